//! Multi-group client.
//!
//! Owns the registry of loaded group handles and the key package custody
//! store. Handles are loaded from the group state store at most once:
//! concurrent `get_group` calls for the same id share an in-flight load
//! and observe the same `Arc<GroupHandle>`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use garrison_proto::{Event, EventId, GroupData, Pubkey, Rumor};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::facade::GroupHandle;
use crate::group::GroupState;
use crate::key_package::{
    create_key_package_event, generate_key_package, KeyPackageStore,
};
use crate::network::RelayNetwork;
use crate::signal::Watch;
use crate::signer::Signer;
use crate::store::KvStore;
use crate::welcome::join_from_welcome;

/// Options for creating a group.
pub struct CreateGroupOptions {
    pub name: String,
    pub description: String,
    /// Relay URLs the group publishes to. Must be non-empty.
    pub relays: Vec<String>,
    /// Identities allowed to author commits.
    pub admin_pubkeys: Vec<Pubkey>,
}

/// Multi-group client: group registry plus key package custody.
pub struct Client {
    signer: Arc<dyn Signer>,
    network: Arc<dyn RelayNetwork>,
    group_store: Arc<dyn KvStore>,
    key_packages: Arc<KeyPackageStore>,
    config: Config,

    groups: Mutex<HashMap<String, Arc<GroupHandle>>>,
    /// In-flight load locks by group id, shared across awaiters.
    loading: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    group_watch: Watch<Vec<String>>,
}

impl Client {
    pub fn new(
        signer: Arc<dyn Signer>,
        network: Arc<dyn RelayNetwork>,
        group_store: Arc<dyn KvStore>,
        key_package_store: Arc<dyn KvStore>,
        config: Config,
    ) -> Self {
        let initial_groups = group_store.keys().unwrap_or_default();
        Self {
            signer,
            network,
            group_store,
            key_packages: Arc::new(KeyPackageStore::new(key_package_store)),
            config,
            groups: Mutex::new(HashMap::new()),
            loading: StdMutex::new(HashMap::new()),
            group_watch: Watch::new(initial_groups),
        }
    }

    /// The custody store.
    pub fn key_packages(&self) -> &KeyPackageStore {
        &self.key_packages
    }

    /// Generate a key package, store it in custody, and return its
    /// unsigned publication event.
    pub async fn new_key_package(
        &self,
        relays: &[String],
        client_name: Option<&str>,
    ) -> Result<(String, Rumor)> {
        let identity = self.signer.public_key().await?;
        let generated =
            generate_key_package(&identity, self.config.key_package_lifetime_seconds)?;
        let reference = self.key_packages.add(&generated)?;
        let rumor =
            create_key_package_event(&identity, &generated.key_package, relays, client_name)?;
        Ok((reference, rumor))
    }

    /// Create a group, persist it and register its handle.
    pub async fn create_group(&self, options: CreateGroupOptions) -> Result<Arc<GroupHandle>> {
        if options.relays.is_empty() {
            return Err(Error::InvalidEvent("a group needs at least one relay".into()));
        }
        let creator = self.signer.public_key().await?;

        let mut admins = options.admin_pubkeys;
        if !admins.contains(&creator) {
            admins.push(creator);
        }

        let data = GroupData::new(options.name, options.description, admins, options.relays);
        let state = GroupState::create(&creator, &data, vec![])?;
        self.register(state).await
    }

    /// Join a group from a decrypted welcome rumor.
    ///
    /// Looks up the private key package in custody by the references the
    /// welcome names; `key_package_event_id`, when given, is checked
    /// against the rumor's `e` tag.
    pub async fn join_group_from_welcome(
        &self,
        welcome_rumor: &Rumor,
        key_package_event_id: Option<EventId>,
    ) -> Result<Arc<GroupHandle>> {
        let state = join_from_welcome(welcome_rumor, &self.key_packages, key_package_event_id)?;
        self.register(state).await
    }

    /// Wrap an already-deserialized state, persist it and register it.
    pub async fn import_group_from_state(&self, state: GroupState) -> Result<Arc<GroupHandle>> {
        self.register(state).await
    }

    /// Get a handle, loading and caching it on first use.
    ///
    /// Concurrent calls for the same id return the same handle: loads
    /// are deduplicated through a by-id in-flight lock table.
    pub async fn get_group(&self, group_id_hex: &str) -> Result<Arc<GroupHandle>> {
        if let Some(handle) = self.groups.lock().await.get(group_id_hex) {
            return Ok(handle.clone());
        }

        let load_lock = {
            let mut loading = self
                .loading
                .lock()
                .map_err(|_| Error::Storage("load table poisoned".into()))?;
            loading
                .entry(group_id_hex.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let handle = {
            let _guard = load_lock.lock().await;

            // A concurrent loader may have won the race.
            if let Some(handle) = self.groups.lock().await.get(group_id_hex) {
                handle.clone()
            } else {
                let bytes = self
                    .group_store
                    .get(group_id_hex)?
                    .ok_or_else(|| Error::GroupNotFound(group_id_hex.to_string()))?;
                let state = GroupState::deserialize(&bytes)?;
                let handle = self.wrap(state);
                self.groups
                    .lock()
                    .await
                    .insert(group_id_hex.to_string(), handle.clone());
                self.refresh_group_watch();
                handle
            }
        };

        if let Ok(mut loading) = self.loading.lock() {
            loading.remove(group_id_hex);
        }
        Ok(handle)
    }

    /// Load every group in the store, skipping corrupted entries.
    pub async fn load_all_groups(&self) -> Result<Vec<Arc<GroupHandle>>> {
        let mut handles = Vec::new();
        for group_id in self.group_store.keys()? {
            match self.get_group(&group_id).await {
                Ok(handle) => handles.push(handle),
                Err(Error::CorruptedState(reason)) => {
                    tracing::error!(group = %group_id, %reason, "skipping corrupted group state");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(handles)
    }

    /// Drop a handle from the cache; its state stays in the store.
    pub async fn unload_group(&self, group_id_hex: &str) {
        self.groups.lock().await.remove(group_id_hex);
        self.refresh_group_watch();
    }

    /// Destroy a group: remove its state and drop the handle.
    pub async fn destroy_group(&self, group_id_hex: &str) -> Result<()> {
        let handle = self.get_group(group_id_hex).await?;
        handle.destroy().await?;
        self.groups.lock().await.remove(group_id_hex);
        self.refresh_group_watch();
        Ok(())
    }

    /// Group ids currently in the store, as snapshot plus update stream.
    pub fn watch_groups(
        &self,
    ) -> (Vec<String>, tokio::sync::mpsc::UnboundedReceiver<Vec<String>>) {
        self.group_watch.watch()
    }

    /// Custody references, as snapshot plus update stream.
    pub fn watch_key_packages(
        &self,
    ) -> (Vec<String>, tokio::sync::mpsc::UnboundedReceiver<Vec<String>>) {
        self.key_packages.watch()
    }

    /// Process a batch of group message events for one group.
    pub async fn ingest_group_events(
        &self,
        group_id_hex: &str,
        events: &[Event],
    ) -> Result<crate::ingest::IngestOutcome> {
        let handle = self.get_group(group_id_hex).await?;
        handle.ingest(events).await
    }

    fn wrap(&self, state: GroupState) -> Arc<GroupHandle> {
        Arc::new(GroupHandle::new(
            state,
            self.signer.clone(),
            self.network.clone(),
            self.group_store.clone(),
            self.config.clone(),
        ))
    }

    async fn register(&self, state: GroupState) -> Result<Arc<GroupHandle>> {
        let handle = self.wrap(state);
        handle.save().await?;
        self.groups
            .lock()
            .await
            .insert(handle.group_id_hex().to_string(), handle.clone());
        self.refresh_group_watch();
        Ok(handle)
    }

    fn refresh_group_watch(&self) {
        self.group_watch
            .set(self.group_store.keys().unwrap_or_default());
    }
}
