//! Single-group facade.
//!
//! A [`GroupHandle`] owns one group's state and wires it to the relay
//! network, the identity signer and the group state store. All mutation
//! goes through the handle, which keeps the MLS invariants: a commit is
//! published and acknowledged before it is merged locally, and welcomes
//! only go out after that acknowledgement.
//!
//! Signals fire synchronously inside the triggering operation, so a
//! `StateChanged` handler always observes the new epoch before the
//! caller's `await` returns.

use std::sync::{Arc, Mutex as StdMutex};

use openmls::prelude::{KeyPackage, MlsMessageOut};
use tokio::sync::Mutex;

use garrison_proto::{Event, EventId, Kind, Pubkey, Rumor};

use crate::config::Config;
use crate::credential::credential_identity;
use crate::envelope::seal_group_event;
use crate::error::{Error, Result};
use crate::group::GroupState;
use crate::ingest::{ingest_batch, IngestOutcome, RecentIds};
use crate::key_package::extract_key_package;
use crate::network::{any_ack, RelayNetwork};
use crate::signal::SignalHub;
use crate::signer::Signer;
use crate::store::KvStore;
use crate::welcome::build_welcome_rumors;

/// Lifecycle signals of one group.
#[derive(Debug, Clone)]
pub enum GroupSignal {
    /// The epoch advanced (commit applied or authored).
    StateChanged,
    /// A decrypted application rumor.
    ApplicationMessage(Rumor),
    /// State was persisted to the group store.
    StateSaved,
    /// A non-fatal persistence or history failure.
    HistoryError(String),
    /// The group was destroyed and removed from the store.
    Destroyed,
}

/// A membership change to propose.
pub enum ProposalAction {
    /// Add a member by key package.
    Add(Box<KeyPackage>),
    /// Remove every leaf belonging to an identity.
    Remove(Pubkey),
    /// Refresh this member's own leaf.
    SelfUpdate,
    /// Propose this member's own removal; an admin commits it.
    Leave,
}

/// Result of a commit operation.
pub struct CommitOutcome {
    /// The published kind-445 commit event.
    pub commit_event: Event,
    /// Identities that were sent a welcome.
    pub welcome_recipients: Vec<Pubkey>,
}

/// Handle to one loaded group.
pub struct GroupHandle {
    group_id_hex: String,
    state: Mutex<GroupState>,
    own_events: StdMutex<RecentIds>,
    signer: Arc<dyn Signer>,
    network: Arc<dyn RelayNetwork>,
    group_store: Arc<dyn KvStore>,
    config: Config,
    signals: SignalHub<GroupSignal>,
}

impl GroupHandle {
    pub fn new(
        state: GroupState,
        signer: Arc<dyn Signer>,
        network: Arc<dyn RelayNetwork>,
        group_store: Arc<dyn KvStore>,
        config: Config,
    ) -> Self {
        Self {
            group_id_hex: state.group_id_hex(),
            state: Mutex::new(state),
            own_events: StdMutex::new(RecentIds::default()),
            signer,
            network,
            group_store,
            config,
            signals: SignalHub::new(),
        }
    }

    /// Hex network group id.
    pub fn group_id_hex(&self) -> &str {
        &self.group_id_hex
    }

    /// Lifecycle signal hub.
    pub fn signals(&self) -> &SignalHub<GroupSignal> {
        &self.signals
    }

    /// Current epoch.
    pub async fn epoch(&self) -> u64 {
        self.state.lock().await.epoch()
    }

    /// Occupied leaf count.
    pub async fn member_count(&self) -> usize {
        self.state.lock().await.member_count()
    }

    /// Member identities.
    pub async fn members(&self) -> Vec<Pubkey> {
        self.state.lock().await.member_identities()
    }

    /// Decoded group data, if the extension is intact.
    pub async fn group_data(&self) -> Option<garrison_proto::GroupData> {
        self.state.lock().await.group_data()
    }

    /// Encrypt an application rumor into the group and publish it.
    pub async fn send_rumor(&self, rumor: &Rumor) -> Result<Event> {
        let mut state = self.state.lock().await;
        let relays = Self::group_relays(&state)?;

        let (group, provider, signer) = state.mls_parts();
        let message = group
            .create_message(provider, signer, &rumor.serialize())
            .map_err(|e| Error::Encryption(e.to_string()))?;
        let event = seal_group_event(&mut state, &message)?;

        self.publish_acknowledged(&relays, &event).await?;
        self.remember_own(event.id);
        self.save_locked(&mut state)?;
        Ok(event)
    }

    /// Build, encrypt and publish proposal messages.
    ///
    /// The proposals also enter this member's own pending queue, so a
    /// later [`Self::commit`] bundles them.
    pub async fn propose(&self, action: ProposalAction) -> Result<Vec<Event>> {
        let mut state = self.state.lock().await;
        let relays = Self::group_relays(&state)?;

        let messages = Self::build_proposal_messages(&mut state, action)?;
        let events = self
            .publish_proposal_messages(&mut state, &relays, &messages)
            .await?;
        self.save_locked(&mut state)?;
        Ok(events)
    }

    /// Stage one proposal action into this member's pending queue.
    fn build_proposal_messages(
        state: &mut GroupState,
        action: ProposalAction,
    ) -> Result<Vec<MlsMessageOut>> {
        let mut messages = Vec::new();
        match action {
            ProposalAction::Add(key_package) => {
                let (group, provider, signer) = state.mls_parts();
                let (message, _ref) = group
                    .propose_add_member(provider, signer, &key_package)
                    .map_err(|e| Error::CreateProposal(e.to_string()))?;
                messages.push(message);
            }
            ProposalAction::Remove(identity) => {
                let leaves = state.leaves_for_identity(&identity);
                if leaves.is_empty() {
                    return Err(Error::InvalidEvent(format!(
                        "{identity} has no leaf in this group"
                    )));
                }
                for leaf in leaves {
                    let (group, provider, signer) = state.mls_parts();
                    let (message, _ref) = group
                        .propose_remove_member(provider, signer, leaf)
                        .map_err(|e| Error::CreateProposal(e.to_string()))?;
                    messages.push(message);
                }
            }
            ProposalAction::SelfUpdate => {
                let (group, provider, signer) = state.mls_parts();
                let (message, _ref) = group
                    .propose_self_update(provider, signer, openmls::prelude::LeafNodeParameters::default())
                    .map_err(|e| Error::CreateProposal(e.to_string()))?;
                messages.push(message);
            }
            ProposalAction::Leave => {
                let (group, provider, signer) = state.mls_parts();
                let message = group
                    .leave_group(provider, signer)
                    .map_err(|e| Error::CreateProposal(e.to_string()))?;
                messages.push(message);
            }
        }
        Ok(messages)
    }

    /// Seal and publish proposal messages, remembering their event ids.
    async fn publish_proposal_messages(
        &self,
        state: &mut GroupState,
        relays: &[String],
        messages: &[MlsMessageOut],
    ) -> Result<Vec<Event>> {
        let mut events = Vec::with_capacity(messages.len());
        for message in messages {
            let event = seal_group_event(state, message)?;
            self.publish_acknowledged(relays, &event).await?;
            self.remember_own(event.id);
            events.push(event);
        }
        Ok(events)
    }

    /// Commit all pending proposals, plus any `extra_proposals` staged
    /// here and now.
    ///
    /// Extra proposals are built and published like [`Self::propose`]
    /// would, then bundled into the same commit, so a caller can fold an
    /// ad-hoc membership change into one commit without a separate
    /// propose round. The commit event is published and acknowledged
    /// before the local merge; if the commit admits members, welcomes
    /// are dispatched after that acknowledgement.
    pub async fn commit(&self, extra_proposals: Vec<ProposalAction>) -> Result<CommitOutcome> {
        let mut state = self.state.lock().await;
        let relays = Self::group_relays(&state)?;

        for action in extra_proposals {
            let messages = Self::build_proposal_messages(&mut state, action)?;
            self.publish_proposal_messages(&mut state, &relays, &messages)
                .await?;
        }

        let (group, provider, signer) = state.mls_parts();
        let (commit_message, welcome_message, _group_info) = group
            .commit_to_pending_proposals(provider, signer)
            .map_err(|e| Error::CreateCommit(e.to_string()))?;

        // Added identities, read from the staged commit before merging.
        let recipients: Vec<Pubkey> = group
            .pending_commit()
            .map(|staged| {
                staged
                    .add_proposals()
                    .filter_map(|queued| {
                        credential_identity(
                            queued.add_proposal().key_package().leaf_node().credential(),
                        )
                        .ok()
                    })
                    .collect()
            })
            .unwrap_or_default();

        // Sealed under the pre-merge epoch so current members can read it.
        let commit_event = seal_group_event(&mut state, &commit_message)?;
        self.publish_acknowledged(&relays, &commit_event).await?;
        self.remember_own(commit_event.id);

        let (group, provider, _signer) = state.mls_parts();
        group
            .merge_pending_commit(provider)
            .map_err(|e| Error::CreateCommit(e.to_string()))?;
        if let Err(e) = state.refresh_exporter_secret() {
            tracing::debug!(error = %e, "exporter secret unavailable after merge");
        }
        self.signals.emit(GroupSignal::StateChanged);

        if let (Some(welcome), false) = (welcome_message, recipients.is_empty()) {
            self.dispatch_welcomes(&welcome, &relays, None, &recipients)
                .await?;
        }

        self.save_locked(&mut state)?;
        Ok(CommitOutcome {
            commit_event,
            welcome_recipients: recipients,
        })
    }

    /// Add a member directly from their kind-443 key package event.
    ///
    /// The event must be validly signed and its key package credential
    /// must belong to the event's author.
    pub async fn invite_by_key_package_event(&self, event: &Event) -> Result<Vec<Pubkey>> {
        event.expect_kind(Kind::KEY_PACKAGE)?;
        event.verify()?;

        let key_package = extract_key_package(event)?;
        let owner = credential_identity(key_package.leaf_node().credential())?;
        if owner != event.pubkey {
            return Err(Error::InvalidEvent(format!(
                "key package credential {owner} does not match event author {}",
                event.pubkey
            )));
        }

        let mut state = self.state.lock().await;
        let relays = Self::group_relays(&state)?;

        let (group, provider, signer) = state.mls_parts();
        let (commit_message, welcome_message, _group_info) = group
            .add_members(provider, signer, &[key_package])
            .map_err(|e| Error::CreateCommit(e.to_string()))?;

        let commit_event = seal_group_event(&mut state, &commit_message)?;
        self.publish_acknowledged(&relays, &commit_event).await?;
        self.remember_own(commit_event.id);

        let (group, provider, _signer) = state.mls_parts();
        group
            .merge_pending_commit(provider)
            .map_err(|e| Error::CreateCommit(e.to_string()))?;
        if let Err(e) = state.refresh_exporter_secret() {
            tracing::debug!(error = %e, "exporter secret unavailable after merge");
        }
        self.signals.emit(GroupSignal::StateChanged);

        let recipients = vec![event.pubkey];
        self.dispatch_welcomes(&welcome_message, &relays, Some(event.id), &recipients)
            .await?;

        self.save_locked(&mut state)?;
        Ok(recipients)
    }

    /// Run the ingest pipeline over a batch of kind-445 events.
    pub async fn ingest(&self, events: &[Event]) -> Result<IngestOutcome> {
        let config = self.config.clone();
        self.ingest_with_config(events, &config).await
    }

    /// Ingest with per-call overrides of the retry and admin tunables.
    pub async fn ingest_with_config(
        &self,
        events: &[Event],
        config: &Config,
    ) -> Result<IngestOutcome> {
        if events.is_empty() {
            return Ok(IngestOutcome::default());
        }
        let mut state = self.state.lock().await;

        let outcome = {
            let own = self
                .own_events
                .lock()
                .map_err(|_| Error::Storage("own-event set poisoned".into()))?;
            ingest_batch(&mut state, events, config, &own)
        };

        if outcome.state_changed() {
            self.signals.emit(GroupSignal::StateChanged);
        }
        for rumor in &outcome.application_rumors {
            self.signals
                .emit(GroupSignal::ApplicationMessage(rumor.clone()));
        }

        // Message processing is not gated on persistence: a failed save
        // surfaces as a signal, the decoded batch is still returned.
        if let Err(e) = self.save_locked(&mut state) {
            tracing::error!(group = %self.group_id_hex, error = %e, "save after ingest failed");
            self.signals.emit(GroupSignal::HistoryError(e.to_string()));
        }
        Ok(outcome)
    }

    /// Serialize and persist the current state.
    pub async fn save(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.save_locked(&mut state)
    }

    /// Remove this group from the store and signal teardown.
    pub async fn destroy(&self) -> Result<()> {
        self.group_store.remove(&self.group_id_hex)?;
        self.signals.emit(GroupSignal::Destroyed);
        Ok(())
    }

    /// Serialized state bytes, for export.
    pub async fn export_state(&self) -> Result<Vec<u8>> {
        self.state.lock().await.serialize()
    }

    fn save_locked(&self, state: &mut GroupState) -> Result<()> {
        let bytes = state.serialize()?;
        self.group_store.set(&self.group_id_hex, bytes)?;
        self.signals.emit(GroupSignal::StateSaved);
        Ok(())
    }

    fn remember_own(&self, id: EventId) {
        if let Ok(mut own) = self.own_events.lock() {
            own.insert(id);
        }
    }

    fn group_relays(state: &GroupState) -> Result<Vec<String>> {
        let relays = state
            .group_data()
            .map(|data| data.relays)
            .unwrap_or_default();
        if relays.is_empty() {
            return Err(Error::Network("group declares no relays".into()));
        }
        Ok(relays)
    }

    async fn publish_acknowledged(&self, relays: &[String], event: &Event) -> Result<()> {
        let acks = self.network.publish(relays, event).await?;
        if !any_ack(&acks) {
            return Err(Error::PublishUnacknowledged);
        }
        Ok(())
    }

    /// Gift wrap and publish welcomes, one per recipient.
    ///
    /// Runs strictly after the commit's publish acknowledgement. When a
    /// recipient has no discoverable inbox relays, the group's own relay
    /// set is used instead.
    async fn dispatch_welcomes(
        &self,
        welcome: &MlsMessageOut,
        group_relays: &[String],
        key_package_event_id: Option<EventId>,
        recipients: &[Pubkey],
    ) -> Result<()> {
        let sender = self.signer.public_key().await?;
        let rumors = build_welcome_rumors(
            &sender,
            welcome,
            group_relays,
            key_package_event_id,
            recipients,
        )?;

        for (recipient, rumor) in rumors {
            let wrap = self.signer.gift_wrap(&recipient, rumor).await?;

            let mut targets = self.network.user_inbox_relays(&recipient).await?;
            if targets.is_empty() {
                tracing::debug!(
                    group = %self.group_id_hex,
                    %recipient,
                    "no inbox relays discovered, falling back to group relays"
                );
                targets = group_relays.to_vec();
            }
            self.publish_acknowledged(&targets, &wrap).await?;
        }
        Ok(())
    }
}
