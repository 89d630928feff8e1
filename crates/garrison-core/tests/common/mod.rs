//! Shared choreography for the end-to-end tests: one in-memory relay
//! set, one client per member, and feed helpers that mimic how an
//! application drains subscriptions between turns.

#![allow(dead_code)]

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;

use garrison_core::client::{Client, CreateGroupOptions};
use garrison_core::config::Config;
use garrison_core::inbox::InviteInbox;
use garrison_core::network::{Filter, MemoryRelay, RelayNetwork};
use garrison_core::signer::{LocalSigner, Signer};
use garrison_core::store::MemoryKvStore;
use garrison_proto::{Event, Kind, Pubkey, Rumor};

pub const RELAY: &str = "wss://relay.one";

pub fn relays() -> Vec<String> {
    vec![RELAY.to_string()]
}

/// One participant: identity, client, inbox and live feeds.
pub struct Member {
    pub signer: Arc<LocalSigner>,
    pub client: Client,
    pub inbox: InviteInbox,
    pub network: Arc<MemoryRelay>,
    group_feed: Mutex<Option<UnboundedReceiver<Event>>>,
    gift_feed: Mutex<Option<UnboundedReceiver<Event>>>,
}

impl Member {
    pub fn new(network: &Arc<MemoryRelay>) -> Self {
        Self::with_group_store(network, Arc::new(MemoryKvStore::new()))
    }

    /// Like [`Member::new`], but sharing the group store handle with the
    /// caller so tests can inspect persisted bytes.
    pub fn with_group_store(network: &Arc<MemoryRelay>, group_store: Arc<MemoryKvStore>) -> Self {
        let signer = Arc::new(LocalSigner::generate());
        let client = Client::new(
            signer.clone(),
            network.clone(),
            group_store,
            Arc::new(MemoryKvStore::new()),
            Config::default(),
        );
        let inbox = InviteInbox::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemoryKvStore::new()),
            Arc::new(MemoryKvStore::new()),
            signer.clone(),
        );
        Self {
            signer,
            client,
            inbox,
            network: network.clone(),
            group_feed: Mutex::new(None),
            gift_feed: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> Pubkey {
        self.signer.identity()
    }

    /// Subscribe to the group's message events from now on.
    pub async fn watch_group(&self, group_id_hex: &str) {
        let rx = self
            .network
            .subscription(
                &relays(),
                &Filter::new().kind(Kind::GROUP_MESSAGE).group_id(group_id_hex),
            )
            .await
            .unwrap();
        *self.group_feed.lock().await = Some(rx);
    }

    /// Subscribe to gift wraps addressed to this member from now on.
    pub async fn watch_gifts(&self) {
        let rx = self
            .network
            .subscription(
                &relays(),
                &Filter::new().kind(Kind::GIFT_WRAP).recipient(self.identity()),
            )
            .await
            .unwrap();
        *self.gift_feed.lock().await = Some(rx);
    }

    /// Everything the group feed delivered since the last drain.
    pub async fn drain_group_feed(&self) -> Vec<Event> {
        let mut guard = self.group_feed.lock().await;
        let feed = guard.as_mut().expect("watch_group not called");
        let mut events = Vec::new();
        while let Ok(event) = feed.try_recv() {
            events.push(event);
        }
        events
    }

    /// Generate, custody and publish a key package event.
    pub async fn publish_key_package(&self) -> Event {
        let (_reference, rumor) = self.client.new_key_package(&relays(), None).await.unwrap();
        let event = self.signer.sign_event(rumor).await.unwrap();
        self.network.publish(&relays(), &event).await.unwrap();
        event
    }

    /// Drain gift wraps, run them through the inbox, and return the
    /// resulting unread welcomes.
    pub async fn receive_invites(&self) -> Vec<Rumor> {
        let wraps = {
            let mut guard = self.gift_feed.lock().await;
            let feed = guard.as_mut().expect("watch_gifts not called");
            let mut events = Vec::new();
            while let Ok(event) = feed.try_recv() {
                events.push(event);
            }
            events
        };
        for wrap in &wraps {
            self.inbox.ingest_event(wrap).unwrap();
        }
        self.inbox.decrypt_received().await.unwrap();
        self.inbox.unread_rumors().unwrap()
    }
}

/// Create a group whose only starting member is `creator`.
pub async fn create_group(creator: &Member, name: &str) -> Arc<garrison_core::GroupHandle> {
    let handle = creator
        .client
        .create_group(CreateGroupOptions {
            name: name.to_string(),
            description: format!("{name} test group"),
            relays: relays(),
            admin_pubkeys: vec![],
        })
        .await
        .unwrap();
    creator.watch_group(handle.group_id_hex()).await;
    handle
}

/// Application rumor of the given kind-9 content, authored by `member`.
pub fn chat_rumor(member: &Member, content: &str) -> Rumor {
    Rumor::new(member.identity(), Kind(9), vec![], content.to_string())
}
