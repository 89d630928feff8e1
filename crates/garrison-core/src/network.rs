//! Relay network seam.
//!
//! The core consumes the event network through [`RelayNetwork`]; it never
//! opens sockets itself. [`MemoryRelay`] is the in-process implementation
//! used by the integration tests: publishes are stored per relay URL and
//! fanned out to live subscriptions.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use garrison_proto::{Event, EventId, Kind, Pubkey};

use crate::error::{Error, Result};

/// Event selection used by requests and subscriptions.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Match any of these kinds; empty matches all.
    pub kinds: Vec<Kind>,
    /// Match any of these `h` tag values; empty matches all.
    pub group_ids: Vec<String>,
    /// Match any of these `p` tag recipients; empty matches all.
    pub recipients: Vec<Pubkey>,
    /// Match any of these event ids; empty matches all.
    pub ids: Vec<EventId>,
    /// Only events created at or after this time.
    pub since: Option<u64>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: Kind) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn group_id(mut self, group_id_hex: impl Into<String>) -> Self {
        self.group_ids.push(group_id_hex.into());
        self
    }

    pub fn recipient(mut self, pubkey: Pubkey) -> Self {
        self.recipients.push(pubkey);
        self
    }

    pub fn id(mut self, id: EventId) -> Self {
        self.ids.push(id);
        self
    }

    pub fn since(mut self, time: u64) -> Self {
        self.since = Some(time);
        self
    }

    /// True when `event` satisfies every populated clause.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if !self.group_ids.is_empty() {
            let matched = event
                .tag_value("h")
                .map(|h| self.group_ids.iter().any(|g| g == h))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        if !self.recipients.is_empty() {
            let matched = event
                .tag_value("p")
                .and_then(|p| Pubkey::from_hex(p).ok())
                .map(|p| self.recipients.contains(&p))
                .unwrap_or(false);
            if !matched {
                return false;
            }
        }
        true
    }
}

/// Per-relay publish outcome.
pub type PublishAcks = HashMap<String, std::result::Result<(), String>>;

/// True when at least one relay acknowledged.
pub fn any_ack(acks: &PublishAcks) -> bool {
    acks.values().any(|outcome| outcome.is_ok())
}

/// The event network the core publishes to and reads from.
#[async_trait]
pub trait RelayNetwork: Send + Sync {
    /// Publish an event to each relay, returning per-relay outcomes.
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishAcks>;

    /// One-shot request for stored events matching the filter.
    async fn request(&self, relays: &[String], filter: &Filter) -> Result<Vec<Event>>;

    /// Live subscription to future events matching the filter.
    async fn subscription(
        &self,
        relays: &[String],
        filter: &Filter,
    ) -> Result<UnboundedReceiver<Event>>;

    /// Relays an identity has declared for receiving wrapped events.
    async fn user_inbox_relays(&self, identity: &Pubkey) -> Result<Vec<String>>;
}

struct Subscription {
    relays: Vec<String>,
    filter: Filter,
    tx: UnboundedSender<Event>,
}

/// In-memory relay set for tests and local runs.
#[derive(Default)]
pub struct MemoryRelay {
    stored: Mutex<HashMap<String, Vec<Event>>>,
    subscriptions: Mutex<Vec<Subscription>>,
    inbox_relays: Mutex<HashMap<Pubkey, Vec<String>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an identity's inbox relays.
    pub fn set_inbox_relays(&self, identity: Pubkey, relays: Vec<String>) {
        self.inbox_relays.lock().unwrap().insert(identity, relays);
    }

    /// Everything stored on one relay, in publish order.
    pub fn stored_on(&self, relay: &str) -> Vec<Event> {
        self.stored
            .lock()
            .unwrap()
            .get(relay)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl RelayNetwork for MemoryRelay {
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishAcks> {
        if relays.is_empty() {
            return Err(Error::Network("no relays given for publish".into()));
        }

        {
            let mut stored = self.stored.lock().unwrap();
            for relay in relays {
                stored.entry(relay.clone()).or_default().push(event.clone());
            }
        }

        self.subscriptions.lock().unwrap().retain(|sub| {
            let on_relay = sub.relays.iter().any(|r| relays.contains(r));
            if on_relay && sub.filter.matches(event) {
                sub.tx.send(event.clone()).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });

        Ok(relays
            .iter()
            .map(|relay| (relay.clone(), Ok(())))
            .collect())
    }

    async fn request(&self, relays: &[String], filter: &Filter) -> Result<Vec<Event>> {
        let stored = self.stored.lock().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for relay in relays {
            for event in stored.get(relay).into_iter().flatten() {
                if filter.matches(event) && seen.insert(event.id) {
                    out.push(event.clone());
                }
            }
        }
        Ok(out)
    }

    async fn subscription(
        &self,
        relays: &[String],
        filter: &Filter,
    ) -> Result<UnboundedReceiver<Event>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscriptions.lock().unwrap().push(Subscription {
            relays: relays.to_vec(),
            filter: filter.clone(),
            tx,
        });
        Ok(rx)
    }

    async fn user_inbox_relays(&self, identity: &Pubkey) -> Result<Vec<String>> {
        Ok(self
            .inbox_relays
            .lock()
            .unwrap()
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use garrison_proto::{EphemeralKeys, Tag};

    fn event_for_group(group: &str) -> Event {
        EphemeralKeys::generate().sign(Kind::GROUP_MESSAGE, vec![Tag::group(group)], "x".into())
    }

    #[tokio::test]
    async fn test_publish_and_request() {
        let relay = MemoryRelay::new();
        let relays = vec!["wss://a".to_string(), "wss://b".to_string()];
        let event = event_for_group("aa");

        let acks = relay.publish(&relays, &event).await.unwrap();
        assert!(any_ack(&acks));
        assert_eq!(acks.len(), 2);

        let found = relay
            .request(&relays, &Filter::new().kind(Kind::GROUP_MESSAGE))
            .await
            .unwrap();
        // Stored on both relays, returned once.
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, event.id);
    }

    #[tokio::test]
    async fn test_filter_by_group() {
        let relay = MemoryRelay::new();
        let relays = vec!["wss://a".to_string()];
        relay.publish(&relays, &event_for_group("aa")).await.unwrap();
        relay.publish(&relays, &event_for_group("bb")).await.unwrap();

        let found = relay
            .request(&relays, &Filter::new().group_id("aa"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].tag_value("h"), Some("aa"));
    }

    #[tokio::test]
    async fn test_subscription_receives_matching_events() {
        let relay = MemoryRelay::new();
        let relays = vec!["wss://a".to_string()];
        let mut rx = relay
            .subscription(&relays, &Filter::new().group_id("aa"))
            .await
            .unwrap();

        relay.publish(&relays, &event_for_group("bb")).await.unwrap();
        let event = event_for_group("aa");
        relay.publish(&relays, &event).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().id, event.id);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_publish_without_relays_is_an_error() {
        let relay = MemoryRelay::new();
        let result = relay.publish(&[], &event_for_group("aa")).await;
        assert!(matches!(result, Err(Error::Network(_))));
    }

    #[tokio::test]
    async fn test_inbox_relays() {
        let relay = MemoryRelay::new();
        let identity = Pubkey::from_bytes([1; 32]);
        assert!(relay.user_inbox_relays(&identity).await.unwrap().is_empty());

        relay.set_inbox_relays(identity, vec!["wss://inbox".into()]);
        assert_eq!(
            relay.user_inbox_relays(&identity).await.unwrap(),
            vec!["wss://inbox".to_string()]
        );
    }
}
