//! Invite inbox: gift-wrapped welcome intake.
//!
//! Three disjoint namespaces track an invite's life:
//!
//! - `received` — gift wraps as delivered, still encrypted
//! - `unread`   — decrypted welcome rumors awaiting the user
//! - `seen`     — every gift wrap id that ever entered the system
//!
//! `seen` is the dedup ledger and outlives everything else: a wrap that
//! fails to unwrap leaves `received` but stays in `seen`, so it is never
//! retried. Decryption is a separate, caller-timed step because the
//! signer may need user interaction to unwrap.

use std::sync::Arc;

use garrison_proto::{Event, EventId, GiftWrapEnvelope, Kind, Rumor};

use crate::error::{Error, Result};
use crate::signal::{SignalHub, Watch};
use crate::signer::Signer;
use crate::store::KvStore;
use crate::welcome::parse_welcome;

/// Inbox lifecycle signals.
#[derive(Debug, Clone)]
pub enum InboxSignal {
    /// A new gift wrap was stored.
    Received(EventId),
    /// A welcome was decrypted and is now unread.
    NewInvite(Rumor),
    /// A gift wrap failed to unwrap or carried something invalid.
    Error(String),
}

/// Deduplicated intake and decryption of welcome gift wraps.
pub struct InviteInbox {
    received: Arc<dyn KvStore>,
    unread: Arc<dyn KvStore>,
    seen: Arc<dyn KvStore>,
    signer: Arc<dyn Signer>,
    signals: SignalHub<InboxSignal>,
    unread_watch: Watch<Vec<Rumor>>,
    received_watch: Watch<Vec<EventId>>,
}

impl InviteInbox {
    pub fn new(
        received: Arc<dyn KvStore>,
        unread: Arc<dyn KvStore>,
        seen: Arc<dyn KvStore>,
        signer: Arc<dyn Signer>,
    ) -> Self {
        let inbox = Self {
            received,
            unread,
            seen,
            signer,
            signals: SignalHub::new(),
            unread_watch: Watch::new(Vec::new()),
            received_watch: Watch::new(Vec::new()),
        };
        inbox.unread_watch.set(inbox.unread_rumors().unwrap_or_default());
        inbox.received_watch.set(inbox.received_ids().unwrap_or_default());
        inbox
    }

    /// Lifecycle signal hub.
    pub fn signals(&self) -> &SignalHub<InboxSignal> {
        &self.signals
    }

    /// Store a gift wrap unless it was ever seen before.
    ///
    /// Returns true when the event is new.
    pub fn ingest_event(&self, gift_wrap: &Event) -> Result<bool> {
        let envelope = GiftWrapEnvelope::parse(gift_wrap)?;

        let id_key = envelope.event_id.to_hex();
        if self.seen.get(&id_key)?.is_some() {
            return Ok(false);
        }
        self.seen.set(&id_key, vec![1])?;

        let encoded = serde_json::to_vec(gift_wrap)
            .map_err(|e| Error::Serialization(e.to_string()))?;
        self.received.set(&id_key, encoded)?;

        self.signals.emit(InboxSignal::Received(gift_wrap.id));
        self.refresh_received()?;
        Ok(true)
    }

    /// Unwrap everything in `received`, moving valid welcomes to `unread`.
    ///
    /// Failures are dropped from `received` but stay in `seen`, so a
    /// broken wrap is not retried forever. Each failure emits an error
    /// signal instead of aborting the sweep.
    pub async fn decrypt_received(&self) -> Result<usize> {
        let mut decrypted = 0;
        for (id_key, raw) in self.received.entries()? {
            let gift_wrap: Event = match serde_json::from_slice(&raw) {
                Ok(event) => event,
                Err(e) => {
                    self.fail(&id_key, format!("stored gift wrap unreadable: {e}"))?;
                    continue;
                }
            };

            let rumor = match self.signer.unwrap_gift(&gift_wrap).await {
                Ok(rumor) => rumor,
                Err(e) => {
                    self.fail(&id_key, format!("gift wrap unwrap failed: {e}"))?;
                    continue;
                }
            };

            if rumor.kind != Kind::WELCOME {
                self.fail(&id_key, format!("inner rumor has kind {}", rumor.kind))?;
                continue;
            }
            if let Err(e) = parse_welcome(&rumor) {
                self.fail(&id_key, format!("invalid welcome: {e}"))?;
                continue;
            }

            let encoded = serde_json::to_vec(&rumor)
                .map_err(|e| Error::Serialization(e.to_string()))?;
            self.unread.set(&rumor.id.to_hex(), encoded)?;
            self.received.remove(&id_key)?;
            decrypted += 1;

            self.signals.emit(InboxSignal::NewInvite(rumor));
        }

        if decrypted > 0 {
            self.refresh_unread()?;
        }
        self.refresh_received()?;
        Ok(decrypted)
    }

    fn fail(&self, received_key: &str, reason: String) -> Result<()> {
        tracing::warn!(gift_wrap = received_key, %reason, "invite dropped");
        self.received.remove(received_key)?;
        self.signals.emit(InboxSignal::Error(reason));
        Ok(())
    }

    /// Decrypted welcomes awaiting user action.
    pub fn unread_rumors(&self) -> Result<Vec<Rumor>> {
        let mut out = Vec::new();
        for (_key, raw) in self.unread.entries()? {
            match serde_json::from_slice::<Rumor>(&raw) {
                Ok(rumor) => out.push(rumor),
                Err(e) => tracing::warn!(error = %e, "skipping unreadable unread entry"),
            }
        }
        Ok(out)
    }

    /// Number of gift wraps waiting for decryption.
    pub fn received_count(&self) -> Result<usize> {
        Ok(self.received.keys()?.len())
    }

    /// Ids of gift wraps waiting for decryption.
    pub fn received_ids(&self) -> Result<Vec<EventId>> {
        Ok(self
            .received
            .keys()?
            .iter()
            .filter_map(|key| EventId::from_hex(key).ok())
            .collect())
    }

    /// Snapshot of pending gift wrap ids plus a stream of updates.
    pub fn watch_received(
        &self,
    ) -> (Vec<EventId>, tokio::sync::mpsc::UnboundedReceiver<Vec<EventId>>) {
        self.received_watch.watch()
    }

    /// Drop a welcome from `unread` once the user has acted on it.
    pub fn mark_as_read(&self, rumor_id: &EventId) -> Result<()> {
        self.unread.remove(&rumor_id.to_hex())?;
        self.refresh_unread()
    }

    /// Snapshot of unread welcomes plus a stream of updates.
    pub fn watch_unread(
        &self,
    ) -> (Vec<Rumor>, tokio::sync::mpsc::UnboundedReceiver<Vec<Rumor>>) {
        self.unread_watch.watch()
    }

    /// Empty `received` and `unread`. `seen` survives, so nothing cleared
    /// here will be accepted again.
    pub fn clear(&self) -> Result<()> {
        for key in self.received.keys()? {
            self.received.remove(&key)?;
        }
        for key in self.unread.keys()? {
            self.unread.remove(&key)?;
        }
        self.refresh_unread()?;
        self.refresh_received()
    }

    /// Destructive reset of the dedup ledger: previously processed gift
    /// wraps will be accepted again after this.
    pub fn clear_seen(&self) -> Result<()> {
        for key in self.seen.keys()? {
            self.seen.remove(&key)?;
        }
        Ok(())
    }

    fn refresh_unread(&self) -> Result<()> {
        self.unread_watch.set(self.unread_rumors()?);
        Ok(())
    }

    fn refresh_received(&self) -> Result<()> {
        self.received_watch.set(self.received_ids()?);
        Ok(())
    }
}
