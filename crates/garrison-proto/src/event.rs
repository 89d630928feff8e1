//! Event model for the relay network.
//!
//! All traffic is carried by events: a kind number, a tag list, a content
//! string, a creation timestamp and an author public key. Signed events
//! additionally carry an Ed25519 signature over the event id; rumors are
//! the unsigned inner form used for application messages and for the
//! welcome carried inside a gift wrap. A leaked rumor cannot be replayed
//! as a valid network event precisely because it has no signature.
//!
//! The event id is the SHA-256 of the canonical serialization
//! `[0, pubkey, created_at, kind, tags, content]`, so `id` commits to every
//! other field.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors from event parsing, validation and signature checks.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("invalid event id: {0}")]
    InvalidEventId(String),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("event id does not match content")]
    IdMismatch,

    #[error("invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("unexpected kind: expected {expected}, got {got}")]
    UnexpectedKind { expected: u16, got: u16 },
}

/// A 32-byte public key, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pubkey([u8; 32]);

impl Pubkey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-char hex public key. Case-insensitive; stored lowercase.
    pub fn from_hex(s: &str) -> Result<Self, EventError> {
        let raw = hex::decode(s).map_err(|e| EventError::InvalidPubkey(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| EventError::InvalidPubkey(format!("expected 32 bytes, got {}", s.len() / 2)))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Pubkey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Pubkey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Pubkey::from_hex(&s).map_err(D::Error::custom)
    }
}

/// A 32-byte event id, hex-encoded on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventId([u8; 32]);

impl EventId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, EventError> {
        let raw = hex::decode(s).map_err(|e| EventError::InvalidEventId(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| EventError::InvalidEventId("expected 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for EventId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EventId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EventId::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Event kind number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Kind(pub u16);

impl Kind {
    /// Key package publication.
    pub const KEY_PACKAGE: Kind = Kind(443);
    /// Welcome inner rumor (never signed, never published directly).
    pub const WELCOME: Kind = Kind(444);
    /// Group message envelope.
    pub const GROUP_MESSAGE: Kind = Kind(445);
    /// Gift wrap envelope.
    pub const GIFT_WRAP: Kind = Kind(1059);
    /// Key package relay list.
    pub const KEY_PACKAGE_RELAYS: Kind = Kind(10051);
    /// Generic deletion.
    pub const DELETION: Kind = Kind(5);

    pub fn as_u16(&self) -> u16 {
        self.0
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tag: a non-empty list of strings, the first being the tag name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new(values: Vec<String>) -> Self {
        Self(values)
    }

    /// `h` tag carrying the network group id.
    pub fn group(group_id_hex: &str) -> Self {
        Self(vec!["h".into(), group_id_hex.into()])
    }

    /// `p` tag addressing a recipient identity.
    pub fn recipient(pubkey: &Pubkey) -> Self {
        Self(vec!["p".into(), pubkey.to_hex()])
    }

    /// `e` tag referencing another event.
    pub fn event_ref(id: &EventId) -> Self {
        Self(vec!["e".into(), id.to_hex()])
    }

    /// `relays` tag listing relay URLs.
    pub fn relays(urls: &[String]) -> Self {
        let mut values = vec!["relays".to_string()];
        values.extend(urls.iter().cloned());
        Self(values)
    }

    /// `relay` tag naming a single relay URL, as used by relay lists.
    pub fn relay(url: &str) -> Self {
        Self(vec!["relay".into(), url.into()])
    }

    /// `encoding` tag declaring the content encoding.
    pub fn encoding(value: &str) -> Self {
        Self(vec!["encoding".into(), value.into()])
    }

    /// `mls_protocol_version` tag.
    pub fn mls_protocol_version(version: &str) -> Self {
        Self(vec!["mls_protocol_version".into(), version.into()])
    }

    /// `mls_ciphersuite` tag carrying the hex suite id.
    pub fn mls_ciphersuite(suite_hex: &str) -> Self {
        Self(vec!["mls_ciphersuite".into(), suite_hex.into()])
    }

    /// `mls_extensions` tag listing signaled extension type ids in hex.
    pub fn mls_extensions(extension_hex_ids: &[String]) -> Self {
        let mut values = vec!["mls_extensions".to_string()];
        values.extend(extension_hex_ids.iter().cloned());
        Self(values)
    }

    /// `client` tag naming the publishing client.
    pub fn client(name: &str) -> Self {
        Self(vec!["client".into(), name.into()])
    }

    /// `k` tag naming a kind, used by deletion events.
    pub fn kind_ref(kind: Kind) -> Self {
        Self(vec!["k".into(), kind.to_string()])
    }

    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }

    /// All values after the tag name.
    pub fn values(&self) -> &[String] {
        if self.0.is_empty() {
            &[]
        } else {
            &self.0[1..]
        }
    }
}

/// Compute an event id over the canonical serialization.
fn compute_id(
    pubkey: &Pubkey,
    created_at: u64,
    kind: Kind,
    tags: &[Tag],
    content: &str,
) -> EventId {
    // Canonical form: [0, pubkey, created_at, kind, tags, content]
    let canonical = serde_json::to_string(&(0u8, pubkey, created_at, kind, tags, content))
        .expect("canonical event form always serializes");
    let digest = Sha256::digest(canonical.as_bytes());
    EventId::from_bytes(digest.into())
}

/// Current unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// An unsigned inner event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rumor {
    pub id: EventId,
    pub pubkey: Pubkey,
    pub created_at: u64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
}

impl Rumor {
    /// Build a rumor, computing its id from the other fields.
    pub fn new(pubkey: Pubkey, kind: Kind, tags: Vec<Tag>, content: String) -> Self {
        let created_at = unix_now();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
        }
    }

    /// Build a rumor with an explicit timestamp.
    pub fn new_at(
        pubkey: Pubkey,
        kind: Kind,
        tags: Vec<Tag>,
        content: String,
        created_at: u64,
    ) -> Self {
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        Self {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
        }
    }

    /// Recompute the id from the current fields.
    pub fn computed_id(&self) -> EventId {
        compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content)
    }

    /// True when the stored id matches the canonical hash.
    pub fn id_is_consistent(&self) -> bool {
        self.id == self.computed_id()
    }

    /// JSON serialization used as MLS application data.
    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("rumor always serializes")
    }

    /// Parse application-data bytes back into a rumor.
    ///
    /// Fails when any required field is missing or malformed.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, EventError> {
        serde_json::from_slice(bytes).map_err(|e| EventError::InvalidPayload(e.to_string()))
    }

    /// First value of the named tag, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// All values of the named tag.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .map(|t| t.values().iter().map(String::as_str).collect())
            .unwrap_or_default()
    }
}

/// A signed event as published to relays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub pubkey: Pubkey,
    pub created_at: u64,
    pub kind: Kind,
    pub tags: Vec<Tag>,
    pub content: String,
    /// Hex-encoded Ed25519 signature over the event id.
    pub sig: String,
}

impl Event {
    /// Verify the id commitment and the signature.
    pub fn verify(&self) -> Result<(), EventError> {
        let expected = compute_id(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
        if expected != self.id {
            return Err(EventError::IdMismatch);
        }
        let key = VerifyingKey::from_bytes(self.pubkey.as_bytes())
            .map_err(|e| EventError::InvalidPubkey(e.to_string()))?;
        let sig_bytes = hex::decode(&self.sig).map_err(|_| EventError::InvalidSignature)?;
        let sig_arr: [u8; 64] = sig_bytes
            .try_into()
            .map_err(|_| EventError::InvalidSignature)?;
        let signature = Signature::from_bytes(&sig_arr);
        key.verify(self.id.as_bytes(), &signature)
            .map_err(|_| EventError::InvalidSignature)
    }

    /// Fail unless this event has the expected kind.
    pub fn expect_kind(&self, expected: Kind) -> Result<(), EventError> {
        if self.kind != expected {
            return Err(EventError::UnexpectedKind {
                expected: expected.as_u16(),
                got: self.kind.as_u16(),
            });
        }
        Ok(())
    }

    /// First value of the named tag, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .and_then(Tag::value)
    }

    /// All values of the named tag.
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .find(|t| t.name() == Some(name))
            .map(|t| t.values().iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Drop the signature, leaving the rumor form.
    pub fn into_rumor(self) -> Rumor {
        Rumor {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
        }
    }
}

/// One-shot Ed25519 key pair used to sign a single published event.
///
/// Group message envelopes and gift wraps are signed with a key generated
/// for that one event, so the publisher key never links to the sender's
/// identity.
pub struct EphemeralKeys {
    signing: SigningKey,
}

impl EphemeralKeys {
    /// Generate a fresh key pair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// Build a signer from existing identity seed bytes.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn public_key(&self) -> Pubkey {
        Pubkey::from_bytes(self.signing.verifying_key().to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing
    }

    /// Sign an event authored by this key.
    pub fn sign(&self, kind: Kind, tags: Vec<Tag>, content: String) -> Event {
        self.sign_at(kind, tags, content, unix_now())
    }

    /// Sign an event with an explicit timestamp.
    pub fn sign_at(&self, kind: Kind, tags: Vec<Tag>, content: String, created_at: u64) -> Event {
        let pubkey = self.public_key();
        let id = compute_id(&pubkey, created_at, kind, &tags, &content);
        let signature = self.signing.sign(id.as_bytes());
        Event {
            id,
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig: hex::encode(signature.to_bytes()),
        }
    }
}
