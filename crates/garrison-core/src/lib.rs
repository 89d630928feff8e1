//! garrison-core: end-to-end encrypted group messaging.
//!
//! Combines MLS (RFC 9420, via OpenMLS) group keying with a relay-based
//! event network. The core owns group state, the two-layer message
//! pipeline, key package custody, the invite inbox and the multi-group
//! client; transport, signing and persistence are consumed through the
//! traits in [`network`], [`signer`] and [`store`].

use openmls::prelude::{Ciphersuite, ExtensionType};

pub mod admin;
pub mod client;
pub mod config;
pub mod credential;
pub mod envelope;
pub mod error;
pub mod facade;
pub mod group;
pub mod ingest;
pub mod inbox;
pub mod key_package;
pub mod network;
pub mod provider;
pub mod signal;
pub mod signer;
pub mod store;
pub mod welcome;

pub use client::Client;
pub use config::{Config, OnUnverifiableCommit};
pub use error::{Error, Result};
pub use facade::{GroupHandle, GroupSignal};

/// The single required ciphersuite.
pub const CIPHERSUITE: Ciphersuite = Ciphersuite::MLS_128_DHKEMX25519_AES128GCM_SHA256_Ed25519;

/// Group data extension type (`0xF2EE`).
pub const GROUP_DATA_EXTENSION: ExtensionType =
    ExtensionType::Unknown(garrison_proto::GROUP_DATA_EXTENSION_TYPE);

/// Extension types every key package must declare support for.
///
/// LastResort is listed because OpenMLS requires key-package-level
/// extensions to appear in capabilities during validation.
pub const SUPPORTED_EXTENSION_TYPES: [ExtensionType; 2] =
    [ExtensionType::LastResort, GROUP_DATA_EXTENSION];

/// Extension types all group members are required to support.
pub const REQUIRED_CONTEXT_EXTENSION_TYPES: [ExtensionType; 1] = [GROUP_DATA_EXTENSION];

/// MLS exporter label for the envelope key.
pub const EXPORTER_LABEL: &str = "nostr";

/// MLS exporter context for the envelope key.
pub const EXPORTER_CONTEXT: &[u8] = b"nostr";
