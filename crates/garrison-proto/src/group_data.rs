//! Group data extension payload.
//!
//! A binary blob embedded as an MLS group-context extension of type
//! `0xF2EE`. It carries the metadata every member must agree on: the
//! 32-byte network group id, name, description, the admin list, relay
//! hints and optional encrypted-image material. Because it lives in the
//! authenticated group context, tampering with it invalidates commits.

use thiserror::Error;
use url::Url;

use crate::codec::{put_bytes, put_opt_bytes, put_str, put_str_array, CodecError, Reader};
use crate::event::Pubkey;

/// Extension type id for the group data extension.
pub const GROUP_DATA_EXTENSION_TYPE: u16 = 0xF2EE;

/// Current encoding version.
pub const GROUP_DATA_VERSION: u8 = 1;

/// Length of the network group id.
pub const NETWORK_GROUP_ID_LEN: usize = 32;

const IMAGE_HASH_LEN: usize = 32;
const IMAGE_KEY_LEN: usize = 32;
const IMAGE_NONCE_LEN: usize = 12;

/// Errors from encoding or decoding the group data extension.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GroupDataError {
    #[error("unsupported group data version: {0}")]
    UnsupportedVersion(u8),

    #[error("network group id must be {expected} bytes, got {got}")]
    BadGroupIdLength { expected: usize, got: usize },

    #[error("admin entry is not a 64-char hex public key: {0}")]
    BadAdminEntry(String),

    #[error("relay is not a valid websocket url: {0}")]
    BadRelayUrl(String),

    #[error("image {field} must be {expected} bytes, got {got}")]
    BadImageField {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Group metadata embedded in the MLS group context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupData {
    /// 32-byte identifier used on the event network (the `h` tag value).
    pub network_group_id: [u8; NETWORK_GROUP_ID_LEN],
    pub name: String,
    pub description: String,
    /// Identities allowed to author commits.
    pub admin_pubkeys: Vec<Pubkey>,
    /// Relay URLs where the group publishes its events.
    pub relays: Vec<String>,
    pub image_hash: Option<[u8; IMAGE_HASH_LEN]>,
    pub image_key: Option<[u8; IMAGE_KEY_LEN]>,
    pub image_nonce: Option<[u8; IMAGE_NONCE_LEN]>,
}

impl GroupData {
    /// Build group data with a freshly generated random network id.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        admin_pubkeys: Vec<Pubkey>,
        relays: Vec<String>,
    ) -> Self {
        use rand::RngCore;
        let mut network_group_id = [0u8; NETWORK_GROUP_ID_LEN];
        rand::thread_rng().fill_bytes(&mut network_group_id);
        Self {
            network_group_id,
            name: name.into(),
            description: description.into(),
            admin_pubkeys,
            relays,
            image_hash: None,
            image_key: None,
            image_nonce: None,
        }
    }

    /// Hex form of the network group id, as used in `h` tags.
    pub fn network_group_id_hex(&self) -> String {
        hex::encode(self.network_group_id)
    }

    /// Case-insensitive admin membership check.
    pub fn is_admin(&self, identity: &Pubkey) -> bool {
        self.admin_pubkeys.iter().any(|admin| admin == identity)
    }

    /// Case-insensitive admin membership check against a hex identity.
    pub fn is_admin_hex(&self, identity_hex: &str) -> bool {
        match Pubkey::from_hex(identity_hex) {
            Ok(pk) => self.is_admin(&pk),
            Err(_) => false,
        }
    }

    /// Encode to the extension byte layout. Total for any valid value.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.push(GROUP_DATA_VERSION);
        put_bytes(&mut out, &self.network_group_id);
        put_str(&mut out, &self.name);
        put_str(&mut out, &self.description);
        let admins: Vec<String> = self.admin_pubkeys.iter().map(Pubkey::to_hex).collect();
        put_str_array(&mut out, &admins);
        put_str_array(&mut out, &self.relays);
        put_opt_bytes(&mut out, self.image_hash.as_ref().map(|v| v.as_slice()));
        put_opt_bytes(&mut out, self.image_key.as_ref().map(|v| v.as_slice()));
        put_opt_bytes(&mut out, self.image_nonce.as_ref().map(|v| v.as_slice()));
        out
    }

    /// Decode and validate an extension payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, GroupDataError> {
        let mut r = Reader::new(bytes);

        let version = r.u8()?;
        if version != GROUP_DATA_VERSION {
            return Err(GroupDataError::UnsupportedVersion(version));
        }

        let gid_raw = r.bytes()?;
        let network_group_id: [u8; NETWORK_GROUP_ID_LEN] =
            gid_raw
                .try_into()
                .map_err(|_| GroupDataError::BadGroupIdLength {
                    expected: NETWORK_GROUP_ID_LEN,
                    got: gid_raw.len(),
                })?;

        let name = r.string()?;
        let description = r.string()?;

        let mut admin_pubkeys = Vec::new();
        for entry in r.str_array()? {
            if entry.len() != 64 {
                return Err(GroupDataError::BadAdminEntry(entry));
            }
            let pk = Pubkey::from_hex(&entry).map_err(|_| GroupDataError::BadAdminEntry(entry))?;
            admin_pubkeys.push(pk);
        }

        let relays = r.str_array()?;
        for relay in &relays {
            validate_relay_url(relay)?;
        }

        let image_hash = decode_fixed_opt(r.opt_bytes()?, "hash", IMAGE_HASH_LEN)?;
        let image_key = decode_fixed_opt(r.opt_bytes()?, "key", IMAGE_KEY_LEN)?;
        let image_nonce = decode_fixed_opt(r.opt_bytes()?, "nonce", IMAGE_NONCE_LEN)?;

        Ok(Self {
            network_group_id,
            name,
            description,
            admin_pubkeys,
            relays,
            image_hash: image_hash.map(|v: Vec<u8>| v.try_into().expect("length checked")),
            image_key: image_key.map(|v: Vec<u8>| v.try_into().expect("length checked")),
            image_nonce: image_nonce.map(|v: Vec<u8>| v.try_into().expect("length checked")),
        })
    }
}

fn decode_fixed_opt(
    raw: Option<&[u8]>,
    field: &'static str,
    expected: usize,
) -> Result<Option<Vec<u8>>, GroupDataError> {
    match raw {
        None => Ok(None),
        Some(bytes) if bytes.len() == expected => Ok(Some(bytes.to_vec())),
        Some(bytes) => Err(GroupDataError::BadImageField {
            field,
            expected,
            got: bytes.len(),
        }),
    }
}

/// Reject anything that does not parse as a ws/wss URL.
pub fn validate_relay_url(relay: &str) -> Result<(), GroupDataError> {
    let parsed = Url::parse(relay).map_err(|_| GroupDataError::BadRelayUrl(relay.to_string()))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        _ => Err(GroupDataError::BadRelayUrl(relay.to_string())),
    }
}
