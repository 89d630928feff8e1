//! garrison-proto: wire model for Garrison encrypted group messaging.
//!
//! This crate has no MLS dependency. It defines the binary codec used by
//! the group data extension and persisted state, the typed event model for
//! the relay network (kinds, tags, rumors, signed events, ephemeral
//! publisher keys), and the group data extension payload itself.

pub mod codec;
pub mod event;
pub mod group_data;
pub mod parsed;

pub use codec::{ContentEncoding, CodecError};
pub use event::{Event, EventError, EventId, EphemeralKeys, Kind, Pubkey, Rumor, Tag};
pub use group_data::{
    GroupData, GroupDataError, GROUP_DATA_EXTENSION_TYPE, GROUP_DATA_VERSION,
    NETWORK_GROUP_ID_LEN,
};
pub use parsed::{
    DeletionEvent, GiftWrapEnvelope, GroupMessageEnvelope, KeyPackagePublication, RelayListEvent,
};
