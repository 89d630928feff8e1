//! Error types for garrison-core.

use garrison_proto::{CodecError, EventError, GroupDataError};
use thiserror::Error;

/// Result type for garrison-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur across the group messaging core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("key package generation failed: {0}")]
    KeyPackageGeneration(String),

    #[error("key package validation failed: {0}")]
    KeyPackageValidation(String),

    #[error("key package not in custody: {0}")]
    KeyPackageNotFound(String),

    #[error("group creation failed: {0}")]
    GroupCreation(String),

    #[error("group not found: {0}")]
    GroupNotFound(String),

    #[error("corrupted group state: {0}")]
    CorruptedState(String),

    #[error("invalid credential: {0}")]
    InvalidCredential(String),

    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("invalid application data: {0}")]
    InvalidApplicationData(String),

    #[error("invalid welcome: {0}")]
    InvalidWelcome(String),

    #[error("unreadable envelope: {0}")]
    Unreadable(String),

    #[error("failed to create commit: {0}")]
    CreateCommit(String),

    #[error("failed to create proposal: {0}")]
    CreateProposal(String),

    #[error("failed to process message: {0}")]
    ProcessMessage(String),

    #[error("failed to process welcome: {0}")]
    ProcessWelcome(String),

    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("no relay acknowledged the publish")]
    PublishUnacknowledged,

    #[error("signer error: {0}")]
    Signer(String),

    #[error(transparent)]
    GroupData(#[from] GroupDataError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Event(#[from] EventError),
}
