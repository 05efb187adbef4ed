//! Error types for the gateway.
//!
//! Two layers live here:
//! - [`GitError`] covers object parsing and pack encode/decode, the storage-format concerns shared
//!   by the stores and the negotiation engine.
//! - [`GatewayError`] is the umbrella a transport binding sees. It folds in path resolution,
//!   protocol and backing-store failures so the binding can pick one client-facing signal
//!   (HTTP status or SSH exit status) per failure class.

use thiserror::Error;

use crate::{protocol::types::ProtocolError, resolve::PathError, store::StoreError};

#[derive(Error, Debug)]
/// Object and pack format errors.
pub enum GitError {
    /// Invalid or unsupported git object type name or pack type id.
    #[error("The `{0}` is not a valid git object type.")]
    InvalidObjectType(String),

    /// Malformed commit object.
    #[error("Invalid commit: {0}")]
    InvalidCommitObject(String),

    /// Malformed tree object.
    #[error("Not a valid git tree object: {0}")]
    InvalidTreeObject(String),

    /// Malformed tag object.
    #[error("Not a valid git tag object: {0}")]
    InvalidTagObject(String),

    /// Invalid pack header magic or version.
    #[error("The `{0}` is not a valid pack header.")]
    InvalidPackHeader(String),

    /// Malformed pack stream (bad entry header, checksum mismatch, truncated data).
    #[error("The `{0}` is not a valid pack file.")]
    InvalidPackFile(String),

    /// Malformed or unsupported `.idx` file.
    #[error("The `{0}` is not a valid idx file.")]
    InvalidIdxFile(String),

    /// Delta could not be applied to its base.
    #[error("Delta object error: {0}")]
    DeltaObjectError(String),

    /// Encoding a pack failed.
    #[error("Pack encode error: {0}")]
    PackEncodeError(String),

    /// Underlying I/O error.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
}

/// Anything that can end a gateway interaction.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// Exit status reported on an SSH channel for this failure.
    pub fn exit_status(&self) -> u32 {
        1
    }
}
