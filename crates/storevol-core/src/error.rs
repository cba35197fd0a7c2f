//! Error taxonomy shared across storevol crates.

use std::path::PathBuf;
use thiserror::Error;

pub type StorevolResult<T> = Result<T, StorevolError>;

#[derive(Debug, Error)]
pub enum StorevolError {
    /// The target disk cannot accept a new volume.
    #[error("disk {disk} cannot accept a new volume: {reason}")]
    DiskUnavailable { disk: String, reason: String },

    /// The volume is mounted and in use; destructive operations refuse to run.
    #[error("volume {0} is mounted and in use")]
    VolumeBusy(String),

    /// In-place encryption failed. The credential stored beforehand is left
    /// in place so partially applied key material is never lost.
    #[error("encrypting volume {volume} failed: {reason}")]
    EncryptionFailed { volume: String, reason: String },

    /// A differently-valued credential already exists under this reference.
    #[error("credential store already holds a different secret under `{0}`")]
    CredentialConflict(String),

    /// Boot-table or synthetic-definition mutation failed. Fatal for the
    /// current run: boot-time correctness cannot be guaranteed otherwise.
    #[error("boot artifact update failed for {path}: {reason}")]
    ArtifactWrite { path: PathBuf, reason: String },

    #[error("provider failure: {0}")]
    Provider(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
