//! Provider contract for labeled package-store volumes.
//!
//! Implementations talk to the host's disk management tooling. Everything
//! here reports *observed* state; nothing is cached between calls.

use std::error::Error;
use std::path::Path;

/// One labeled volume as observed by a live inventory scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeDescriptor {
    /// Well-known label identifying the package-store volume.
    pub label: String,
    /// Identifier of the containing disk (e.g. `disk1`).
    pub disk: String,
    /// The volume's own device identifier (e.g. `disk1s7`).
    pub identifier: String,
    /// Whether the volume reports encryption at rest.
    pub encrypted: bool,
    /// Whether the volume could be located and queried just now.
    pub reachable: bool,
}

/// Abstraction over the host's volume management tooling.
pub trait VolumeProvider {
    type Error: Error + Send + Sync + 'static;

    /// Enumerate all volumes currently bearing `label`, queried live.
    ///
    /// An empty result is a valid, non-error outcome meaning "not yet
    /// provisioned".
    fn list_volumes(&self, label: &str) -> Result<Vec<VolumeDescriptor>, Self::Error>;

    /// Create a fresh volume labeled `label` on `disk`, mounted at `mountpoint`.
    fn create_volume(
        &self,
        disk: &str,
        label: &str,
        mountpoint: &Path,
    ) -> Result<VolumeDescriptor, Self::Error>;

    /// Encrypt `volume` in place with `passphrase`.
    fn encrypt_volume(
        &self,
        volume: &VolumeDescriptor,
        passphrase: &str,
    ) -> Result<(), Self::Error>;

    /// Destroy `volume`. Callers gate this behind explicit consent.
    fn delete_volume(&self, volume: &VolumeDescriptor) -> Result<(), Self::Error>;

    /// Whether `volume` is currently mounted.
    fn volume_mounted(&self, volume: &VolumeDescriptor) -> Result<bool, Self::Error>;

    /// Check whether `passphrase` unlocks `volume` without mutating its state.
    fn verify_passphrase(
        &self,
        volume: &VolumeDescriptor,
        passphrase: &str,
    ) -> Result<bool, Self::Error>;
}
