//! Read-only health snapshot: volumes, boot artifacts, daemon, credentials.

use crate::artifacts::{ArtifactPresence, BootArtifacts};
use crate::config::StorevolConfig;
use crate::error::{StorevolError, StorevolResult};
use crate::mounter::MounterDaemon;
use crate::secret::credential_reference;
use storevol_provider::{CredentialStore, VolumeDescriptor, VolumeProvider};

/// Observed state of one candidate volume plus its credential.
#[derive(Debug, Clone)]
pub struct VolumeStatus {
    pub volume: VolumeDescriptor,
    pub credential_present: bool,
    /// Whether the stored credential unlocks the volume. `None` when there is
    /// nothing to verify (no credential, or the volume is unencrypted).
    pub credential_unlocks: Option<bool>,
}

/// Everything `status` observed, with no mutations performed.
#[derive(Debug, Clone)]
pub struct HostStatus {
    pub volumes: Vec<VolumeStatus>,
    pub artifacts: ArtifactPresence,
    pub daemon_installed: bool,
}

/// Collect a health snapshot without changing anything on the host.
pub fn status<P, C>(
    config: &StorevolConfig,
    provider: &P,
    credentials: &C,
    artifacts: &BootArtifacts,
    mounter: &MounterDaemon,
) -> StorevolResult<HostStatus>
where
    P: VolumeProvider<Error = StorevolError>,
    C: CredentialStore<Error = StorevolError>,
{
    let mut volumes = Vec::new();
    for volume in provider.list_volumes(&config.volume.label)? {
        let reference = credential_reference(&volume.label, &volume.disk);
        let secret = credentials.retrieve(&reference)?;
        let credential_present = secret.is_some();
        let credential_unlocks = match secret {
            Some(secret) if volume.encrypted && volume.reachable => {
                Some(provider.verify_passphrase(&volume, &secret)?)
            }
            _ => None,
        };
        volumes.push(VolumeStatus {
            volume,
            credential_present,
            credential_unlocks,
        });
    }

    Ok(HostStatus {
        volumes,
        artifacts: artifacts.presence()?,
        daemon_installed: mounter.installed(),
    })
}
