//! Volume lifecycle operations: create, encrypt, delete.

use crate::error::{StorevolError, StorevolResult};
use crate::secret::{credential_reference, generate_passphrase};
use log::info;
use std::path::Path;
use storevol_provider::{CredentialStore, VolumeDescriptor, VolumeProvider};

/// Performs volume mutations on behalf of the workflows.
///
/// Consent is never gathered here: callers own the decision to run a
/// destructive operation.
pub struct VolumeOperator<'a, P, C> {
    provider: &'a P,
    credentials: &'a C,
}

impl<'a, P, C> VolumeOperator<'a, P, C>
where
    P: VolumeProvider<Error = StorevolError>,
    C: CredentialStore<Error = StorevolError>,
{
    pub fn new(provider: &'a P, credentials: &'a C) -> Self {
        Self {
            provider,
            credentials,
        }
    }

    /// Create a fresh labeled volume on `disk`.
    pub fn create(
        &self,
        disk: &str,
        label: &str,
        mountpoint: &Path,
    ) -> StorevolResult<VolumeDescriptor> {
        let volume = self.provider.create_volume(disk, label, mountpoint)?;
        info!("created volume {} on {}", volume.identifier, volume.disk);
        Ok(volume)
    }

    /// Encrypt `volume` in place with a freshly generated passphrase.
    ///
    /// The passphrase is stored under the derived reference *before* the
    /// encrypt operation is issued, so a crash mid-operation leaves a
    /// retrievable credential rather than a locked volume with no recorded
    /// secret. On failure the stored credential stays in place: an unused
    /// credential is harmless, lost key material is not.
    pub fn encrypt(&self, volume: &VolumeDescriptor) -> StorevolResult<VolumeDescriptor> {
        let reference = credential_reference(&volume.label, &volume.disk);
        let passphrase = generate_passphrase();
        self.credentials.store(&reference, &passphrase, false)?;
        info!("stored encryption credential under `{reference}`");

        self.provider.encrypt_volume(volume, &passphrase)?;
        info!("encrypted volume {} in place", volume.identifier);
        Ok(VolumeDescriptor {
            encrypted: true,
            ..volume.clone()
        })
    }

    /// Destroy `volume`. Refuses while the volume is mounted.
    pub fn delete(&self, volume: &VolumeDescriptor) -> StorevolResult<()> {
        if self.provider.volume_mounted(volume)? {
            return Err(StorevolError::VolumeBusy(volume.identifier.clone()));
        }
        self.provider.delete_volume(volume)?;
        info!("deleted volume {}", volume.identifier);
        Ok(())
    }
}
