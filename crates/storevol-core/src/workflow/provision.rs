//! Fresh-install provisioning and the combined entry point invoked by the
//! host installer.

use super::remediate::{remediate, RemediationReport};
use super::{event, ConsentChannel, WorkflowEvent, WorkflowLevel, WorkflowReport};
use crate::artifacts::BootArtifacts;
use crate::config::{HostPolicy, StorevolConfig};
use crate::error::{StorevolError, StorevolResult};
use crate::mounter::MounterDaemon;
use crate::operator::VolumeOperator;
use storevol_provider::{CredentialStore, VolumeDescriptor, VolumeProvider};

/// Combined result of one installer invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub events: Vec<WorkflowEvent>,
    pub remediation: Option<RemediationReport>,
    pub provisioning: Option<WorkflowReport>,
}

impl RunReport {
    /// Number of candidate volumes whose corrective action failed.
    pub fn failed_volumes(&self) -> usize {
        self.remediation
            .as_ref()
            .map(|report| report.failures().count())
            .unwrap_or(0)
    }
}

/// Sequence a fresh install: boot artifacts, volume creation, conditional
/// encryption, then the mount daemon.
///
/// If any step past the artifact set fails, the artifacts stay in place on
/// purpose: the next run's remediation pass reconciles them against whatever
/// volume state the failure left behind.
pub fn provision<P, C>(
    config: &StorevolConfig,
    policy: &HostPolicy,
    provider: &P,
    credentials: &C,
    artifacts: &BootArtifacts,
    mounter: &MounterDaemon,
) -> StorevolResult<WorkflowReport>
where
    P: VolumeProvider<Error = StorevolError>,
    C: CredentialStore<Error = StorevolError>,
{
    let title = "Volume provisioning".to_string();
    let mut events = Vec::new();

    if !policy.is_target_platform || !policy.volume_required {
        events.push(event(
            WorkflowLevel::Info,
            "host does not require a dedicated package-store volume; skipping provisioning",
        ));
        return Ok(WorkflowReport { title, events });
    }

    artifacts.add_all()?;
    events.push(event(WorkflowLevel::Success, "boot artifacts in place"));

    let operator = VolumeOperator::new(provider, credentials);
    let existing = find_usable_volume(config, policy, provider)?;
    match existing {
        Some(volume) => {
            events.push(event(
                WorkflowLevel::Info,
                format!(
                    "reusing existing volume {} on {}",
                    volume.identifier, volume.disk
                ),
            ));
        }
        None => {
            let disk = policy
                .pinned_disk
                .as_deref()
                .unwrap_or(&config.volume.preferred_disk);
            let volume = operator.create(disk, &config.volume.label, &config.volume.mountpoint)?;
            events.push(event(
                WorkflowLevel::Success,
                format!("created volume {} on {disk}", volume.identifier),
            ));

            if policy.full_disk_encryption_active {
                operator.encrypt(&volume)?;
                events.push(event(
                    WorkflowLevel::Security,
                    format!(
                        "encrypted volume {}; passphrase stored in the keychain",
                        volume.identifier
                    ),
                ));
            }
        }
    }

    mounter.install()?;
    events.push(event(
        WorkflowLevel::Success,
        "mount-at-boot daemon installed",
    ));

    Ok(WorkflowReport { title, events })
}

/// Entry point invoked by the installation procedure before it performs its
/// own work. An uninstall-only invocation skips remediation and provisioning
/// entirely; the full uninstall flow is handled elsewhere.
#[allow(clippy::too_many_arguments)]
pub fn run<P, C>(
    config: &StorevolConfig,
    policy: &HostPolicy,
    provider: &P,
    credentials: &C,
    artifacts: &BootArtifacts,
    mounter: &MounterDaemon,
    consent: &dyn ConsentChannel,
    uninstall_requested: bool,
) -> StorevolResult<RunReport>
where
    P: VolumeProvider<Error = StorevolError>,
    C: CredentialStore<Error = StorevolError>,
{
    if uninstall_requested {
        return Ok(RunReport {
            events: vec![event(
                WorkflowLevel::Info,
                "uninstall requested; volume remediation and provisioning skipped",
            )],
            remediation: None,
            provisioning: None,
        });
    }

    let remediation = remediate(config, policy, provider, credentials, artifacts, consent)?;
    let provisioning = provision(config, policy, provider, credentials, artifacts, mounter)?;
    Ok(RunReport {
        events: Vec::new(),
        remediation: Some(remediation),
        provisioning: Some(provisioning),
    })
}

/// A volume provisioning can reuse: reachable, carrying the expected label,
/// and on the pinned disk when pinning is active.
fn find_usable_volume<P>(
    config: &StorevolConfig,
    policy: &HostPolicy,
    provider: &P,
) -> StorevolResult<Option<VolumeDescriptor>>
where
    P: VolumeProvider<Error = StorevolError>,
{
    let volumes = provider.list_volumes(&config.volume.label)?;
    Ok(volumes.into_iter().find(|volume| {
        volume.reachable
            && policy
                .pinned_disk
                .as_deref()
                .map_or(true, |pinned| volume.disk == pinned)
    }))
}
