//! Per-volume remediation: reconcile observed volume, credential, and boot
//! artifact state back to a healthy configuration.
//!
//! Every corrective action that could destroy data is gated behind the
//! injected consent channel. Failures remediating one candidate volume are
//! collected and never abort the remaining candidates.

use super::{event, ConsentChannel, WorkflowEvent, WorkflowLevel};
use crate::artifacts::BootArtifacts;
use crate::config::{HostPolicy, StorevolConfig};
use crate::error::{StorevolError, StorevolResult};
use crate::operator::VolumeOperator;
use crate::secret::credential_reference;
use storevol_provider::{CredentialStore, VolumeDescriptor, VolumeProvider};

/// Tagged outcome of remediating one candidate volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemediationOutcome {
    /// Encrypted volume whose stored credential unlocks it; nothing to do.
    Healthy,
    /// Unencrypted volume on a host without full-disk encryption; consistent.
    Consistent,
    /// Volume could not be queried; left untouched for fresh provisioning.
    Unreachable,
    /// Volume deleted after explicit consent (its credential was unusable).
    Deleted,
    /// Volume encrypted in place after explicit consent.
    Encrypted,
    /// The user declined the proposed action; volume left as observed.
    Declined,
    /// Headless session cannot prompt; unencrypted volume left as-is.
    HeadlessSkip,
    /// Volume sits on a different disk than the pinned one; never touched.
    OutOfScope,
    /// The corrective action failed; other candidates continue regardless.
    Failed(String),
}

/// Remediation result for one candidate volume.
#[derive(Debug, Clone)]
pub struct VolumeRemediation {
    pub volume: VolumeDescriptor,
    pub outcome: RemediationOutcome,
}

/// Report produced by a remediation run.
#[derive(Debug, Clone)]
pub struct RemediationReport {
    pub title: String,
    pub events: Vec<WorkflowEvent>,
    pub volumes: Vec<VolumeRemediation>,
}

impl RemediationReport {
    /// Volumes whose corrective action failed.
    pub fn failures(&self) -> impl Iterator<Item = &VolumeRemediation> {
        self.volumes
            .iter()
            .filter(|entry| matches!(entry.outcome, RemediationOutcome::Failed(_)))
    }
}

/// Evaluate every candidate volume against the decision table and apply the
/// chosen corrective action, then clear the boot artifact set so stale
/// entries never outlive the volume they referenced. Fresh provisioning
/// re-adds the set when the host still requires it.
pub fn remediate<P, C>(
    config: &StorevolConfig,
    policy: &HostPolicy,
    provider: &P,
    credentials: &C,
    artifacts: &BootArtifacts,
    consent: &dyn ConsentChannel,
) -> StorevolResult<RemediationReport>
where
    P: VolumeProvider<Error = StorevolError>,
    C: CredentialStore<Error = StorevolError>,
{
    let title = "Volume remediation".to_string();
    let mut events = Vec::new();
    let mut volumes = Vec::new();

    if !policy.is_target_platform || !policy.volume_required {
        events.push(event(
            WorkflowLevel::Info,
            "host does not require a dedicated package-store volume; nothing to remediate",
        ));
        return Ok(RemediationReport {
            title,
            events,
            volumes,
        });
    }

    let label = &config.volume.label;
    let candidates = provider.list_volumes(label)?;
    if candidates.is_empty() {
        events.push(event(
            WorkflowLevel::Info,
            format!("no volume labeled `{label}` found; fresh provisioning will create one"),
        ));
    }

    let operator = VolumeOperator::new(provider, credentials);
    for volume in candidates {
        let outcome = match policy.pinned_disk.as_deref() {
            Some(pinned) if volume.disk != pinned => {
                events.push(event(
                    WorkflowLevel::Info,
                    format!(
                        "volume {} sits on {} rather than the pinned {pinned}; leaving it untouched",
                        volume.identifier, volume.disk
                    ),
                ));
                RemediationOutcome::OutOfScope
            }
            _ => remediate_volume(
                policy,
                &operator,
                provider,
                credentials,
                consent,
                &volume,
                &mut events,
            ),
        };
        volumes.push(VolumeRemediation { volume, outcome });
    }

    artifacts.remove_all()?;
    events.push(event(
        WorkflowLevel::Info,
        "boot artifacts cleared pending fresh provisioning",
    ));

    Ok(RemediationReport {
        title,
        events,
        volumes,
    })
}

fn remediate_volume<P, C>(
    policy: &HostPolicy,
    operator: &VolumeOperator<'_, P, C>,
    provider: &P,
    credentials: &C,
    consent: &dyn ConsentChannel,
    volume: &VolumeDescriptor,
    events: &mut Vec<WorkflowEvent>,
) -> RemediationOutcome
where
    P: VolumeProvider<Error = StorevolError>,
    C: CredentialStore<Error = StorevolError>,
{
    if !volume.reachable {
        events.push(event(
            WorkflowLevel::Warn,
            format!(
                "volume {} could not be queried; leaving it untouched",
                volume.identifier
            ),
        ));
        return RemediationOutcome::Unreachable;
    }

    if volume.encrypted {
        remediate_encrypted(operator, provider, credentials, consent, volume, events)
    } else if policy.full_disk_encryption_active {
        remediate_unencrypted(policy, operator, consent, volume, events)
    } else {
        events.push(event(
            WorkflowLevel::Info,
            format!(
                "volume {} is unencrypted and full-disk encryption is off; nothing to do",
                volume.identifier
            ),
        ));
        RemediationOutcome::Consistent
    }
}

/// An encrypted volume is healthy exactly when its stored credential
/// unlocks it. Anything else can only be recovered by deleting the volume,
/// which requires explicit consent.
fn remediate_encrypted<P, C>(
    operator: &VolumeOperator<'_, P, C>,
    provider: &P,
    credentials: &C,
    consent: &dyn ConsentChannel,
    volume: &VolumeDescriptor,
    events: &mut Vec<WorkflowEvent>,
) -> RemediationOutcome
where
    P: VolumeProvider<Error = StorevolError>,
    C: CredentialStore<Error = StorevolError>,
{
    let reference = credential_reference(&volume.label, &volume.disk);
    let usable = match credentials.retrieve(&reference) {
        Ok(Some(secret)) => match provider.verify_passphrase(volume, &secret) {
            Ok(unlocks) => unlocks,
            Err(err) => {
                events.push(event(
                    WorkflowLevel::Warn,
                    format!(
                        "could not verify the stored credential against {}: {err}",
                        volume.identifier
                    ),
                ));
                false
            }
        },
        Ok(None) => false,
        Err(err) => {
            events.push(event(
                WorkflowLevel::Warn,
                format!("credential store lookup for `{reference}` failed: {err}"),
            ));
            false
        }
    };

    if usable {
        events.push(event(
            WorkflowLevel::Success,
            format!(
                "volume {} is encrypted and its stored credential unlocks it",
                volume.identifier
            ),
        ));
        return RemediationOutcome::Healthy;
    }

    let question = format!(
        "The volume `{}` on {} is encrypted, but its recorded password is missing or does not \
         unlock it. Delete the volume so it can be recreated? (Alternatively, store the correct \
         password in the keychain under `{reference}` and re-run.)",
        volume.label, volume.disk
    );
    if !consent.ask(&question) {
        events.push(event(
            WorkflowLevel::Warn,
            format!(
                "consent declined; volume {} left as observed",
                volume.identifier
            ),
        ));
        return RemediationOutcome::Declined;
    }

    match operator.delete(volume) {
        Ok(()) => {
            // The credential is orphaned once the volume is gone; removal is
            // a no-op when it was already absent.
            if let Err(err) = credentials.remove(&reference) {
                events.push(event(
                    WorkflowLevel::Warn,
                    format!("could not remove orphaned credential `{reference}`: {err}"),
                ));
            }
            events.push(event(
                WorkflowLevel::Security,
                format!(
                    "deleted volume {} with consent; a fresh volume will be provisioned",
                    volume.identifier
                ),
            ));
            RemediationOutcome::Deleted
        }
        Err(err) => {
            events.push(event(
                WorkflowLevel::Error,
                format!("failed to delete volume {}: {err}", volume.identifier),
            ));
            RemediationOutcome::Failed(err.to_string())
        }
    }
}

fn remediate_unencrypted<P, C>(
    policy: &HostPolicy,
    operator: &VolumeOperator<'_, P, C>,
    consent: &dyn ConsentChannel,
    volume: &VolumeDescriptor,
    events: &mut Vec<WorkflowEvent>,
) -> RemediationOutcome
where
    P: VolumeProvider<Error = StorevolError>,
    C: CredentialStore<Error = StorevolError>,
{
    if policy.is_headless_session {
        events.push(event(
            WorkflowLevel::Warn,
            format!(
                "full-disk encryption is active but volume {} is unencrypted; cannot prompt in a \
                 headless session, leaving it as-is",
                volume.identifier
            ),
        ));
        return RemediationOutcome::HeadlessSkip;
    }

    let question = format!(
        "Full-disk encryption is active, but the volume `{}` on {} is not encrypted. Encrypt it \
         in place? (A fresh password will be generated and stored in the keychain.)",
        volume.label, volume.disk
    );
    if !consent.ask(&question) {
        events.push(event(
            WorkflowLevel::Warn,
            format!(
                "consent declined; volume {} stays unencrypted",
                volume.identifier
            ),
        ));
        return RemediationOutcome::Declined;
    }

    match operator.encrypt(volume) {
        Ok(_) => {
            events.push(event(
                WorkflowLevel::Security,
                format!(
                    "encrypted volume {} in place; passphrase stored in the keychain",
                    volume.identifier
                ),
            ));
            RemediationOutcome::Encrypted
        }
        Err(err) => {
            events.push(event(
                WorkflowLevel::Error,
                format!("failed to encrypt volume {}: {err}", volume.identifier),
            ));
            RemediationOutcome::Failed(err.to_string())
        }
    }
}
