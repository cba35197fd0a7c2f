use super::*;
use crate::artifacts::BootArtifacts;
use crate::config::{HostPolicy, StorevolConfig};
use crate::error::{StorevolError, StorevolResult};
use crate::mounter::MounterDaemon;
use crate::secret::credential_reference;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use storevol_provider::{CredentialStore, VolumeDescriptor, VolumeProvider};
use tempfile::tempdir;

/// Shared, ordered record of every observable call across the fakes.
type Journal = Arc<Mutex<Vec<String>>>;

fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

fn count_with_prefix(journal: &Journal, prefix: &str) -> usize {
    entries(journal)
        .iter()
        .filter(|entry| entry.starts_with(prefix))
        .count()
}

#[derive(Clone)]
struct MockVolumes {
    volumes: Arc<Mutex<Vec<VolumeDescriptor>>>,
    unlockable: Arc<Mutex<HashMap<String, String>>>,
    mounted: Arc<Mutex<HashSet<String>>>,
    fail_encrypt: bool,
    journal: Journal,
}

impl MockVolumes {
    fn new(journal: &Journal) -> Self {
        Self {
            volumes: Arc::new(Mutex::new(Vec::new())),
            unlockable: Arc::new(Mutex::new(HashMap::new())),
            mounted: Arc::new(Mutex::new(HashSet::new())),
            fail_encrypt: false,
            journal: journal.clone(),
        }
    }

    fn with_volume(self, volume: VolumeDescriptor) -> Self {
        self.volumes.lock().unwrap().push(volume);
        self
    }

    fn set_unlockable(&self, identifier: &str, passphrase: &str) {
        self.unlockable
            .lock()
            .unwrap()
            .insert(identifier.to_string(), passphrase.to_string());
    }

    fn set_mounted(&self, identifier: &str) {
        self.mounted.lock().unwrap().insert(identifier.to_string());
    }

    fn remaining(&self) -> Vec<VolumeDescriptor> {
        self.volumes.lock().unwrap().clone()
    }
}

impl VolumeProvider for MockVolumes {
    type Error = StorevolError;

    fn list_volumes(&self, label: &str) -> StorevolResult<Vec<VolumeDescriptor>> {
        self.journal.lock().unwrap().push("list".to_string());
        Ok(self
            .volumes
            .lock()
            .unwrap()
            .iter()
            .filter(|volume| volume.label == label)
            .cloned()
            .collect())
    }

    fn create_volume(
        &self,
        disk: &str,
        label: &str,
        _mountpoint: &Path,
    ) -> StorevolResult<VolumeDescriptor> {
        self.journal.lock().unwrap().push(format!("create:{disk}"));
        let mut volumes = self.volumes.lock().unwrap();
        let volume = VolumeDescriptor {
            label: label.to_string(),
            disk: disk.to_string(),
            identifier: format!("{disk}s{}", volumes.len() + 1),
            encrypted: false,
            reachable: true,
        };
        volumes.push(volume.clone());
        Ok(volume)
    }

    fn encrypt_volume(&self, volume: &VolumeDescriptor, passphrase: &str) -> StorevolResult<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("encrypt:{}", volume.identifier));
        if self.fail_encrypt {
            return Err(StorevolError::EncryptionFailed {
                volume: volume.identifier.clone(),
                reason: "simulated failure".into(),
            });
        }
        for existing in self.volumes.lock().unwrap().iter_mut() {
            if existing.identifier == volume.identifier {
                existing.encrypted = true;
            }
        }
        self.set_unlockable(&volume.identifier, passphrase);
        Ok(())
    }

    fn delete_volume(&self, volume: &VolumeDescriptor) -> StorevolResult<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("delete:{}", volume.identifier));
        self.volumes
            .lock()
            .unwrap()
            .retain(|existing| existing.identifier != volume.identifier);
        Ok(())
    }

    fn volume_mounted(&self, volume: &VolumeDescriptor) -> StorevolResult<bool> {
        Ok(self.mounted.lock().unwrap().contains(&volume.identifier))
    }

    fn verify_passphrase(
        &self,
        volume: &VolumeDescriptor,
        passphrase: &str,
    ) -> StorevolResult<bool> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("verify:{}", volume.identifier));
        Ok(self
            .unlockable
            .lock()
            .unwrap()
            .get(&volume.identifier)
            .is_some_and(|stored| stored == passphrase))
    }
}

#[derive(Clone)]
struct MockCredentials {
    secrets: Arc<Mutex<HashMap<String, String>>>,
    journal: Journal,
}

impl MockCredentials {
    fn new(journal: &Journal) -> Self {
        Self {
            secrets: Arc::new(Mutex::new(HashMap::new())),
            journal: journal.clone(),
        }
    }

    fn insert(&self, reference: &str, secret: &str) {
        self.secrets
            .lock()
            .unwrap()
            .insert(reference.to_string(), secret.to_string());
    }

    fn contains(&self, reference: &str) -> bool {
        self.secrets.lock().unwrap().contains_key(reference)
    }
}

impl CredentialStore for MockCredentials {
    type Error = StorevolError;

    fn store(&self, reference: &str, secret: &str, overwrite: bool) -> StorevolResult<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("store:{reference}"));
        let mut secrets = self.secrets.lock().unwrap();
        if let Some(existing) = secrets.get(reference) {
            if existing != secret && !overwrite {
                return Err(StorevolError::CredentialConflict(reference.to_string()));
            }
        }
        secrets.insert(reference.to_string(), secret.to_string());
        Ok(())
    }

    fn retrieve(&self, reference: &str) -> StorevolResult<Option<String>> {
        Ok(self.secrets.lock().unwrap().get(reference).cloned())
    }

    fn remove(&self, reference: &str) -> StorevolResult<()> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("remove:{reference}"));
        self.secrets.lock().unwrap().remove(reference);
        Ok(())
    }
}

struct ScriptedConsent {
    answer: bool,
    asked: Arc<Mutex<Vec<String>>>,
}

impl ScriptedConsent {
    fn new(answer: bool) -> Self {
        Self {
            answer,
            asked: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn questions(&self) -> Vec<String> {
        self.asked.lock().unwrap().clone()
    }
}

impl ConsentChannel for ScriptedConsent {
    fn ask(&self, question: &str) -> bool {
        self.asked.lock().unwrap().push(question.to_string());
        self.answer
    }
}

fn sample_policy(fde: bool, headless: bool) -> HostPolicy {
    HostPolicy {
        is_target_platform: true,
        full_disk_encryption_active: fde,
        is_headless_session: headless,
        volume_required: true,
        pinned_disk: None,
    }
}

fn store_volume(disk: &str, encrypted: bool) -> VolumeDescriptor {
    VolumeDescriptor {
        label: "Package Store".to_string(),
        disk: disk.to_string(),
        identifier: format!("{disk}s7"),
        encrypted,
        reachable: true,
    }
}

fn test_artifacts(dir: &Path) -> BootArtifacts {
    BootArtifacts::with_paths(
        dir.join("synthetic.conf"),
        dir.join("fstab"),
        dir.join("store"),
        "store".to_string(),
        "Package Store".to_string(),
    )
}

fn test_mounter(dir: &Path) -> MounterDaemon {
    MounterDaemon::with_dir(
        "org.storevol.volume-mount".to_string(),
        "Package Store".to_string(),
        dir.join("store"),
        dir.join("daemons"),
    )
}

fn mutation_count(journal: &Journal) -> usize {
    ["create:", "encrypt:", "delete:", "store:", "remove:"]
        .iter()
        .map(|prefix| count_with_prefix(journal, prefix))
        .sum()
}

#[test]
fn healthy_volume_needs_no_second_pass() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(true, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    let credentials = MockCredentials::new(&journal);
    let reference = credential_reference("Package Store", "disk1");
    credentials.insert(&reference, "hunter2");
    provider.set_unlockable("disk1s7", "hunter2");
    let artifacts = test_artifacts(dir.path());
    let consent = ScriptedConsent::new(false);

    for _ in 0..2 {
        let report = remediate(
            &config,
            &policy,
            &provider,
            &credentials,
            &artifacts,
            &consent,
        )
        .unwrap();
        assert_eq!(report.volumes.len(), 1);
        assert_eq!(report.volumes[0].outcome, RemediationOutcome::Healthy);
    }

    assert_eq!(mutation_count(&journal), 0);
    assert!(consent.questions().is_empty());
}

#[test]
fn declined_delete_leaves_the_volume_alone() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(false, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let consent = ScriptedConsent::new(false);

    let report = remediate(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &consent,
    )
    .unwrap();

    assert_eq!(report.volumes[0].outcome, RemediationOutcome::Declined);
    assert_eq!(consent.questions().len(), 1);
    assert_eq!(count_with_prefix(&journal, "delete:"), 0);
    assert_eq!(provider.remaining().len(), 1);
}

#[test]
fn unusable_credential_deletes_only_with_consent() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(false, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = remediate(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &consent,
    )
    .unwrap();

    assert_eq!(report.volumes[0].outcome, RemediationOutcome::Deleted);
    // Consent was gathered before the destructive call.
    assert_eq!(consent.questions().len(), 1);
    assert_eq!(count_with_prefix(&journal, "delete:"), 1);
    assert_eq!(count_with_prefix(&journal, "encrypt:"), 0);
    assert_eq!(count_with_prefix(&journal, "store:"), 0);
    assert!(provider.remaining().is_empty());
}

#[test]
fn stale_credential_counts_as_unusable() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(false, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    let credentials = MockCredentials::new(&journal);
    let reference = credential_reference("Package Store", "disk1");
    credentials.insert(&reference, "stale");
    provider.set_unlockable("disk1s7", "fresh");
    let artifacts = test_artifacts(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = remediate(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &consent,
    )
    .unwrap();

    assert_eq!(report.volumes[0].outcome, RemediationOutcome::Deleted);
    // The orphaned credential is cleaned up alongside the volume.
    assert!(!credentials.contains(&reference));
}

#[test]
fn headless_session_never_touches_an_unencrypted_volume() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(true, true);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", false));
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = remediate(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &consent,
    )
    .unwrap();

    assert_eq!(report.volumes[0].outcome, RemediationOutcome::HeadlessSkip);
    assert!(consent.questions().is_empty());
    assert_eq!(mutation_count(&journal), 0);
    assert!(!provider.remaining()[0].encrypted);
}

#[test]
fn interactive_session_encrypts_with_consent() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(true, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", false));
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = remediate(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &consent,
    )
    .unwrap();

    assert_eq!(report.volumes[0].outcome, RemediationOutcome::Encrypted);
    assert!(provider.remaining()[0].encrypted);

    // The credential lands in the store before the encrypt is issued.
    let log = entries(&journal);
    let store_at = log.iter().position(|e| e.starts_with("store:")).unwrap();
    let encrypt_at = log.iter().position(|e| e.starts_with("encrypt:")).unwrap();
    assert!(store_at < encrypt_at);

    let reference = credential_reference("Package Store", "disk1");
    assert!(credentials.contains(&reference));
}

#[test]
fn failed_encryption_keeps_the_stored_credential() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(true, false);
    let mut provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", false));
    provider.fail_encrypt = true;
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = remediate(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &consent,
    )
    .unwrap();

    assert!(matches!(
        report.volumes[0].outcome,
        RemediationOutcome::Failed(_)
    ));
    let reference = credential_reference("Package Store", "disk1");
    assert!(credentials.contains(&reference));
}

#[test]
fn mounted_volume_refuses_deletion() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(false, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    provider.set_mounted("disk1s7");
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = remediate(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &consent,
    )
    .unwrap();

    match &report.volumes[0].outcome {
        RemediationOutcome::Failed(reason) => assert!(reason.contains("mounted")),
        other => panic!("expected a failed outcome, got {other:?}"),
    }
    assert_eq!(provider.remaining().len(), 1);
}

#[test]
fn pinned_disk_limits_remediation_scope() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let mut policy = sample_policy(false, false);
    policy.pinned_disk = Some("disk1".to_string());
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk2", true));
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = remediate(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &consent,
    )
    .unwrap();

    assert_eq!(report.volumes[0].outcome, RemediationOutcome::OutOfScope);
    assert!(consent.questions().is_empty());
    assert_eq!(mutation_count(&journal), 0);
}

#[test]
fn remediation_reconciles_boot_artifacts() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(true, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    let credentials = MockCredentials::new(&journal);
    let reference = credential_reference("Package Store", "disk1");
    credentials.insert(&reference, "hunter2");
    provider.set_unlockable("disk1s7", "hunter2");
    let artifacts = test_artifacts(dir.path());
    artifacts.add_all().unwrap();
    let consent = ScriptedConsent::new(false);

    remediate(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &consent,
    )
    .unwrap();

    assert!(artifacts.presence().unwrap().empty());
}

#[test]
fn fresh_provision_sequences_every_step() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(true, false);
    let provider = MockVolumes::new(&journal);
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let mounter = test_mounter(dir.path());

    provision(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &mounter,
    )
    .unwrap();

    let reference = credential_reference("Package Store", "disk1");
    assert_eq!(
        entries(&journal),
        vec![
            "list".to_string(),
            "create:disk1".to_string(),
            format!("store:{reference}"),
            "encrypt:disk1s1".to_string(),
        ]
    );
    assert!(artifacts.presence().unwrap().complete());
    assert!(mounter.installed());
    assert!(credentials.contains(&reference));
}

#[test]
fn provision_without_fde_skips_encryption() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(false, false);
    let provider = MockVolumes::new(&journal);
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let mounter = test_mounter(dir.path());

    provision(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &mounter,
    )
    .unwrap();

    assert_eq!(count_with_prefix(&journal, "create:"), 1);
    assert_eq!(count_with_prefix(&journal, "encrypt:"), 0);
    assert_eq!(count_with_prefix(&journal, "store:"), 0);
    assert!(mounter.installed());
}

#[test]
fn provision_reuses_a_surviving_volume() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(true, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let mounter = test_mounter(dir.path());

    provision(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &mounter,
    )
    .unwrap();

    assert_eq!(count_with_prefix(&journal, "create:"), 0);
    assert_eq!(count_with_prefix(&journal, "encrypt:"), 0);
    assert!(artifacts.presence().unwrap().complete());
    assert!(mounter.installed());
}

#[test]
fn non_required_host_is_a_no_op() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let mut policy = sample_policy(true, false);
    policy.volume_required = false;
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", false));
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let mounter = test_mounter(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = run(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &mounter,
        &consent,
        false,
    )
    .unwrap();

    assert!(entries(&journal).is_empty());
    assert!(!mounter.installed());
    assert_eq!(report.failed_volumes(), 0);
}

#[test]
fn uninstall_request_skips_remediation_and_provisioning() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(true, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let mounter = test_mounter(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = run(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &mounter,
        &consent,
        true,
    )
    .unwrap();

    assert!(report.remediation.is_none());
    assert!(report.provisioning.is_none());
    assert!(entries(&journal).is_empty());
    assert!(artifacts.presence().unwrap().empty());
    assert!(!mounter.installed());
}

#[test]
fn full_run_recreates_after_a_consented_delete() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let policy = sample_policy(false, false);
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    let credentials = MockCredentials::new(&journal);
    let artifacts = test_artifacts(dir.path());
    let mounter = test_mounter(dir.path());
    let consent = ScriptedConsent::new(true);

    let report = run(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &mounter,
        &consent,
        false,
    )
    .unwrap();

    let remediation = report.remediation.as_ref().unwrap();
    assert_eq!(remediation.volumes[0].outcome, RemediationOutcome::Deleted);

    let log = entries(&journal);
    let delete_at = log.iter().position(|e| e.starts_with("delete:")).unwrap();
    let create_at = log.iter().position(|e| e.starts_with("create:")).unwrap();
    assert!(delete_at < create_at);

    assert_eq!(provider.remaining().len(), 1);
    assert!(artifacts.presence().unwrap().complete());
    assert!(mounter.installed());
}

#[test]
fn status_reports_without_mutating() {
    let dir = tempdir().unwrap();
    let journal = Journal::default();
    let config = StorevolConfig::default();
    let provider = MockVolumes::new(&journal).with_volume(store_volume("disk1", true));
    let credentials = MockCredentials::new(&journal);
    let reference = credential_reference("Package Store", "disk1");
    credentials.insert(&reference, "hunter2");
    provider.set_unlockable("disk1s7", "hunter2");
    let artifacts = test_artifacts(dir.path());
    let mounter = test_mounter(dir.path());

    let snapshot = status(&config, &provider, &credentials, &artifacts, &mounter).unwrap();

    assert_eq!(snapshot.volumes.len(), 1);
    assert!(snapshot.volumes[0].credential_present);
    assert_eq!(snapshot.volumes[0].credential_unlocks, Some(true));
    assert!(snapshot.artifacts.empty());
    assert!(!snapshot.daemon_installed);
    assert_eq!(mutation_count(&journal), 0);
}
