//! storevol command-line entry point.
//!
//! A thin shell over the core workflows: parses the install-mode flags,
//! captures host policy once, and renders workflow reports. The actual
//! package installation is performed by the caller after this tool returns.

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, warn};
use std::io::{self, Write};
use std::path::PathBuf;
use storevol_apfs::{full_disk_encryption_active, SystemApfsProvider, SystemKeychainStore};
use storevol_core::artifacts::BootArtifacts;
use storevol_core::config::{config_schema, HostPolicy, StorevolConfig};
use storevol_core::logging;
use storevol_core::mounter::MounterDaemon;
use storevol_core::secret::credential_reference;
use storevol_core::workflow::{
    self, ConsentChannel, HostStatus, RemediationOutcome, RemediationReport, WorkflowEvent,
    WorkflowLevel, WorkflowReport,
};
use storevol_provider::{CredentialStore, VolumeProvider};

/// Prepare the package-store volume before an install, or inspect it.
#[derive(Parser, Debug)]
#[command(
    name = "storevol",
    version,
    about = "Provision, repair, and inspect the dedicated package-store volume."
)]
struct Cli {
    /// Path to the storevol configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run the daemon-based (multi-user) install preparation.
    #[arg(long, conflicts_with = "no_daemon")]
    daemon: bool,

    /// Run the single-user install preparation (unsupported on hosts that
    /// require a dedicated volume).
    #[arg(long)]
    no_daemon: bool,

    /// The caller is uninstalling; skip volume remediation and provisioning.
    #[arg(long)]
    uninstall: bool,

    /// Print a read-only status report and exit.
    #[arg(long)]
    status: bool,

    /// Prompt for the volume passphrase and record it in the keychain under
    /// the derived reference, then exit. Useful before re-running
    /// remediation when the recorded password is wrong.
    #[arg(long)]
    store_passphrase: bool,

    /// Answer yes to every consent prompt. Destructive remediation will
    /// proceed without asking.
    #[arg(long)]
    assume_yes: bool,

    /// Print the configuration file JSON schema and exit.
    #[arg(long)]
    config_schema: bool,
}

/// Interactive yes/no prompt on stdin; anything unclear counts as no.
struct TerminalConsent;

impl ConsentChannel for TerminalConsent {
    fn ask(&self, question: &str) -> bool {
        print!("{question} [y/N] ");
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
    }
}

/// Consent channel for `--assume-yes`.
struct AssumeYes;

impl ConsentChannel for AssumeYes {
    fn ask(&self, _question: &str) -> bool {
        true
    }
}

/// Headless sessions cannot prompt; every consent-gated action is declined.
struct DenyAll;

impl ConsentChannel for DenyAll {
    fn ask(&self, question: &str) -> bool {
        warn!("headless session; declining: {question}");
        false
    }
}

fn main() {
    logging::init("info");
    if let Err(err) = run() {
        error!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    if cli.config_schema {
        let schema = config_schema();
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(StorevolConfig::path_from_env);
    let config = StorevolConfig::load_or_default(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;

    let provider = SystemApfsProvider::from_config(&config).context("resolve volume tooling")?;
    let credentials =
        SystemKeychainStore::from_config(&config).context("resolve credential tooling")?;
    let artifacts = BootArtifacts::from_config(&config)?;
    let mounter = MounterDaemon::from_config(&config);

    if cli.status {
        let snapshot = workflow::status(&config, &provider, &credentials, &artifacts, &mounter)?;
        print_status(&config, &snapshot);
        return Ok(());
    }

    if cli.store_passphrase {
        return store_passphrase(&config, &provider, &credentials);
    }

    let fde = full_disk_encryption_active(&config).unwrap_or_else(|err| {
        warn!("could not determine full-disk encryption status: {err}");
        false
    });
    let policy = HostPolicy::from_environment(fde);

    if cli.no_daemon && policy.is_target_platform && policy.volume_required {
        bail!(
            "this platform requires the daemon-based install to keep the package-store volume \
             mounted; re-run with --daemon (or no flag)"
        );
    }

    let consent: Box<dyn ConsentChannel> = if policy.is_headless_session {
        Box::new(DenyAll)
    } else if cli.assume_yes {
        Box::new(AssumeYes)
    } else {
        Box::new(TerminalConsent)
    };

    let report = workflow::run(
        &config,
        &policy,
        &provider,
        &credentials,
        &artifacts,
        &mounter,
        consent.as_ref(),
        cli.uninstall,
    )?;

    print_events(&report.events);
    if let Some(remediation) = &report.remediation {
        print_remediation(remediation);
    }
    if let Some(provisioning) = &report.provisioning {
        print_report(provisioning);
    }

    let failed = report.failed_volumes();
    if failed > 0 {
        bail!("remediation failed for {failed} volume(s); see the report above");
    }
    Ok(())
}

/// Record an operator-supplied passphrase under the derived reference so the
/// next remediation run can verify it instead of proposing deletion.
fn store_passphrase<P, C>(config: &StorevolConfig, provider: &P, credentials: &C) -> Result<()>
where
    P: VolumeProvider<Error = storevol_core::StorevolError>,
    C: CredentialStore<Error = storevol_core::StorevolError>,
{
    let label = &config.volume.label;
    let volumes = provider.list_volumes(label)?;
    let volume = volumes
        .first()
        .with_context(|| format!("no volume labeled `{label}` found"))?;

    let reference = credential_reference(&volume.label, &volume.disk);
    let passphrase = rpassword::prompt_password(format!("Passphrase for `{label}`: "))?;
    if passphrase.is_empty() {
        bail!("passphrase must not be empty");
    }

    credentials.store(&reference, &passphrase, true)?;
    println!("Stored credential under `{reference}`.");

    if volume.encrypted {
        if provider.verify_passphrase(volume, &passphrase)? {
            println!("The stored passphrase unlocks {}.", volume.identifier);
        } else {
            warn!(
                "the stored passphrase does not unlock {}; remediation will still flag it",
                volume.identifier
            );
        }
    }
    Ok(())
}

fn print_report(report: &WorkflowReport) {
    println!("== {}", report.title);
    print_events(&report.events);
}

fn print_remediation(report: &RemediationReport) {
    println!("== {}", report.title);
    print_events(&report.events);
    for entry in &report.volumes {
        println!(
            "    volume {} on {}: {}",
            entry.volume.identifier,
            entry.volume.disk,
            describe_outcome(&entry.outcome)
        );
    }
}

fn print_events(events: &[WorkflowEvent]) {
    for event in events {
        println!("{} {}", level_tag(event.level), event.message);
    }
}

fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "  -",
        WorkflowLevel::Success => "  +",
        WorkflowLevel::Warn => "  !",
        WorkflowLevel::Error => "  x",
        WorkflowLevel::Security => "  #",
    }
}

fn describe_outcome(outcome: &RemediationOutcome) -> String {
    match outcome {
        RemediationOutcome::Healthy => "healthy".into(),
        RemediationOutcome::Consistent => "consistent (unencrypted, no full-disk encryption)".into(),
        RemediationOutcome::Unreachable => "unreachable; left untouched".into(),
        RemediationOutcome::Deleted => "deleted with consent".into(),
        RemediationOutcome::Encrypted => "encrypted in place".into(),
        RemediationOutcome::Declined => "left as observed (consent declined)".into(),
        RemediationOutcome::HeadlessSkip => "left unencrypted (headless session)".into(),
        RemediationOutcome::OutOfScope => "on another disk; out of scope".into(),
        RemediationOutcome::Failed(reason) => format!("failed: {reason}"),
    }
}

fn print_status(config: &StorevolConfig, status: &HostStatus) {
    println!("== Package-store volume status");
    if status.volumes.is_empty() {
        println!("  - no volume labeled `{}`", config.volume.label);
    }
    for entry in &status.volumes {
        let credential = if entry.credential_present {
            match entry.credential_unlocks {
                Some(true) => "credential ok",
                Some(false) => "credential does not unlock",
                None => "credential present",
            }
        } else {
            "no credential"
        };
        println!(
            "  - {} on {} ({}, {credential})",
            entry.volume.identifier,
            entry.volume.disk,
            if entry.volume.encrypted {
                "encrypted"
            } else {
                "unencrypted"
            }
        );
    }
    println!(
        "  - boot artifacts: synthetic {}, mount point {}, fstab {}",
        present(status.artifacts.synthetic_entry),
        present(status.artifacts.mountpoint),
        present(status.artifacts.fstab_entry)
    );
    println!(
        "  - mount daemon: {}",
        present(status.daemon_installed)
    );
}

fn present(value: bool) -> &'static str {
    if value {
        "present"
    } else {
        "absent"
    }
}
