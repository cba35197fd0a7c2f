//! System-backed `VolumeProvider` wrapping the host `diskutil` binary.
//!
//! Volume state is parsed from `diskutil info -all` text output; mutations
//! go through the `diskutil apfs` verbs. Full-disk encryption status comes
//! from `fdesetup status`.

use crate::command::{output_diagnostic, ToolCommand};
use log::warn;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use storevol_core::{StorevolConfig, StorevolError, StorevolResult};
use storevol_provider::{VolumeDescriptor, VolumeProvider};

const DISKUTIL_PATH_ENV: &str = "STOREVOL_DISKUTIL";
const DEFAULT_DISKUTIL_PATHS: &[&str] = &["/usr/sbin/diskutil", "/sbin/diskutil"];
const FDESETUP_PATH_ENV: &str = "STOREVOL_FDESETUP";
const DEFAULT_FDESETUP_PATHS: &[&str] = &["/usr/bin/fdesetup", "/usr/sbin/fdesetup"];

/// System provider that manages APFS volumes via the host `diskutil` binary.
#[derive(Debug, Clone)]
pub struct SystemApfsProvider {
    diskutil: ToolCommand,
}

impl SystemApfsProvider {
    /// Build a provider from configuration, resolving the `diskutil` binary.
    pub fn from_config(config: &StorevolConfig) -> StorevolResult<Self> {
        let binary = resolve_tool(DISKUTIL_PATH_ENV, DEFAULT_DISKUTIL_PATHS, "diskutil")?;
        Ok(Self {
            diskutil: ToolCommand::new(binary, Duration::from_secs(config.tools.timeout_secs)),
        })
    }

    /// Locate the labeled volume on `disk` after a create.
    fn find_volume(&self, disk: &str, label: &str) -> StorevolResult<Option<VolumeDescriptor>> {
        let volumes = self.list_volumes(label)?;
        Ok(volumes
            .into_iter()
            .filter(|volume| volume.disk == disk)
            .last())
    }
}

impl VolumeProvider for SystemApfsProvider {
    type Error = StorevolError;

    fn list_volumes(&self, label: &str) -> StorevolResult<Vec<VolumeDescriptor>> {
        let out = self.diskutil.run(&["info", "-all"], None)?;
        if out.status != 0 {
            return Err(StorevolError::Provider(format!(
                "diskutil info -all failed: {}",
                output_diagnostic(&out)
            )));
        }
        Ok(parse_volume_blocks(&out.stdout, label))
    }

    fn create_volume(
        &self,
        disk: &str,
        label: &str,
        mountpoint: &Path,
    ) -> StorevolResult<VolumeDescriptor> {
        let mount_arg = mountpoint.to_string_lossy().into_owned();
        let out = self.diskutil.run(
            &[
                "apfs",
                "addVolume",
                disk,
                "APFS",
                label,
                "-mountpoint",
                &mount_arg,
            ],
            None,
        )?;
        if out.status != 0 {
            return Err(StorevolError::DiskUnavailable {
                disk: disk.to_string(),
                reason: output_diagnostic(&out),
            });
        }

        self.find_volume(disk, label)?.ok_or_else(|| {
            StorevolError::Provider(format!(
                "diskutil reported success creating `{label}` on {disk} but the volume is not listed"
            ))
        })
    }

    fn encrypt_volume(&self, volume: &VolumeDescriptor, passphrase: &str) -> StorevolResult<()> {
        let out = self.diskutil.run(
            &[
                "apfs",
                "encryptVolume",
                &volume.identifier,
                "-user",
                "disk",
                "-stdinpassphrase",
            ],
            Some(passphrase.as_bytes()),
        )?;
        if out.status != 0 {
            return Err(StorevolError::EncryptionFailed {
                volume: volume.identifier.clone(),
                reason: output_diagnostic(&out),
            });
        }
        Ok(())
    }

    fn delete_volume(&self, volume: &VolumeDescriptor) -> StorevolResult<()> {
        let out = self
            .diskutil
            .run(&["apfs", "deleteVolume", &volume.identifier], None)?;
        if out.status == 0 {
            return Ok(());
        }

        let diagnostic = output_diagnostic(&out);
        if looks_busy(&diagnostic) {
            return Err(StorevolError::VolumeBusy(volume.identifier.clone()));
        }
        Err(StorevolError::Provider(format!(
            "diskutil failed to delete volume {}: {diagnostic}",
            volume.identifier
        )))
    }

    fn volume_mounted(&self, volume: &VolumeDescriptor) -> StorevolResult<bool> {
        let out = self.diskutil.run(&["info", &volume.identifier], None)?;
        if out.status != 0 {
            // A volume diskutil cannot describe is certainly not mounted.
            return Ok(false);
        }
        let fields = parse_fields(&out.stdout);
        Ok(fields.get("Mounted").is_some_and(|value| value == "Yes"))
    }

    fn verify_passphrase(
        &self,
        volume: &VolumeDescriptor,
        passphrase: &str,
    ) -> StorevolResult<bool> {
        // `-verify` checks the passphrase without changing mount or
        // encryption state.
        let out = self.diskutil.run(
            &[
                "apfs",
                "unlockVolume",
                &volume.identifier,
                "-verify",
                "-stdinpassphrase",
            ],
            Some(passphrase.as_bytes()),
        )?;
        if out.status == 0 {
            return Ok(true);
        }

        let diagnostic = output_diagnostic(&out);
        if !looks_like_rejection(&diagnostic) {
            warn!(
                "passphrase verification against {} did not complete cleanly: {diagnostic}",
                volume.identifier
            );
        }
        // Any failure counts as "does not unlock"; the remediation that
        // follows stays consent-gated either way.
        Ok(false)
    }
}

/// Whether host-wide encryption at rest is active, per `fdesetup status`.
pub fn full_disk_encryption_active(config: &StorevolConfig) -> StorevolResult<bool> {
    let binary = match resolve_tool(FDESETUP_PATH_ENV, DEFAULT_FDESETUP_PATHS, "fdesetup") {
        Ok(binary) => binary,
        Err(err) => {
            warn!("{err}; assuming full-disk encryption is inactive");
            return Ok(false);
        }
    };
    let tool = ToolCommand::new(binary, Duration::from_secs(config.tools.timeout_secs));
    let out = tool.run(&["status"], None)?;
    if out.status != 0 {
        return Err(StorevolError::Provider(format!(
            "fdesetup status failed: {}",
            output_diagnostic(&out)
        )));
    }
    Ok(out.stdout.to_ascii_lowercase().contains("filevault is on"))
}

/// Parse the per-volume blocks of `diskutil info -all` and keep those
/// matching `label`.
fn parse_volume_blocks(payload: &str, label: &str) -> Vec<VolumeDescriptor> {
    payload
        .lines()
        .collect::<Vec<_>>()
        .split(|line| is_block_separator(line))
        .filter_map(|block| descriptor_from_block(&block.join("\n"), label))
        .collect()
}

fn is_block_separator(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.len() >= 4 && trimmed.chars().all(|ch| ch == '*')
}

fn descriptor_from_block(block: &str, label: &str) -> Option<VolumeDescriptor> {
    let fields = parse_fields(block);
    if fields.get("Volume Name").map(String::as_str) != Some(label) {
        return None;
    }
    let identifier = fields.get("Device Identifier")?.clone();
    let disk = fields
        .get("Part of Whole")
        .cloned()
        .unwrap_or_else(|| whole_disk_of(&identifier));
    let encrypted = ["FileVault", "Encrypted"]
        .iter()
        .any(|key| fields.get(*key).is_some_and(|value| value == "Yes"));
    Some(VolumeDescriptor {
        label: label.to_string(),
        disk,
        identifier,
        encrypted,
        reachable: true,
    })
}

/// Parse the `   Key:   Value` lines diskutil emits.
fn parse_fields(block: &str) -> HashMap<String, String> {
    block
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() || value.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// `disk1s7` → `disk1`.
fn whole_disk_of(identifier: &str) -> String {
    match identifier.find('s') {
        Some(first) => match identifier[first + 1..].find('s') {
            Some(second) => identifier[..first + 1 + second].to_string(),
            None => identifier.to_string(),
        },
        None => identifier.to_string(),
    }
}

fn looks_busy(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("busy")
        || lower.contains("in use")
        || lower.contains("currently mounted")
        || lower.contains("could not be unmounted")
}

fn looks_like_rejection(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("passphrase")
        || lower.contains("incorrect")
        || lower.contains("authentication")
}

fn resolve_tool(env_key: &str, candidates: &[&str], name: &str) -> StorevolResult<PathBuf> {
    if let Some(explicit) = env::var_os(env_key) {
        let candidate = PathBuf::from(explicit);
        if !candidate.exists() {
            return Err(StorevolError::InvalidConfig(format!(
                "{name} binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate);
    }

    for candidate in candidates {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }

    find_in_path(name).ok_or_else(|| {
        StorevolError::InvalidConfig(format!(
            "unable to locate {name} binary; tried {candidates:?} and PATH"
        ))
    })
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
