//! Boot-time artifact management.
//!
//! The synthetic filesystem entry, the mount point directory, and the fstab
//! entry are handled as one logical set: all added or all removed. Each
//! member operation is idempotent so a re-run after partial failure
//! converges instead of erroring.

use crate::config::StorevolConfig;
use crate::error::{StorevolError, StorevolResult};
use log::{info, warn};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const SYNTHETIC_CONF_ENV: &str = "STOREVOL_SYNTHETIC_CONF";
const FSTAB_ENV: &str = "STOREVOL_FSTAB";
const DEFAULT_SYNTHETIC_CONF: &str = "/etc/synthetic.conf";
const DEFAULT_FSTAB: &str = "/etc/fstab";
const FSTAB_OPTIONS: &str = "apfs rw,noauto,nobrowse,suid,owners";

/// Presence of each member of the boot artifact set, as observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactPresence {
    pub synthetic_entry: bool,
    pub mountpoint: bool,
    pub fstab_entry: bool,
}

impl ArtifactPresence {
    pub fn complete(&self) -> bool {
        self.synthetic_entry && self.mountpoint && self.fstab_entry
    }

    pub fn empty(&self) -> bool {
        !self.synthetic_entry && !self.mountpoint && !self.fstab_entry
    }
}

/// Adds and removes the boot artifact set.
///
/// Add order is synthetic entry, mount point, fstab entry: a mount-table
/// line referencing a synthetic definition that does not exist is the worse
/// dangling state, so the definition lands first and leaves last.
pub struct BootArtifacts {
    synthetic_conf: PathBuf,
    fstab: PathBuf,
    mountpoint: PathBuf,
    synthetic_name: String,
    label: String,
}

impl BootArtifacts {
    /// Build the manager from configuration, honouring the file-path
    /// environment overrides.
    pub fn from_config(config: &StorevolConfig) -> StorevolResult<Self> {
        Ok(Self::with_paths(
            path_from_env(SYNTHETIC_CONF_ENV, DEFAULT_SYNTHETIC_CONF),
            path_from_env(FSTAB_ENV, DEFAULT_FSTAB),
            config.volume.mountpoint.clone(),
            config.synthetic_name()?.to_string(),
            config.volume.label.clone(),
        ))
    }

    /// Build the manager against explicit host file paths.
    pub fn with_paths(
        synthetic_conf: PathBuf,
        fstab: PathBuf,
        mountpoint: PathBuf,
        synthetic_name: String,
        label: String,
    ) -> Self {
        Self {
            synthetic_conf,
            fstab,
            mountpoint,
            synthetic_name,
            label,
        }
    }

    /// Add every member of the set. Already-present members are untouched.
    pub fn add_all(&self) -> StorevolResult<()> {
        ensure_line(&self.synthetic_conf, &self.synthetic_name)?;
        fs::create_dir_all(&self.mountpoint)
            .map_err(|err| artifact_write(&self.mountpoint, &err))?;
        ensure_line(&self.fstab, &self.fstab_entry())?;
        info!(
            "boot artifacts in place for {} at {}",
            self.label,
            self.mountpoint.display()
        );
        Ok(())
    }

    /// Remove every member of the set, in reverse add order. Absent members
    /// are a silent success.
    pub fn remove_all(&self) -> StorevolResult<()> {
        remove_line(&self.fstab, &self.fstab_entry())?;
        self.remove_mountpoint();
        remove_line(&self.synthetic_conf, &self.synthetic_name)?;
        info!("boot artifacts removed for {}", self.label);
        Ok(())
    }

    /// Observe which members currently exist.
    pub fn presence(&self) -> StorevolResult<ArtifactPresence> {
        Ok(ArtifactPresence {
            synthetic_entry: file_has_line(&self.synthetic_conf, &self.synthetic_name)?,
            mountpoint: self.mountpoint.is_dir(),
            fstab_entry: file_has_line(&self.fstab, &self.fstab_entry())?,
        })
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    fn fstab_entry(&self) -> String {
        format!(
            "LABEL={} {} {}",
            escape_fstab_field(&self.label),
            self.mountpoint.display(),
            FSTAB_OPTIONS
        )
    }

    fn remove_mountpoint(&self) {
        // A populated or busy mount point belongs to whatever is mounted
        // there; only an empty leftover directory is cleaned up.
        match fs::remove_dir(&self.mountpoint) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(
                "leaving mount point {} in place: {err}",
                self.mountpoint.display()
            ),
        }
    }
}

/// Spaces (and other separators) are octal-escaped per mount-table syntax.
fn escape_fstab_field(value: &str) -> String {
    value
        .chars()
        .map(|ch| match ch {
            ' ' => "\\040".to_string(),
            '\t' => "\\011".to_string(),
            other => other.to_string(),
        })
        .collect()
}

fn path_from_env(key: &str, default: &str) -> PathBuf {
    env::var_os(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(default))
}

fn read_lines(path: &Path) -> StorevolResult<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.lines().map(str::to_string).collect()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(err) => Err(artifact_write(path, &err)),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> StorevolResult<()> {
    let mut contents = lines.join("\n");
    if !contents.is_empty() {
        contents.push('\n');
    }
    fs::write(path, contents).map_err(|err| artifact_write(path, &err))
}

fn file_has_line(path: &Path, line: &str) -> StorevolResult<bool> {
    Ok(read_lines(path)?.iter().any(|existing| existing == line))
}

/// Append `line` unless an identical line already exists.
fn ensure_line(path: &Path, line: &str) -> StorevolResult<()> {
    let mut lines = read_lines(path)?;
    if lines.iter().any(|existing| existing == line) {
        return Ok(());
    }
    lines.push(line.to_string());
    write_lines(path, &lines)
}

/// Drop every line identical to `line`; absent file or line is a no-op.
fn remove_line(path: &Path, line: &str) -> StorevolResult<()> {
    let lines = read_lines(path)?;
    if !lines.iter().any(|existing| existing == line) {
        return Ok(());
    }
    let kept: Vec<String> = lines.into_iter().filter(|existing| existing != line).collect();
    write_lines(path, &kept)
}

fn artifact_write(path: &Path, err: &std::io::Error) -> StorevolError {
    StorevolError::ArtifactWrite {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
