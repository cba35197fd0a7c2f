//! Mount-at-boot daemon management.
//!
//! Installs and removes the launchd job that mounts the package-store
//! volume when the host boots. Presence of the job definition is the only
//! state; install and uninstall are idempotent.

use crate::config::StorevolConfig;
use crate::error::StorevolResult;
use log::{info, warn};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

const DAEMON_DIR_ENV: &str = "STOREVOL_DAEMON_DIR";
const LAUNCHCTL_PATH_ENV: &str = "STOREVOL_LAUNCHCTL";
const LAUNCHCTL_SKIP_ENV: &str = "STOREVOL_SKIP_LAUNCHCTL";
const DEFAULT_DAEMON_DIR: &str = "/Library/LaunchDaemons";
const LAUNCHCTL_CANDIDATES: &[&str] = &["/bin/launchctl", "/usr/bin/launchctl"];

/// Installs/removes the launchd job definition for the boot-time mounter.
pub struct MounterDaemon {
    label: String,
    volume_label: String,
    mountpoint: PathBuf,
    daemon_dir: PathBuf,
    skip_launchctl: bool,
}

impl MounterDaemon {
    /// Build the manager from configuration, honouring the directory and
    /// launchctl environment overrides.
    pub fn from_config(config: &StorevolConfig) -> Self {
        Self {
            label: config.daemon.label.clone(),
            volume_label: config.volume.label.clone(),
            mountpoint: config.volume.mountpoint.clone(),
            daemon_dir: env::var_os(DAEMON_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DAEMON_DIR)),
            skip_launchctl: env::var_os(LAUNCHCTL_SKIP_ENV).is_some(),
        }
    }

    /// Build the manager against an explicit daemon directory, without
    /// talking to launchd.
    pub fn with_dir(
        label: String,
        volume_label: String,
        mountpoint: PathBuf,
        daemon_dir: PathBuf,
    ) -> Self {
        Self {
            label,
            volume_label,
            mountpoint,
            daemon_dir,
            skip_launchctl: true,
        }
    }

    pub fn plist_path(&self) -> PathBuf {
        self.daemon_dir.join(format!("{}.plist", self.label))
    }

    pub fn installed(&self) -> bool {
        self.plist_path().exists()
    }

    /// Write the job definition and ask launchd to load it.
    ///
    /// A launchd load failure is reported but not fatal: the definition on
    /// disk is picked up at the next boot either way.
    pub fn install(&self) -> StorevolResult<()> {
        fs::create_dir_all(&self.daemon_dir)?;
        let path = self.plist_path();
        fs::write(&path, self.render_plist())?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644))?;
        info!("installed mount daemon definition at {}", path.display());

        if self.skip_launchctl {
            return Ok(());
        }
        match launchctl_path() {
            Some(launchctl) => bootstrap_job(&launchctl, &path),
            None => warn!("launchctl not found; the mount daemon will load at next boot"),
        }
        Ok(())
    }

    /// Unload and remove the job definition. Absence is a silent success.
    pub fn uninstall(&self) -> StorevolResult<()> {
        let path = self.plist_path();
        if !path.exists() {
            return Ok(());
        }

        if !self.skip_launchctl {
            if let Some(launchctl) = launchctl_path() {
                bootout_job(&launchctl, &self.label, &path);
            }
        }

        match fs::remove_file(&path) {
            Ok(()) => info!("removed mount daemon definition at {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(())
    }

    fn render_plist(&self) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
	<key>Label</key>
	<string>{label}</string>
	<key>RunAtLoad</key>
	<true/>
	<key>ProgramArguments</key>
	<array>
		<string>/usr/sbin/diskutil</string>
		<string>mount</string>
		<string>-mountPoint</string>
		<string>{mountpoint}</string>
		<string>{volume_label}</string>
	</array>
</dict>
</plist>
"#,
            label = self.label,
            mountpoint = self.mountpoint.display(),
            volume_label = self.volume_label,
        )
    }
}

/// Load the job now; fall back to the legacy subcommand on older hosts.
fn bootstrap_job(launchctl: &Path, plist: &Path) {
    let plist_arg = plist.to_string_lossy().into_owned();
    let primary = Command::new(launchctl)
        .args(["bootstrap", "system", &plist_arg])
        .output();
    match primary {
        Ok(result) if result.status.success() => {
            info!("mount daemon loaded");
            return;
        }
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if !action_unsupported(&stderr) && !already_loaded(&stderr) {
                warn!("launchctl bootstrap failed: {}", stderr.trim());
                return;
            }
            if already_loaded(&stderr) {
                return;
            }
        }
        Err(err) => {
            warn!("launchctl bootstrap failed: {err}");
            return;
        }
    }

    match Command::new(launchctl)
        .args(["load", "-w", &plist_arg])
        .output()
    {
        Ok(result) if result.status.success() => info!("mount daemon loaded"),
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if !already_loaded(&stderr) {
                warn!("launchctl load failed: {}", stderr.trim());
            }
        }
        Err(err) => warn!("launchctl load failed: {err}"),
    }
}

/// Unload the job; failures only warn since the definition is removed anyway.
fn bootout_job(launchctl: &Path, label: &str, plist: &Path) {
    let target = format!("system/{label}");
    let bootout = Command::new(launchctl).args(["bootout", &target]).output();
    match bootout {
        Ok(result) if result.status.success() => return,
        Ok(result) => {
            let stderr = String::from_utf8_lossy(&result.stderr);
            if !action_unsupported(&stderr) {
                return;
            }
        }
        Err(err) => {
            warn!("launchctl bootout failed: {err}");
            return;
        }
    }

    let plist_arg = plist.to_string_lossy().into_owned();
    if let Err(err) = Command::new(launchctl)
        .args(["unload", &plist_arg])
        .output()
    {
        warn!("launchctl unload failed: {err}");
    }
}

fn action_unsupported(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("unknown subcommand") || lower.contains("usage:")
}

fn already_loaded(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("already loaded") || lower.contains("service already loaded")
}

fn launchctl_path() -> Option<PathBuf> {
    if let Some(explicit) = env::var_os(LAUNCHCTL_PATH_ENV) {
        return Some(PathBuf::from(explicit));
    }
    LAUNCHCTL_CANDIDATES
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample(dir: &Path) -> MounterDaemon {
        MounterDaemon::with_dir(
            "org.storevol.volume-mount".to_string(),
            "Package Store".to_string(),
            PathBuf::from("/store"),
            dir.to_path_buf(),
        )
    }

    #[test]
    fn install_writes_the_job_definition() {
        let dir = tempdir().unwrap();
        let daemon = sample(dir.path());
        daemon.install().unwrap();

        assert!(daemon.installed());
        let plist = fs::read_to_string(daemon.plist_path()).unwrap();
        assert!(plist.contains("<string>org.storevol.volume-mount</string>"));
        assert!(plist.contains("<string>/store</string>"));
        assert!(plist.contains("<string>Package Store</string>"));
        let mode = fs::metadata(daemon.plist_path())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn install_and_uninstall_are_idempotent() {
        let dir = tempdir().unwrap();
        let daemon = sample(dir.path());
        daemon.install().unwrap();
        daemon.install().unwrap();
        daemon.uninstall().unwrap();
        assert!(!daemon.installed());
        daemon.uninstall().unwrap();
    }
}
