//! Configuration model and the host policy snapshot threaded through workflows.

use crate::error::{StorevolError, StorevolResult};
use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/storevol.toml";
const CONFIG_ENV: &str = "STOREVOL_CONFIG";
const USE_DISK_ENV: &str = "STOREVOL_USE_DISK";
const VOLUME_REQUIRED_ENV: &str = "STOREVOL_VOLUME_REQUIRED";
const HEADLESS_ENV: &str = "STOREVOL_HEADLESS";

/// The volume this host is expected to carry.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct VolumeCfg {
    /// Well-known label identifying the package-store volume.
    pub label: String,
    /// Mount point backing the package store. Must be a root-level path so a
    /// synthetic filesystem entry can define it.
    pub mountpoint: PathBuf,
    /// Disk that receives a freshly created volume.
    pub preferred_disk: String,
}

impl Default for VolumeCfg {
    fn default() -> Self {
        Self {
            label: "Package Store".to_string(),
            mountpoint: PathBuf::from("/store"),
            preferred_disk: "disk1".to_string(),
        }
    }
}

/// Mount-at-boot daemon registration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonCfg {
    /// launchd label for the mount-at-boot job.
    pub label: String,
}

impl Default for DaemonCfg {
    fn default() -> Self {
        Self {
            label: "org.storevol.volume-mount".to_string(),
        }
    }
}

/// Credential store location.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct KeychainCfg {
    /// Keychain file receiving the volume passphrase.
    pub path: PathBuf,
}

impl Default for KeychainCfg {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/Library/Keychains/System.keychain"),
        }
    }
}

/// Host tool invocation limits.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct ToolsCfg {
    /// Timeout applied to every external tool invocation, in seconds. Disk
    /// operations (create, encrypt) can take a while.
    pub timeout_secs: u64,
}

impl Default for ToolsCfg {
    fn default() -> Self {
        Self { timeout_secs: 90 }
    }
}

/// Top-level storevol configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(default, deny_unknown_fields)]
pub struct StorevolConfig {
    pub volume: VolumeCfg,
    pub daemon: DaemonCfg,
    pub keychain: KeychainCfg,
    pub tools: ToolsCfg,

    /// Where this configuration was loaded from.
    #[serde(skip)]
    pub path: PathBuf,
}

impl StorevolConfig {
    /// Resolve the configuration path, honouring the `STOREVOL_CONFIG` override.
    pub fn path_from_env() -> PathBuf {
        env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Load the configuration at `path`, falling back to built-in defaults
    /// when the file does not exist.
    pub fn load_or_default(path: &Path) -> StorevolResult<Self> {
        let mut config = match fs::read_to_string(path) {
            Ok(raw) => toml::from_str::<StorevolConfig>(&raw).map_err(|err| {
                StorevolError::InvalidConfig(format!("{}: {err}", path.display()))
            })?,
            Err(err) if err.kind() == ErrorKind::NotFound => StorevolConfig::default(),
            Err(err) => return Err(err.into()),
        };
        config.path = path.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the workflows cannot act on.
    pub fn validate(&self) -> StorevolResult<()> {
        let label = self.volume.label.trim();
        if label.is_empty() || label.contains('\n') {
            return Err(StorevolError::InvalidConfig(
                "volume.label must be a non-empty single line".into(),
            ));
        }
        if self.volume.preferred_disk.trim().is_empty() {
            return Err(StorevolError::InvalidConfig(
                "volume.preferred_disk must not be empty".into(),
            ));
        }
        if self.daemon.label.trim().is_empty() {
            return Err(StorevolError::InvalidConfig(
                "daemon.label must not be empty".into(),
            ));
        }
        if self.tools.timeout_secs == 0 {
            return Err(StorevolError::InvalidConfig(
                "tools.timeout_secs must be greater than zero".into(),
            ));
        }
        self.synthetic_name().map(|_| ())
    }

    /// The root-level directory name the synthetic filesystem entry defines.
    pub fn synthetic_name(&self) -> StorevolResult<&str> {
        let mountpoint = &self.volume.mountpoint;
        let invalid = || {
            StorevolError::InvalidConfig(format!(
                "volume.mountpoint {} must be an absolute root-level path (e.g. /store)",
                mountpoint.display()
            ))
        };
        if mountpoint.parent() != Some(Path::new("/")) {
            return Err(invalid());
        }
        mountpoint
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(invalid)
    }
}

/// Emit the JSON schema for the configuration file.
pub fn config_schema() -> schemars::schema::RootSchema {
    schema_for!(StorevolConfig)
}

/// Read-only snapshot of the environment, captured once at orchestrator
/// entry. No component reads ambient environment state after this point.
#[derive(Debug, Clone)]
pub struct HostPolicy {
    /// Whether this operating system family needs a dedicated volume.
    pub is_target_platform: bool,
    /// Whether host-wide encryption at rest is active.
    pub full_disk_encryption_active: bool,
    /// Whether the session cannot present interactive prompts.
    pub is_headless_session: bool,
    /// Whether a dedicated volume is required at all (overridable).
    pub volume_required: bool,
    /// Restrict remediation to volumes on this disk, when set.
    pub pinned_disk: Option<String>,
}

impl HostPolicy {
    /// Capture the ambient environment. `full_disk_encryption_active` is
    /// supplied by the caller since probing it needs a host tool.
    pub fn from_environment(full_disk_encryption_active: bool) -> Self {
        let is_target_platform = cfg!(target_os = "macos");
        let is_headless_session = parse_bool_env(HEADLESS_ENV).unwrap_or_else(stdin_is_not_a_tty);
        let volume_required = parse_bool_env(VOLUME_REQUIRED_ENV).unwrap_or(is_target_platform);
        let pinned_disk = env::var(USE_DISK_ENV)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        Self {
            is_target_platform,
            full_disk_encryption_active,
            is_headless_session,
            volume_required,
            pinned_disk,
        }
    }
}

fn parse_bool_env(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(unix)]
fn stdin_is_not_a_tty() -> bool {
    unsafe { libc::isatty(0) != 1 }
}

#[cfg(not(unix))]
fn stdin_is_not_a_tty() -> bool {
    true
}
