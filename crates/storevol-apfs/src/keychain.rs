//! Keychain-backed `CredentialStore` wrapping the host `security` binary.

use crate::command::{output_diagnostic, ToolCommand, ToolOutput};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use storevol_core::{StorevolConfig, StorevolError, StorevolResult};
use storevol_provider::CredentialStore;

const SECURITY_PATH_ENV: &str = "STOREVOL_SECURITY";
const DEFAULT_SECURITY_PATHS: &[&str] = &["/usr/bin/security"];
/// Account name shared by every credential this tool manages; the service
/// name carries the volume-specific reference.
const ACCOUNT: &str = "storevol";
/// `security` exits with this code when the item is absent.
const ERR_SEC_ITEM_NOT_FOUND: i32 = 44;

/// Credential store backed by the host system keychain.
pub struct SystemKeychainStore {
    security: ToolCommand,
    keychain: PathBuf,
}

impl SystemKeychainStore {
    /// Build a store from configuration, resolving the `security` binary.
    pub fn from_config(config: &StorevolConfig) -> StorevolResult<Self> {
        let binary = resolve_security()?;
        Ok(Self {
            security: ToolCommand::new(binary, Duration::from_secs(config.tools.timeout_secs)),
            keychain: config.keychain.path.clone(),
        })
    }

    fn run(&self, args: &[String]) -> StorevolResult<ToolOutput> {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.security.run(&arg_refs, None)
    }
}

impl CredentialStore for SystemKeychainStore {
    type Error = StorevolError;

    fn store(&self, reference: &str, secret: &str, overwrite: bool) -> StorevolResult<()> {
        if let Some(existing) = self.retrieve(reference)? {
            if existing == secret {
                return Ok(());
            }
            if !overwrite {
                return Err(StorevolError::CredentialConflict(reference.to_string()));
            }
        }

        let mut args: Vec<String> = vec![
            "add-generic-password".into(),
            "-a".into(),
            ACCOUNT.into(),
            "-s".into(),
            reference.into(),
            "-w".into(),
            secret.into(),
        ];
        if overwrite {
            args.push("-U".into());
        }
        args.push(self.keychain.to_string_lossy().into_owned());

        let out = self.run(&args)?;
        if out.status != 0 {
            return Err(StorevolError::Provider(format!(
                "security add-generic-password failed for `{reference}`: {}",
                output_diagnostic(&out)
            )));
        }
        Ok(())
    }

    fn retrieve(&self, reference: &str) -> StorevolResult<Option<String>> {
        let args: Vec<String> = vec![
            "find-generic-password".into(),
            "-a".into(),
            ACCOUNT.into(),
            "-s".into(),
            reference.into(),
            "-w".into(),
            self.keychain.to_string_lossy().into_owned(),
        ];
        let out = self.run(&args)?;
        if out.status == 0 {
            let secret = out.stdout.trim_end_matches(['\r', '\n']).to_string();
            return Ok(Some(secret));
        }
        if credential_absent(&out) {
            return Ok(None);
        }
        Err(StorevolError::Provider(format!(
            "security find-generic-password failed for `{reference}`: {}",
            output_diagnostic(&out)
        )))
    }

    fn remove(&self, reference: &str) -> StorevolResult<()> {
        let args: Vec<String> = vec![
            "delete-generic-password".into(),
            "-a".into(),
            ACCOUNT.into(),
            "-s".into(),
            reference.into(),
            self.keychain.to_string_lossy().into_owned(),
        ];
        let out = self.run(&args)?;
        if out.status == 0 || credential_absent(&out) {
            return Ok(());
        }
        Err(StorevolError::Provider(format!(
            "security delete-generic-password failed for `{reference}`: {}",
            output_diagnostic(&out)
        )))
    }
}

fn credential_absent(out: &ToolOutput) -> bool {
    out.status == ERR_SEC_ITEM_NOT_FOUND
        || output_diagnostic(out)
            .to_ascii_lowercase()
            .contains("could not be found")
}

fn resolve_security() -> StorevolResult<PathBuf> {
    if let Some(explicit) = env::var_os(SECURITY_PATH_ENV) {
        let candidate = PathBuf::from(explicit);
        if !candidate.exists() {
            return Err(StorevolError::InvalidConfig(format!(
                "security binary not found at {}",
                candidate.display()
            )));
        }
        return Ok(candidate);
    }

    DEFAULT_SECURITY_PATHS
        .iter()
        .map(Path::new)
        .find(|path| path.exists())
        .map(Path::to_path_buf)
        .ok_or_else(|| {
            StorevolError::InvalidConfig(format!(
                "unable to locate security binary; tried {DEFAULT_SECURITY_PATHS:?}"
            ))
        })
}
