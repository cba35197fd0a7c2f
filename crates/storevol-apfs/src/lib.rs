//! System integration for APFS-backed package-store volumes.
//!
//! Wraps the host `diskutil`, `security`, and `fdesetup` binaries behind the
//! provider contracts so workflows never talk to a shell directly.

mod command;
mod keychain;
mod system;

pub use keychain::SystemKeychainStore;
pub use system::{full_disk_encryption_active, SystemApfsProvider};
