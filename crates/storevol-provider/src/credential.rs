//! Contract for the system credential store holding volume passphrases.

use std::error::Error;

/// Abstraction over the host's credential facility (keychain or equivalent).
///
/// References are derived deterministically from the volume they belong to,
/// so the same volume always resolves to the same stored secret across runs.
pub trait CredentialStore {
    type Error: Error + Send + Sync + 'static;

    /// Persist `secret` under `reference`.
    ///
    /// Storing an identical secret again succeeds silently. A
    /// differently-valued credential under the same reference is rejected
    /// unless `overwrite` is set.
    fn store(&self, reference: &str, secret: &str, overwrite: bool) -> Result<(), Self::Error>;

    /// Fetch the stored secret, if any.
    fn retrieve(&self, reference: &str) -> Result<Option<String>, Self::Error>;

    /// Remove the stored secret. Removing an absent credential is a no-op.
    fn remove(&self, reference: &str) -> Result<(), Self::Error>;
}
