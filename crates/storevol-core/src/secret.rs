//! Passphrase generation and credential reference derivation.

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

/// Generate a fresh volume passphrase: 32 random bytes, hex encoded.
pub fn generate_passphrase() -> Zeroizing<String> {
    let mut material = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut material[..]);
    Zeroizing::new(hex::encode(&material[..]))
}

/// Derive the credential-store reference for a labeled volume.
///
/// The same label/disk pair must always map to the same reference so a
/// re-provisioning run finds the credential stored by an earlier one.
pub fn credential_reference(label: &str, disk: &str) -> String {
    format!("{label} encryption password ({disk})")
}
