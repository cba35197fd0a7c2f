#![forbid(unsafe_code)]

//! Host facility contracts shared across storevol.
//!
//! The rest of the workspace defines workflows and operator surfaces against
//! these traits without depending on concrete system integrations.

pub mod credential;
pub mod volume;

pub use credential::CredentialStore;
pub use volume::{VolumeDescriptor, VolumeProvider};
