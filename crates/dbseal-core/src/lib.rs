//! Core abstractions for dbseal: master key material, the error taxonomy and the
//! encrypted-store contract consumed by collaborators.

pub mod error;
pub mod key;
pub mod store;

pub use error::{ErrorKind, StoreError};
pub use key::MasterKey;
pub use store::{EncryptedStore, RotationOutcome, RotationReport};
