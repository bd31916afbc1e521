//! Transparent at-rest encryption for file-backed SQLite databases.
//! Uses PBKDF2-HMAC-SHA256 key stretching and AES-256-GCM sealing, with master
//! keys sourced from the OS keyring (or test doubles).

pub mod codec;
pub mod file_state;
pub mod kdf;
pub mod key_provider;
pub mod manager;
pub mod table;

pub use manager::{DatabaseHandle, EncryptedStoreManager, StoreSettings};
pub use table::Row;
