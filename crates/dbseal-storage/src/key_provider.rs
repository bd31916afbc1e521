use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use dbseal_core::MasterKey;
use rand::{rngs::OsRng, RngCore};
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

/// Bytes of entropy in a generated master passphrase.
const GENERATED_KEY_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("keyring error: {0}")]
    Keyring(String),
    #[error("environment variable {0} is not set or empty")]
    MissingEnv(String),
    #[error("key source is read-only: {0}")]
    ReadOnly(String),
    #[error("generation error: {0}")]
    Generation(String),
}

/// Supplies the master key (OS keychain in production; env or memory otherwise).
#[async_trait]
pub trait MasterKeyProvider: Send + Sync {
    /// Short label for logs (never includes key material).
    fn name(&self) -> &'static str;

    async fn master_key(&self) -> Result<MasterKey, KeyError>;

    /// Persist a rotated key so the next process start picks it up.
    async fn replace(&self, key: &MasterKey) -> Result<(), KeyError>;
}

/// OS keyring-backed provider. Generates and stores a random passphrase on
/// first use.
pub struct KeyringProvider {
    service: String,
    account: String,
}

impl KeyringProvider {
    pub fn new(service: impl Into<String>, account: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            account: account.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, KeyError> {
        keyring::Entry::new(&self.service, &self.account)
            .map_err(|e| KeyError::Keyring(e.to_string()))
    }
}

#[async_trait]
impl MasterKeyProvider for KeyringProvider {
    fn name(&self) -> &'static str {
        "keyring"
    }

    async fn master_key(&self) -> Result<MasterKey, KeyError> {
        // Keyring operations are synchronous; wrap in async for trait compatibility.
        let entry = self.entry()?;
        match entry.get_password() {
            Ok(secret) => Ok(MasterKey::from_passphrase(&Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => {
                let secret = generate_passphrase();
                entry
                    .set_password(&secret)
                    .map_err(|e| KeyError::Keyring(e.to_string()))?;
                info!(service = %self.service, "generated new master key in keyring");
                Ok(MasterKey::from_passphrase(&secret))
            }
            Err(err) => Err(KeyError::Keyring(err.to_string())),
        }
    }

    async fn replace(&self, key: &MasterKey) -> Result<(), KeyError> {
        let secret = Zeroizing::new(
            String::from_utf8(key.as_bytes().to_vec())
                .map_err(|_| KeyError::Generation("master key is not valid UTF-8".into()))?,
        );
        self.entry()?
            .set_password(&secret)
            .map_err(|e| KeyError::Keyring(e.to_string()))
    }
}

/// Reads the master passphrase from an environment variable.
pub struct EnvKeyProvider {
    var: String,
}

impl EnvKeyProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

#[async_trait]
impl MasterKeyProvider for EnvKeyProvider {
    fn name(&self) -> &'static str {
        "env"
    }

    async fn master_key(&self) -> Result<MasterKey, KeyError> {
        read_env_key(&self.var)
    }

    async fn replace(&self, _key: &MasterKey) -> Result<(), KeyError> {
        Err(KeyError::ReadOnly(format!(
            "update {} in the deployment secret store",
            self.var
        )))
    }
}

/// In-memory key provider for tests and ephemeral sessions.
#[derive(Debug, Default, Clone)]
pub struct InMemoryKeyProvider {
    inner: Arc<Mutex<Option<MasterKey>>>,
}

impl InMemoryKeyProvider {
    pub fn with_key(key: MasterKey) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(key))),
        }
    }
}

#[async_trait]
impl MasterKeyProvider for InMemoryKeyProvider {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn master_key(&self) -> Result<MasterKey, KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;

        if let Some(existing) = guard.clone() {
            return Ok(existing);
        }

        let key = MasterKey::from_passphrase(&generate_passphrase());
        *guard = Some(key.clone());
        Ok(key)
    }

    async fn replace(&self, key: &MasterKey) -> Result<(), KeyError> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|err| KeyError::Generation(format!("lock poisoned: {err}")))?;
        *guard = Some(key.clone());
        Ok(())
    }
}

/// Read a non-empty passphrase from `var`.
pub fn read_env_key(var: &str) -> Result<MasterKey, KeyError> {
    match std::env::var(var) {
        Ok(value) if !value.is_empty() => Ok(MasterKey::from_passphrase(&Zeroizing::new(value))),
        _ => Err(KeyError::MissingEnv(var.to_string())),
    }
}

fn generate_passphrase() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; GENERATED_KEY_LEN]);
    OsRng.fill_bytes(bytes.as_mut_slice());
    Zeroizing::new(general_purpose::STANDARD.encode(bytes.as_slice()))
}
