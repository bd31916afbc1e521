use std::sync::Arc;

use crate::config::{Config, KeySource};
use color_eyre::Result;
use dbseal_storage::{
    key_provider::{EnvKeyProvider, KeyringProvider, MasterKeyProvider},
    EncryptedStoreManager,
};
use tracing::debug;

/// Build the master-key source named by the config.
pub fn key_provider(config: &Config) -> Box<dyn MasterKeyProvider> {
    match config.key.source {
        KeySource::Keyring => Box::new(KeyringProvider::new(
            config.key.service.clone(),
            config.key.account.clone(),
        )),
        KeySource::Env => Box::new(EnvKeyProvider::new(config.key.env_var.clone())),
    }
}

/// Build a manager keyed from the configured provider.
pub async fn manager_from_config(
    config: &Config,
    provider: &dyn MasterKeyProvider,
) -> Result<Arc<EncryptedStoreManager>> {
    debug!(source = provider.name(), "loading master key");
    let master_key = provider
        .master_key()
        .await
        .map_err(|e| color_eyre::eyre::eyre!("master key ({}): {e}", provider.name()))?;
    let manager = EncryptedStoreManager::new(master_key, config.store_settings())?;
    Ok(Arc::new(manager))
}

/// Helper for tests: a manager with a fixed passphrase and a cheap work factor.
#[cfg(test)]
pub fn test_manager(passphrase: &str) -> Arc<EncryptedStoreManager> {
    use dbseal_core::MasterKey;
    use dbseal_storage::{kdf::KdfParams, StoreSettings};

    let settings = StoreSettings {
        kdf: KdfParams { iterations: 16 },
        compact_on_close: true,
    };
    Arc::new(
        EncryptedStoreManager::new(MasterKey::from_passphrase(passphrase), settings)
            .expect("test manager"),
    )
}
