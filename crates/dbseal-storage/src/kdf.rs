use std::fmt;

use dbseal_core::{MasterKey, StoreError};
use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::warn;
use zeroize::Zeroizing;

/// Length of the derived AES-256 key.
pub const KEY_LEN: usize = 32;
/// Length of the random salt stored in each sealed file header.
pub const SALT_LEN: usize = 16;
/// Default work factor for new seals.
pub const DEFAULT_ITERATIONS: u32 = 100_000;
/// Iteration counts below this still work but are logged as weak.
pub const RECOMMENDED_MIN_ITERATIONS: u32 = 100_000;
/// Upper bound accepted from file headers; anything above is treated as corrupt.
pub const MAX_ITERATIONS: u32 = 10_000_000;

pub type Salt = [u8; SALT_LEN];

/// Deployment-level key stretching parameters.
/// The iteration count is written into every sealed header, so raising it
/// later does not break files sealed under the old value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
        }
    }
}

impl KdfParams {
    pub fn validate(&self) -> Result<(), StoreError> {
        check_iterations(self.iterations)?;
        if self.iterations < RECOMMENDED_MIN_ITERATIONS {
            warn!(
                iterations = self.iterations,
                recommended = RECOMMENDED_MIN_ITERATIONS,
                "kdf iteration count below recommended minimum"
            );
        }
        Ok(())
    }
}

/// 256-bit cipher key together with the salt and work factor that produced it.
pub struct DerivedKey {
    bytes: Zeroizing<[u8; KEY_LEN]>,
    salt: Salt,
    iterations: u32,
}

impl DerivedKey {
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    pub fn salt(&self) -> &Salt {
        &self.salt
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

/// Stretch `master_key` into a cipher key. Deterministic for equal inputs.
pub fn derive(
    master_key: &MasterKey,
    salt: &Salt,
    iterations: u32,
) -> Result<DerivedKey, StoreError> {
    if master_key.is_empty() {
        return Err(StoreError::configuration("master key must not be empty"));
    }
    check_iterations(iterations)?;

    let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(master_key.as_bytes(), salt, iterations, &mut bytes[..]);
    Ok(DerivedKey {
        bytes,
        salt: *salt,
        iterations,
    })
}

/// Derive a key under a freshly generated random salt.
pub fn derive_fresh(
    master_key: &MasterKey,
    params: &KdfParams,
) -> Result<DerivedKey, StoreError> {
    derive(master_key, &random_salt(), params.iterations)
}

pub fn random_salt() -> Salt {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn check_iterations(iterations: u32) -> Result<(), StoreError> {
    if iterations < 1 {
        return Err(StoreError::configuration("iteration count must be at least 1"));
    }
    if iterations > MAX_ITERATIONS {
        return Err(StoreError::configuration(format!(
            "iteration count {iterations} exceeds maximum {MAX_ITERATIONS}"
        )));
    }
    Ok(())
}
