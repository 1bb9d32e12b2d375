//! Encrypted at-rest secret store.
//!
//! On first initialisation a 32-byte salt and a 32-byte master key are
//! drawn from the OS RNG and written as `salt ‖ master_key` to
//! `.secrets.key` (mode 0600, directory 0700). The working key is derived
//! with PBKDF2-HMAC-SHA256 over 100 000 iterations; later boots read the
//! file back and re-derive the same key.
//!
//! Secret values are sealed with AES-256-GCM under a fresh 12-byte nonce
//! and stored base64-encoded as `nonce ‖ ciphertext ‖ tag`. Listing never
//! exposes plaintext.

use crate::constants::{
    SECRETS_FILE, SECRETS_KEY_FILE, SECRET_KDF_ITERATIONS, SECRET_KEY_LEN, SECRET_NONCE_LEN,
    SECRET_SALT_LEN,
};
use crate::error::{Error, Result};
use crate::store::{init_data_dir, SnapshotFile};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

// =============================================================================
// Model
// =============================================================================

/// An encrypted secret as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    /// Opaque 12-hex id.
    pub id: String,
    /// Unique name; the lookup key.
    pub name: String,
    /// Base64 of `nonce ‖ ciphertext ‖ tag`.
    pub data: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Non-sensitive secret metadata returned by list/inspect.
#[derive(Debug, Clone, Serialize)]
pub struct SecretInfo {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Store
// =============================================================================

/// Encrypted key/value store for credentials injected into containers.
pub struct SecretStore {
    secrets: Mutex<HashMap<String, Secret>>,
    snapshot: SnapshotFile,
    key: [u8; SECRET_KEY_LEN],
}

impl SecretStore {
    /// Opens (or initialises) the store under `data_dir`.
    ///
    /// Failure to create the directory or derive the working key is fatal.
    pub fn new(data_dir: &Path) -> Result<Self> {
        init_data_dir(data_dir)?;

        let key = load_or_generate_key(&data_dir.join(SECRETS_KEY_FILE))?;
        let snapshot = SnapshotFile::new(data_dir.join(SECRETS_FILE));

        let mut secrets = HashMap::new();
        match snapshot.load::<Secret>() {
            Ok(list) => {
                for secret in list {
                    secrets.insert(secret.name.clone(), secret);
                }
            }
            Err(e) => warn!("failed to load secrets state, starting fresh: {e}"),
        }

        Ok(Self {
            secrets: Mutex::new(secrets),
            snapshot,
            key,
        })
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Secret>>> {
        self.secrets
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {e}")))
    }

    /// Creates a new secret; the name must be unused.
    pub fn create(&self, name: &str, plaintext: &[u8]) -> Result<SecretInfo> {
        let mut secrets = self.guard()?;

        if secrets.contains_key(name) {
            return Err(Error::SecretExists(name.to_string()));
        }

        let data = self.encrypt(plaintext)?;
        let now = Utc::now();
        let secret = Secret {
            id: generate_secret_id()?,
            name: name.to_string(),
            data,
            created_at: now,
            updated_at: now,
        };
        let info = SecretInfo {
            id: secret.id.clone(),
            name: secret.name.clone(),
            created_at: secret.created_at,
            updated_at: secret.updated_at,
        };

        secrets.insert(name.to_string(), secret);
        self.save(&secrets)?;
        info!("created secret {name}");
        Ok(info)
    }

    /// Decrypts and returns a secret's value. A ciphertext that fails to
    /// authenticate is a hard error.
    pub fn get(&self, name: &str) -> Result<Vec<u8>> {
        let secrets = self.guard()?;
        let secret = secrets
            .get(name)
            .ok_or_else(|| Error::SecretNotFound(name.to_string()))?;
        self.decrypt(&secret.data)
    }

    /// Replaces a secret's value and bumps its updated timestamp.
    pub fn update(&self, name: &str, plaintext: &[u8]) -> Result<()> {
        let mut secrets = self.guard()?;
        let data = self.encrypt(plaintext)?;

        let secret = secrets
            .get_mut(name)
            .ok_or_else(|| Error::SecretNotFound(name.to_string()))?;
        secret.data = data;
        secret.updated_at = Utc::now();

        self.save(&secrets)?;
        info!("updated secret {name}");
        Ok(())
    }

    /// Removes a secret.
    pub fn remove(&self, name: &str) -> Result<()> {
        let mut secrets = self.guard()?;
        if secrets.remove(name).is_none() {
            return Err(Error::SecretNotFound(name.to_string()));
        }
        self.save(&secrets)?;
        info!("removed secret {name}");
        Ok(())
    }

    /// Returns metadata for all secrets; never plaintext.
    pub fn list(&self) -> Vec<SecretInfo> {
        // Listing is infallible; recover the map from a poisoned lock.
        let secrets = self
            .secrets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut list: Vec<SecretInfo> = secrets
            .values()
            .map(|s| SecretInfo {
                id: s.id.clone(),
                name: s.name.clone(),
                created_at: s.created_at,
                updated_at: s.updated_at,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Formats a secret for environment injection: `"<env_name>=<value>"`.
    pub fn secret_env(&self, name: &str, env_name: &str) -> Result<String> {
        let value = self.get(name)?;
        let value = String::from_utf8(value)
            .map_err(|_| Error::Decrypt(format!("secret {name} is not valid UTF-8")))?;
        Ok(format!("{env_name}={value}"))
    }

    fn save(&self, secrets: &HashMap<String, Secret>) -> Result<()> {
        let list: Vec<&Secret> = secrets.values().collect();
        self.snapshot.save(&list)
    }

    // =========================================================================
    // Encryption
    // =========================================================================

    fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("bad key length: {e}")))?;

        let mut nonce_bytes = [0u8; SECRET_NONCE_LEN];
        rand::rngs::OsRng
            .try_fill_bytes(&mut nonce_bytes)
            .map_err(|e| Error::Rng(e.to_string()))?;
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload::from(plaintext))
            .map_err(|e| Error::Internal(format!("encryption failed: {e}")))?;

        let mut sealed = Vec::with_capacity(SECRET_NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(sealed))
    }

    fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let sealed = BASE64
            .decode(encoded)
            .map_err(|e| Error::Decrypt(e.to_string()))?;

        if sealed.len() < SECRET_NONCE_LEN {
            return Err(Error::Decrypt("ciphertext too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(SECRET_NONCE_LEN);

        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::Internal(format!("bad key length: {e}")))?;

        cipher
            .decrypt(Nonce::from_slice(nonce_bytes), Payload::from(ciphertext))
            .map_err(|_| Error::Decrypt("authentication failed".to_string()))
    }
}

// =============================================================================
// Key Material
// =============================================================================

/// Loads `salt ‖ master_key` from the key file, or generates and persists
/// it, then derives the working key.
fn load_or_generate_key(key_path: &PathBuf) -> Result<[u8; SECRET_KEY_LEN]> {
    if let Ok(key_data) = std::fs::read(key_path) {
        if key_data.len() >= SECRET_SALT_LEN + SECRET_KEY_LEN {
            let (salt, master) = key_data.split_at(SECRET_SALT_LEN);
            return Ok(derive_key(master, salt));
        }
        warn!("key file {} is truncated, regenerating", key_path.display());
    }

    let mut salt = [0u8; SECRET_SALT_LEN];
    rand::rngs::OsRng
        .try_fill_bytes(&mut salt)
        .map_err(|e| Error::Rng(e.to_string()))?;
    let mut master = [0u8; SECRET_KEY_LEN];
    rand::rngs::OsRng
        .try_fill_bytes(&mut master)
        .map_err(|e| Error::Rng(e.to_string()))?;

    let mut key_data = Vec::with_capacity(SECRET_SALT_LEN + SECRET_KEY_LEN);
    key_data.extend_from_slice(&salt);
    key_data.extend_from_slice(&master);
    std::fs::write(key_path, &key_data)?;

    #[cfg(unix)]
    std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))?;

    info!("generated secret store master key");
    Ok(derive_key(&master, &salt))
}

fn derive_key(master: &[u8], salt: &[u8]) -> [u8; SECRET_KEY_LEN] {
    let mut key = [0u8; SECRET_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(master, salt, SECRET_KDF_ITERATIONS, &mut key);
    key
}

fn generate_secret_id() -> Result<String> {
    let mut buf = [0u8; 6];
    rand::rngs::OsRng
        .try_fill_bytes(&mut buf)
        .map_err(|e| Error::Rng(e.to_string()))?;
    Ok(hex::encode(buf))
}
