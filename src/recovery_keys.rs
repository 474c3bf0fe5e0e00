use base64::{engine::general_purpose::URL_SAFE, Engine as _};
use chrono::{DateTime, Utc};
use rand::rngs::SysRng;
use rand::TryRng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::FdeError;
use crate::Result;

pub const RECOVERY_KEY_LEN: usize = 16;
const KEY_ID_LEN: usize = 10;

/// One-time recovery key. Rendered as eight dash separated groups of five
/// decimal digits, one group per little-endian 16-bit word.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct RecoveryKey([u8; RECOVERY_KEY_LEN]);

impl RecoveryKey {
    pub fn from_bytes(bytes: [u8; RECOVERY_KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Result<Self> {
        let mut bytes = [0u8; RECOVERY_KEY_LEN];
        let mut rng = SysRng;
        rng.try_fill_bytes(&mut bytes)
            .map_err(|e| FdeError::internal(format!("cannot generate recovery key: {e}")))?;
        let key = Self(bytes);
        bytes.zeroize();
        Ok(key)
    }

    pub fn as_bytes(&self) -> &[u8; RECOVERY_KEY_LEN] {
        &self.0
    }

    /// Short identifier handed out instead of the key itself.
    pub fn id(&self) -> String {
        let digest = Sha256::digest(self.0);
        let encoded = URL_SAFE.encode(digest);
        encoded[..KEY_ID_LEN].to_string()
    }
}

impl fmt::Display for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, chunk) in self.0.chunks(2).enumerate() {
            if idx > 0 {
                f.write_str("-")?;
            }
            let word = u16::from_le_bytes([chunk[0], chunk[1]]);
            write!(f, "{word:05}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for RecoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RecoveryKey(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryKeyCacheError {
    #[error("no recovery key entry for key-id")]
    NoRecoveryKey,
    #[error("recovery key id already exists")]
    AlreadyExists,
}

#[derive(Debug, Clone)]
pub struct CachedRecoveryKey {
    pub key: RecoveryKey,
    pub expiration: DateTime<Utc>,
}

impl CachedRecoveryKey {
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiration
    }
}

/// Short-lived store for generated recovery keys.
pub trait RecoveryKeyCache: Send + Sync {
    fn add_key(&self, key_id: &str, entry: CachedRecoveryKey) -> Result<()>;
    fn key(&self, key_id: &str) -> Result<CachedRecoveryKey>;
    fn remove_key(&self, key_id: &str) -> Result<()>;
}

#[derive(Default)]
pub struct InMemoryRecoveryKeyCache {
    entries: Mutex<HashMap<String, CachedRecoveryKey>>,
}

impl InMemoryRecoveryKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, CachedRecoveryKey>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl RecoveryKeyCache for InMemoryRecoveryKeyCache {
    fn add_key(&self, key_id: &str, entry: CachedRecoveryKey) -> Result<()> {
        let mut entries = self.entries();
        if entries.contains_key(key_id) {
            return Err(RecoveryKeyCacheError::AlreadyExists.into());
        }
        entries.insert(key_id.to_string(), entry);
        Ok(())
    }

    fn key(&self, key_id: &str) -> Result<CachedRecoveryKey> {
        self.entries()
            .get(key_id)
            .cloned()
            .ok_or_else(|| RecoveryKeyCacheError::NoRecoveryKey.into())
    }

    fn remove_key(&self, key_id: &str) -> Result<()> {
        self.entries().remove(key_id);
        Ok(())
    }
}

/// True when `err` reports a missing cache entry.
pub fn is_no_recovery_key(err: &FdeError) -> bool {
    matches!(
        err,
        FdeError::RecoveryKey(RecoveryKeyCacheError::NoRecoveryKey)
    )
}
