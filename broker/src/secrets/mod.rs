//! Storage for environment credentials.
//!
//! The broker reads client secrets and passwords through [`SecretStore`] just
//! before a flow runs and never keeps them afterwards.

pub mod encryption;
pub mod file_store;

pub use encryption::{EncryptionError, SecretCipher};
pub use file_store::EncryptedFileSecretStore;

use crate::auth::types::CredentialKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

/// Address of one secret: an environment and the kind of credential.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SecretKey {
    pub environment_id: String,
    pub kind: CredentialKind,
}

impl SecretKey {
    pub fn new(environment_id: impl Into<String>, kind: CredentialKind) -> Self {
        Self {
            environment_id: environment_id.into(),
            kind,
        }
    }

    /// `dvtool/{environment_id}/{kind}`
    pub fn storage_key(&self) -> String {
        format!("dvtool/{}/{}", self.environment_id, self.kind)
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// A secret string, zeroized on drop and redacted from `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(Zeroizing<String>);

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Zeroizing<String>> for SecretValue {
    fn from(value: Zeroizing<String>) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(***)")
    }
}

#[derive(Debug, Error)]
pub enum SecretStoreError {
    #[error("Secret store I/O failed for {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Secret store file {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    #[error("Master password does not unlock the secret store")]
    WrongMasterPassword,

    #[error(transparent)]
    Encryption(#[from] EncryptionError),
}

/// Persistent key/value storage for secrets.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, key: &SecretKey) -> Result<Option<SecretValue>, SecretStoreError>;

    async fn set_secret(&self, key: &SecretKey, value: SecretValue)
    -> Result<(), SecretStoreError>;

    /// Removes the secret. Deleting a missing secret succeeds.
    async fn delete_secret(&self, key: &SecretKey) -> Result<(), SecretStoreError>;
}

/// Process-local store, used by tests and as a fallback when no secret file
/// is configured.
#[derive(Default)]
pub struct MemorySecretStore {
    entries: RwLock<HashMap<SecretKey, SecretValue>>,
}

impl MemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(&self, key: &SecretKey) -> Result<Option<SecretValue>, SecretStoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set_secret(
        &self,
        key: &SecretKey,
        value: SecretValue,
    ) -> Result<(), SecretStoreError> {
        self.entries.write().await.insert(key.clone(), value);
        Ok(())
    }

    async fn delete_secret(&self, key: &SecretKey) -> Result<(), SecretStoreError> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
