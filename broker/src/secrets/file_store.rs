use super::encryption::SecretCipher;
use super::{SecretKey, SecretStore, SecretStoreError, SecretValue};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

const FILE_VERSION: u32 = 1;
const VERIFIER_LABEL: &str = "dvtool/verifier";
const VERIFIER_PLAINTEXT: &str = "dvtool-secret-store";

#[derive(Serialize, Deserialize)]
struct SecretFile {
    version: u32,
    salt: String,
    verifier: String,
    #[serde(default)]
    entries: BTreeMap<String, String>,
}

/// Secret store backed by one JSON file.
///
/// Every value is encrypted separately with AES-256-GCM under a key derived
/// from the master password and the file's salt. The file also carries an
/// encrypted verifier so a wrong master password is detected on open rather
/// than on the first read.
pub struct EncryptedFileSecretStore {
    path: PathBuf,
    cipher: SecretCipher,
    file: Mutex<SecretFile>,
}

impl std::fmt::Debug for EncryptedFileSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileSecretStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl EncryptedFileSecretStore {
    /// `{config_dir}/dvtool/secrets.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("dvtool").join("secrets.json"))
    }

    /// Opens the store at `path`, creating it lazily on the first write.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read or parsed, or when
    /// `master_password` does not unlock it.
    pub async fn open(
        path: impl Into<PathBuf>,
        master_password: &str,
    ) -> Result<Self, SecretStoreError> {
        let path = path.into();

        let exists = tokio::fs::try_exists(&path)
            .await
            .map_err(|e| io_error(&path, e))?;

        let (cipher, file) = if exists {
            let content = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
            let file: SecretFile =
                serde_json::from_str(&content).map_err(|e| SecretStoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?;
            if file.version != FILE_VERSION {
                return Err(SecretStoreError::Corrupt {
                    path: path.display().to_string(),
                    reason: format!("unsupported version {}", file.version),
                });
            }

            let cipher = SecretCipher::from_salt_base64(master_password, &file.salt)?;
            match cipher.decrypt(VERIFIER_LABEL, &file.verifier) {
                Ok(plain) if plain.as_str() == VERIFIER_PLAINTEXT => {}
                _ => return Err(SecretStoreError::WrongMasterPassword),
            }
            log::debug!(
                "Opened secret store {} with {} entries",
                path.display(),
                file.entries.len()
            );
            (cipher, file)
        } else {
            let cipher = SecretCipher::new(master_password)?;
            let file = SecretFile {
                version: FILE_VERSION,
                salt: cipher.salt_base64(),
                verifier: cipher.encrypt(VERIFIER_LABEL, VERIFIER_PLAINTEXT)?,
                entries: BTreeMap::new(),
            };
            log::debug!("Secret store {} does not exist yet", path.display());
            (cipher, file)
        };

        Ok(Self {
            path,
            cipher,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes to a sibling temp file and renames it over the target.
    async fn persist(&self, file: &SecretFile) -> Result<(), SecretStoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, e))?;
            }
        }

        let content = serde_json::to_string_pretty(file).map_err(|e| SecretStoreError::Corrupt {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| io_error(&tmp, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .await
                .map_err(|e| io_error(&tmp, e))?;
        }

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))
    }
}

fn io_error(path: &Path, error: std::io::Error) -> SecretStoreError {
    SecretStoreError::Io {
        path: path.display().to_string(),
        reason: error.to_string(),
    }
}

#[async_trait]
impl SecretStore for EncryptedFileSecretStore {
    async fn get_secret(&self, key: &SecretKey) -> Result<Option<SecretValue>, SecretStoreError> {
        let storage_key = key.storage_key();
        let file = self.file.lock().await;
        match file.entries.get(&storage_key) {
            Some(encrypted) => Ok(Some(SecretValue::from(
                self.cipher.decrypt(&storage_key, encrypted)?,
            ))),
            None => Ok(None),
        }
    }

    async fn set_secret(
        &self,
        key: &SecretKey,
        value: SecretValue,
    ) -> Result<(), SecretStoreError> {
        let storage_key = key.storage_key();
        let encrypted = self.cipher.encrypt(&storage_key, value.expose())?;

        let mut file = self.file.lock().await;
        file.entries.insert(storage_key, encrypted);
        self.persist(&file).await?;
        log::info!("Stored {} for environment {}", key.kind, key.environment_id);
        Ok(())
    }

    async fn delete_secret(&self, key: &SecretKey) -> Result<(), SecretStoreError> {
        let mut file = self.file.lock().await;
        if file.entries.remove(&key.storage_key()).is_some() {
            self.persist(&file).await?;
            log::info!("Deleted {} for environment {}", key.kind, key.environment_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::types::CredentialKind;
    use claims::assert_matches;
    use tempfile::TempDir;

    fn key() -> SecretKey {
        SecretKey::new("contoso-dev", CredentialKind::ClientSecret)
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("nested").join("secrets.json");

        let store = EncryptedFileSecretStore::open(&path, "master").await.expect("open");
        store
            .set_secret(&key(), SecretValue::new("sp-secret-value"))
            .await
            .expect("set");

        let reopened = EncryptedFileSecretStore::open(&path, "master").await.expect("reopen");
        let value = reopened.get_secret(&key()).await.expect("get");
        assert_eq!(value.map(|v| v.expose().to_string()), Some("sp-secret-value".to_string()));
    }

    #[tokio::test]
    async fn test_wrong_master_password_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("secrets.json");

        let store = EncryptedFileSecretStore::open(&path, "master").await.expect("open");
        store
            .set_secret(&key(), SecretValue::new("value"))
            .await
            .expect("set");

        let result = EncryptedFileSecretStore::open(&path, "not-master").await;
        assert_matches!(result, Err(SecretStoreError::WrongMasterPassword));
    }

    #[tokio::test]
    async fn test_plaintext_never_written() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("secrets.json");

        let store = EncryptedFileSecretStore::open(&path, "master").await.expect("open");
        store
            .set_secret(&key(), SecretValue::new("very-recognisable-secret"))
            .await
            .expect("set");

        let content = std::fs::read_to_string(&path).expect("read");
        assert!(!content.contains("very-recognisable-secret"));
        assert!(content.contains("dvtool/contoso-dev/client_secret"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok_and_does_not_create_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("secrets.json");

        let store = EncryptedFileSecretStore::open(&path, "master").await.expect("open");
        store.delete_secret(&key()).await.expect("delete");
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_corrupt_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("secrets.json");
        std::fs::write(&path, "not json").expect("write");

        let result = EncryptedFileSecretStore::open(&path, "master").await;
        assert_matches!(result, Err(SecretStoreError::Corrupt { .. }));
    }
}
