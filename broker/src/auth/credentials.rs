//! Just-in-time credential retrieval for flow handlers.

use super::errors::AuthenticationError;
use super::types::{AuthMethod, CredentialKind};
use crate::secrets::{SecretKey, SecretStore, SecretValue};
use async_trait::async_trait;
use std::sync::Arc;

/// Secret material handed to exactly one flow execution.
#[derive(Clone, Debug)]
pub enum Credentials {
    /// Interactive and device code flows need nothing stored
    None,
    ClientSecret(SecretValue),
    Password(SecretValue),
}

impl Credentials {
    pub fn client_secret(&self) -> Option<&SecretValue> {
        match self {
            Credentials::ClientSecret(secret) => Some(secret),
            _ => None,
        }
    }

    pub fn password(&self) -> Option<&SecretValue> {
        match self {
            Credentials::Password(password) => Some(password),
            _ => None,
        }
    }
}

/// Supplies credentials for an environment on demand.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credentials_for(
        &self,
        environment_id: &str,
        method: AuthMethod,
    ) -> Result<Credentials, AuthenticationError>;
}

/// Reads credentials from a [`SecretStore`].
pub struct SecretStoreCredentialProvider {
    store: Arc<dyn SecretStore>,
}

impl SecretStoreCredentialProvider {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialProvider for SecretStoreCredentialProvider {
    async fn credentials_for(
        &self,
        environment_id: &str,
        method: AuthMethod,
    ) -> Result<Credentials, AuthenticationError> {
        let Some(kind) = method.required_credential() else {
            return Ok(Credentials::None);
        };

        let key = SecretKey::new(environment_id, kind);
        let secret = self.store.get_secret(&key).await.map_err(|e| {
            AuthenticationError::InvalidConfiguration(format!(
                "Secret store unavailable for environment {environment_id}: {e}"
            ))
        })?;

        match secret {
            Some(value) if !value.is_empty() => Ok(match kind {
                CredentialKind::ClientSecret => Credentials::ClientSecret(value),
                CredentialKind::Password => Credentials::Password(value),
            }),
            _ => Err(AuthenticationError::InvalidCredentials {
                reason: format!(
                    "no {} stored for environment {environment_id}",
                    kind.as_str().replace('_', " ")
                ),
            }),
        }
    }
}
