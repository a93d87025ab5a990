use super::credentials::Credentials;
use super::errors::AuthenticationError;
use super::provider::FlowHandler;
use super::token_endpoint::{TokenEndpointResponse, credential_exchange_error, request_token};
use super::types::{AuthMethod, CachedToken, EnvironmentAuthConfig};
use crate::common::HttpClient;
use crate::config::TenantEndpoints;
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Resource owner password grant.
///
/// Accounts with MFA or conditional access answer with `invalid_grant` or
/// `interaction_required`; the provider's description is kept in the
/// [`AuthenticationError::InvalidCredentials`] reason so the user learns to
/// switch to an interactive method.
pub struct PasswordFlow {
    http: Arc<HttpClient>,
    authority_host: String,
}

impl PasswordFlow {
    pub fn new(http: Arc<HttpClient>, authority_host: impl Into<String>) -> Self {
        Self {
            http,
            authority_host: authority_host.into(),
        }
    }
}

#[async_trait]
impl FlowHandler for PasswordFlow {
    async fn acquire_token(
        &self,
        config: &EnvironmentAuthConfig,
        credentials: Credentials,
        cancel: &CancellationToken,
    ) -> Result<CachedToken, AuthenticationError> {
        let client_id = config.effective_client_id()?;
        let username = config.username().ok_or_else(|| {
            AuthenticationError::InvalidConfiguration(
                "A username is required for username/password authentication".to_string(),
            )
        })?;
        let password =
            credentials
                .password()
                .ok_or_else(|| AuthenticationError::InvalidCredentials {
                    reason: "no password supplied".to_string(),
                })?;

        let scope = config.scope();
        let url = TenantEndpoints::new(&self.authority_host, &config.tenant_id).token();
        let form = [
            ("grant_type", "password"),
            ("client_id", client_id),
            ("username", username),
            ("password", password.expose()),
            ("scope", scope.as_str()),
        ];

        log::debug!("Requesting password grant token");
        match request_token(&self.http, &url, &form, &scope, cancel).await? {
            TokenEndpointResponse::Token(token) => Ok(token),
            TokenEndpointResponse::Error { status, body } => {
                log::warn!(
                    "Password grant rejected with HTTP {}: {}",
                    status.as_u16(),
                    body.error
                );
                Err(credential_exchange_error(&url, status, &body))
            }
        }
    }

    fn auth_method(&self) -> AuthMethod {
        AuthMethod::UsernamePassword
    }
}
