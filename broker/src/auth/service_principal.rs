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

/// Client credentials grant for an app registration with a client secret.
pub struct ServicePrincipalFlow {
    http: Arc<HttpClient>,
    authority_host: String,
}

impl ServicePrincipalFlow {
    pub fn new(http: Arc<HttpClient>, authority_host: impl Into<String>) -> Self {
        Self {
            http,
            authority_host: authority_host.into(),
        }
    }
}

#[async_trait]
impl FlowHandler for ServicePrincipalFlow {
    async fn acquire_token(
        &self,
        config: &EnvironmentAuthConfig,
        credentials: Credentials,
        cancel: &CancellationToken,
    ) -> Result<CachedToken, AuthenticationError> {
        let client_id = config.effective_client_id()?;
        let client_secret = credentials.client_secret().ok_or_else(|| {
            AuthenticationError::InvalidCredentials {
                reason: "no client secret supplied".to_string(),
            }
        })?;

        let scope = config.scope();
        let url = TenantEndpoints::new(&self.authority_host, &config.tenant_id).token();
        let form = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret.expose()),
            ("scope", scope.as_str()),
        ];

        log::debug!("Requesting client credentials token for client {client_id}");
        match request_token(&self.http, &url, &form, &scope, cancel).await? {
            TokenEndpointResponse::Token(token) => Ok(token),
            TokenEndpointResponse::Error { status, body } => {
                log::warn!(
                    "Client credentials grant rejected with HTTP {}: {}",
                    status.as_u16(),
                    body.error
                );
                Err(credential_exchange_error(&url, status, &body))
            }
        }
    }

    fn auth_method(&self) -> AuthMethod {
        AuthMethod::ServicePrincipal
    }
}
