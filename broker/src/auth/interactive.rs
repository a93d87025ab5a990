use super::browser::BrowserLauncher;
use super::credentials::Credentials;
use super::errors::AuthenticationError;
use super::loopback::LoopbackRedirectServer;
use super::pkce::PkcePair;
use super::provider::FlowHandler;
use super::token_endpoint::{TokenEndpointResponse, request_token};
use super::types::{AuthMethod, CachedToken, EnvironmentAuthConfig};
use crate::common::HttpClient;
use crate::config::{BrokerSettings, TenantEndpoints};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Authorization code grant with PKCE, completed in the system browser.
pub struct InteractiveFlow {
    http: Arc<HttpClient>,
    authority_host: String,
    timeout: Duration,
    browser: Arc<dyn BrowserLauncher>,
}

impl InteractiveFlow {
    pub fn new(
        http: Arc<HttpClient>,
        settings: &BrokerSettings,
        browser: Arc<dyn BrowserLauncher>,
    ) -> Self {
        Self {
            http,
            authority_host: settings.authority_host().to_string(),
            timeout: settings.interactive_timeout(),
            browser,
        }
    }
}

/// Builds the `/authorize` URL the browser is sent to.
///
/// # Errors
///
/// Fails if the authority host does not form a valid URL.
pub fn authorization_url(
    authorize_endpoint: &str,
    config: &EnvironmentAuthConfig,
    redirect_uri: &str,
    state: &str,
    pkce: &PkcePair,
) -> Result<Url, AuthenticationError> {
    let mut url = Url::parse(authorize_endpoint).map_err(|e| {
        AuthenticationError::InvalidConfiguration(format!("Invalid authority host: {e}"))
    })?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", config.effective_client_id()?)
            .append_pair("response_type", "code")
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_mode", "query")
            .append_pair("scope", &config.scope())
            .append_pair("state", state)
            .append_pair("code_challenge", pkce.challenge())
            .append_pair("code_challenge_method", pkce.method());
        match config.username() {
            Some(username) => query.append_pair("login_hint", username),
            None => query.append_pair("prompt", "select_account"),
        };
    }

    Ok(url)
}

#[async_trait]
impl FlowHandler for InteractiveFlow {
    async fn acquire_token(
        &self,
        config: &EnvironmentAuthConfig,
        _credentials: Credentials,
        cancel: &CancellationToken,
    ) -> Result<CachedToken, AuthenticationError> {
        let client_id = config.effective_client_id()?;
        let scope = config.scope();
        let endpoints = TenantEndpoints::new(&self.authority_host, &config.tenant_id);
        let pkce = PkcePair::generate();

        let server = LoopbackRedirectServer::start(self.timeout).await?;
        let redirect_uri = server.redirect_uri();
        let url = authorization_url(
            &endpoints.authorize(),
            config,
            &redirect_uri,
            server.state(),
            &pkce,
        )?;

        log::info!(
            "Opening browser for interactive sign-in, waiting up to {}s",
            self.timeout.as_secs()
        );
        if let Err(e) = self.browser.open_external(url.as_str()) {
            log::warn!("Could not open the system browser: {e}");
        }

        let callback = server.wait_for_callback(cancel).await?;

        let token_url = endpoints.token();
        let form = [
            ("grant_type", "authorization_code"),
            ("client_id", client_id),
            ("code", callback.code()),
            ("redirect_uri", redirect_uri.as_str()),
            ("code_verifier", pkce.verifier()),
            ("scope", scope.as_str()),
        ];
        match request_token(&self.http, &token_url, &form, &scope, cancel).await? {
            TokenEndpointResponse::Token(token) => {
                log::info!("Interactive sign-in completed");
                Ok(token)
            }
            TokenEndpointResponse::Error { status, body } => {
                log::error!(
                    "Authorization code exchange failed with HTTP {}: {}",
                    status.as_u16(),
                    body.error
                );
                Err(
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        AuthenticationError::NetworkFailure {
                            endpoint: token_url.clone(),
                            reason: body.summary(),
                            status: Some(status.as_u16()),
                        }
                    } else {
                        AuthenticationError::UnexpectedProtocolError {
                            error_code: Some(body.error.clone()),
                            reason: body.summary(),
                        }
                    },
                )
            }
        }
    }

    fn auth_method(&self) -> AuthMethod {
        AuthMethod::Interactive
    }
}
