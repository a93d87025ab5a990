use super::credentials::Credentials;
use super::errors::AuthenticationError;
use super::provider::FlowHandler;
use super::token_endpoint::{
    OAuthErrorBody, Seconds, TokenEndpointResponse, read_error_body, read_json, request_token,
};
use super::types::{AuthMethod, CachedToken, DeviceCodeInfo, EnvironmentAuthConfig};
use crate::common::HttpClient;
use crate::config::{BrokerSettings, TenantEndpoints};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Receives the user code and verification page once the flow has started.
pub type DeviceCodeCallback = Arc<dyn Fn(&DeviceCodeInfo) + Send + Sync>;

#[derive(Deserialize)]
struct DeviceCodeResponse {
    device_code: String,
    user_code: String,
    #[serde(default)]
    verification_uri: Option<String>,
    // Older v1 endpoints use `verification_url`.
    #[serde(default)]
    verification_url: Option<String>,
    expires_in: Seconds,
    #[serde(default)]
    interval: Option<Seconds>,
    #[serde(default)]
    message: Option<String>,
}

/// Device authorization grant (RFC 8628).
///
/// The user completes sign-in on any device; this side polls the token
/// endpoint until the grant is approved, declined, expired or cancelled.
pub struct DeviceCodeFlow {
    http: Arc<HttpClient>,
    authority_host: String,
    slow_down_increment: Duration,
    max_wait: Duration,
    on_device_code: DeviceCodeCallback,
}

impl DeviceCodeFlow {
    pub fn new(
        http: Arc<HttpClient>,
        settings: &BrokerSettings,
        on_device_code: DeviceCodeCallback,
    ) -> Self {
        Self {
            http,
            authority_host: settings.authority_host().to_string(),
            slow_down_increment: settings.device_code_slow_down(),
            max_wait: settings.device_code_max_wait(),
            on_device_code,
        }
    }

    async fn start(
        &self,
        endpoints: &TenantEndpoints,
        client_id: &str,
        scope: &str,
        cancel: &CancellationToken,
    ) -> Result<(Zeroizing<String>, DeviceCodeInfo), AuthenticationError> {
        let url = endpoints.device_code();
        let response = self
            .http
            .post_form(&url, &[("client_id", client_id), ("scope", scope)], cancel)
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = read_error_body(response, cancel).await?;
            log::error!(
                "Device code request failed with HTTP {}: {}",
                status.as_u16(),
                body.error
            );
            return Err(poll_failure(&url, status, &body));
        }

        let body: DeviceCodeResponse = read_json(response, cancel).await?;
        let device_code = Zeroizing::new(body.device_code);
        let verification_uri = body
            .verification_uri
            .or(body.verification_url)
            .ok_or_else(|| {
                AuthenticationError::protocol("device code response has no verification uri")
            })?;
        let expires_in = body.expires_in.as_secs().ok_or_else(|| {
            AuthenticationError::protocol("device code response has an unreadable expires_in")
        })?;
        let interval = body
            .interval
            .and_then(|interval| interval.as_secs())
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
            .max(1);
        let message = body.message.unwrap_or_else(|| {
            format!(
                "To sign in, use a web browser to open the page {verification_uri} and enter the code {} to authenticate.",
                body.user_code
            )
        });

        Ok((
            device_code,
            DeviceCodeInfo {
                user_code: body.user_code,
                verification_uri,
                expires_in,
                interval,
                message,
            },
        ))
    }
}

/// Maps a device code error that is not one of the polling states.
fn poll_failure(endpoint: &str, status: StatusCode, body: &OAuthErrorBody) -> AuthenticationError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        AuthenticationError::NetworkFailure {
            endpoint: endpoint.to_string(),
            reason: body.summary(),
            status: Some(status.as_u16()),
        }
    } else {
        AuthenticationError::UnexpectedProtocolError {
            error_code: Some(body.error.clone()),
            reason: body.summary(),
        }
    }
}

#[async_trait]
impl FlowHandler for DeviceCodeFlow {
    async fn acquire_token(
        &self,
        config: &EnvironmentAuthConfig,
        _credentials: Credentials,
        cancel: &CancellationToken,
    ) -> Result<CachedToken, AuthenticationError> {
        let client_id = config.effective_client_id()?;
        let scope = config.scope();
        let endpoints = TenantEndpoints::new(&self.authority_host, &config.tenant_id);

        let (device_code, info) = self.start(&endpoints, client_id, &scope, cancel).await?;
        let deadline = Instant::now() + Duration::from_secs(info.expires_in).min(self.max_wait);
        let mut interval = Duration::from_secs(info.interval);

        log::info!(
            "Device code sign-in started, waiting up to {}s for the user",
            deadline.saturating_duration_since(Instant::now()).as_secs()
        );
        (self.on_device_code)(&info);

        let token_url = endpoints.token();
        loop {
            if cancel.is_cancelled() {
                return Err(AuthenticationError::UserCancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("Device code expired before sign-in completed");
                return Err(AuthenticationError::DeviceCodeExpired);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuthenticationError::UserCancelled),
                _ = tokio::time::sleep(interval.min(deadline - now)) => {}
            }

            let form = [
                ("grant_type", DEVICE_CODE_GRANT),
                ("client_id", client_id),
                ("device_code", device_code.as_str()),
            ];
            let (status, body) = match request_token(&self.http, &token_url, &form, &scope, cancel)
                .await?
            {
                TokenEndpointResponse::Token(token) => {
                    log::info!("Device code sign-in completed");
                    return Ok(token);
                }
                TokenEndpointResponse::Error { status, body } => (status, body),
            };

            match body.error.as_str() {
                "authorization_pending" => {
                    log::debug!("Waiting for user to complete authentication");
                }
                "slow_down" => {
                    interval += self.slow_down_increment;
                    log::debug!(
                        "Polling too frequently, interval raised to {}s",
                        interval.as_secs()
                    );
                }
                "expired_token" | "code_expired" => {
                    return Err(AuthenticationError::DeviceCodeExpired);
                }
                "authorization_declined" | "access_denied" => {
                    log::info!("User declined the device code sign-in");
                    return Err(AuthenticationError::UserCancelled);
                }
                _ => return Err(poll_failure(&token_url, status, &body)),
            }
        }
    }

    fn auth_method(&self) -> AuthMethod {
        AuthMethod::DeviceCode
    }
}
