//! Token endpoint exchange shared by all grant flows.

use super::errors::AuthenticationError;
use super::types::{AccessToken, CachedToken};
use crate::common::HttpClient;
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_type")]
    token_type: String,
    expires_in: Seconds,
    #[serde(default)]
    scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Some endpoints send `expires_in` as a JSON string.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum Seconds {
    Number(u64),
    Text(String),
}

impl Seconds {
    pub(crate) fn as_secs(&self) -> Option<u64> {
        match self {
            Seconds::Number(secs) => Some(*secs),
            Seconds::Text(text) => text.trim().parse().ok(),
        }
    }
}

/// RFC 6749 §5.2 error body.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl OAuthErrorBody {
    /// `error` plus the first line of the description. Entra appends trace and
    /// correlation ids on later lines.
    pub fn summary(&self) -> String {
        match self
            .error_description
            .as_deref()
            .and_then(|d| d.lines().next())
            .map(str::trim)
            .filter(|d| !d.is_empty())
        {
            Some(description) => format!("{}: {description}", self.error),
            None => self.error.clone(),
        }
    }
}

pub(crate) enum TokenEndpointResponse {
    Token(CachedToken),
    Error {
        status: StatusCode,
        body: OAuthErrorBody,
    },
}

/// POSTs `form` to the token endpoint and parses either outcome.
///
/// # Errors
///
/// Transport failures and cancellation come from the shared client; a
/// success status with an unreadable body is an
/// [`AuthenticationError::UnexpectedProtocolError`].
pub(crate) async fn request_token(
    http: &HttpClient,
    url: &str,
    form: &[(&str, &str)],
    requested_scope: &str,
    cancel: &CancellationToken,
) -> Result<TokenEndpointResponse, AuthenticationError> {
    let response = http.post_form(url, form, cancel).await?;
    let status = response.status();

    if status.is_success() {
        let body: TokenResponse = read_json(response, cancel).await?;
        let expires_in = body.expires_in.as_secs().ok_or_else(|| {
            AuthenticationError::protocol("token response carried an unreadable expires_in")
        })?;
        if body.access_token.is_empty() {
            return Err(AuthenticationError::protocol(
                "token response carried an empty access_token",
            ));
        }
        let scope = body.scope.unwrap_or_else(|| requested_scope.to_string());
        return Ok(TokenEndpointResponse::Token(CachedToken::new(
            AccessToken::new(body.access_token),
            body.token_type,
            Duration::from_secs(expires_in),
            scope,
        )));
    }

    Ok(TokenEndpointResponse::Error {
        status,
        body: read_error_body(response, cancel).await?,
    })
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: Response,
    cancel: &CancellationToken,
) -> Result<T, AuthenticationError> {
    let bytes = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AuthenticationError::UserCancelled),
        bytes = response.bytes() => bytes,
    };
    let bytes = bytes.map_err(|e| AuthenticationError::NetworkFailure {
        endpoint: e.url().map(|u| u.to_string()).unwrap_or_default(),
        reason: format!("failed to read response body: {}", e.without_url()),
        status: None,
    })?;
    serde_json::from_slice(&bytes)
        .map_err(|e| AuthenticationError::protocol(format!("malformed response body: {e}")))
}

/// Reads an error body, tolerating endpoints that do not send JSON.
pub(crate) async fn read_error_body(
    response: Response,
    cancel: &CancellationToken,
) -> Result<OAuthErrorBody, AuthenticationError> {
    let status = response.status();
    let text = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(AuthenticationError::UserCancelled),
        text = response.text() => text.unwrap_or_default(),
    };
    Ok(
        serde_json::from_str::<OAuthErrorBody>(&text).unwrap_or_else(|_| OAuthErrorBody {
            error: format!("http_{}", status.as_u16()),
            error_description: None,
        }),
    )
}

/// Maps a failed credential exchange (client credentials or password grant).
///
/// 400 and 401 mean the identity provider rejected what was sent; throttling
/// and server errors that survived the client's retries are network failures.
pub(crate) fn credential_exchange_error(
    endpoint: &str,
    status: StatusCode,
    body: &OAuthErrorBody,
) -> AuthenticationError {
    match status {
        StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
            AuthenticationError::InvalidCredentials {
                reason: body.summary(),
            }
        }
        status if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() => {
            AuthenticationError::NetworkFailure {
                endpoint: endpoint.to_string(),
                reason: body.summary(),
                status: Some(status.as_u16()),
            }
        }
        _ => AuthenticationError::UnexpectedProtocolError {
            error_code: Some(body.error.clone()),
            reason: format!("HTTP {}: {}", status.as_u16(), body.summary()),
        },
    }
}
