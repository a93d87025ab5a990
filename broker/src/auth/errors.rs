use crate::common::HttpError;
use thiserror::Error;

/// Errors returned by token acquisition.
///
/// Every variant tells the caller what to do next:
///
/// - [`InvalidCredentials`] - ask the user to re-enter credentials
/// - [`NetworkFailure`] - offer a manual retry
/// - [`UserCancelled`] - do nothing, the user asked for it
/// - [`DeviceCodeExpired`] / [`InteractiveTimeout`] - start a new sign-in
/// - [`UnexpectedProtocolError`] - fail and report
/// - [`InvalidConfiguration`] - fix the environment settings
///
/// None of the variants carry secret material. Provider error descriptions
/// are kept because they are needed to act on the failure (for example an
/// MFA requirement), but request bodies never are.
///
/// [`InvalidCredentials`]: AuthenticationError::InvalidCredentials
/// [`NetworkFailure`]: AuthenticationError::NetworkFailure
/// [`UserCancelled`]: AuthenticationError::UserCancelled
/// [`DeviceCodeExpired`]: AuthenticationError::DeviceCodeExpired
/// [`InteractiveTimeout`]: AuthenticationError::InteractiveTimeout
/// [`UnexpectedProtocolError`]: AuthenticationError::UnexpectedProtocolError
/// [`InvalidConfiguration`]: AuthenticationError::InvalidConfiguration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthenticationError {
    #[error("Invalid credentials: {reason}")]
    InvalidCredentials { reason: String },

    #[error("Network failure contacting {endpoint}: {reason}")]
    NetworkFailure {
        endpoint: String,
        reason: String,
        status: Option<u16>,
    },

    #[error("Authentication cancelled")]
    UserCancelled,

    #[error("The device code expired before sign-in was completed")]
    DeviceCodeExpired,

    #[error("No browser sign-in was completed within {timeout_secs}s")]
    InteractiveTimeout { timeout_secs: u64 },

    #[error("Unexpected response from the identity provider: {reason}")]
    UnexpectedProtocolError {
        error_code: Option<String>,
        reason: String,
    },

    #[error("Invalid environment configuration: {0}")]
    InvalidConfiguration(String),
}

impl AuthenticationError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        AuthenticationError::UnexpectedProtocolError {
            error_code: None,
            reason: reason.into(),
        }
    }

    /// Transient failures worth a manual retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthenticationError::NetworkFailure { .. })
    }

    /// Failures fixed by asking for credentials again.
    pub fn requires_reprompt(&self) -> bool {
        matches!(self, AuthenticationError::InvalidCredentials { .. })
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, AuthenticationError::UserCancelled)
    }

    /// Text suitable for showing to the user.
    ///
    /// Cancellation maps to an empty string: the caller is expected to simply
    /// stop showing progress.
    pub fn user_message(&self) -> String {
        match self {
            AuthenticationError::UserCancelled => String::new(),
            AuthenticationError::InvalidCredentials { reason } => format!(
                "Sign-in was rejected ({reason}). Please re-enter the credentials for this environment."
            ),
            AuthenticationError::NetworkFailure { endpoint, .. } => format!(
                "Could not reach {endpoint}. Check your connection and try again."
            ),
            AuthenticationError::DeviceCodeExpired => {
                "The device code expired. Start the sign-in again.".to_string()
            }
            AuthenticationError::InteractiveTimeout { .. } => {
                "The browser sign-in was not completed in time. Start the sign-in again."
                    .to_string()
            }
            AuthenticationError::UnexpectedProtocolError { reason, .. } => {
                format!("Authentication failed: {reason}")
            }
            AuthenticationError::InvalidConfiguration(reason) => {
                format!("The environment is not configured correctly: {reason}")
            }
        }
    }
}

impl From<HttpError> for AuthenticationError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Cancelled => AuthenticationError::UserCancelled,
            HttpError::ClientCreation { reason } => AuthenticationError::InvalidConfiguration(
                format!("HTTP client could not be created: {reason}"),
            ),
            HttpError::RequestFailed { url, reason } => AuthenticationError::NetworkFailure {
                endpoint: url,
                reason,
                status: None,
            },
            HttpError::Timeout { url, seconds } => AuthenticationError::NetworkFailure {
                endpoint: url,
                reason: format!("request timed out after {seconds}s"),
                status: None,
            },
        }
    }
}
