use broker::auth::AuthenticationError;
use broker::secrets::SecretStoreError;
use broker::utils::EnvVarError;
use thiserror::Error;

/// Errors surfaced by CLI commands.
///
/// Authentication errors are kept intact so `main` can print their
/// [`AuthenticationError::user_message`] and treat cancellation quietly.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown environment '{0}'. Run `dvtool environments` to list configured ones.")]
    UnknownEnvironment(String),

    #[error(transparent)]
    Auth(#[from] AuthenticationError),

    #[error("Secret store error: {0}")]
    Secrets(#[from] SecretStoreError),

    #[error("{0}")]
    Env(#[from] EnvVarError),

    #[error("Dataverse request failed: {0}")]
    Dataverse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for AppError {
    fn from(err: ::config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
