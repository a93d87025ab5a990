//! Validated access to environment variables.

use crate::secrets::SecretValue;
use thiserror::Error;
use zeroize::Zeroizing;

/// Variable holding the master password of the encrypted secret file.
pub const MASTER_PASSWORD_VAR: &str = "DVTOOL_MASTER_PASSWORD";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvVarError {
    #[error(
        "Environment variable '{name}' not found. Please set this variable in your .env file or environment."
    )]
    NotFound { name: String },

    #[error(
        "Environment variable '{name}' contains invalid UTF-8 characters. Please check the value."
    )]
    InvalidUtf8 { name: String },

    #[error("Environment variable '{name}' is empty. Please provide a valid value.")]
    Empty { name: String },
}

/// Environment variable helpers. Plain values are trimmed; secrets are
/// returned as set.
pub struct EnvUtils;

impl EnvUtils {
    pub fn has_non_empty_var(name: &str) -> bool {
        std::env::var(name).is_ok_and(|value| !value.trim().is_empty())
    }

    /// Returns the trimmed value of `name`.
    ///
    /// # Errors
    ///
    /// Returns [`EnvVarError`] when the variable is unset, blank, or not
    /// UTF-8.
    pub fn get_validated_var(name: &str) -> Result<String, EnvVarError> {
        let value = Self::read(name)?;
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(EnvVarError::Empty {
                name: name.to_string(),
            });
        }
        Ok(trimmed.to_string())
    }

    pub fn get_optional_var(name: &str) -> Option<String> {
        Self::get_validated_var(name).ok()
    }

    /// Reads a secret without trimming it; the value is never logged.
    ///
    /// # Errors
    ///
    /// Same as [`EnvUtils::get_validated_var`].
    pub fn get_secret_var(name: &str) -> Result<SecretValue, EnvVarError> {
        let value = Zeroizing::new(Self::read(name)?);
        if value.trim().is_empty() {
            return Err(EnvVarError::Empty {
                name: name.to_string(),
            });
        }
        Ok(SecretValue::from(value))
    }

    fn read(name: &str) -> Result<String, EnvVarError> {
        std::env::var(name).map_err(|e| match e {
            std::env::VarError::NotPresent => EnvVarError::NotFound {
                name: name.to_string(),
            },
            std::env::VarError::NotUnicode(_) => EnvVarError::InvalidUtf8 {
                name: name.to_string(),
            },
        })
    }
}
