use crate::error::{AppError, AppResult};
use ::config::{Config, Environment, File};
use broker::auth::EnvironmentAuthConfig;
use broker::config::BrokerSettings;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_PREFIX: &str = "DVTOOL";

/// Top-level configuration.
#[derive(Debug, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    broker: BrokerSettings,
    #[serde(default)]
    secrets: SecretsConfig,
    #[serde(default)]
    environments: BTreeMap<String, EnvironmentEntry>,
}

impl AppConfig {
    pub fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    pub fn broker(&self) -> &BrokerSettings {
        &self.broker
    }

    pub fn secrets(&self) -> &SecretsConfig {
        &self.secrets
    }

    pub fn environments(&self) -> &BTreeMap<String, EnvironmentEntry> {
        &self.environments
    }

    pub fn environment(&self, id: &str) -> AppResult<&EnvironmentEntry> {
        self.environments
            .get(id)
            .ok_or_else(|| AppError::UnknownEnvironment(id.to_string()))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    level: Option<String>,
    file: Option<String>,
}

impl LoggingConfig {
    pub fn level(&self) -> &str {
        self.level.as_deref().unwrap_or("info")
    }

    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SecretsConfig {
    file: Option<PathBuf>,
}

impl SecretsConfig {
    /// Configured secret file, else the per-user default.
    pub fn file(&self) -> Option<PathBuf> {
        self.file
            .clone()
            .or_else(broker::secrets::EncryptedFileSecretStore::default_path)
    }
}

/// One configured Dataverse environment.
#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentEntry {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(flatten)]
    auth: EnvironmentAuthConfig,
}

impl EnvironmentEntry {
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    pub fn auth(&self) -> &EnvironmentAuthConfig {
        &self.auth
    }
}

/// First existing default location: the user config directory, then the
/// working directory.
fn default_config_file() -> Option<PathBuf> {
    let candidates = [
        dirs::config_dir().map(|dir| dir.join("dvtool").join(CONFIG_FILE_NAME)),
        Some(PathBuf::from(CONFIG_FILE_NAME)),
    ];
    candidates.into_iter().flatten().find(|path| path.is_file())
}

/// Loads `config.toml` and `DVTOOL_*` environment overrides.
///
/// An explicit `path` must exist; without one the default locations are
/// optional and an empty configuration is valid.
///
/// # Errors
///
/// Returns [`AppError::Config`] when the file cannot be read or does not
/// match the expected layout.
pub fn load_config(path: Option<&Path>) -> AppResult<AppConfig> {
    dotenv::dotenv().ok();

    let mut builder = Config::builder();
    match path {
        Some(path) => builder = builder.add_source(File::from(path).required(true)),
        None => {
            if let Some(path) = default_config_file() {
                builder = builder.add_source(File::from(path).required(false));
            }
        }
    }

    let config = builder
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = config
        .try_deserialize()
        .map_err(|e| AppError::Config(format!("Failed to deserialize config: {e}")))?;
    app_config.validate()?;
    Ok(app_config)
}

impl AppConfig {
    /// Rejects environments that can never authenticate.
    fn validate(&self) -> AppResult<()> {
        for (id, entry) in &self.environments {
            entry
                .auth
                .validate()
                .map_err(|e| AppError::Config(format!("environment '{id}': {e}")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::auth::AuthMethod;
    use claims::{assert_err, assert_ok};
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, content).expect("write config");
        path
    }

    #[test]
    fn test_full_layout() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
[logging]
level = "debug"
file = "dvtool.log"

[broker]
clock_skew_secs = 120

[secrets]
file = "/tmp/dvtool-secrets.json"

[environments.dev]
display_name = "Contoso Dev"
tenant_id = "contoso.onmicrosoft.com"
dataverse_url = "https://contoso-dev.crm.dynamics.com"
auth_method = "device_code"

[environments.build]
tenant_id = "contoso.onmicrosoft.com"
client_id = "00000000-0000-0000-0000-000000000001"
dataverse_url = "https://contoso-build.crm.dynamics.com"
auth_method = "service_principal"
"#,
        );

        let config = load_config(Some(&path)).expect("config");
        assert_eq!(config.logging().level(), "debug");
        assert_eq!(config.logging().file(), Some("dvtool.log"));
        assert_eq!(config.broker().clock_skew_secs, 120);
        assert_eq!(config.broker().interactive_timeout_secs, 120);
        assert_eq!(
            config.secrets().file(),
            Some(PathBuf::from("/tmp/dvtool-secrets.json"))
        );

        let dev = config.environment("dev").expect("dev");
        assert_eq!(dev.display_name(), Some("Contoso Dev"));
        assert_eq!(dev.auth().auth_method, AuthMethod::DeviceCode);
        assert_eq!(dev.auth().client_id, None);

        let build = config.environment("build").expect("build");
        assert_eq!(build.auth().auth_method, AuthMethod::ServicePrincipal);
        assert_err!(config.environment("prod"));
    }

    #[test]
    fn test_invalid_environment_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
[environments.broken]
tenant_id = "contoso"
dataverse_url = "https://contoso.crm.dynamics.com"
auth_method = "service_principal"
"#,
        );

        let err = load_config(Some(&path)).expect_err("missing client id");
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let dir = TempDir::new().expect("tempdir");
        assert_err!(load_config(Some(&dir.path().join("absent.toml"))));
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = write_config(&dir, "");
        let config = assert_ok!(load_config(Some(&path)));
        assert_eq!(config.logging().level(), "info");
        assert_eq!(config.broker(), &BrokerSettings::default());
        assert!(config.environments().is_empty());
    }
}
