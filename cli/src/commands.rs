use crate::config::AppConfig;
use crate::dataverse;
use crate::error::{AppError, AppResult};
use crate::system::{SystemBrowser, print_device_code};
use broker::auth::{
    AuthenticationCoordinator, CachedToken, CredentialKind, SecretStoreCredentialProvider,
};
use broker::common::HttpClient;
use broker::secrets::{
    EncryptedFileSecretStore, MemorySecretStore, SecretKey, SecretStore, SecretValue,
};
use broker::utils::{EnvUtils, MASTER_PASSWORD_VAR};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "dvtool")]
#[command(about = "Inspect and manage Microsoft Dataverse environments")]
pub struct Cli {
    /// Path to config.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List configured environments
    Environments,
    /// Acquire an access token for an environment
    Token {
        environment: String,
        /// Print the raw access token to stdout
        #[arg(long)]
        show: bool,
    },
    /// Acquire a token and call WhoAmI
    TestConnection { environment: String },
    /// Manage stored client secrets and passwords
    Secret(SecretCommands),
}

#[derive(Args, Debug)]
pub struct SecretCommands {
    #[command(subcommand)]
    pub command: SecretSubcommands,
}

#[derive(Subcommand, Debug)]
pub enum SecretSubcommands {
    /// Store a secret read from stdin
    Set {
        environment: String,
        kind: SecretKindArg,
    },
    /// Delete a stored secret
    Delete {
        environment: String,
        kind: SecretKindArg,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecretKindArg {
    ClientSecret,
    Password,
}

impl From<SecretKindArg> for CredentialKind {
    fn from(kind: SecretKindArg) -> Self {
        match kind {
            SecretKindArg::ClientSecret => CredentialKind::ClientSecret,
            SecretKindArg::Password => CredentialKind::Password,
        }
    }
}

/// Opens the encrypted secret file when a master password is available.
///
/// Without one, secrets live only for this process.
async fn open_secret_store(config: &AppConfig) -> AppResult<Arc<dyn SecretStore>> {
    let path = config.secrets().file();
    match (EnvUtils::get_secret_var(MASTER_PASSWORD_VAR), path) {
        (Ok(master_password), Some(path)) => Ok(Arc::new(
            EncryptedFileSecretStore::open(path, master_password.expose()).await?,
        )),
        (Ok(_), None) => Err(AppError::Config(
            "No secret file configured and no user config directory available".to_string(),
        )),
        (Err(e), _) => {
            log::warn!("{e} Stored secrets are unavailable for this run.");
            Ok(Arc::new(MemorySecretStore::new()))
        }
    }
}

/// Cancels `cancel` on Ctrl-C.
fn cancel_on_ctrl_c(cancel: &CancellationToken) {
    let cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, cancelling");
            cancel.cancel();
        }
    });
}

struct Session {
    config: AppConfig,
    coordinator: AuthenticationCoordinator,
    provider: SecretStoreCredentialProvider,
    cancel: CancellationToken,
}

impl Session {
    async fn open(config: AppConfig) -> AppResult<Self> {
        let store = open_secret_store(&config).await?;
        let coordinator = AuthenticationCoordinator::new(
            config.broker(),
            Arc::new(SystemBrowser),
            print_device_code(),
        )?;
        let cancel = CancellationToken::new();
        cancel_on_ctrl_c(&cancel);

        Ok(Self {
            config,
            coordinator,
            provider: SecretStoreCredentialProvider::new(store),
            cancel,
        })
    }

    async fn token(&self, environment: &str) -> AppResult<CachedToken> {
        let entry = self.config.environment(environment)?;
        Ok(self
            .coordinator
            .acquire_token(environment, entry.auth(), &self.provider, &self.cancel)
            .await?)
    }
}

pub async fn run(cli: Cli, config: AppConfig) -> AppResult<()> {
    match cli.command {
        Commands::Environments => {
            list_environments(&config);
            Ok(())
        }
        Commands::Token { environment, show } => {
            let session = Session::open(config).await?;
            let token = session.token(&environment).await?;
            if show {
                println!("{}", token.access_token.secret());
            } else {
                println!(
                    "Acquired {} token for {environment}, expires {}",
                    token.token_type,
                    token.expires_on.with_timezone(&chrono::Local)
                );
            }
            Ok(())
        }
        Commands::TestConnection { environment } => {
            let session = Session::open(config).await?;
            let token = session.token(&environment).await?;
            let settings = session.config.broker();
            let http = HttpClient::new(settings.http_timeout(), settings.retry_policy())
                .map_err(broker::auth::AuthenticationError::from)?;
            let dataverse_url = &session.config.environment(&environment)?.auth().dataverse_url;
            let who =
                dataverse::who_am_i(&http, dataverse_url, &token, &session.cancel).await?;

            println!("Connected to {dataverse_url}");
            println!("  UserId:         {}", who.user_id);
            println!("  BusinessUnitId: {}", who.business_unit_id);
            println!("  OrganizationId: {}", who.organization_id);
            Ok(())
        }
        Commands::Secret(SecretCommands { command }) => run_secret(command, &config).await,
    }
}

fn list_environments(config: &AppConfig) {
    if config.environments().is_empty() {
        println!("No environments configured.");
        return;
    }
    for (id, entry) in config.environments() {
        println!(
            "{id:<20} {:<18} {:<24} {}",
            entry.auth().auth_method.as_str(),
            entry.display_name().unwrap_or("-"),
            entry.auth().dataverse_url
        );
    }
}

async fn run_secret(command: SecretSubcommands, config: &AppConfig) -> AppResult<()> {
    // Writing secrets into a throwaway in-memory store would silently lose them.
    let master_password = EnvUtils::get_secret_var(MASTER_PASSWORD_VAR)?;
    let path = config.secrets().file().ok_or_else(|| {
        AppError::Config("No secret file configured and no user config directory available".to_string())
    })?;
    let store = EncryptedFileSecretStore::open(path, master_password.expose()).await?;

    match command {
        SecretSubcommands::Set { environment, kind } => {
            config.environment(&environment)?;
            let value = read_secret_from_stdin().await?;
            if value.is_empty() {
                return Err(AppError::Config("Refusing to store an empty secret".to_string()));
            }
            store
                .set_secret(&SecretKey::new(environment.as_str(), kind.into()), value)
                .await?;
            eprintln!("Stored {} for {environment}", CredentialKind::from(kind));
        }
        SecretSubcommands::Delete { environment, kind } => {
            store
                .delete_secret(&SecretKey::new(environment.as_str(), kind.into()))
                .await?;
            eprintln!("Deleted {} for {environment}", CredentialKind::from(kind));
        }
    }
    Ok(())
}

/// Reads the secret on the blocking pool so the runtime keeps serving the
/// Ctrl-C handler.
async fn read_secret_from_stdin() -> AppResult<SecretValue> {
    eprintln!("Enter the secret and press Enter:");
    let value = tokio::task::spawn_blocking(|| read_secret_line(&mut std::io::stdin().lock()))
        .await
        .map_err(std::io::Error::other)??;
    Ok(value)
}

/// First line of `reader` without its line terminator.
fn read_secret_line(reader: &mut impl BufRead) -> std::io::Result<SecretValue> {
    let mut line = Zeroizing::new(String::new());
    reader.read_line(&mut line)?;
    Ok(SecretValue::new(line.trim_end_matches(['\r', '\n'])))
}
