use super::errors::AuthenticationError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use zeroize::Zeroizing;

/// Public client registered by Microsoft for Dataverse tooling. Used by the
/// user-delegated flows when an environment does not bring its own app
/// registration.
pub const DEFAULT_PUBLIC_CLIENT_ID: &str = "51f81489-12ee-4a9e-aaae-a2591f45987d";

/// Authentication methods supported by the broker.
///
/// Each method maps to exactly one flow handler and decides which credential
/// (if any) has to be fetched from the secret store before the flow runs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// Client credentials grant with an app registration secret
    ServicePrincipal,
    /// Resource owner password grant
    UsernamePassword,
    /// Authorization code grant with PKCE through the system browser
    Interactive,
    /// Device authorization grant, completed on any browser
    DeviceCode,
}

impl AuthMethod {
    pub const ALL: [AuthMethod; 4] = [
        AuthMethod::ServicePrincipal,
        AuthMethod::UsernamePassword,
        AuthMethod::Interactive,
        AuthMethod::DeviceCode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::ServicePrincipal => "service_principal",
            AuthMethod::UsernamePassword => "username_password",
            AuthMethod::Interactive => "interactive",
            AuthMethod::DeviceCode => "device_code",
        }
    }

    /// The secret this method needs from the secret store, if any.
    pub fn required_credential(&self) -> Option<CredentialKind> {
        match self {
            AuthMethod::ServicePrincipal => Some(CredentialKind::ClientSecret),
            AuthMethod::UsernamePassword => Some(CredentialKind::Password),
            AuthMethod::Interactive | AuthMethod::DeviceCode => None,
        }
    }

    /// Whether tokens issued by this method belong to a signed-in user rather
    /// than to the app registration itself.
    pub fn is_user_delegated(&self) -> bool {
        !matches!(self, AuthMethod::ServicePrincipal)
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = AuthenticationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuthMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == s.trim())
            .ok_or_else(|| {
                AuthenticationError::InvalidConfiguration(format!(
                    "Unknown authentication method '{s}'. Expected one of: service_principal, username_password, interactive, device_code"
                ))
            })
    }
}

/// Kind of secret kept in the secret store for an environment.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ClientSecret,
    Password,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::ClientSecret => "client_secret",
            CredentialKind::Password => "password",
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication settings of one Dataverse environment.
///
/// The value is owned by environment management; the broker only reads it.
/// A fresh copy is passed into every acquisition so edits made elsewhere are
/// picked up on the next call.
///
/// # Required Fields
///
/// - `tenant_id` - Microsoft Entra tenant (GUID or verified domain)
/// - `dataverse_url` - Environment URL, e.g. `https://contoso.crm.dynamics.com`
/// - `auth_method` - Which grant flow to run
///
/// # Method Specific Fields
///
/// - `client_id` - Required for `service_principal`, optional otherwise
/// - `username` - Required for `username_password`, used as login hint for
///   `interactive`
/// - `custom_scope` - Overrides the default `{dataverse_url}/.default` scope
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentAuthConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub dataverse_url: String,
    pub auth_method: AuthMethod,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub custom_scope: Option<String>,
}

impl EnvironmentAuthConfig {
    pub fn new(
        tenant_id: impl Into<String>,
        dataverse_url: impl Into<String>,
        auth_method: AuthMethod,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            client_id: None,
            dataverse_url: dataverse_url.into(),
            auth_method,
            username: None,
            custom_scope: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_custom_scope(mut self, scope: impl Into<String>) -> Self {
        self.custom_scope = Some(scope.into());
        self
    }

    /// Scope requested from the token endpoint.
    pub fn scope(&self) -> String {
        match non_blank(self.custom_scope.as_deref()) {
            Some(scope) => scope.to_string(),
            None => format!("{}/.default", self.dataverse_url.trim().trim_end_matches('/')),
        }
    }

    /// Client id used on the wire.
    ///
    /// # Errors
    ///
    /// Returns [`AuthenticationError::InvalidConfiguration`] for a service
    /// principal without a client id; the other methods fall back to
    /// [`DEFAULT_PUBLIC_CLIENT_ID`].
    pub fn effective_client_id(&self) -> Result<&str, AuthenticationError> {
        match non_blank(self.client_id.as_deref()) {
            Some(client_id) => Ok(client_id),
            None if self.auth_method.is_user_delegated() => Ok(DEFAULT_PUBLIC_CLIENT_ID),
            None => Err(AuthenticationError::InvalidConfiguration(
                "A client id is required for service principal authentication".to_string(),
            )),
        }
    }

    /// Username for methods that sign in as a user.
    pub fn username(&self) -> Option<&str> {
        non_blank(self.username.as_deref())
    }

    /// Checks that the configuration can ever produce a token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthenticationError::InvalidConfiguration`] describing the
    /// first problem found.
    pub fn validate(&self) -> Result<(), AuthenticationError> {
        if self.tenant_id.trim().is_empty() {
            return Err(AuthenticationError::InvalidConfiguration(
                "Tenant id cannot be empty".to_string(),
            ));
        }

        let url = url::Url::parse(self.dataverse_url.trim()).map_err(|e| {
            AuthenticationError::InvalidConfiguration(format!("Invalid Dataverse URL: {e}"))
        })?;
        let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
        match url.scheme() {
            "https" => {}
            "http" if loopback => {}
            other => {
                return Err(AuthenticationError::InvalidConfiguration(format!(
                    "Dataverse URL must use https, got '{other}'"
                )));
            }
        }

        self.effective_client_id()?;

        if self.auth_method == AuthMethod::UsernamePassword && self.username().is_none() {
            return Err(AuthenticationError::InvalidConfiguration(
                "A username is required for username/password authentication".to_string(),
            ));
        }

        Ok(())
    }

    /// Identity of the tokens this configuration produces.
    ///
    /// # Errors
    ///
    /// Fails only when no client id can be determined.
    pub fn cache_key(&self) -> Result<CacheKey, AuthenticationError> {
        Ok(CacheKey {
            tenant_id: self.tenant_id.trim().to_string(),
            client_id: self.effective_client_id()?.to_string(),
            auth_method: self.auth_method,
            scope: self.scope(),
            username: if self.auth_method.is_user_delegated() {
                self.username().map(str::to_string)
            } else {
                None
            },
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Composite identity of a cached token.
///
/// Kept as a struct rather than a joined string so distinct tuples can never
/// collide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant_id: String,
    pub client_id: String,
    pub auth_method: AuthMethod,
    pub scope: String,
    pub username: Option<String>,
}

impl fmt::Display for CacheKey {
    // Deliberately omits the username.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} [{}]",
            self.tenant_id, self.client_id, self.auth_method, self.scope
        )
    }
}

/// Opaque bearer token value.
///
/// Zeroized on drop and redacted from `Debug`/`Display`.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(Zeroizing<String>);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    /// Exposes the raw token for use in an `Authorization` header.
    pub fn secret(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// A token together with what is needed to decide whether it is still usable.
#[derive(Clone, Debug)]
pub struct CachedToken {
    pub access_token: AccessToken,
    /// Usually "Bearer"
    pub token_type: String,
    pub expires_on: DateTime<Utc>,
    pub scope: String,
}

impl CachedToken {
    pub fn new(
        access_token: AccessToken,
        token_type: impl Into<String>,
        expires_in: Duration,
        scope: impl Into<String>,
    ) -> Self {
        let expires_in = ChronoDuration::from_std(expires_in).unwrap_or(ChronoDuration::zero());
        Self {
            access_token,
            token_type: token_type.into(),
            expires_on: Utc::now() + expires_in,
            scope: scope.into(),
        }
    }

    /// True once `now + skew` reaches `expires_on`.
    pub fn is_expired(&self, skew: Duration) -> bool {
        self.is_expired_at(Utc::now(), skew)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        let skew = ChronoDuration::from_std(skew).unwrap_or(ChronoDuration::MAX);
        match now.checked_add_signed(skew) {
            Some(limit) => limit >= self.expires_on,
            None => true,
        }
    }

    /// Value for an `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("{} {}", self.token_type, self.access_token.secret())
    }
}

/// What the user needs to complete a device code sign-in.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceCodeInfo {
    /// The code to type on the verification page
    pub user_code: String,
    /// The page where the code is entered
    pub verification_uri: String,
    /// Seconds until the code expires
    pub expires_in: u64,
    /// Seconds between polls requested by the server
    pub interval: u64,
    /// Ready-to-display instructions
    pub message: String,
}
