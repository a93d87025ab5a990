pub mod browser;
pub mod coordinator;
pub mod credentials;
pub mod device_code;
pub mod errors;
pub mod interactive;
pub mod invalidation;
pub mod loopback;
pub mod password;
pub mod pkce;
pub mod provider;
pub mod service_principal;
pub mod token_cache;
pub(crate) mod token_endpoint;
pub mod types;

pub use browser::BrowserLauncher;
pub use coordinator::AuthenticationCoordinator;
pub use credentials::{CredentialProvider, Credentials, SecretStoreCredentialProvider};
pub use device_code::{DeviceCodeCallback, DeviceCodeFlow};
pub use errors::AuthenticationError;
pub use interactive::InteractiveFlow;
pub use invalidation::should_invalidate;
pub use loopback::{AuthorizationCallback, LoopbackRedirectServer};
pub use password::PasswordFlow;
pub use provider::{FlowHandler, FlowRegistry};
pub use service_principal::ServicePrincipalFlow;
pub use token_cache::TokenCache;
pub use types::{
    AccessToken, AuthMethod, CacheKey, CachedToken, CredentialKind, DeviceCodeInfo,
    EnvironmentAuthConfig,
};
