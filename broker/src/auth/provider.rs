use super::credentials::Credentials;
use super::errors::AuthenticationError;
use super::types::{AuthMethod, CachedToken, EnvironmentAuthConfig};
use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One OAuth grant flow.
///
/// A handler turns an environment configuration plus the credentials fetched
/// for this single execution into a token. Handlers hold no per-environment
/// state; caching and serialization are the coordinator's job.
///
/// # Examples
///
/// ```no_run
/// use broker::auth::{AuthMethod, AuthenticationError, CachedToken, Credentials,
///     EnvironmentAuthConfig, FlowHandler};
/// use async_trait::async_trait;
/// use tokio_util::sync::CancellationToken;
///
/// struct AlwaysCancelled;
///
/// #[async_trait]
/// impl FlowHandler for AlwaysCancelled {
///     async fn acquire_token(
///         &self,
///         _config: &EnvironmentAuthConfig,
///         _credentials: Credentials,
///         _cancel: &CancellationToken,
///     ) -> Result<CachedToken, AuthenticationError> {
///         Err(AuthenticationError::UserCancelled)
///     }
///
///     fn auth_method(&self) -> AuthMethod {
///         AuthMethod::DeviceCode
///     }
/// }
/// ```
#[async_trait]
pub trait FlowHandler: Send + Sync {
    /// Runs the protocol exchange.
    ///
    /// # Errors
    ///
    /// Returns the typed [`AuthenticationError`] describing why no token was
    /// issued. Cancellation always surfaces as
    /// [`AuthenticationError::UserCancelled`].
    async fn acquire_token(
        &self,
        config: &EnvironmentAuthConfig,
        credentials: Credentials,
        cancel: &CancellationToken,
    ) -> Result<CachedToken, AuthenticationError>;

    /// The method this handler serves.
    fn auth_method(&self) -> AuthMethod;
}

/// One handler per [`AuthMethod`].
#[derive(Clone)]
pub struct FlowRegistry {
    service_principal: Arc<dyn FlowHandler>,
    username_password: Arc<dyn FlowHandler>,
    interactive: Arc<dyn FlowHandler>,
    device_code: Arc<dyn FlowHandler>,
}

impl std::fmt::Debug for FlowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowRegistry").finish_non_exhaustive()
    }
}

impl FlowRegistry {
    /// # Errors
    ///
    /// Fails when a handler is registered in a slot for another method.
    pub fn new(
        service_principal: Arc<dyn FlowHandler>,
        username_password: Arc<dyn FlowHandler>,
        interactive: Arc<dyn FlowHandler>,
        device_code: Arc<dyn FlowHandler>,
    ) -> Result<Self, AuthenticationError> {
        let registry = Self {
            service_principal,
            username_password,
            interactive,
            device_code,
        };
        for method in AuthMethod::ALL {
            let served = registry.handler(method).auth_method();
            if served != method {
                return Err(AuthenticationError::InvalidConfiguration(format!(
                    "Handler for {served} registered as {method}"
                )));
            }
        }
        Ok(registry)
    }

    /// Replaces the handler for the method it serves.
    pub fn with_handler(mut self, handler: Arc<dyn FlowHandler>) -> Self {
        match handler.auth_method() {
            AuthMethod::ServicePrincipal => self.service_principal = handler,
            AuthMethod::UsernamePassword => self.username_password = handler,
            AuthMethod::Interactive => self.interactive = handler,
            AuthMethod::DeviceCode => self.device_code = handler,
        }
        self
    }

    pub fn handler(&self, method: AuthMethod) -> &Arc<dyn FlowHandler> {
        match method {
            AuthMethod::ServicePrincipal => &self.service_principal,
            AuthMethod::UsernamePassword => &self.username_password,
            AuthMethod::Interactive => &self.interactive,
            AuthMethod::DeviceCode => &self.device_code,
        }
    }
}
