//! Single entry point for token acquisition.
//!
//! Per call: validate the configuration, look the token up in the cache, and
//! on a miss serialize on the environment id, re-check the cache, fetch
//! credentials and run the flow handler for the configured method. Different
//! environments never wait on each other.

use super::browser::BrowserLauncher;
use super::credentials::CredentialProvider;
use super::device_code::{DeviceCodeCallback, DeviceCodeFlow};
use super::errors::AuthenticationError;
use super::interactive::InteractiveFlow;
use super::invalidation::{changed_fields, should_invalidate};
use super::password::PasswordFlow;
use super::provider::FlowRegistry;
use super::service_principal::ServicePrincipalFlow;
use super::token_cache::TokenCache;
use super::types::{CacheKey, CachedToken, CredentialKind, EnvironmentAuthConfig};
use crate::common::HttpClient;
use crate::config::BrokerSettings;
use crate::secrets::{SecretKey, SecretStore, SecretStoreError};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

type LockTable = StdMutex<HashMap<String, Arc<Mutex<()>>>>;

/// Holds one reference to an environment's lock entry and removes the entry
/// from the table once nobody else references it.
struct LockLease<'a> {
    table: &'a LockTable,
    environment_id: String,
    mutex: Option<Arc<Mutex<()>>>,
}

impl Drop for LockLease<'_> {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        drop(self.mutex.take());
        if table
            .get(&self.environment_id)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            table.remove(&self.environment_id);
        }
    }
}

/// Exclusive right to run a flow for one environment.
struct EnvironmentGuard<'a> {
    // Field order matters: the guard releases the mutex before the lease
    // checks whether the entry is still referenced.
    _guard: OwnedMutexGuard<()>,
    _lease: LockLease<'a>,
}

/// Cache keys recorded per environment, plus invalidation counters.
///
/// A flow snapshots [`KeyIndex::generation`] before it starts and only caches
/// its token if the snapshot is unchanged, so an invalidation that lands
/// while the flow is in flight is not undone by it.
#[derive(Default)]
struct KeyIndex {
    keys: HashMap<String, HashSet<CacheKey>>,
    generations: HashMap<String, u64>,
    epoch: u64,
}

impl KeyIndex {
    fn generation(&self, environment_id: &str) -> (u64, u64) {
        (
            self.epoch,
            self.generations.get(environment_id).copied().unwrap_or(0),
        )
    }

    fn invalidate(&mut self, environment_id: &str) -> Option<HashSet<CacheKey>> {
        *self
            .generations
            .entry(environment_id.to_string())
            .or_default() += 1;
        self.keys.remove(environment_id)
    }

    fn invalidate_all(&mut self) {
        self.epoch += 1;
        self.keys.clear();
    }
}

pub struct AuthenticationCoordinator {
    flows: FlowRegistry,
    cache: TokenCache,
    locks: LockTable,
    key_index: Mutex<KeyIndex>,
}

impl AuthenticationCoordinator {
    /// Wires the four standard flows over one shared HTTP client.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be created.
    pub fn new(
        settings: &BrokerSettings,
        browser: Arc<dyn BrowserLauncher>,
        on_device_code: DeviceCodeCallback,
    ) -> Result<Self, AuthenticationError> {
        let http = Arc::new(HttpClient::new(
            settings.http_timeout(),
            settings.retry_policy(),
        )?);

        let flows = FlowRegistry::new(
            Arc::new(ServicePrincipalFlow::new(
                http.clone(),
                settings.authority_host(),
            )),
            Arc::new(PasswordFlow::new(http.clone(), settings.authority_host())),
            Arc::new(InteractiveFlow::new(http.clone(), settings, browser)),
            Arc::new(DeviceCodeFlow::new(http, settings, on_device_code)),
        )?;

        Ok(Self::with_flows(
            flows,
            TokenCache::new(settings.clock_skew()),
        ))
    }

    pub fn with_flows(flows: FlowRegistry, cache: TokenCache) -> Self {
        Self {
            flows,
            cache,
            locks: StdMutex::new(HashMap::new()),
            key_index: Mutex::new(KeyIndex::default()),
        }
    }

    pub fn token_cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Returns a usable token for `environment_id`, running a flow if needed.
    ///
    /// # Errors
    ///
    /// Returns the flow's [`AuthenticationError`] unchanged;
    /// [`AuthenticationError::UserCancelled`] when `cancel` fires at any
    /// suspension point, including the wait for another caller's flow.
    pub async fn acquire_token(
        &self,
        environment_id: &str,
        config: &EnvironmentAuthConfig,
        credential_provider: &dyn CredentialProvider,
        cancel: &CancellationToken,
    ) -> Result<CachedToken, AuthenticationError> {
        let result = self
            .acquire(environment_id, config, credential_provider, cancel)
            .await;

        if let Err(e) = &result {
            if e.is_cancellation() {
                log::info!("Token acquisition for environment {environment_id} was cancelled");
            } else {
                log::error!("Token acquisition for environment {environment_id} failed: {e}");
            }
        }
        result
    }

    async fn acquire(
        &self,
        environment_id: &str,
        config: &EnvironmentAuthConfig,
        credential_provider: &dyn CredentialProvider,
        cancel: &CancellationToken,
    ) -> Result<CachedToken, AuthenticationError> {
        config.validate()?;
        let key = config.cache_key()?;

        if let Some(token) = self.cache.get(&key).await {
            log::debug!("Token cache hit for environment {environment_id}");
            return Ok(token);
        }

        let _guard = self.lock_environment(environment_id, cancel).await?;

        if let Some(token) = self.cache.get(&key).await {
            log::debug!("Token for environment {environment_id} acquired by a concurrent caller");
            return Ok(token);
        }

        let generation = self.key_index.lock().await.generation(environment_id);

        let credentials = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthenticationError::UserCancelled),
            credentials = credential_provider.credentials_for(environment_id, config.auth_method) => credentials?,
        };

        log::info!(
            "Acquiring token for environment {environment_id} via {}",
            config.auth_method
        );
        let token = self
            .flows
            .handler(config.auth_method)
            .acquire_token(config, credentials, cancel)
            .await?;

        {
            let mut index = self.key_index.lock().await;
            if index.generation(environment_id) != generation {
                log::info!(
                    "Environment {environment_id} was invalidated during sign-in, not caching the token"
                );
                return Ok(token);
            }
            self.cache.set(key.clone(), token.clone()).await;
            index
                .keys
                .entry(environment_id.to_string())
                .or_default()
                .insert(key);
        }

        log::info!(
            "Acquired {} token for environment {environment_id}, expires {}",
            token.token_type,
            token.expires_on
        );
        Ok(token)
    }

    async fn lock_environment(
        &self,
        environment_id: &str,
        cancel: &CancellationToken,
    ) -> Result<EnvironmentGuard<'_>, AuthenticationError> {
        let mutex = {
            let mut table = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            table
                .entry(environment_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let lease = LockLease {
            table: &self.locks,
            environment_id: environment_id.to_string(),
            mutex: Some(mutex.clone()),
        };

        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthenticationError::UserCancelled),
            guard = mutex.lock_owned() => guard,
        };

        Ok(EnvironmentGuard {
            _guard: guard,
            _lease: lease,
        })
    }

    /// Number of environments with a lock entry; entries vanish once unused.
    pub fn active_locks(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Applies an edit of an environment. Returns whether cached tokens were
    /// dropped.
    pub async fn on_environment_updated(
        &self,
        environment_id: &str,
        previous: Option<&EnvironmentAuthConfig>,
        current: &EnvironmentAuthConfig,
    ) -> bool {
        if !should_invalidate(previous, current) {
            return false;
        }

        if let Some(previous) = previous {
            log::info!(
                "Environment {environment_id} changed ({}), dropping cached tokens",
                changed_fields(previous, current).join(", ")
            );
        }
        self.invalidate_environment(environment_id).await;
        true
    }

    /// Drops cached tokens and stored secrets of a deleted environment.
    ///
    /// # Errors
    ///
    /// Returns the first secret store failure; both deletions are attempted.
    pub async fn on_environment_removed(
        &self,
        environment_id: &str,
        secret_store: &dyn SecretStore,
    ) -> Result<(), SecretStoreError> {
        self.invalidate_environment(environment_id).await;

        let mut first_error = None;
        for kind in [CredentialKind::ClientSecret, CredentialKind::Password] {
            if let Err(e) = secret_store
                .delete_secret(&SecretKey::new(environment_id, kind))
                .await
            {
                log::error!("Failed to delete {kind} of environment {environment_id}: {e}");
                first_error.get_or_insert(e);
            }
        }

        log::info!("Environment {environment_id} removed");
        first_error.map_or(Ok(()), Err)
    }

    /// Drops the environment's cached tokens, including the one a flow
    /// running right now would otherwise store.
    pub async fn invalidate_environment(&self, environment_id: &str) {
        let mut index = self.key_index.lock().await;
        if let Some(keys) = index.invalidate(environment_id) {
            self.cache.invalidate_many(keys.iter()).await;
            log::debug!(
                "Invalidated {} cached token(s) for environment {environment_id}",
                keys.len()
            );
        }
    }

    pub async fn invalidate_all(&self) {
        let mut index = self.key_index.lock().await;
        index.invalidate_all();
        self.cache.invalidate_all().await;
        log::debug!("Invalidated all cached tokens");
    }
}
