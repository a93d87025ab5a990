use async_trait::async_trait;
use broker::auth::{
    AccessToken, AuthMethod, AuthenticationCoordinator, AuthenticationError, BrowserLauncher,
    CachedToken, CredentialKind, Credentials, DeviceCodeCallback, DeviceCodeInfo,
    EnvironmentAuthConfig, FlowHandler, FlowRegistry, SecretStoreCredentialProvider, TokenCache,
};
use broker::config::BrokerSettings;
use broker::secrets::{MemorySecretStore, SecretKey, SecretStore, SecretValue};
use claims::{assert_matches, assert_ok};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod helpers {
    use super::*;

    pub fn sp_config() -> EnvironmentAuthConfig {
        EnvironmentAuthConfig::new(
            "contoso",
            "https://contoso.crm.dynamics.com",
            AuthMethod::ServicePrincipal,
        )
        .with_client_id("app-id")
    }

    pub fn device_config(tenant: &str) -> EnvironmentAuthConfig {
        EnvironmentAuthConfig::new(
            tenant,
            "https://contoso.crm.dynamics.com",
            AuthMethod::DeviceCode,
        )
    }

    pub struct NoBrowser;

    impl BrowserLauncher for NoBrowser {
        fn open_external(&self, _url: &str) -> Result<(), String> {
            Err("no browser in tests".to_string())
        }
    }

    pub fn no_hook() -> DeviceCodeCallback {
        Arc::new(|_: &DeviceCodeInfo| {})
    }

    pub fn wiremock_coordinator(server: &MockServer) -> AuthenticationCoordinator {
        let settings = BrokerSettings {
            authority_host: server.uri(),
            http_max_retries: 0,
            ..BrokerSettings::default()
        };
        AuthenticationCoordinator::new(&settings, Arc::new(NoBrowser), no_hook())
            .expect("coordinator")
    }

    pub async fn store_with_secret(environment_id: &str, secret: &str) -> Arc<MemorySecretStore> {
        let store = Arc::new(MemorySecretStore::new());
        store
            .set_secret(
                &SecretKey::new(environment_id, CredentialKind::ClientSecret),
                SecretValue::new(secret),
            )
            .await
            .expect("set secret");
        store
    }

    pub async fn mount_sp_token(server: &MockServer, expected_calls: u64) {
        Mock::given(method("POST"))
            .and(path("/contoso/oauth2/v2.0/token"))
            .and(body_string_contains("client_secret=right-secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "sp-token",
                "token_type": "Bearer",
                "expires_in": 3599,
            })))
            .expect(expected_calls)
            .mount(server)
            .await;
    }

    /// Flow handler that counts executions and can be made to wait.
    pub struct ScriptedFlow {
        method: AuthMethod,
        pub calls: AtomicU32,
        delay: Duration,
        barrier: Option<Arc<Barrier>>,
    }

    impl ScriptedFlow {
        pub fn new(method: AuthMethod, delay: Duration) -> Self {
            Self {
                method,
                calls: AtomicU32::new(0),
                delay,
                barrier: None,
            }
        }

        pub fn with_barrier(mut self, barrier: Arc<Barrier>) -> Self {
            self.barrier = Some(barrier);
            self
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FlowHandler for ScriptedFlow {
        async fn acquire_token(
            &self,
            config: &EnvironmentAuthConfig,
            _credentials: Credentials,
            cancel: &CancellationToken,
        ) -> Result<CachedToken, AuthenticationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(barrier) = &self.barrier {
                barrier.wait().await;
            }
            tokio::select! {
                _ = cancel.cancelled() => Err(AuthenticationError::UserCancelled),
                _ = tokio::time::sleep(self.delay) => Ok(CachedToken::new(
                    AccessToken::new(format!("token-{}-{call}", config.tenant_id)),
                    "Bearer",
                    Duration::from_secs(3600),
                    config.scope(),
                )),
            }
        }

        fn auth_method(&self) -> AuthMethod {
            self.method
        }
    }

    /// Coordinator whose device code slot runs `device`.
    pub fn scripted_coordinator(device: Arc<ScriptedFlow>) -> AuthenticationCoordinator {
        let flows = FlowRegistry::new(
            Arc::new(ScriptedFlow::new(AuthMethod::ServicePrincipal, Duration::ZERO)),
            Arc::new(ScriptedFlow::new(AuthMethod::UsernamePassword, Duration::ZERO)),
            Arc::new(ScriptedFlow::new(AuthMethod::Interactive, Duration::ZERO)),
            device,
        )
        .expect("registry");
        AuthenticationCoordinator::with_flows(flows, TokenCache::default())
    }

    pub fn empty_provider() -> SecretStoreCredentialProvider {
        SecretStoreCredentialProvider::new(Arc::new(MemorySecretStore::new()))
    }
}

use helpers::*;

mod caching {
    use super::*;

    #[tokio::test]
    async fn test_cache_hit_makes_no_network_call() {
        let server = MockServer::start().await;
        mount_sp_token(&server, 1).await;

        let coordinator = wiremock_coordinator(&server);
        let provider = SecretStoreCredentialProvider::new(store_with_secret("dev", "right-secret").await);
        let cancel = CancellationToken::new();

        let first = coordinator
            .acquire_token("dev", &sp_config(), &provider, &cancel)
            .await
            .expect("first");
        let second = coordinator
            .acquire_token("dev", &sp_config(), &provider, &cancel)
            .await
            .expect("second");

        assert_eq!(first.access_token, second.access_token);
        assert!(first.expires_on > chrono::Utc::now());
        assert_eq!(coordinator.token_cache().len().await, 1);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_invalid_credentials_and_not_cached() {
        let server = MockServer::start().await;
        mount_sp_token(&server, 0).await;
        Mock::given(method("POST"))
            .and(path("/contoso/oauth2/v2.0/token"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "error": "invalid_client",
                "error_description": "AADSTS7000215: Invalid client secret provided.",
            })))
            .with_priority(10)
            .mount(&server)
            .await;

        let coordinator = wiremock_coordinator(&server);
        let provider = SecretStoreCredentialProvider::new(store_with_secret("dev", "wrong-secret").await);
        let result = coordinator
            .acquire_token("dev", &sp_config(), &provider, &CancellationToken::new())
            .await;

        assert_matches!(result, Err(AuthenticationError::InvalidCredentials { .. }));
        assert!(coordinator.token_cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_missing_secret_never_reaches_the_network() {
        let server = MockServer::start().await;
        mount_sp_token(&server, 0).await;

        let coordinator = wiremock_coordinator(&server);
        let result = coordinator
            .acquire_token("dev", &sp_config(), &empty_provider(), &CancellationToken::new())
            .await;

        assert_matches!(result, Err(AuthenticationError::InvalidCredentials { .. }));
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_rejected_before_dispatch() {
        let device = Arc::new(ScriptedFlow::new(AuthMethod::DeviceCode, Duration::ZERO));
        let coordinator = scripted_coordinator(device.clone());
        let config = EnvironmentAuthConfig::new("contoso", "not a url", AuthMethod::DeviceCode);

        let result = coordinator
            .acquire_token("dev", &config, &empty_provider(), &CancellationToken::new())
            .await;

        assert_matches!(result, Err(AuthenticationError::InvalidConfiguration(_)));
        assert_eq!(device.calls(), 0);
    }
}

mod concurrency {
    use super::*;

    #[tokio::test]
    async fn test_concurrent_cold_calls_run_one_flow() {
        let device = Arc::new(ScriptedFlow::new(
            AuthMethod::DeviceCode,
            Duration::from_millis(200),
        ));
        let coordinator = scripted_coordinator(device.clone());
        let provider = empty_provider();
        let config = device_config("contoso");
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            coordinator.acquire_token("dev", &config, &provider, &cancel),
            coordinator.acquire_token("dev", &config, &provider, &cancel),
        );

        assert_eq!(device.calls(), 1);
        assert_eq!(
            a.expect("first").access_token,
            b.expect("second").access_token
        );
        assert_eq!(coordinator.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_different_environments_run_in_parallel() {
        // Both flows must be inside the handler at the same time to pass the
        // barrier; serialized execution would never finish.
        let barrier = Arc::new(Barrier::new(2));
        let device = Arc::new(
            ScriptedFlow::new(AuthMethod::DeviceCode, Duration::ZERO).with_barrier(barrier),
        );
        let coordinator = scripted_coordinator(device.clone());
        let provider = empty_provider();
        let (contoso, fabrikam) = (device_config("contoso"), device_config("fabrikam"));
        let cancel = CancellationToken::new();

        let joined = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                coordinator.acquire_token("contoso-dev", &contoso, &provider, &cancel),
                coordinator.acquire_token("fabrikam-dev", &fabrikam, &provider, &cancel),
            )
        })
        .await
        .expect("environments blocked each other");

        assert_ok!(joined.0);
        assert_ok!(joined.1);
        assert_eq!(device.calls(), 2);
    }

    #[tokio::test]
    async fn test_cancelling_a_waiter_leaves_the_holder_alone() {
        let device = Arc::new(ScriptedFlow::new(
            AuthMethod::DeviceCode,
            Duration::from_millis(300),
        ));
        let coordinator = scripted_coordinator(device.clone());
        let provider = empty_provider();
        let config = device_config("contoso");
        let holder_cancel = CancellationToken::new();
        let waiter_cancel = CancellationToken::new();

        let trigger = waiter_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let (holder, waiter) = tokio::join!(
            coordinator.acquire_token("dev", &config, &provider, &holder_cancel),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                coordinator
                    .acquire_token("dev", &config, &provider, &waiter_cancel)
                    .await
            },
        );

        assert_ok!(holder);
        assert_matches!(waiter, Err(AuthenticationError::UserCancelled));
        assert_eq!(device.calls(), 1);
        assert_eq!(coordinator.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_holder_lets_next_waiter_run_its_own_flow() {
        let device = Arc::new(ScriptedFlow::new(
            AuthMethod::DeviceCode,
            Duration::from_millis(300),
        ));
        let coordinator = scripted_coordinator(device.clone());
        let provider = empty_provider();
        let config = device_config("contoso");
        let holder_cancel = CancellationToken::new();
        let waiter_cancel = CancellationToken::new();

        let trigger = holder_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let (holder, waiter) = tokio::join!(
            coordinator.acquire_token("dev", &config, &provider, &holder_cancel),
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                coordinator
                    .acquire_token("dev", &config, &provider, &waiter_cancel)
                    .await
            },
        );

        assert_matches!(holder, Err(AuthenticationError::UserCancelled));
        assert_ok!(waiter);
        assert_eq!(device.calls(), 2);
    }
}

mod environment_lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_identity_edit_forces_reacquisition() {
        let server = MockServer::start().await;
        mount_sp_token(&server, 2).await;

        let coordinator = wiremock_coordinator(&server);
        let provider = SecretStoreCredentialProvider::new(store_with_secret("dev", "right-secret").await);
        let cancel = CancellationToken::new();
        let before = sp_config();

        assert_ok!(coordinator.acquire_token("dev", &before, &provider, &cancel).await);

        let scope_only = before
            .clone()
            .with_custom_scope("https://contoso.crm.dynamics.com/.default");
        assert!(!coordinator.on_environment_updated("dev", Some(&before), &scope_only).await);
        assert_eq!(coordinator.token_cache().len().await, 1);

        let mut edited = before.clone();
        edited.dataverse_url = "https://contoso-new.crm.dynamics.com".to_string();
        assert!(coordinator.on_environment_updated("dev", Some(&before), &edited).await);
        assert!(coordinator.token_cache().is_empty().await);

        assert_ok!(coordinator.acquire_token("dev", &before, &provider, &cancel).await);
    }

    #[tokio::test]
    async fn test_invalidation_is_scoped_to_the_environment() {
        let device = Arc::new(ScriptedFlow::new(AuthMethod::DeviceCode, Duration::ZERO));
        let coordinator = scripted_coordinator(device.clone());
        let provider = empty_provider();
        let cancel = CancellationToken::new();

        assert_ok!(
            coordinator
                .acquire_token("contoso-dev", &device_config("contoso"), &provider, &cancel)
                .await
        );
        assert_ok!(
            coordinator
                .acquire_token("fabrikam-dev", &device_config("fabrikam"), &provider, &cancel)
                .await
        );

        coordinator.invalidate_environment("contoso-dev").await;
        assert_eq!(coordinator.token_cache().len().await, 1);

        coordinator.invalidate_all().await;
        assert!(coordinator.token_cache().is_empty().await);
    }

    #[tokio::test]
    async fn test_removal_deletes_tokens_and_secrets() {
        let device = Arc::new(ScriptedFlow::new(AuthMethod::DeviceCode, Duration::ZERO));
        let coordinator = scripted_coordinator(device);
        let store = store_with_secret("dev", "secret").await;
        store
            .set_secret(
                &SecretKey::new("dev", CredentialKind::Password),
                SecretValue::new("password"),
            )
            .await
            .expect("set");
        store
            .set_secret(
                &SecretKey::new("other", CredentialKind::Password),
                SecretValue::new("password"),
            )
            .await
            .expect("set");
        let provider = SecretStoreCredentialProvider::new(store.clone());

        assert_ok!(
            coordinator
                .acquire_token("dev", &device_config("contoso"), &provider, &CancellationToken::new())
                .await
        );

        assert_ok!(coordinator.on_environment_removed("dev", store.as_ref()).await);

        assert!(coordinator.token_cache().is_empty().await);
        assert_eq!(store.len().await, 1);
        assert!(
            store
                .get_secret(&SecretKey::new("dev", CredentialKind::ClientSecret))
                .await
                .expect("get")
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_removal_during_in_flight_flow_leaves_nothing_cached() {
        let device = Arc::new(ScriptedFlow::new(
            AuthMethod::DeviceCode,
            Duration::from_millis(300),
        ));
        let coordinator = scripted_coordinator(device.clone());
        let provider = empty_provider();
        let store = MemorySecretStore::new();
        let config = device_config("contoso");
        let cancel = CancellationToken::new();

        let (acquired, removed) = tokio::join!(
            coordinator.acquire_token("dev", &config, &provider, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                coordinator.on_environment_removed("dev", &store).await
            },
        );

        assert_ok!(acquired);
        assert_ok!(removed);
        assert!(coordinator.token_cache().is_empty().await);

        assert_ok!(coordinator.acquire_token("dev", &config, &provider, &cancel).await);
        assert_eq!(device.calls(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_all_during_in_flight_flow_leaves_nothing_cached() {
        let device = Arc::new(ScriptedFlow::new(
            AuthMethod::DeviceCode,
            Duration::from_millis(300),
        ));
        let coordinator = scripted_coordinator(device.clone());
        let provider = empty_provider();
        let cancel = CancellationToken::new();

        let config = device_config("contoso");
        let (acquired, ()) = tokio::join!(
            coordinator.acquire_token("dev", &config, &provider, &cancel),
            async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                coordinator.invalidate_all().await;
            },
        );

        assert_ok!(acquired);
        assert!(coordinator.token_cache().is_empty().await);
        assert_eq!(coordinator.active_locks(), 0);
    }
}
