//! Single-use loopback HTTP listener catching the authorization-code redirect.
//!
//! The listener binds an OS-assigned port on 127.0.0.1, and the same port on
//! [::1] when IPv6 loopback is available, since browsers may resolve
//! `localhost` to either. It only answers `GET /{random-segment}`. The first
//! callback on that path settles the wait: a matching `state` completes it,
//! a missing or different `state` is answered with 400 and fails it. The
//! server is always shut down before
//! [`LoopbackRedirectServer::wait_for_callback`] returns, and on drop.

use super::errors::AuthenticationError;
use super::pkce::random_urlsafe;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use std::collections::HashMap;
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use zeroize::Zeroizing;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// `error_code` reported when a redirect carries the wrong `state`.
pub const STATE_MISMATCH: &str = "state_mismatch";

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Sign-in complete</title></head>
<body><h1>Sign-in complete</h1><p>You can close this window and return to dvtool.</p></body>
</html>"#;

const FAILED_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Sign-in failed</title></head>
<body><h1>Sign-in failed</h1><p>Return to dvtool for details.</p></body>
</html>"#;

const REJECTED_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Invalid request</title></head>
<body><h1>Invalid request</h1><p>This sign-in response does not belong to the current session.</p></body>
</html>"#;

const USED_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Already used</title></head>
<body><h1>Already used</h1><p>This sign-in session has already completed.</p></body>
</html>"#;

type CallbackOutcome = Result<AuthorizationCallback, AuthenticationError>;

/// Parameters captured from a valid redirect.
pub struct AuthorizationCallback {
    code: Zeroizing<String>,
    state: String,
}

impl AuthorizationCallback {
    pub fn code(&self) -> &str {
        self.code.as_str()
    }

    pub fn state(&self) -> &str {
        &self.state
    }
}

impl fmt::Debug for AuthorizationCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizationCallback")
            .field("code", &"***")
            .field("state", &self.state)
            .finish()
    }
}

struct CallbackState {
    expected_state: String,
    sender: Mutex<Option<oneshot::Sender<CallbackOutcome>>>,
}

pub struct LoopbackRedirectServer {
    port: u16,
    path_segment: String,
    state: String,
    timeout: Duration,
    ipv6: bool,
    callback_rx: Option<oneshot::Receiver<CallbackOutcome>>,
    shutdown: CancellationToken,
    serving: JoinSet<()>,
}

impl LoopbackRedirectServer {
    /// Binds an ephemeral port and starts serving.
    ///
    /// `timeout` bounds [`wait_for_callback`](Self::wait_for_callback).
    ///
    /// # Errors
    ///
    /// Returns [`AuthenticationError::NetworkFailure`] if no loopback port
    /// can be bound.
    pub async fn start(timeout: Duration) -> Result<Self, AuthenticationError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| bind_failure(e.to_string()))?;
        let port = listener
            .local_addr()
            .map_err(|e| bind_failure(e.to_string()))?
            .port();

        let mut listeners = vec![listener];
        match TcpListener::bind((Ipv6Addr::LOCALHOST, port)).await {
            Ok(listener) => listeners.push(listener),
            Err(e) => log::debug!("Loopback listener is IPv4 only on port {port}: {e}"),
        }
        let ipv6 = listeners.len() > 1;

        let path_segment = random_urlsafe();
        let state = random_urlsafe();
        let (callback_tx, callback_rx) = oneshot::channel();
        let shutdown = CancellationToken::new();

        let shared = Arc::new(CallbackState {
            expected_state: state.clone(),
            sender: Mutex::new(Some(callback_tx)),
        });

        let app = Router::new()
            .route(&format!("/{path_segment}"), get(handle_redirect))
            .with_state(shared);

        let mut serving = JoinSet::new();
        for listener in listeners {
            let app = app.clone();
            let shutdown = shutdown.clone();
            serving.spawn(async move {
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
                {
                    log::error!("Loopback listener failed: {e}");
                }
            });
        }

        log::debug!("Loopback listener started on port {port}");

        Ok(Self {
            port,
            path_segment,
            state,
            timeout,
            ipv6,
            callback_rx: Some(callback_rx),
            shutdown,
            serving,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether `[::1]` is served alongside 127.0.0.1.
    pub fn listens_on_ipv6(&self) -> bool {
        self.ipv6
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}/{}", self.port, self.path_segment)
    }

    /// The `state` value the authorization request must carry.
    pub fn state(&self) -> &str {
        &self.state
    }

    /// Waits for the redirect, then shuts the listener down.
    ///
    /// # Errors
    ///
    /// - [`AuthenticationError::UserCancelled`] on cancellation or when the
    ///   user declined consent
    /// - [`AuthenticationError::InteractiveTimeout`] when no redirect
    ///   arrived in time
    /// - [`AuthenticationError::UnexpectedProtocolError`] for an error
    ///   redirect, a redirect without a code, or a redirect whose `state`
    ///   is missing or does not match (`error_code` `state_mismatch`)
    pub async fn wait_for_callback(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<AuthorizationCallback, AuthenticationError> {
        let outcome = match self.callback_rx.take() {
            Some(callback_rx) => {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(AuthenticationError::UserCancelled),
                    received = callback_rx => received.unwrap_or_else(|_| {
                        Err(AuthenticationError::protocol("loopback listener stopped unexpectedly"))
                    }),
                    _ = tokio::time::sleep(self.timeout) => Err(AuthenticationError::InteractiveTimeout {
                        timeout_secs: self.timeout.as_secs(),
                    }),
                }
            }
            None => Err(AuthenticationError::protocol(
                "loopback listener already consumed",
            )),
        };

        self.shutdown().await;
        outcome
    }

    async fn shutdown(&mut self) {
        self.shutdown.cancel();

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while self.serving.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::debug!("Loopback listener did not drain in time, aborting");
            self.serving.abort_all();
            while self.serving.join_next().await.is_some() {}
        }

        log::debug!("Loopback listener on port {} closed", self.port);
    }
}

impl Drop for LoopbackRedirectServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.serving.abort_all();
    }
}

async fn handle_redirect(
    State(shared): State<Arc<CallbackState>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<&'static str>) {
    let state_matches = params
        .get("state")
        .is_some_and(|state| constant_time_eq(state.as_bytes(), shared.expected_state.as_bytes()));
    if !state_matches {
        log::warn!("Rejected loopback redirect with missing or mismatched state");
        if let Some(sender) = shared.sender.lock().await.take() {
            let _ = sender.send(Err(AuthenticationError::UnexpectedProtocolError {
                error_code: Some(STATE_MISMATCH.to_string()),
                reason: "redirect state does not match the sign-in session".to_string(),
            }));
        }
        return (StatusCode::BAD_REQUEST, Html(REJECTED_PAGE));
    }

    let outcome = match (params.get("code"), params.get("error")) {
        (_, Some(error)) => Err(callback_error(
            error,
            params.get("error_description").map(String::as_str),
        )),
        (Some(code), None) if !code.is_empty() => Ok(AuthorizationCallback {
            code: Zeroizing::new(code.clone()),
            state: shared.expected_state.clone(),
        }),
        _ => Err(AuthenticationError::protocol(
            "redirect carried neither an authorization code nor an error",
        )),
    };

    let Some(sender) = shared.sender.lock().await.take() else {
        return (StatusCode::GONE, Html(USED_PAGE));
    };

    let page = if outcome.is_ok() {
        SUCCESS_PAGE
    } else {
        FAILED_PAGE
    };
    let _ = sender.send(outcome);
    (StatusCode::OK, Html(page))
}

fn callback_error(error: &str, description: Option<&str>) -> AuthenticationError {
    match error {
        "access_denied" => AuthenticationError::UserCancelled,
        _ => AuthenticationError::UnexpectedProtocolError {
            error_code: Some(error.to_string()),
            reason: description.unwrap_or(error).to_string(),
        },
    }
}

fn bind_failure(reason: String) -> AuthenticationError {
    AuthenticationError::NetworkFailure {
        endpoint: "127.0.0.1 (loopback listener)".to_string(),
        reason,
        status: None,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use claims::assert_matches;
    use std::time::Instant;

    async fn get(url: &str) -> reqwest::StatusCode {
        reqwest::get(url).await.expect("request should reach listener").status()
    }

    #[tokio::test]
    async fn test_binds_distinct_ephemeral_ports() {
        let first = LoopbackRedirectServer::start(Duration::from_secs(5))
            .await
            .expect("first listener");
        let second = LoopbackRedirectServer::start(Duration::from_secs(5))
            .await
            .expect("second listener");

        assert_ne!(first.port(), 0);
        assert_ne!(first.port(), second.port());
        assert_ne!(first.redirect_uri(), second.redirect_uri());
        assert_ne!(first.state(), second.state());
        assert!(first.redirect_uri().starts_with(&format!("http://localhost:{}/", first.port())));
    }

    #[tokio::test]
    async fn test_valid_callback_completes() {
        let server = LoopbackRedirectServer::start(Duration::from_secs(5))
            .await
            .expect("listener");
        let url = format!(
            "http://127.0.0.1:{}/{}?code=abc&state={}",
            server.port(),
            server.path_segment,
            server.state()
        );

        let request = tokio::spawn(async move { get(&url).await });
        let callback = server
            .wait_for_callback(&CancellationToken::new())
            .await
            .expect("callback");

        assert_eq!(callback.code(), "abc");
        assert_eq!(request.await.expect("join"), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_mismatched_state_fails_the_wait_immediately() {
        let server = LoopbackRedirectServer::start(Duration::from_secs(5))
            .await
            .expect("listener");
        let port = server.port();
        let forged = format!(
            "http://127.0.0.1:{port}/{}?code=abc&state=forged",
            server.path_segment
        );
        let status = tokio::spawn(async move { get(&forged).await });

        let started = Instant::now();
        let result = server.wait_for_callback(&CancellationToken::new()).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_matches!(
            result,
            Err(AuthenticationError::UnexpectedProtocolError { error_code: Some(ref code), .. })
                if code == STATE_MISMATCH
        );
        assert_eq!(status.await.expect("join"), reqwest::StatusCode::BAD_REQUEST);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .expect("port should be free again");
    }

    #[tokio::test]
    async fn test_missing_state_fails_the_wait() {
        let server = LoopbackRedirectServer::start(Duration::from_secs(5))
            .await
            .expect("listener");
        let url = format!("http://127.0.0.1:{}/{}?code=abc", server.port(), server.path_segment);
        let status = tokio::spawn(async move { get(&url).await });

        let result = server.wait_for_callback(&CancellationToken::new()).await;

        assert_matches!(result, Err(AuthenticationError::UnexpectedProtocolError { .. }));
        assert_eq!(status.await.expect("join"), reqwest::StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_redirect_over_ipv6_loopback_completes() {
        let server = LoopbackRedirectServer::start(Duration::from_secs(5))
            .await
            .expect("listener");
        if !server.listens_on_ipv6() {
            return;
        }
        let url = format!(
            "http://[::1]:{}/{}?code=abc&state={}",
            server.port(),
            server.path_segment,
            server.state()
        );
        let request = tokio::spawn(async move { get(&url).await });

        let callback = server
            .wait_for_callback(&CancellationToken::new())
            .await
            .expect("callback");

        assert_eq!(callback.code(), "abc");
        assert_eq!(request.await.expect("join"), reqwest::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let server = LoopbackRedirectServer::start(Duration::from_secs(5))
            .await
            .expect("listener");
        let url = format!(
            "http://127.0.0.1:{}/callback?code=abc&state={}",
            server.port(),
            server.state()
        );
        assert_eq!(get(&url).await, reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_access_denied_maps_to_cancel() {
        let server = LoopbackRedirectServer::start(Duration::from_secs(5))
            .await
            .expect("listener");
        let url = format!(
            "http://127.0.0.1:{}/{}?error=access_denied&state={}",
            server.port(),
            server.path_segment,
            server.state()
        );
        tokio::spawn(async move { get(&url).await });

        let result = server.wait_for_callback(&CancellationToken::new()).await;
        assert_matches!(result, Err(AuthenticationError::UserCancelled));
    }

    #[tokio::test]
    async fn test_cancellation_releases_port() {
        let server = LoopbackRedirectServer::start(Duration::from_secs(30))
            .await
            .expect("listener");
        let port = server.port();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = server.wait_for_callback(&cancel).await;
        assert_matches!(result, Err(AuthenticationError::UserCancelled));

        TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .await
            .expect("port should be free again");
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
