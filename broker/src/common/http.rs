//! Shared HTTP client used for every identity-provider call.
//!
//! Owns the request timeout and the retry policy so the individual flows do
//! not each invent one. Retries are limited to throttling and gateway
//! statuses (429, 503, 504); anything else, including transport failures, is
//! returned to the caller on the first attempt.

use super::errors::HttpError;
use reqwest::{RequestBuilder, Response, StatusCode, header::RETRY_AFTER};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff settings for retryable statuses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn is_retryable_status(status: StatusCode) -> bool {
        matches!(
            status,
            StatusCode::TOO_MANY_REQUESTS
                | StatusCode::SERVICE_UNAVAILABLE
                | StatusCode::GATEWAY_TIMEOUT
        )
    }

    /// Delay before retry number `attempt` (zero based).
    ///
    /// A server supplied `Retry-After` takes precedence over the exponential
    /// schedule; both are capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let exponential = self
            .base_delay
            .checked_mul(2u32.saturating_pow(attempt))
            .unwrap_or(self.max_delay);
        retry_after.unwrap_or(exponential).min(self.max_delay)
    }
}

#[derive(Clone, Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    timeout: Duration,
    retry: RetryPolicy,
}

impl HttpClient {
    /// Builds a client with the given per-request timeout and retry policy.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::ClientCreation`] if the TLS backend cannot be
    /// initialised.
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("dvtool/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| HttpError::ClientCreation {
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            timeout,
            retry,
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// POSTs an `application/x-www-form-urlencoded` body.
    ///
    /// The form is rebuilt for every attempt and is never logged.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::send_with_retry`].
    pub async fn post_form(
        &self,
        url: &str,
        form: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Response, HttpError> {
        self.send_with_retry(url, cancel, |client| client.post(url).form(form))
            .await
    }

    /// GETs `url` with a bearer token.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::send_with_retry`].
    pub async fn get_with_bearer(
        &self,
        url: &str,
        authorization: &str,
        cancel: &CancellationToken,
    ) -> Result<Response, HttpError> {
        self.send_with_retry(url, cancel, |client| {
            client
                .get(url)
                .header(reqwest::header::AUTHORIZATION, authorization)
                .header(reqwest::header::ACCEPT, "application/json")
        })
        .await
    }

    /// Sends the request produced by `build`, retrying 429/503/504 responses.
    ///
    /// Returns the last response once it is not retryable or the retry budget
    /// is spent; the caller inspects the status.
    ///
    /// # Errors
    ///
    /// - [`HttpError::Cancelled`] if `cancel` fires while a request or a
    ///   backoff delay is pending
    /// - [`HttpError::Timeout`] / [`HttpError::RequestFailed`] on transport
    ///   failures
    pub async fn send_with_retry<F>(
        &self,
        url: &str,
        cancel: &CancellationToken,
        build: F,
    ) -> Result<Response, HttpError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(HttpError::Cancelled);
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HttpError::Cancelled),
                result = build(&self.client).send() => result,
            };

            let response = result.map_err(|e| self.transport_error(url, e))?;
            let status = response.status();

            if !RetryPolicy::is_retryable_status(status) || attempt >= self.retry.max_retries {
                return Ok(response);
            }

            let delay = self.retry.delay_for(attempt, retry_after(&response));
            attempt += 1;
            log::warn!(
                "{url} responded with {status}, retrying in {delay:?} (attempt {attempt}/{})",
                self.retry.max_retries
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HttpError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn transport_error(&self, url: &str, error: reqwest::Error) -> HttpError {
        if error.is_timeout() {
            HttpError::Timeout {
                url: url.to_string(),
                seconds: self.timeout.as_secs(),
            }
        } else {
            HttpError::RequestFailed {
                url: url.to_string(),
                reason: error.without_url().to_string(),
            }
        }
    }
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
