use thiserror::Error;

/// HTTP-level errors raised by the shared [`HttpClient`](super::HttpClient).
///
/// These describe the transport only. A response with an error status is
/// not an `HttpError`: it is handed back to the caller, which knows how to
/// read the body of that particular endpoint.
///
/// # Error Categories
///
/// ## Client Configuration Errors
/// - [`ClientCreation`] - HTTP client initialization failures
///
/// ## Request Execution Errors
/// - [`RequestFailed`] - Connection, TLS or protocol failures
/// - [`Timeout`] - Request exceeded the configured timeout
///
/// ## Caller Initiated
/// - [`Cancelled`] - The cancellation token fired while a request or a retry
///   delay was pending
///
/// # Examples
///
/// ```no_run
/// use broker::common::HttpError;
///
/// fn describe(error: &HttpError) -> &'static str {
///     match error {
///         HttpError::Timeout { .. } | HttpError::RequestFailed { .. } => "retry later",
///         HttpError::Cancelled => "",
///         HttpError::ClientCreation { .. } => "check TLS setup",
///     }
/// }
/// ```
///
/// [`ClientCreation`]: HttpError::ClientCreation
/// [`RequestFailed`]: HttpError::RequestFailed
/// [`Timeout`]: HttpError::Timeout
/// [`Cancelled`]: HttpError::Cancelled
#[derive(Debug, Error)]
pub enum HttpError {
    /// HTTP client initialization failed.
    ///
    /// # Fields
    /// - `reason`: Detailed description of the client creation failure
    #[error("HTTP client creation failed: {reason}")]
    ClientCreation { reason: String },

    /// HTTP request execution failed before a response was received.
    ///
    /// # Fields
    /// - `url`: The URL that was being requested (never includes a body)
    /// - `reason`: Detailed description of the failure
    #[error("Request failed: {url} - {reason}")]
    RequestFailed { url: String, reason: String },

    /// HTTP request timed out.
    ///
    /// # Fields
    /// - `url`: The URL that timed out
    /// - `seconds`: The timeout duration that was exceeded
    #[error("Request timeout after {seconds}s: {url}")]
    Timeout { url: String, seconds: u64 },

    /// The operation was cancelled by the caller.
    #[error("Request cancelled")]
    Cancelled,
}
