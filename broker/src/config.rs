//! Broker settings.
//!
//! Every field has a default so an empty `[broker]` table (or none at all)
//! yields a working configuration.

use crate::common::RetryPolicy;
use serde::Deserialize;
use std::time::Duration;

pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BrokerSettings {
    #[serde(default = "default_authority_host")]
    pub authority_host: String,
    #[serde(default = "default_clock_skew_secs")]
    pub clock_skew_secs: u64,
    #[serde(default = "default_interactive_timeout_secs")]
    pub interactive_timeout_secs: u64,
    #[serde(default = "default_device_code_max_wait_secs")]
    pub device_code_max_wait_secs: u64,
    #[serde(default = "default_device_code_slow_down_secs")]
    pub device_code_slow_down_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    #[serde(default = "default_http_max_retries")]
    pub http_max_retries: u32,
    #[serde(default = "default_http_retry_base_delay_ms")]
    pub http_retry_base_delay_ms: u64,
}

fn default_authority_host() -> String {
    DEFAULT_AUTHORITY_HOST.to_string()
}

fn default_clock_skew_secs() -> u64 {
    60
}

fn default_interactive_timeout_secs() -> u64 {
    120
}

fn default_device_code_max_wait_secs() -> u64 {
    900
}

fn default_device_code_slow_down_secs() -> u64 {
    5
}

fn default_http_timeout_secs() -> u64 {
    30
}

fn default_http_max_retries() -> u32 {
    3
}

fn default_http_retry_base_delay_ms() -> u64 {
    500
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            authority_host: default_authority_host(),
            clock_skew_secs: default_clock_skew_secs(),
            interactive_timeout_secs: default_interactive_timeout_secs(),
            device_code_max_wait_secs: default_device_code_max_wait_secs(),
            device_code_slow_down_secs: default_device_code_slow_down_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            http_max_retries: default_http_max_retries(),
            http_retry_base_delay_ms: default_http_retry_base_delay_ms(),
        }
    }
}

impl BrokerSettings {
    /// Authority host without a trailing slash.
    pub fn authority_host(&self) -> &str {
        self.authority_host.trim().trim_end_matches('/')
    }

    pub fn clock_skew(&self) -> Duration {
        Duration::from_secs(self.clock_skew_secs)
    }

    pub fn interactive_timeout(&self) -> Duration {
        Duration::from_secs(self.interactive_timeout_secs)
    }

    pub fn device_code_max_wait(&self) -> Duration {
        Duration::from_secs(self.device_code_max_wait_secs)
    }

    pub fn device_code_slow_down(&self) -> Duration {
        Duration::from_secs(self.device_code_slow_down_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.http_max_retries,
            base_delay: Duration::from_millis(self.http_retry_base_delay_ms),
            ..RetryPolicy::default()
        }
    }
}

/// Endpoints of one tenant on the configured authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantEndpoints {
    base: String,
}

impl TenantEndpoints {
    pub fn new(authority_host: &str, tenant_id: &str) -> Self {
        Self {
            base: format!(
                "{}/{}/oauth2/v2.0",
                authority_host.trim().trim_end_matches('/'),
                urlencoding::encode(tenant_id.trim())
            ),
        }
    }

    pub fn token(&self) -> String {
        format!("{}/token", self.base)
    }

    pub fn authorize(&self) -> String {
        format!("{}/authorize", self.base)
    }

    pub fn device_code(&self) -> String {
        format!("{}/devicecode", self.base)
    }
}
