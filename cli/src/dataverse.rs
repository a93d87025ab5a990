//! Minimal Dataverse Web API client used by `test-connection`.

use crate::error::{AppError, AppResult};
use broker::auth::{AuthenticationError, CachedToken};
use broker::common::HttpClient;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub const WEB_API_PATH: &str = "api/data/v9.2";

/// Body of `GET /WhoAmI`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub struct WhoAmI {
    pub user_id: String,
    pub business_unit_id: String,
    pub organization_id: String,
}

pub fn who_am_i_url(dataverse_url: &str) -> String {
    format!(
        "{}/{WEB_API_PATH}/WhoAmI",
        dataverse_url.trim().trim_end_matches('/')
    )
}

/// Calls `WhoAmI` with `token`.
///
/// # Errors
///
/// A 401/403 is reported as [`AuthenticationError::InvalidCredentials`];
/// other failures as [`AppError::Dataverse`].
pub async fn who_am_i(
    http: &HttpClient,
    dataverse_url: &str,
    token: &CachedToken,
    cancel: &CancellationToken,
) -> AppResult<WhoAmI> {
    let url = who_am_i_url(dataverse_url);
    let response = http
        .get_with_bearer(&url, &token.authorization_header(), cancel)
        .await
        .map_err(AuthenticationError::from)?;

    let status = response.status();
    if status.as_u16() == 401 || status.as_u16() == 403 {
        return Err(AuthenticationError::InvalidCredentials {
            reason: format!("Dataverse answered HTTP {} for WhoAmI", status.as_u16()),
        }
        .into());
    }
    if !status.is_success() {
        return Err(AppError::Dataverse(format!(
            "WhoAmI returned HTTP {}",
            status.as_u16()
        )));
    }

    response
        .json::<WhoAmI>()
        .await
        .map_err(|e| AppError::Dataverse(format!("Unreadable WhoAmI response: {e}")))
}
