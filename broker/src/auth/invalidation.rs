//! Decides whether an edit to an environment makes its cached tokens stale.

use super::types::EnvironmentAuthConfig;

/// Returns `true` when cached tokens of `previous` must not be reused for
/// `current`.
///
/// Only identity-bearing fields count: auth method, client id, username,
/// Dataverse URL and tenant id. With no previous configuration there is
/// nothing cached, so the answer is `false`.
pub fn should_invalidate(
    previous: Option<&EnvironmentAuthConfig>,
    current: &EnvironmentAuthConfig,
) -> bool {
    previous.is_some_and(|previous| !changed_fields(previous, current).is_empty())
}

/// Names of the identity-bearing fields that differ.
pub fn changed_fields(
    previous: &EnvironmentAuthConfig,
    current: &EnvironmentAuthConfig,
) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if previous.auth_method != current.auth_method {
        changed.push("auth_method");
    }
    if previous.client_id != current.client_id {
        changed.push("client_id");
    }
    if previous.username != current.username {
        changed.push("username");
    }
    if previous.dataverse_url != current.dataverse_url {
        changed.push("dataverse_url");
    }
    if previous.tenant_id != current.tenant_id {
        changed.push("tenant_id");
    }
    changed
}
