//! Identity provider adapter.
//!
//! Authentication itself is delegated to the managed identity provider; the
//! reverse proxy at the edge verifies the session and forwards the identity
//! as headers. This module only reads those headers and enforces the admin
//! guard for the back-office endpoints.

use axum::http::HeaderMap;
use tracing::warn;

use crate::{config::Config, error::AppError};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_NAME_HEADER: &str = "x-user-name";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub email: String,
    pub display_name: String,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The authenticated identity, or `Unauthorized` when the edge forwarded
/// none.
pub fn identity(headers: &HeaderMap) -> Result<Identity, AppError> {
    let user_id = header(headers, USER_ID_HEADER).ok_or(AppError::Unauthorized)?;

    Ok(Identity {
        user_id,
        email: header(headers, USER_EMAIL_HEADER).unwrap_or_default(),
        display_name: header(headers, USER_NAME_HEADER).unwrap_or_default(),
    })
}

/// Admin guard for back-office transitions. A failed check is a
/// security-relevant event and is logged with the caller's identity.
pub fn require_admin(config: &Config, headers: &HeaderMap) -> Result<Identity, AppError> {
    let caller = identity(headers)?;

    let token = header(headers, ADMIN_TOKEN_HEADER);
    if token.as_deref() != Some(config.admin_token.as_str()) {
        warn!(
            user_id = %caller.user_id,
            "Rejected admin action: invalid admin token"
        );
        return Err(AppError::Forbidden);
    }

    Ok(caller)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderMap;

    use super::*;

    fn test_config(token: &str) -> Config {
        Config {
            port: 0,
            redis_url: String::new(),
            admin_token: token.to_string(),
        }
    }

    #[test]
    fn identity_requires_user_id() {
        let headers = HeaderMap::new();
        assert!(identity(&headers).is_err());

        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, "u1".parse().unwrap());
        headers.insert(USER_EMAIL_HEADER, "u1@example.com".parse().unwrap());

        let id = identity(&headers).unwrap();
        assert_eq!(id.user_id, "u1");
        assert_eq!(id.email, "u1@example.com");
    }

    #[test]
    fn admin_guard_rejects_bad_token() {
        let config = test_config("secret");

        let mut headers = HeaderMap::new();
        headers.insert(USER_ID_HEADER, "u1".parse().unwrap());
        assert!(require_admin(&config, &headers).is_err());

        headers.insert(ADMIN_TOKEN_HEADER, "wrong".parse().unwrap());
        assert!(require_admin(&config, &headers).is_err());

        headers.insert(ADMIN_TOKEN_HEADER, "secret".parse().unwrap());
        assert!(require_admin(&config, &headers).is_ok());
    }
}
