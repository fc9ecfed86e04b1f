//! Caller identity.
//!
//! Authentication happens in front of this server; the authenticated
//! identity and device session arrive as request headers. This module only
//! checks that the session still exists and attaches the caller's deadline.

use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use tokio::time::Instant;

use courier_store::User;

use crate::api::AppState;
use crate::error::ServerError;
use crate::store::Store;

pub const USER_HEADER: &str = "x-courier-user";
pub const SESSION_HEADER: &str = "x-courier-session";
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";

/// The authenticated `(user, session)` pair of a request.
#[derive(Debug, Clone)]
pub struct Caller {
    pub user: User,
    pub session_id: String,
    /// Point after which lock acquisition gives up with `Canceled`.
    pub deadline: Instant,
}

impl Caller {
    pub fn phone(&self) -> &str {
        &self.user.phone_full
    }

    /// Load `phone_full` and check that `session_id` is one of its sessions.
    pub fn resolve(
        store: &Store,
        phone_full: &str,
        session_id: &str,
        timeout: Duration,
    ) -> Result<Self, ServerError> {
        let user = match store.call(|db| db.get_user(phone_full)) {
            Ok(user) => user,
            Err(ServerError::NotFound(_)) => {
                return Err(ServerError::PermissionDenied(format!("unknown user {phone_full}")))
            }
            Err(e) => return Err(e),
        };
        if !user.has_session(session_id) {
            return Err(ServerError::PermissionDenied(format!(
                "session {session_id} is not valid for {phone_full}"
            )));
        }

        Ok(Self {
            user,
            session_id: session_id.to_string(),
            deadline: Instant::now() + timeout,
        })
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Deadline requested by the caller, falling back to `default`.
pub fn request_timeout(headers: &HeaderMap, default: Duration) -> Duration {
    header(headers, TIMEOUT_HEADER)
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let phone_full = header(&parts.headers, USER_HEADER)
            .ok_or_else(|| ServerError::PermissionDenied("missing caller identity".into()))?;
        let session_id = header(&parts.headers, SESSION_HEADER)
            .ok_or_else(|| ServerError::PermissionDenied("missing caller session".into()))?;
        let timeout = request_timeout(&parts.headers, state.config.request_timeout);

        Caller::resolve(&state.store, phone_full, session_id, timeout)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use courier_shared::types::DeviceKind;
    use courier_store::UserSession;

    use super::*;
    use crate::store::test_store;

    #[test]
    fn resolve_requires_known_session() {
        let (_dir, store) = test_store();
        let user = User {
            phone_full: "alice".into(),
            phone: "alice".into(),
            country_code: "1".into(),
            username: None,
            first_name: "Alice".into(),
            last_name: String::new(),
            avatar: None,
            sessions: vec![UserSession::new("a1", DeviceKind::Ios)],
            group_threads: Default::default(),
            created_at: 0,
        };
        store.call(|db| db.insert_user(&user)).unwrap();

        let caller = Caller::resolve(&store, "alice", "a1", Duration::from_secs(1)).unwrap();
        assert_eq!(caller.phone(), "alice");

        assert!(matches!(
            Caller::resolve(&store, "alice", "gone", Duration::from_secs(1)),
            Err(ServerError::PermissionDenied(_))
        ));
        assert!(matches!(
            Caller::resolve(&store, "mallory", "a1", Duration::from_secs(1)),
            Err(ServerError::PermissionDenied(_))
        ));
    }

    #[test]
    fn timeout_header_overrides_default() {
        let mut headers = HeaderMap::new();
        let default = Duration::from_secs(30);
        assert_eq!(request_timeout(&headers, default), default);

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("250"));
        assert_eq!(request_timeout(&headers, default), Duration::from_millis(250));

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("soon"));
        assert_eq!(request_timeout(&headers, default), default);
    }
}
