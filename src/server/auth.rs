//! Request authentication
//!
//! Two caller classes reach this server: end users (git clients sending a
//! token as HTTP Basic password or as a bearer token) and peer nodes
//! (bearer-authenticated with the shared cluster credential). A peer caller
//! is fully trusted; its requests carry the already-verified end-user
//! principal in a query parameter instead.

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, Response, StatusCode};
use axum::middleware::Next;
use base64::Engine;

use crate::server::AppState;

/// Identity attached to an inbound request.
#[derive(Debug, Clone, Default)]
pub struct Caller {
    /// Token presented by an end user, if any.
    pub principal: Option<String>,
    /// Peer node authenticated with the cluster credential.
    pub is_system: bool,
}

/// Parse the Authorization header. Git clients send Basic with the token
/// in either field; CI agents send Bearer.
pub fn caller_from_headers(headers: &HeaderMap, cluster_credential: &str) -> Caller {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return Caller::default();
    };

    if let Some(token) = value.strip_prefix("Bearer ") {
        if !cluster_credential.is_empty() && token == cluster_credential {
            return Caller { principal: None, is_system: true };
        }
        if !token.is_empty() {
            return Caller { principal: Some(token.to_string()), is_system: false };
        }
        return Caller::default();
    }

    if let Some(encoded) = value.strip_prefix("Basic ") {
        let engine = base64::engine::general_purpose::STANDARD;
        if let Some(decoded) = engine
            .decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
        {
            let (user, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
            let token = if password.is_empty() { user } else { password };
            if !token.is_empty() {
                return Caller { principal: Some(token.to_string()), is_system: false };
            }
        }
    }

    Caller::default()
}

/// Gate for the internal `/~cluster` surface: only peers holding the
/// cluster credential get through.
pub async fn require_cluster_credential(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response<Body>, StatusCode> {
    let caller = caller_from_headers(request.headers(), state.directory.credential());
    if caller.is_system {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, value.parse().unwrap());
        headers
    }

    #[test]
    fn test_no_header_is_anonymous() {
        let caller = caller_from_headers(&HeaderMap::new(), "secret");
        assert_eq!(caller.principal, None);
        assert!(!caller.is_system);
    }

    #[test]
    fn test_bearer_cluster_credential() {
        let caller = caller_from_headers(&headers("Bearer secret"), "secret");
        assert!(caller.is_system);
        assert_eq!(caller.principal, None);
    }

    #[test]
    fn test_bearer_user_token() {
        let caller = caller_from_headers(&headers("Bearer builder-token"), "secret");
        assert!(!caller.is_system);
        assert_eq!(caller.principal.as_deref(), Some("builder-token"));
    }

    #[test]
    fn test_empty_credential_never_matches_system() {
        let caller = caller_from_headers(&headers("Bearer "), "");
        assert!(!caller.is_system);
    }

    #[test]
    fn test_basic_token_in_password_field() {
        let engine = base64::engine::general_purpose::STANDARD;
        let encoded = engine.encode("git:builder-token");
        let caller = caller_from_headers(&headers(&format!("Basic {encoded}")), "secret");
        assert_eq!(caller.principal.as_deref(), Some("builder-token"));
    }

    #[test]
    fn test_basic_token_in_user_field() {
        let engine = base64::engine::general_purpose::STANDARD;
        let encoded = engine.encode("builder-token:");
        let caller = caller_from_headers(&headers(&format!("Basic {encoded}")), "secret");
        assert_eq!(caller.principal.as_deref(), Some("builder-token"));
    }
}
