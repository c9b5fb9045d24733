pub mod health;
pub mod metrics;
pub mod rpc;
pub mod stream;
pub mod transactions;

use axum::http::{header, HeaderMap};
use serde_json::Value;

use relay_core::Envelope;

use crate::error::ApiResult;

/// Metadata key under which a caller's bearer token travels to handlers.
pub const ACCESS_TOKEN_KEY: &str = "access_token";

/// Extracts the token of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Wraps a request body into an envelope, forwarding the caller's token.
pub fn request_envelope(body: Value, headers: &HeaderMap) -> ApiResult<Envelope> {
    let envelope = Envelope::from_value(body)?;
    Ok(match bearer_token(headers) {
        Some(token) => envelope.with_metadata(ACCESS_TOKEN_KEY, token),
        None => envelope,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    fn headers(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer abc")), Some("abc".to_string()));
        assert_eq!(bearer_token(&headers("bearer  abc ")), Some("abc".to_string()));
        assert_eq!(bearer_token(&headers("Basic abc")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_request_envelope_carries_token() {
        let envelope = request_envelope(json!({"userId": "u-1"}), &headers("Bearer t-1")).unwrap();
        assert_eq!(envelope.metadata.get(ACCESS_TOKEN_KEY).map(String::as_str), Some("t-1"));
        assert_eq!(envelope.get_str("userId"), Some("u-1"));

        assert!(request_envelope(json!([1, 2]), &HeaderMap::new()).is_err());
    }
}
