use axum::http::{header::AUTHORIZATION, HeaderMap, StatusCode};

use crate::api::state::AppState;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .map(str::trim)
}

/// Reject control requests that do not carry the configured token
pub fn ensure_admin_authorized(
    state: &AppState,
    headers: &HeaderMap,
) -> std::result::Result<(), (StatusCode, String)> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Ok(());
    };
    match bearer_token(headers) {
        Some(token) if token == expected => Ok(()),
        Some(_) => Err((StatusCode::FORBIDDEN, "invalid admin token".to_string())),
        None => Err((
            StatusCode::UNAUTHORIZED,
            "missing bearer token".to_string(),
        )),
    }
}

/// Operator name for audit records: `X-Operator` header or "api"
pub fn operator_name(headers: &HeaderMap) -> String {
    headers
        .get("x-operator")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("api")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, "Bearer secret ".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("secret"));
        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_operator_defaults_to_api() {
        let mut headers = HeaderMap::new();
        assert_eq!(operator_name(&headers), "api");
        headers.insert("x-operator", "dana".parse().unwrap());
        assert_eq!(operator_name(&headers), "dana");
    }
}
