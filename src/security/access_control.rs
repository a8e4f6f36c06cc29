//! Credential middleware.
//! Extracts the API key, authenticates it, and attaches the `Identity`.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, uri::PathAndQuery, HeaderMap, Request, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::AuthConfig;
use crate::security::credentials::CredentialGate;

/// State required for credential checks.
#[derive(Clone)]
pub struct AccessControlState {
    pub gate: Arc<CredentialGate>,
    pub auth: Arc<AuthConfig>,
}

/// Pull the presented key out of the request. Header wins over query.
pub fn extract_key(headers: &HeaderMap, uri: &Uri, auth: &AuthConfig) -> Option<String> {
    if let Some(value) = headers.get(auth.header.as_str()) {
        let value = value.to_str().ok()?;
        if auth.header.eq_ignore_ascii_case(header::AUTHORIZATION.as_str()) {
            return value
                .get(..7)
                .filter(|scheme| scheme.eq_ignore_ascii_case("bearer "))
                .map(|_| value[7..].trim().to_string());
        }
        return Some(value.trim().to_string());
    }

    let param = auth.query_param.as_deref()?;
    url::form_urlencoded::parse(uri.query()?.as_bytes())
        .find(|(name, _)| name == param)
        .map(|(_, value)| value.into_owned())
}

/// `uri` without the `param` query parameter, so a query-string key stays out of
/// access logs and the upstream URL. Header keys are end-to-end and pass through.
pub fn strip_query_param(uri: &Uri, param: &str) -> Uri {
    let Some(query) = uri.query() else {
        return uri.clone();
    };

    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| {
            let name = pair.split('=').next().unwrap_or_default();
            !url::form_urlencoded::parse(name.as_bytes()).any(|(decoded, _)| decoded == param)
        })
        .collect();

    let path_and_query = if kept.is_empty() {
        uri.path().to_string()
    } else {
        format!("{}?{}", uri.path(), kept.join("&"))
    };

    let mut parts = uri.clone().into_parts();
    match PathAndQuery::try_from(path_and_query) {
        Ok(pq) => parts.path_and_query = Some(pq),
        Err(_) => return uri.clone(),
    }
    Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
}

pub async fn access_control_middleware(
    State(state): State<AccessControlState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let presented = extract_key(req.headers(), req.uri(), &state.auth).unwrap_or_default();

    let identity = match state.gate.authenticate(&presented) {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    if let Some(param) = state.auth.query_param.as_deref() {
        let stripped = strip_query_param(req.uri(), param);
        *req.uri_mut() = stripped;
    }

    tracing::debug!(key_id = %identity.key_id, "Request authenticated");
    req.extensions_mut().insert(identity);
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(name: &'static str, value: &'static str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(name, HeaderValue::from_static(value));
        h
    }

    #[test]
    fn bearer_token_from_authorization() {
        let auth = AuthConfig::default();
        let uri: Uri = "/v1/models".parse().unwrap();
        let key = extract_key(&headers("authorization", "Bearer sk-1"), &uri, &auth);
        assert_eq!(key.as_deref(), Some("sk-1"));

        let key = extract_key(&headers("authorization", "bearer sk-1"), &uri, &auth);
        assert_eq!(key.as_deref(), Some("sk-1"));

        let key = extract_key(&headers("authorization", "Basic abc"), &uri, &auth);
        assert_eq!(key, None);
    }

    #[test]
    fn custom_header_is_read_verbatim() {
        let auth = AuthConfig {
            header: "x-api-key".into(),
            ..AuthConfig::default()
        };
        let uri: Uri = "/".parse().unwrap();
        let key = extract_key(&headers("x-api-key", "sk-2"), &uri, &auth);
        assert_eq!(key.as_deref(), Some("sk-2"));
    }

    #[test]
    fn query_parameter_fallback() {
        let auth = AuthConfig::default();
        let uri: Uri = "/ws?room=1&api_key=sk%2D3".parse().unwrap();
        let key = extract_key(&HeaderMap::new(), &uri, &auth);
        assert_eq!(key.as_deref(), Some("sk-3"));
    }

    #[test]
    fn header_wins_over_query() {
        let auth = AuthConfig::default();
        let uri: Uri = "/ws?api_key=from-query".parse().unwrap();
        let key = extract_key(&headers("authorization", "Bearer from-header"), &uri, &auth);
        assert_eq!(key.as_deref(), Some("from-header"));
    }

    #[test]
    fn strips_key_from_query() {
        let uri: Uri = "/ws?room=1&api_key=secret&x=2".parse().unwrap();
        assert_eq!(strip_query_param(&uri, "api_key").to_string(), "/ws?room=1&x=2");

        let uri: Uri = "/ws?api_key=secret".parse().unwrap();
        assert_eq!(strip_query_param(&uri, "api_key").to_string(), "/ws");

        let uri: Uri = "/ws".parse().unwrap();
        assert_eq!(strip_query_param(&uri, "api_key").to_string(), "/ws");
    }
}
