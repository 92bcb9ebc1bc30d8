use super::{FilterResult, Whitelist};
use crate::config::AuthConfig;
use crate::proxy::context::{json_response, Exchange, Identity};
use crate::relay::{Category, LogRelay};
use http::header::AUTHORIZATION;
use http::{HeaderName, HeaderValue, StatusCode};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// Where the credential was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenSource {
    Header,
    Query,
}

/// Bearer-token validation and identity propagation. Pure computation: the
/// signature check never leaves the process.
pub struct AuthGuard {
    key: DecodingKey,
    validation: Validation,
    whitelist: Whitelist,
    query_token_paths: Whitelist,
    user_id_header: HeaderName,
    relay: LogRelay,
}

impl AuthGuard {
    pub fn new(config: &AuthConfig, whitelist: Whitelist, relay: LogRelay) -> anyhow::Result<Self> {
        let algorithm = match config.algorithm.as_str() {
            "HS256" => Algorithm::HS256,
            "HS384" => Algorithm::HS384,
            "HS512" => Algorithm::HS512,
            other => anyhow::bail!("auth: unsupported algorithm '{}'", other),
        };
        if config.jwt_secret.is_empty() {
            tracing::warn!("filter: auth: jwt_secret is empty, set auth.jwt_secret or EDGE_JWT_SECRET");
        }
        let user_id_header = HeaderName::from_bytes(config.user_id_header.as_bytes())
            .map_err(|e| anyhow::anyhow!("auth: invalid user_id_header: {}", e))?;

        Ok(Self {
            key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            validation: Validation::new(algorithm),
            whitelist,
            query_token_paths: Whitelist::new(config.query_token_paths.iter().cloned()),
            user_id_header,
            relay,
        })
    }

    /// Validate a raw token and return the identity it carries.
    pub fn validate(&self, token: &str) -> Option<Identity> {
        match decode::<Claims>(token, &self.key, &self.validation) {
            Ok(data) if !data.claims.sub.is_empty() => Some(Identity {
                subject: data.claims.sub,
                claims: data.claims.extra,
            }),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("filter: auth: token rejected, error={}", e);
                None
            }
        }
    }

    fn extract_token<'a>(&self, ex: &'a Exchange) -> Option<(&'a str, TokenSource)> {
        if let Some(token) = ex
            .header_str(AUTHORIZATION.as_str())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
        {
            return Some((token, TokenSource::Header));
        }
        if self.query_token_paths.matches(&ex.path) {
            return ex
                .query_param("token")
                .filter(|t| !t.is_empty())
                .map(|t| (t, TokenSource::Query));
        }
        None
    }

    pub(super) async fn on_request(&self, ex: &mut Exchange) -> FilterResult {
        // Callers never get to choose their own identity.
        ex.headers.remove(&self.user_id_header);

        if self.whitelist.matches(&ex.path) {
            return FilterResult::Continue;
        }

        let found = self
            .extract_token(ex)
            .map(|(token, source)| (token.to_string(), source));
        let identity = found
            .as_ref()
            .and_then(|(token, _)| self.validate(token));

        let (identity, (token, source)) = match (identity, found) {
            (Some(identity), Some(found)) => (identity, found),
            _ => {
                tracing::debug!(
                    "filter: auth: unauthorized, client_ip={}, path={}",
                    ex.client_ip,
                    ex.path
                );
                self.relay
                    .record(&ex.client_ip.to_string(), Category::Auth, "Token Invalid");
                ex.already_logged = true;
                return FilterResult::Reject(json_response(
                    StatusCode::UNAUTHORIZED,
                    &serde_json::json!({ "code": 401, "message": "Unauthorized access" }),
                ));
            }
        };

        match HeaderValue::from_str(&identity.subject) {
            Ok(v) => {
                ex.headers.insert(self.user_id_header.clone(), v);
            }
            Err(_) => {
                tracing::warn!("filter: auth: subject is not a valid header value, not propagated");
            }
        }
        if source == TokenSource::Query {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                ex.headers.insert(AUTHORIZATION, v);
            }
        }
        ex.identity = Some(identity);
        FilterResult::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::Background;
    use crate::config::{BackgroundConfig, LogRelayConfig};
    use crate::store::MemoryStore;
    use http::{HeaderMap, Method};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::sync::Arc;

    const SECRET: &str = "unit-test-secret";

    fn token(sub: &str, exp_offset: i64) -> String {
        let exp = chrono::Utc::now().timestamp() + exp_offset;
        let claims = serde_json::json!({ "sub": sub, "username": "alice", "exp": exp });
        encode(
            &Header::new(Algorithm::HS512),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn guard(query_token_paths: Vec<String>) -> AuthGuard {
        let store = Arc::new(MemoryStore::new());
        let relay = LogRelay::new(
            store,
            Background::start(&BackgroundConfig::default()),
            LogRelayConfig::default(),
        );
        let config = AuthConfig {
            jwt_secret: SECRET.into(),
            query_token_paths,
            ..AuthConfig::default()
        };
        AuthGuard::new(&config, Whitelist::new(["/auth/login".to_string()]), relay).unwrap()
    }

    fn exchange(path: &str, query: Option<&str>, headers: HeaderMap) -> Exchange {
        Exchange::new(
            Method::GET,
            path.into(),
            query.map(str::to_string),
            headers,
            "127.0.0.1:1234".parse().unwrap(),
        )
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn test_valid_header_token() {
        let g = guard(vec![]);
        let mut ex = exchange("/api/user/1", None, bearer(&token("42", 3600)));
        assert!(matches!(g.on_request(&mut ex).await, FilterResult::Continue));
        assert_eq!(ex.header_str("x-user-id"), Some("42"));
        let identity = ex.identity.unwrap();
        assert_eq!(identity.subject, "42");
        assert_eq!(identity.claims["username"], "alice");
    }

    #[tokio::test]
    async fn test_missing_token_is_401() {
        let g = guard(vec![]);
        let mut ex = exchange("/api/user/1", None, HeaderMap::new());
        match g.on_request(&mut ex).await {
            FilterResult::Reject(resp) => assert_eq!(resp.status(), StatusCode::UNAUTHORIZED),
            FilterResult::Continue => panic!("expected 401"),
        }
        assert!(ex.already_logged);
        assert!(ex.identity.is_none());
    }

    #[tokio::test]
    async fn test_expired_and_tampered_tokens() {
        let g = guard(vec![]);
        let mut expired = exchange("/api/x", None, bearer(&token("42", -3600)));
        assert!(matches!(g.on_request(&mut expired).await, FilterResult::Reject(_)));

        let mut tampered = token("42", 3600);
        tampered.push('x');
        let mut ex = exchange("/api/x", None, bearer(&tampered));
        assert!(matches!(g.on_request(&mut ex).await, FilterResult::Reject(_)));

        let mut not_bearer = HeaderMap::new();
        not_bearer.insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        let mut ex = exchange("/api/x", None, not_bearer);
        assert!(matches!(g.on_request(&mut ex).await, FilterResult::Reject(_)));
    }

    #[tokio::test]
    async fn test_query_token_reinserts_authorization() {
        let g = guard(vec!["/ws/".to_string()]);
        let t = token("7", 3600);
        let query = format!("token={}", t);
        let mut ex = exchange("/ws/feed", Some(&query), HeaderMap::new());
        assert!(matches!(g.on_request(&mut ex).await, FilterResult::Continue));
        assert_eq!(ex.header_str("x-user-id"), Some("7"));
        assert_eq!(
            ex.header_str("authorization").map(str::to_string),
            Some(format!("Bearer {}", t))
        );
    }

    #[tokio::test]
    async fn test_query_token_limited_to_paths() {
        let g = guard(vec!["/ws/".to_string()]);
        let query = format!("token={}", token("7", 3600));

        let mut denied = exchange("/api/x", Some(&query), HeaderMap::new());
        assert!(matches!(g.on_request(&mut denied).await, FilterResult::Reject(_)));

        let mut allowed = exchange("/ws/feed", Some(&query), HeaderMap::new());
        assert!(matches!(g.on_request(&mut allowed).await, FilterResult::Continue));
    }

    #[tokio::test]
    async fn test_query_token_off_without_paths() {
        let g = guard(vec![]);
        let query = format!("token={}", token("7", 3600));
        let mut ex = exchange("/api/user/me", Some(&query), HeaderMap::new());
        match g.on_request(&mut ex).await {
            FilterResult::Reject(resp) => assert_eq!(resp.status(), StatusCode::UNAUTHORIZED),
            FilterResult::Continue => panic!("query token accepted on a protected path"),
        }
        assert!(ex.header_str("x-user-id").is_none());
    }

    #[tokio::test]
    async fn test_spoofed_user_id_stripped() {
        let g = guard(vec![]);
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("admin"));
        let mut ex = exchange("/auth/login", None, headers);
        assert!(matches!(g.on_request(&mut ex).await, FilterResult::Continue));
        assert!(ex.header_str("x-user-id").is_none());

        let mut headers = bearer(&token("42", 3600));
        headers.insert("x-user-id", HeaderValue::from_static("admin"));
        let mut ex = exchange("/api/x", None, headers);
        assert!(matches!(g.on_request(&mut ex).await, FilterResult::Continue));
        assert_eq!(ex.header_str("x-user-id"), Some("42"));
    }
}
