use http::StatusCode;
use std::fmt;

#[derive(Debug)]
pub enum GatewayError {
    NoRouteMatch,
    UpstreamTimeout,
    UpstreamConnect(String),
    InvalidUpstream(String),
    Config(String),
}

impl GatewayError {
    /// Status the client sees when this error ends an exchange.
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NoRouteMatch => StatusCode::NOT_FOUND,
            GatewayError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::UpstreamConnect(_) | GatewayError::InvalidUpstream(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing message. Upstream details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        match self {
            GatewayError::NoRouteMatch => "no route matched",
            GatewayError::UpstreamTimeout => "gateway timeout",
            GatewayError::UpstreamConnect(_) | GatewayError::InvalidUpstream(_) => "bad gateway",
            GatewayError::Config(_) => "internal error",
        }
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::NoRouteMatch => write!(f, "no route matched"),
            GatewayError::UpstreamTimeout => write!(f, "upstream timeout"),
            GatewayError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            GatewayError::InvalidUpstream(uri) => write!(f, "invalid upstream uri: {}", uri),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_upstream_connect() {
        assert_eq!(
            GatewayError::UpstreamConnect("conn refused".to_string()).to_string(),
            "upstream connect error: conn refused"
        );
    }

    #[test]
    fn display_invalid_upstream() {
        assert_eq!(
            GatewayError::InvalidUpstream("::bad".to_string()).to_string(),
            "invalid upstream uri: ::bad"
        );
    }

    #[test]
    fn status_mapping() {
        assert_eq!(GatewayError::NoRouteMatch.status(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::UpstreamTimeout.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(
            GatewayError::UpstreamConnect("x".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            GatewayError::Config("bad".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn public_message_hides_detail() {
        let e = GatewayError::UpstreamConnect("10.0.0.7:8080 refused".into());
        assert_eq!(e.public_message(), "bad gateway");
        assert_eq!(GatewayError::NoRouteMatch.public_message(), "no route matched");
    }
}
