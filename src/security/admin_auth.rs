use crate::config::Config;
use crate::error::GatewayError;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use ipnetwork::IpNetwork;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct AdminAuth {
    token: Option<String>,
    allowed_ips: Vec<IpNetwork>,
}

/// Client address attached to authenticated admin requests for audit logs.
#[derive(Debug, Clone, Copy)]
pub struct AdminCaller(pub IpAddr);

#[derive(Debug, PartialEq)]
pub enum AuthRejection {
    /// No `ADMIN_TOKEN` configured: the admin surface is off.
    Disabled,
    Forbidden(IpAddr),
    MissingToken,
    InvalidToken,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        match self {
            AuthRejection::Disabled => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "error": "admin_disabled",
                    "message": "Admin endpoints require ADMIN_TOKEN to be configured"
                })),
            )
                .into_response(),
            AuthRejection::Forbidden(ip) => GatewayError::Unauthorized { ip: ip.to_string() }
                .into_response(),
            AuthRejection::MissingToken | AuthRejection::InvalidToken => (
                StatusCode::UNAUTHORIZED,
                [(header::WWW_AUTHENTICATE, "Bearer")],
                Json(json!({
                    "error": "unauthorized",
                    "message": "A valid bearer token is required"
                })),
            )
                .into_response(),
        }
    }
}

impl AdminAuth {
    pub fn new(token: Option<String>, allowed_ips: Vec<IpNetwork>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            allowed_ips,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.admin_token.clone(), config.allowed_admin_ips.clone())
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Source IP check first, then the bearer token.
    pub fn check(&self, headers: &HeaderMap, peer: IpAddr) -> Result<IpAddr, AuthRejection> {
        let token = self.token.as_deref().ok_or(AuthRejection::Disabled)?;

        let client = client_ip(headers, peer);
        if !is_ip_allowed(&self.allowed_ips, client) {
            return Err(AuthRejection::Forbidden(client));
        }

        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or(AuthRejection::MissingToken)?
            .strip_prefix("Bearer ")
            .ok_or(AuthRejection::InvalidToken)?;

        if !constant_time_compare(presented.trim(), token) {
            return Err(AuthRejection::InvalidToken);
        }
        Ok(client)
    }
}

/// Guards every `/admin` route.
pub async fn require_admin(
    State(auth): State<Arc<AdminAuth>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut req: Request,
    next: Next,
) -> Response {
    match auth.check(req.headers(), addr.ip()) {
        Ok(client) => {
            debug!("Admin request {} {} from {}", req.method(), req.uri().path(), client);
            req.extensions_mut().insert(AdminCaller(client));
            next.run(req).await
        }
        Err(rejection) => {
            warn!(
                "Rejected admin request {} from {}: {:?}",
                req.uri().path(),
                addr.ip(),
                rejection
            );
            rejection.into_response()
        }
    }
}

/// Forwarding headers are only honoured when the peer is a local proxy.
fn client_ip(headers: &HeaderMap, peer: IpAddr) -> IpAddr {
    if !peer.is_loopback() {
        return peer;
    }

    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
    {
        return forwarded;
    }

    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<IpAddr>().ok())
    {
        return real_ip;
    }

    peer
}

fn is_ip_allowed(allowed_networks: &[IpNetwork], ip: IpAddr) -> bool {
    ip.is_loopback() || allowed_networks.iter().any(|network| network.contains(ip))
}

fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::str::FromStr;

    fn auth() -> AdminAuth {
        AdminAuth::new(
            Some("s3cret".to_string()),
            vec![IpNetwork::from_str("10.0.1.0/24").unwrap()],
        )
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare("secret123", "secret123"));
        assert!(!constant_time_compare("secret123", "secret124"));
        assert!(!constant_time_compare("short", "longer"));
    }

    #[test]
    fn test_disabled_without_token() {
        let auth = AdminAuth::new(Some(String::new()), vec![]);
        assert!(!auth.is_enabled());
        assert_eq!(
            auth.check(&bearer("anything"), ip("127.0.0.1")),
            Err(AuthRejection::Disabled)
        );
    }

    #[test]
    fn test_allowed_network_with_valid_token() {
        assert_eq!(auth().check(&bearer("s3cret"), ip("10.0.1.7")), Ok(ip("10.0.1.7")));
        assert_eq!(auth().check(&bearer("s3cret"), ip("::1")), Ok(ip("::1")));
    }

    #[test]
    fn test_outside_network_is_forbidden_even_with_token() {
        assert_eq!(
            auth().check(&bearer("s3cret"), ip("8.8.8.8")),
            Err(AuthRejection::Forbidden(ip("8.8.8.8")))
        );
    }

    #[test]
    fn test_bad_or_missing_token() {
        assert_eq!(
            auth().check(&HeaderMap::new(), ip("10.0.1.7")),
            Err(AuthRejection::MissingToken)
        );
        assert_eq!(
            auth().check(&bearer("wrong"), ip("10.0.1.7")),
            Err(AuthRejection::InvalidToken)
        );

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic czNjcmV0"));
        assert_eq!(
            auth().check(&basic, ip("10.0.1.7")),
            Err(AuthRejection::InvalidToken)
        );
    }

    #[test]
    fn test_forwarded_for_only_trusted_from_local_proxy() {
        let mut headers = bearer("s3cret");
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));

        // Behind a local proxy the original client is checked
        assert_eq!(
            auth().check(&headers, ip("127.0.0.1")),
            Err(AuthRejection::Forbidden(ip("203.0.113.9")))
        );

        // A remote peer cannot claim to be someone else
        let mut spoofed = bearer("s3cret");
        spoofed.insert("x-forwarded-for", HeaderValue::from_static("10.0.1.7"));
        assert_eq!(
            auth().check(&spoofed, ip("8.8.8.8")),
            Err(AuthRejection::Forbidden(ip("8.8.8.8")))
        );
    }
}
