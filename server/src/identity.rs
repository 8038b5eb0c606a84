//! Client identity derivation for rate limiting.
//!
//! The identity is taken from, in order of preference:
//!
//! 1. the `X-Forwarded-For` header (first listed address)
//! 2. the `X-Real-IP` header
//! 3. the peer address of the TCP connection
//!
//! Any trailing port is stripped before the value is used as a map key.
//!
//! Both headers are client-controlled and trivially spoofable. That is
//! accepted for a low-stakes public question form; callers that need
//! spoof-resistance should key the limiter on a pre-validated identity.

use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::HeaderMap;

/// Header set by reverse proxies with the originating client address.
pub const HEADER_FORWARDED_FOR: &str = "x-forwarded-for";

/// Header set by some proxies (nginx) with the client address.
pub const HEADER_REAL_IP: &str = "x-real-ip";

/// Identity used when neither headers nor the peer address are available.
pub const UNKNOWN_IDENTITY: &str = "unknown";

/// Derives the rate-limiting identity for a request.
///
/// ```rust
/// use askbox_server::identity::client_identity;
/// use axum::http::HeaderMap;
///
/// let mut headers = HeaderMap::new();
/// headers.insert("x-real-ip", "198.51.100.4:51234".parse().unwrap());
///
/// assert_eq!(client_identity(&headers, None), "198.51.100.4");
/// ```
pub fn client_identity(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = header_value(headers, HEADER_FORWARDED_FOR)
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    if let Some(addr) = forwarded {
        return strip_port(addr).to_owned();
    }

    if let Some(addr) = header_value(headers, HEADER_REAL_IP).map(str::trim) {
        if !addr.is_empty() {
            return strip_port(addr).to_owned();
        }
    }

    match peer {
        Some(peer) => peer.ip().to_string(),
        None => UNKNOWN_IDENTITY.to_owned(),
    }
}

/// Strips a trailing `:port` from an address.
///
/// Handles `host:port` and `[v6]:port`. A bare IPv6 address (several
/// colons, no brackets) has no unambiguous port and is returned unchanged.
pub fn strip_port(addr: &str) -> &str {
    if let Some(rest) = addr.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => addr,
        };
    }

    match addr.split_once(':') {
        Some((host, port)) if !port.contains(':') => host,
        _ => addr,
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Extractor yielding the request's rate-limiting identity.
///
/// Reads the peer address from [`ConnectInfo`] when the server was started
/// with `into_make_service_with_connect_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

impl ClientIdentity {
    /// Borrows the identity as a map key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S> FromRequestParts<S> for ClientIdentity
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(Self(client_identity(&parts.headers, peer)))
    }
}
