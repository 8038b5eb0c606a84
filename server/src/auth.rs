//! Admin authentication without server-side sessions.
//!
//! Admins authenticate either with a signed, time-limited token or with the
//! configured admin password. A successful password login issues a fresh
//! token so the client does not have to resend the password.
//!
//! # Tokens
//!
//! Tokens are HS256 JWTs whose only claim is `exp`. The signing key is 32
//! bytes from the operating system's secure random source, generated once
//! when the [`AuthGate`] is created and never persisted. Restarting the
//! process therefore invalidates every outstanding token, and a token cannot
//! be revoked before it expires.
//!
//! # Failure semantics
//!
//! [`AuthGate::verify`] and [`AuthGate::authenticate`] fail closed: any
//! malformed token, bad signature, expiry, hash error or wrong password
//! yields "not admin". Callers only ever see a boolean; the reason is logged
//! at debug level and never returned.
//!
//! # Example
//!
//! ```rust
//! use askbox_server::auth::{AuthGate, Credentials};
//!
//! let gate = AuthGate::with_hash_cost("hunter2", "1h", 4).unwrap();
//!
//! let outcome = gate.authenticate(&Credentials::default().with_password("hunter2"));
//! assert!(outcome.is_admin);
//!
//! let token = outcome.fresh_token.unwrap();
//! assert!(gate.verify(&token));
//! ```

use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use axum::http::{header, HeaderMap};
use jsonwebtoken::{
    decode, encode, get_current_timestamp, Algorithm, DecodingKey, EncodingKey, Header,
    Validation,
};
use rand::rngs::OsRng;
use rand::TryRngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Token lifetime used when the configured duration cannot be parsed.
pub const DEFAULT_TOKEN_DURATION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Size of the in-memory HMAC signing key.
pub const SIGNING_KEY_BYTES: usize = 32;

/// Prefix of an `Authorization` header carrying a token.
pub const BEARER_PREFIX: &str = "Bearer ";

/// Errors that can occur while setting up the gate.
///
/// Verification never produces these; see the module docs.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The secure random source was unavailable.
    ///
    /// Continuing would mean signing tokens with a guessable key, so this is
    /// treated as fatal at startup.
    #[error("failed to generate signing key: {0}")]
    KeyGeneration(String),

    /// Hashing the admin password failed.
    #[error("failed to hash admin password: {0}")]
    PasswordHash(String),

    /// Signing a token failed.
    #[error("failed to sign token: {0}")]
    Token(String),
}

/// Error returned by [`parse_duration`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid duration {input:?}: {reason}")]
pub struct DurationError {
    /// The rejected input.
    pub input: String,
    /// What was wrong with it.
    pub reason: &'static str,
}

/// Token payload. Nothing but the expiry is signed or checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Expiry as seconds since the Unix epoch.
    pub exp: u64,
}

/// Credentials presented by a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Token from an `Authorization: Bearer` header.
    pub bearer: Option<String>,
    /// Plaintext password from a form field or query parameter.
    pub password: Option<String>,
}

impl Credentials {
    /// Extracts a bearer token from the request headers.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let bearer = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix(BEARER_PREFIX))
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(str::to_owned);

        Self {
            bearer,
            password: None,
        }
    }

    /// Adds a password.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Adds a password if one was supplied.
    pub fn with_optional_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Returns `true` if a non-empty password was supplied.
    ///
    /// Only these requests need the slow hash comparison.
    pub fn has_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

/// Result of [`AuthGate::authenticate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthOutcome {
    /// Whether the request is from the admin.
    pub is_admin: bool,
    /// Token issued after a successful password login.
    pub fresh_token: Option<String>,
}

impl AuthOutcome {
    fn denied() -> Self {
        Self::default()
    }
}

/// Reloadable admin settings.
struct AdminCredentials {
    password_hash: String,
    token_ttl: Duration,
}

/// Issues and checks admin tokens.
pub struct AuthGate {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    credentials: RwLock<AdminCredentials>,
    hash_cost: u32,
}

impl AuthGate {
    /// Creates a gate with a fresh random signing key.
    ///
    /// # Arguments
    ///
    /// * `password` - The admin password; only its bcrypt hash is kept
    /// * `token_duration` - Token lifetime such as `"720h"`; unparseable
    ///   values fall back to [`DEFAULT_TOKEN_DURATION`]
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::KeyGeneration`] if no secure randomness is
    /// available, or [`AuthError::PasswordHash`] if hashing fails.
    pub fn new(password: &str, token_duration: &str) -> Result<Self, AuthError> {
        Self::with_hash_cost(password, token_duration, bcrypt::DEFAULT_COST)
    }

    /// Like [`AuthGate::new`] with an explicit bcrypt cost.
    pub fn with_hash_cost(
        password: &str,
        token_duration: &str,
        hash_cost: u32,
    ) -> Result<Self, AuthError> {
        let mut secret = [0u8; SIGNING_KEY_BYTES];
        OsRng
            .try_fill_bytes(&mut secret)
            .map_err(|err| AuthError::KeyGeneration(err.to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.validate_aud = false;

        let credentials = AdminCredentials {
            password_hash: hash_password(password, hash_cost)?,
            token_ttl: token_duration_or_default(token_duration),
        };

        debug!(
            token_ttl_secs = credentials.token_ttl.as_secs(),
            "Auth gate initialized"
        );

        Ok(Self {
            encoding_key: EncodingKey::from_secret(&secret),
            decoding_key: DecodingKey::from_secret(&secret),
            validation,
            credentials: RwLock::new(credentials),
            hash_cost,
        })
    }

    /// Issues a token expiring one configured duration from now.
    pub fn issue(&self) -> Result<String, AuthError> {
        let ttl = self.token_duration().as_secs();
        self.issue_expiring_at(get_current_timestamp().saturating_add(ttl))
    }

    /// Issues a token with an explicit expiry, in seconds since the epoch.
    pub fn issue_expiring_at(&self, exp: u64) -> Result<String, AuthError> {
        encode(
            &Header::new(Algorithm::HS256),
            &Claims { exp },
            &self.encoding_key,
        )
        .map_err(|err| AuthError::Token(err.to_string()))
    }

    /// Returns `true` if `token` is HS256-signed by this gate and unexpired.
    pub fn verify(&self, token: &str) -> bool {
        match decode::<Claims>(token, &self.decoding_key, &self.validation) {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "Admin token rejected");
                false
            }
        }
    }

    /// Decides whether a request comes from the admin.
    ///
    /// A bearer token is tried first. If it is missing or invalid and a
    /// non-empty password was supplied, the password is checked against the
    /// stored bcrypt hash and, on success, a fresh token is issued.
    ///
    /// The password path is deliberately slow; async callers should run it
    /// on a blocking thread.
    pub fn authenticate(&self, credentials: &Credentials) -> AuthOutcome {
        if let Some(token) = credentials.bearer.as_deref() {
            if self.verify(token) {
                return AuthOutcome {
                    is_admin: true,
                    fresh_token: None,
                };
            }
        }

        let Some(password) = credentials.password.as_deref().filter(|p| !p.is_empty()) else {
            return AuthOutcome::denied();
        };

        let hash = self.read_credentials(|c| c.password_hash.clone());
        match bcrypt::verify(password, &hash) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Admin password rejected");
                return AuthOutcome::denied();
            }
            Err(err) => {
                debug!(error = %err, "Admin password check failed");
                return AuthOutcome::denied();
            }
        }

        match self.issue() {
            Ok(token) => AuthOutcome {
                is_admin: true,
                fresh_token: Some(token),
            },
            Err(err) => {
                warn!(error = %err, "Password accepted but token issue failed");
                AuthOutcome {
                    is_admin: true,
                    fresh_token: None,
                }
            }
        }
    }

    /// Replaces the admin password and token lifetime.
    ///
    /// The signing key is kept, so tokens issued earlier stay valid until
    /// their own expiry.
    pub fn set_admin_credentials(
        &self,
        password: &str,
        token_duration: &str,
    ) -> Result<(), AuthError> {
        // Hash before taking the lock; bcrypt is slow.
        let password_hash = hash_password(password, self.hash_cost)?;
        let token_ttl = token_duration_or_default(token_duration);

        let mut credentials = self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *credentials = AdminCredentials {
            password_hash,
            token_ttl,
        };

        info!(token_ttl_secs = token_ttl.as_secs(), "Admin credentials updated");
        Ok(())
    }

    /// Current token lifetime.
    pub fn token_duration(&self) -> Duration {
        self.read_credentials(|c| c.token_ttl)
    }

    fn read_credentials<T>(&self, f: impl FnOnce(&AdminCredentials) -> T) -> T {
        let credentials = self
            .credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&credentials)
    }
}

impl fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthGate")
            .field("token_duration", &self.token_duration())
            .field("hash_cost", &self.hash_cost)
            .finish_non_exhaustive()
    }
}

fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    bcrypt::hash(password, cost).map_err(|err| AuthError::PasswordHash(err.to_string()))
}

/// Parses a token duration, falling back to [`DEFAULT_TOKEN_DURATION`].
pub fn token_duration_or_default(input: &str) -> Duration {
    match parse_duration(input) {
        Ok(duration) => duration,
        Err(err) => {
            warn!(
                error = %err,
                default_secs = DEFAULT_TOKEN_DURATION.as_secs(),
                "Invalid token duration, using default"
            );
            DEFAULT_TOKEN_DURATION
        }
    }
}

/// Parses a duration written as a sequence of decimal numbers with units,
/// such as `"720h"`, `"1h30m"` or `"1.5s"`.
///
/// Units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. A bare `"0"` is
/// accepted; negative durations are not.
///
/// ```rust
/// use askbox_server::auth::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
/// assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
/// assert!(parse_duration("30d").is_err());
/// ```
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let fail = |reason| DurationError {
        input: input.to_owned(),
        reason,
    };

    let mut rest = input.strip_prefix('+').unwrap_or(input);
    if rest.starts_with('-') {
        return Err(fail("negative durations are not supported"));
    }
    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    if rest.is_empty() {
        return Err(fail("empty duration"));
    }

    let mut total_nanos: f64 = 0.0;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (number, tail) = rest.split_at(number_len);
        if number.is_empty() || number == "." {
            return Err(fail("expected a number"));
        }
        let value: f64 = number.parse().map_err(|_| fail("malformed number"))?;

        let unit_len = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let scale = match unit {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60e9,
            "h" => 3600e9,
            "" => return Err(fail("missing unit")),
            _ => return Err(fail("unknown unit")),
        };

        total_nanos += value * scale;
        rest = tail;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(fail("duration out of range"));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use base64::prelude::*;

    const TEST_COST: u32 = 4;

    fn gate() -> AuthGate {
        AuthGate::with_hash_cost("correct horse", "1h", TEST_COST).unwrap()
    }

    /// Test that an issued token verifies immediately.
    #[test]
    fn issued_token_verifies() {
        let gate = gate();
        let token = gate.issue().unwrap();
        assert!(gate.verify(&token));
    }

    /// Test that a token past its expiry is rejected.
    #[test]
    fn expired_token_is_rejected() {
        let gate = gate();
        let token = gate
            .issue_expiring_at(get_current_timestamp() - 5)
            .unwrap();
        assert!(!gate.verify(&token));
    }

    /// Test that a token from a different key is rejected.
    #[test]
    fn token_from_other_gate_is_rejected() {
        let token = gate().issue().unwrap();
        assert!(!gate().verify(&token));
    }

    /// Test that altering the payload breaks the signature.
    #[test]
    fn tampered_payload_is_rejected() {
        let gate = gate();
        let token = gate.issue().unwrap();
        let parts: Vec<&str> = token.split('.').collect();

        let forged_claims = serde_json::to_vec(&Claims { exp: u64::MAX / 2 }).unwrap();
        let forged_payload = base64_url(&forged_claims);
        let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);

        assert!(!gate.verify(&forged));
    }

    /// Test that a token using another algorithm is rejected.
    #[test]
    fn other_algorithm_is_rejected() {
        let gate = gate();
        let token = gate.issue().unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let none_header = base64_url(br#"{"alg":"none","typ":"JWT"}"#);
        let forged = format!("{}.{}.", none_header, parts[1]);

        assert!(!gate.verify(&forged));
    }

    /// Test that garbage never verifies.
    #[test]
    fn malformed_tokens_are_rejected() {
        let gate = gate();
        for token in ["", "abc", "a.b.c", "...."] {
            assert!(!gate.verify(token), "{token:?} should not verify");
        }
    }

    /// Test that a valid bearer token authenticates without issuing a new one.
    #[test]
    fn bearer_token_authenticates() {
        let gate = gate();
        let credentials = Credentials {
            bearer: Some(gate.issue().unwrap()),
            password: None,
        };

        let outcome = gate.authenticate(&credentials);
        assert!(outcome.is_admin);
        assert!(outcome.fresh_token.is_none());
    }

    /// Test that the correct password authenticates and yields a usable token.
    #[test]
    fn password_login_issues_token() {
        let gate = gate();
        let outcome = gate.authenticate(&Credentials::default().with_password("correct horse"));

        assert!(outcome.is_admin);
        let token = outcome.fresh_token.expect("password login should issue a token");
        assert!(gate.verify(&token));
    }

    /// Test that an invalid bearer token falls back to the password.
    #[test]
    fn invalid_bearer_falls_back_to_password() {
        let gate = gate();
        let credentials = Credentials {
            bearer: Some("not-a-token".into()),
            password: Some("correct horse".into()),
        };

        let outcome = gate.authenticate(&credentials);
        assert!(outcome.is_admin);
        assert!(outcome.fresh_token.is_some());
    }

    /// Test that every failure path yields "not admin".
    #[test]
    fn fails_closed() {
        let gate = gate();
        let cases = [
            Credentials::default(),
            Credentials::default().with_password(""),
            Credentials::default().with_password("wrong"),
            Credentials {
                bearer: Some("garbage".into()),
                password: None,
            },
        ];

        for credentials in cases {
            assert_eq!(gate.authenticate(&credentials), AuthOutcome::denied());
        }
    }

    /// Test that rotating the password keeps the key and old tokens.
    #[test]
    fn credential_reload_keeps_signing_key() {
        let gate = gate();
        let old_token = gate.issue().unwrap();

        gate.set_admin_credentials("new password", "2h").unwrap();

        assert!(gate.verify(&old_token));
        assert_eq!(gate.token_duration(), Duration::from_secs(7200));
        assert!(!gate.authenticate(&Credentials::default().with_password("correct horse")).is_admin);
        assert!(gate.authenticate(&Credentials::default().with_password("new password")).is_admin);
    }

    /// Test that an unparseable duration falls back to 30 days.
    #[test]
    fn invalid_duration_uses_default() {
        let gate = AuthGate::with_hash_cost("pw", "thirty days", TEST_COST).unwrap();
        assert_eq!(gate.token_duration(), DEFAULT_TOKEN_DURATION);

        let before = get_current_timestamp();
        let token = gate.issue().unwrap();
        let claims = decode::<Claims>(&token, &gate.decoding_key, &gate.validation)
            .unwrap()
            .claims;
        assert!(claims.exp >= before + DEFAULT_TOKEN_DURATION.as_secs());
    }

    #[test]
    fn credentials_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def.ghi"));
        assert_eq!(
            Credentials::from_headers(&headers).bearer.as_deref(),
            Some("abc.def.ghi")
        );

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        assert_eq!(Credentials::from_headers(&headers).bearer, None);

        assert_eq!(Credentials::from_headers(&HeaderMap::new()), Credentials::default());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let debug = format!("{:?}", gate());
        assert!(!debug.contains("correct horse"));
        assert!(!debug.contains("$2"));
    }

    #[test]
    fn parse_duration_accepts_go_style() {
        assert_eq!(parse_duration("720h").unwrap(), Duration::from_secs(720 * 3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10us").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("10µs").unwrap(), Duration::from_micros(10));
        assert_eq!(parse_duration("100ns").unwrap(), Duration::from_nanos(100));
        assert_eq!(parse_duration("+5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
    }

    #[test]
    fn parse_duration_rejects_invalid() {
        for input in ["", "h", "10", "30d", "-1h", "1..5s", "1h x", "."] {
            assert!(parse_duration(input).is_err(), "{input:?} should be rejected");
        }
    }

    fn base64_url(bytes: &[u8]) -> String {
        BASE64_URL_SAFE_NO_PAD.encode(bytes)
    }
}
