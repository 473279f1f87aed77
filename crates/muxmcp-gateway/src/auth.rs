//! Inbound authentication enforcement.
//!
//! Each adapter names what it demands of clients; this module checks the
//! inbound request against that descriptor. Comparisons go through
//! `subtle` so timing does not leak how much of a credential matched, and
//! failures name the step that failed - never the expected value.

use axum::http::HeaderMap;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use muxmcp_transport::ApiKeyLocation;

/// Credentials demanded of inbound clients. Same shape as the upstream
/// descriptor, plus `none`.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InboundAuth {
    /// Open adapter.
    #[default]
    None,
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// Expected token.
        token: SecretString,
    },
    /// HTTP basic credentials.
    Basic {
        /// Expected user name.
        username: String,
        /// Expected password.
        password: SecretString,
    },
    /// API key at a configured location.
    ApiKey {
        /// Where to read it from.
        location: ApiKeyLocation,
        /// Header / parameter / cookie name.
        name: String,
        /// Expected value.
        value: SecretString,
    },
}

impl std::fmt::Debug for InboundAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer { .. } => f.write_str("Bearer { token: <redacted> }"),
            Self::Basic { username, .. } => {
                write!(f, "Basic {{ username: {username:?}, password: <redacted> }}")
            }
            Self::ApiKey { location, name, .. } => {
                write!(f, "ApiKey {{ location: {location:?}, name: {name:?}, value: <redacted> }}")
            }
        }
    }
}

/// The raw credential-bearing parts of an inbound request.
#[derive(Debug, Clone, Copy)]
pub struct InboundCredentials<'a> {
    /// Request headers.
    pub headers: &'a HeaderMap,
    /// Raw query string, if any.
    pub query: Option<&'a str>,
}

/// Why enforcement failed. The reason is safe to surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    /// No credential where one was demanded.
    Missing,
    /// A credential was present but unreadable (wrong scheme, bad base64).
    Malformed,
    /// A well-formed credential that does not match.
    Mismatch,
}

impl AuthFailure {
    /// Stable reason string for error replies.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Missing => "credentials missing",
            Self::Malformed => "credentials malformed",
            Self::Mismatch => "credentials mismatch",
        }
    }
}

fn ct_eq(left: &[u8], right: &[u8]) -> bool {
    left.ct_eq(right).into()
}

/// Check `creds` against `auth`.
pub fn enforce(auth: &InboundAuth, creds: InboundCredentials<'_>) -> Result<(), AuthFailure> {
    match auth {
        InboundAuth::None => Ok(()),

        InboundAuth::Bearer { token } => {
            let header = authorization_header(creds.headers).ok_or(AuthFailure::Missing)?;
            let presented = header
                .strip_prefix("Bearer ")
                .ok_or(AuthFailure::Malformed)?;
            if ct_eq(presented.as_bytes(), token.expose_secret().as_bytes()) {
                Ok(())
            } else {
                Err(AuthFailure::Mismatch)
            }
        }

        InboundAuth::Basic { username, password } => {
            let header = authorization_header(creds.headers).ok_or(AuthFailure::Missing)?;
            let encoded = header.strip_prefix("Basic ").ok_or(AuthFailure::Malformed)?;
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map_err(|_| AuthFailure::Malformed)?;
            let decoded = String::from_utf8(decoded).map_err(|_| AuthFailure::Malformed)?;
            let (user, pass) = decoded.split_once(':').ok_or(AuthFailure::Malformed)?;
            // Compare both fields unconditionally so a wrong user name
            // costs the same as a wrong password.
            let user_ok = ct_eq(user.as_bytes(), username.as_bytes());
            let pass_ok = ct_eq(pass.as_bytes(), password.expose_secret().as_bytes());
            if user_ok && pass_ok {
                Ok(())
            } else {
                Err(AuthFailure::Mismatch)
            }
        }

        InboundAuth::ApiKey {
            location,
            name,
            value,
        } => {
            let presented = match location {
                ApiKeyLocation::Header => creds
                    .headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .map(ToString::to_string),
                ApiKeyLocation::Query => creds.query.and_then(|q| query_param(q, name)),
                ApiKeyLocation::Cookie => cookie_value(creds.headers, name),
            }
            .ok_or(AuthFailure::Missing)?;
            if ct_eq(presented.as_bytes(), value.expose_secret().as_bytes()) {
                Ok(())
            } else {
                Err(AuthFailure::Mismatch)
            }
        }
    }
}

fn authorization_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
}

fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}
