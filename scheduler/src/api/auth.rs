//! Optional HTTP Basic Auth over the entire API surface (§6).

use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::api::AppState;

const REALM: &str = "scheduler";

/// username -> lowercase-hex SHA-256 of the expected password.
#[derive(Debug, Clone, Default)]
pub struct AuthConfig {
    pub username: String,
    pub password_hash: String,
}

impl AuthConfig {
    /// Loads `username=password_hash` from a file, one entry per line,
    /// the format the reference's auth config path expects.
    pub fn load(path: &std::path::Path) -> eyre::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let line = raw
            .lines()
            .find(|l| !l.trim().is_empty())
            .ok_or_else(|| eyre::eyre!("auth config file is empty"))?;
        let (username, password_hash) = line
            .split_once('=')
            .ok_or_else(|| eyre::eyre!("auth config line must be 'username=password_hash'"))?;
        Ok(Self {
            username: username.trim().to_owned(),
            password_hash: password_hash.trim().to_ascii_lowercase(),
        })
    }
}

pub async fn basic_auth(
    State(state): State<Arc<AppState>>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(auth) = &state.auth else {
        return Ok(next.run(request).await);
    };

    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if let Some(header) = header {
        if let Some(creds) = decode_basic(header) {
            if creds.0 == auth.username && constant_time_eq(&hash_password(&creds.1), &auth.password_hash) {
                return Ok(next.run(request).await);
            }
        }
    }

    let mut response = Response::new(axum::body::Body::from("unauthorized"));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    response.headers_mut().insert(
        header::WWW_AUTHENTICATE,
        HeaderValue::from_str(&format!("Basic realm=\"{REALM}\", charset=\"UTF-8\"")).unwrap(),
    );
    Ok(response)
}

fn decode_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    decoded.split_once(':').map(|(u, p)| (u.to_owned(), p.to_owned()))
}

fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    format!("{digest:x}")
}

/// Byte-length-revealing, timing-safe comparison. The reference compares
/// fixed-length hex digests, so length itself carries no secret.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b.iter()).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_lowercase_hex() {
        let hash = hash_password("secret");
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn constant_time_eq_matches_equal_strings() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
