use axum::http::{HeaderMap, header};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::config::BasicAuthConfig;

pub const CHALLENGE: &str = r#"Basic realm="REALM""#;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingCredentials,
    #[error("malformed credentials")]
    MalformedCredentials,
    #[error("invalid credentials")]
    InvalidCredentials,
}

#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl BasicAuth {
    /// Returns `None` unless both username and password are configured.
    pub fn from_config(config: &BasicAuthConfig) -> Option<Self> {
        if config.username.is_empty() || config.password.is_empty() {
            return None;
        }
        Some(Self {
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AuthError> {
        let value = headers
            .get(header::AUTHORIZATION)
            .ok_or(AuthError::MissingCredentials)?;
        let value = value
            .to_str()
            .map_err(|_| AuthError::MalformedCredentials)?;
        let (username, password) = parse_basic(value)?;

        if username == self.username && password == self.password {
            Ok(())
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }
}

fn parse_basic(value: &str) -> Result<(String, String), AuthError> {
    let (scheme, encoded) = value
        .split_once(' ')
        .ok_or(AuthError::MalformedCredentials)?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return Err(AuthError::MalformedCredentials);
    }

    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::MalformedCredentials)?;
    let decoded = String::from_utf8(decoded).map_err(|_| AuthError::MalformedCredentials)?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or(AuthError::MalformedCredentials)?;

    Ok((username.to_string(), password.to_string()))
}
