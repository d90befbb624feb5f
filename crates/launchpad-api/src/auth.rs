//! Bearer token verification.
//!
//! Operators sign with `auth.secret`; metric reporters sign with
//! `auth.proxy_secret`. Both use HS256. Tokens without an `exp` claim are
//! accepted.

use std::collections::HashSet;

use http::header::AUTHORIZATION;
use http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use launchpad_core::AuthConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<u64>,
}

pub struct TokenVerifier {
    operator_key: DecodingKey,
    reporter_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        Self {
            operator_key: DecodingKey::from_secret(config.secret.as_bytes()),
            reporter_key: DecodingKey::from_secret(config.proxy_secret.as_bytes()),
            validation,
        }
    }

    /// Verify an operator token.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        self.decode(token, &self.operator_key)
    }

    /// Verify a metric reporter token.
    pub fn verify_reporter(&self, token: &str) -> Result<Claims, AuthError> {
        self.decode(token, &self.reporter_key)
    }

    fn decode(&self, token: &str, key: &DecodingKey) -> Result<Claims, AuthError> {
        decode::<Claims>(token, key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// Token from an `Authorization: Bearer ...` header.
pub fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingToken)?;
    let token = value
        .strip_prefix("Bearer ")
        .unwrap_or(value)
        .trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}
