//! Session tokens presented in the connect handshake.
//!
//! The privileged app signs with the shared core secret (HS256); every other
//! app signs with its own RSA key (RS256) whose public half the core keeps on
//! the app record.

use chrono::{Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};

pub const APP_SUBJECT_PREFIX: &str = "app:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

impl SessionClaims {
    pub fn new(app_identifier: &str, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            sub: format!("{APP_SUBJECT_PREFIX}{app_identifier}"),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        }
    }

    pub fn app_identifier(&self) -> Option<&str> {
        self.sub.strip_prefix(APP_SUBJECT_PREFIX)
    }
}

pub fn mint_privileged_session_token(
    secret: &str,
    app_identifier: &str,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    encode(
        &Header::new(Algorithm::HS256),
        &SessionClaims::new(app_identifier, ttl),
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

pub fn mint_app_session_token(
    private_key_pem: &[u8],
    app_identifier: &str,
    ttl: Duration,
) -> Result<String, jsonwebtoken::errors::Error> {
    let key = EncodingKey::from_rsa_pem(private_key_pem)?;
    encode(
        &Header::new(Algorithm::RS256),
        &SessionClaims::new(app_identifier, ttl),
        &key,
    )
}
