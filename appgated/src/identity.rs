//! Who is calling.
//!
//! Two identity classes exist: the app session established once per
//! connection, and app-user bearer tokens that apps hand back to prove a
//! user delegated to them.

use appgate_protocol::results::{AppUserAccessToken, AuthenticatedUser};
use appgate_protocol::session::SessionClaims;
use appgate_protocol::ProtocolError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::app::AppRecord;

pub const APP_USER_SUBJECT_PREFIX: &str = "app_user";

/// The app instance behind one connection, fixed at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub app_identifier: String,
    pub instance_id: String,
    pub privileged: bool,
}

impl CallerIdentity {
    pub fn new(app_identifier: &str, instance_id: &str, privileged: bool) -> Self {
        Self {
            app_identifier: app_identifier.to_string(),
            instance_id: instance_id.to_string(),
            privileged,
        }
    }

    /// `<appIdentifier>:<instanceId>`
    pub fn handler_id(&self) -> String {
        format!("{}:{}", self.app_identifier, self.instance_id)
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("token is not a well-formed JWT")]
    Malformed,
    #[error("token payload is not a JSON object")]
    UnstructuredPayload,
    #[error("token has no subject")]
    MissingSubject,
    #[error("token subject `{0}` is not an app-user subject")]
    BadSubject(String),
    #[error("token was issued for app `{token}` but presented for `{declared}`")]
    AppMismatch { token: String, declared: String },
    #[error("token verification failed: {0}")]
    Verification(#[from] jsonwebtoken::errors::Error),
    #[error("unknown app `{0}`")]
    UnknownApp(String),
    #[error("app `{0}` has no public key on record")]
    MissingPublicKey(String),
}

impl From<IdentityError> for ProtocolError {
    fn from(err: IdentityError) -> Self {
        match err {
            IdentityError::UnknownApp(_) => ProtocolError::NotFound(err.to_string()),
            other => ProtocolError::Unauthorized(other.to_string()),
        }
    }
}

/// Verifies the session token presented in the connect handshake.
#[derive(Clone)]
pub struct SessionVerifier {
    privileged_app: String,
    core_secret: String,
}

impl SessionVerifier {
    pub fn new(privileged_app: impl Into<String>, core_secret: impl Into<String>) -> Self {
        Self {
            privileged_app: privileged_app.into(),
            core_secret: core_secret.into(),
        }
    }

    pub fn privileged_app(&self) -> &str {
        &self.privileged_app
    }

    pub fn is_privileged(&self, app_identifier: &str) -> bool {
        app_identifier == self.privileged_app
    }

    /// HS256 with the core secret for the privileged app, RS256 against the
    /// stored public key for everyone else.
    pub fn verify(&self, app: &AppRecord, token: &str) -> Result<SessionClaims, IdentityError> {
        let (key, algorithm) = if self.is_privileged(&app.identifier) {
            (
                DecodingKey::from_secret(self.core_secret.as_bytes()),
                Algorithm::HS256,
            )
        } else {
            let pem = app
                .manifest
                .public_key
                .as_deref()
                .ok_or_else(|| IdentityError::MissingPublicKey(app.identifier.clone()))?;
            (DecodingKey::from_rsa_pem(pem.as_bytes())?, Algorithm::RS256)
        };

        let mut validation = Validation::new(algorithm);
        validation.sub = Some(format!(
            "{}{}",
            appgate_protocol::session::APP_SUBJECT_PREFIX,
            app.identifier
        ));
        validation.set_required_spec_claims(&["exp", "sub"]);

        let data = decode::<SessionClaims>(token, &key, &validation)?;
        Ok(data.claims)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AppUserClaims {
    sub: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// Mints and checks `app_user:<userId>:<appIdentifier>` tokens.
#[derive(Clone)]
pub struct AppUserTokens {
    secret: String,
    audience: String,
    ttl: Duration,
}

impl AppUserTokens {
    pub fn new(secret: impl Into<String>, audience: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            audience: audience.into(),
            ttl,
        }
    }

    pub fn mint(
        &self,
        user_id: &str,
        app_identifier: &str,
    ) -> Result<AppUserAccessToken, IdentityError> {
        let now = Utc::now();
        let expires_at = now + self.ttl;
        let claims = AppUserClaims {
            sub: format!("{APP_USER_SUBJECT_PREFIX}:{user_id}:{app_identifier}"),
            aud: self.audience.clone(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let access_token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?;
        Ok(AppUserAccessToken {
            access_token,
            expires_at,
        })
    }

    /// Structural checks run on the unverified payload first, so a token
    /// minted for another app is rejected before any signature work.
    pub fn authenticate(
        &self,
        token: &str,
        declared_app: &str,
    ) -> Result<AuthenticatedUser, IdentityError> {
        let payload = unverified_payload(token)?;
        let subject = payload
            .get("sub")
            .and_then(Value::as_str)
            .ok_or(IdentityError::MissingSubject)?;
        let (user_id, token_app) = split_app_user_subject(subject)?;
        if token_app != declared_app {
            debug!(%token_app, %declared_app, "app-user token presented for another app");
            return Err(IdentityError::AppMismatch {
                token: token_app.to_string(),
                declared: declared_app.to_string(),
            });
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[self.audience.as_str()]);
        validation.sub = Some(subject.to_string());
        validation.set_required_spec_claims(&["exp", "sub", "aud"]);
        decode::<AppUserClaims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &validation,
        )?;

        Ok(AuthenticatedUser {
            user_id: user_id.to_string(),
            app_identifier: token_app.to_string(),
        })
    }
}

fn unverified_payload(token: &str) -> Result<serde_json::Map<String, Value>, IdentityError> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(IdentityError::Malformed);
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|_| IdentityError::Malformed)?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(IdentityError::UnstructuredPayload),
        Err(_) => Err(IdentityError::Malformed),
    }
}

fn split_app_user_subject(subject: &str) -> Result<(&str, &str), IdentityError> {
    let parts: Vec<&str> = subject.split(':').collect();
    match parts.as_slice() {
        [prefix, user_id, app]
            if *prefix == APP_USER_SUBJECT_PREFIX && !user_id.is_empty() && !app.is_empty() =>
        {
            Ok((user_id, app))
        }
        _ => Err(IdentityError::BadSubject(subject.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppManifest;
    use appgate_protocol::session::{mint_app_session_token, mint_privileged_session_token};
    use appgate_protocol::ErrorCode;

    const GALLERY_PRIVATE: &[u8] = include_bytes!("../tests/fixtures/gallery_private.pem");
    const GALLERY_PUBLIC: &str = include_str!("../tests/fixtures/gallery_public.pem");
    const ROGUE_PRIVATE: &[u8] = include_bytes!("../tests/fixtures/rogue_private.pem");

    fn app(identifier: &str, public_key: Option<&str>) -> AppRecord {
        let mut manifest: AppManifest = toml::from_str("").unwrap();
        manifest.public_key = public_key.map(String::from);
        AppRecord {
            identifier: identifier.to_string(),
            enabled: true,
            manifest,
        }
    }

    fn tokens() -> AppUserTokens {
        AppUserTokens::new("core-secret", "appgate", Duration::hours(1))
    }

    fn forge(payload: &str) -> String {
        format!(
            "{}.{}.c2ln",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn handler_id_joins_app_and_instance() {
        let caller = CallerIdentity::new("gallery", "w-1", false);
        assert_eq!(caller.handler_id(), "gallery:w-1");
    }

    #[test]
    fn privileged_session_uses_core_secret() {
        let verifier = SessionVerifier::new("core", "core-secret");
        let token = mint_privileged_session_token("core-secret", "core", Duration::minutes(5))
            .unwrap();
        let claims = verifier.verify(&app("core", None), &token).unwrap();
        assert_eq!(claims.app_identifier(), Some("core"));

        let wrong = mint_privileged_session_token("guess", "core", Duration::minutes(5)).unwrap();
        assert!(matches!(
            verifier.verify(&app("core", None), &wrong),
            Err(IdentityError::Verification(_))
        ));
    }

    #[test]
    fn app_session_uses_stored_public_key() {
        let verifier = SessionVerifier::new("core", "core-secret");
        let gallery = app("gallery", Some(GALLERY_PUBLIC));

        let token = mint_app_session_token(GALLERY_PRIVATE, "gallery", Duration::minutes(5))
            .unwrap();
        verifier.verify(&gallery, &token).unwrap();

        let rogue = mint_app_session_token(ROGUE_PRIVATE, "gallery", Duration::minutes(5))
            .unwrap();
        assert!(verifier.verify(&gallery, &rogue).is_err());
    }

    #[test]
    fn app_session_rejects_hs256_and_foreign_subject() {
        let verifier = SessionVerifier::new("core", "core-secret");
        let gallery = app("gallery", Some(GALLERY_PUBLIC));

        let hs = mint_privileged_session_token("core-secret", "gallery", Duration::minutes(5))
            .unwrap();
        assert!(verifier.verify(&gallery, &hs).is_err());

        let other = mint_app_session_token(GALLERY_PRIVATE, "notes", Duration::minutes(5))
            .unwrap();
        assert!(verifier.verify(&gallery, &other).is_err());
    }

    #[test]
    fn expired_session_is_rejected() {
        let verifier = SessionVerifier::new("core", "core-secret");
        let token = mint_privileged_session_token("core-secret", "core", Duration::minutes(-10))
            .unwrap();
        let err: ProtocolError = verifier.verify(&app("core", None), &token).unwrap_err().into();
        assert_eq!(err.code(), ErrorCode::Unauthorized);
    }

    #[test]
    fn missing_public_key_is_unauthorized() {
        let verifier = SessionVerifier::new("core", "core-secret");
        let err = verifier.verify(&app("gallery", None), "a.b.c").unwrap_err();
        assert!(matches!(err, IdentityError::MissingPublicKey(_)));
    }

    #[test]
    fn app_user_token_round_trips() {
        let tokens = tokens();
        let minted = tokens.mint("u1", "gallery").unwrap();
        let user = tokens.authenticate(&minted.access_token, "gallery").unwrap();
        assert_eq!(user.user_id, "u1");
        assert_eq!(user.app_identifier, "gallery");
    }

    #[test]
    fn mismatched_app_fails_before_signature_check() {
        // Unsigned garbage signature: reaching verification would yield
        // `Verification`, not `AppMismatch`.
        let token = forge(r#"{"sub":"app_user:U1:app1","aud":"appgate","exp":9999999999}"#);
        let err = tokens().authenticate(&token, "app2").unwrap_err();
        assert!(matches!(err, IdentityError::AppMismatch { .. }));

        let protocol: ProtocolError = err.into();
        assert_eq!(protocol.code(), ErrorCode::Unauthorized);
    }

    #[test]
    fn structural_failures_are_unauthorized() {
        let tokens = tokens();
        assert!(matches!(
            tokens.authenticate("not-a-jwt", "gallery"),
            Err(IdentityError::Malformed)
        ));
        assert!(matches!(
            tokens.authenticate(&forge(r#""just a string""#), "gallery"),
            Err(IdentityError::UnstructuredPayload)
        ));
        assert!(matches!(
            tokens.authenticate(&forge(r#"{"aud":"appgate"}"#), "gallery"),
            Err(IdentityError::MissingSubject)
        ));
        assert!(matches!(
            tokens.authenticate(&forge(r#"{"sub":"app_user:u1"}"#), "gallery"),
            Err(IdentityError::BadSubject(_))
        ));
        assert!(matches!(
            tokens.authenticate(&forge(r#"{"sub":"user:u1:gallery"}"#), "gallery"),
            Err(IdentityError::BadSubject(_))
        ));
    }

    #[test]
    fn forged_signature_is_rejected() {
        let token = forge(r#"{"sub":"app_user:u1:gallery","aud":"appgate","exp":9999999999}"#);
        assert!(matches!(
            tokens().authenticate(&token, "gallery"),
            Err(IdentityError::Verification(_))
        ));
    }

    #[test]
    fn wrong_audience_is_rejected() {
        let other = AppUserTokens::new("core-secret", "elsewhere", Duration::hours(1));
        let minted = other.mint("u1", "gallery").unwrap();
        assert!(tokens().authenticate(&minted.access_token, "gallery").is_err());
    }

    #[test]
    fn unknown_app_maps_to_not_found() {
        let err: ProtocolError = IdentityError::UnknownApp("ghost".into()).into();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }
}
