//! Bearer-credential verification and fingerprinting.
//!
//! The verifier is pure: it never touches the store. The handshake combines
//! it with a durable-session lookup keyed by [`token_fingerprint`].

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Claims carried by a bearer credential.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject — the authenticated user id.
    pub sub: String,
    /// The durable session id this credential was issued for.
    pub sid: String,
    /// Issued-at (unix timestamp).
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

/// Identity resolved from a verified credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub user_id: String,
    pub session_id: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("credential expired")]
    Expired,
    #[error("bad signature")]
    BadSignature,
}

/// Sign a credential for the user/session pair, expiring at `expires_at`.
pub fn sign_token(
    user_id: &str,
    session_id: &str,
    secret: &str,
    expires_at: DateTime<Utc>,
) -> Result<String, AuthError> {
    let claims = Claims {
        sub: user_id.to_string(),
        sid: session_id.to_string(),
        iat: Utc::now().timestamp(),
        exp: expires_at.timestamp(),
    };
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::InvalidCredential)
}

/// Verify a credential and return the embedded identity.
///
/// Only HS256 is accepted. Expired, mis-signed, or malformed credentials are
/// rejected with the matching [`AuthError`] kind.
pub fn verify_token(token: &str, secret: &str) -> Result<TokenIdentity, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    let data = jsonwebtoken::decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        jsonwebtoken::errors::ErrorKind::InvalidSignature
        | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => AuthError::BadSignature,
        _ => AuthError::InvalidCredential,
    })?;
    Ok(TokenIdentity {
        user_id: data.claims.sub,
        session_id: data.claims.sid,
    })
}

/// Deterministic fingerprint of a credential, used as the durable-session
/// lookup key. Hex-encoded SHA-256, so always 64 characters.
pub fn token_fingerprint(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}
