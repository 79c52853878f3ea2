//! Identity and signed tokens.
//!
//! Access tokens carry the user identity; session tokens bind a session id to
//! that identity so a session cannot be picked up by another account.

mod google;

pub use google::{GoogleIdentityProvider, IdentityProvider, UserProfile};

use axum::http::{HeaderMap, header};
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SecurityConfig;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("session token does not match session {0}")]
    SessionMismatch(String),
    #[error("identity provider is not configured")]
    NotConfigured,
    #[error("identity provider rejected the request: {0}")]
    Provider(String),
    #[error("identity provider unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            _ => Self::InvalidToken(e.to_string()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UserClaims {
    pub sub: String, // User ID (Subject)
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    pub exp: u64,
    pub iat: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct SessionClaims {
    pub sid: String,
    pub sub: String,
    pub exp: u64,
    pub iat: u64,
}

#[derive(Clone, Debug)]
pub struct UserContext {
    pub user_id: String,
    pub claims: UserClaims,
}

/// HS256 issuer and verifier for access and session tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    access_ttl: u64,
    session_ttl: u64,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl", &self.access_ttl)
            .field("session_ttl", &self.session_ttl)
            .finish_non_exhaustive()
    }
}

fn now_secs() -> u64 {
    u64::try_from(Utc::now().timestamp()).unwrap_or_default()
}

impl TokenService {
    pub fn new(config: &SecurityConfig) -> Self {
        let secret = config.jwt_secret.as_bytes();
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            access_ttl: config.access_token_ttl_secs,
            session_ttl: config.session_token_ttl_secs,
        }
    }

    pub fn issue_access_token(&self, profile: &UserProfile) -> Result<String, AuthError> {
        let iat = now_secs();
        let claims = UserClaims {
            sub: profile.id.clone(),
            email: profile.email.clone(),
            name: profile.name.clone(),
            exp: iat + self.access_ttl,
            iat,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    pub fn verify_access_token(&self, token: &str) -> Result<UserContext, AuthError> {
        let data = decode::<UserClaims>(token, &self.decoding, &Validation::default())?;
        let claims = data.claims;
        Ok(UserContext {
            user_id: claims.sub.clone(),
            claims,
        })
    }

    pub fn issue_session_token(&self, session_id: &str, user_id: &str) -> Result<String, AuthError> {
        let iat = now_secs();
        let claims = SessionClaims {
            sid: session_id.to_string(),
            sub: user_id.to_string(),
            exp: iat + self.session_ttl,
            iat,
        };
        Ok(encode(&Header::default(), &claims, &self.encoding)?)
    }

    /// Validate a session token against the session it is presented with and,
    /// when known, the caller's identity.
    pub fn verify_session_token(
        &self,
        token: &str,
        session_id: &str,
        user_id: Option<&str>,
    ) -> Result<SessionClaims, AuthError> {
        let claims = decode::<SessionClaims>(token, &self.decoding, &Validation::default())?.claims;
        if claims.sid != session_id || user_id.is_some_and(|u| u != claims.sub) {
            return Err(AuthError::SessionMismatch(session_id.to_string()));
        }
        Ok(claims)
    }
}

/// `Authorization: Bearer <token>` value, if present.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}
