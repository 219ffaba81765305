// src/auth.rs
use crate::error::AppError;
use chrono::Utc;
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use log::warn;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use warp::{Filter, Rejection};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "session";
const SALT_LEN: usize = 16;
const HASH_METHOD: &str = "sha256";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("token subject is not a user id")]
    InvalidSubject,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Hashes a password as `sha256$<salt>$<hex hmac>`, the salted format
/// existing accounts were created with.
pub fn hash_password(password: &str) -> String {
    let salt: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SALT_LEN)
        .map(char::from)
        .collect();
    format!("{}${}${}", HASH_METHOD, salt, hex::encode(sign(&salt, password)))
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (Some(method), Some(salt), Some(digest)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    if method != HASH_METHOD {
        warn!("Unsupported password hash method: {}", method);
        return false;
    }
    let Ok(expected) = hex::decode(digest) else {
        return false;
    };
    match HmacSha256::new_from_slice(salt.as_bytes()) {
        Ok(mut mac) => {
            mac.update(password.as_bytes());
            mac.verify_slice(&expected).is_ok()
        }
        Err(_) => false,
    }
}

fn sign(salt: &str, password: &str) -> Vec<u8> {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(salt.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key of any size is valid"),
    };
    mac.update(password.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

/// Issues and checks the signed session tokens kept in the `session` cookie.
pub struct Sessions {
    secret: String,
    ttl_secs: u64,
}

impl Sessions {
    pub fn new(secret: impl Into<String>, ttl_secs: u64) -> Self {
        Self {
            secret: secret.into(),
            ttl_secs,
        }
    }

    pub fn issue(&self, user_id: i64) -> Result<String, AuthError> {
        let exp = Utc::now().timestamp().max(0) as u64 + self.ttl_secs;
        self.encode_claims(&Claims {
            sub: user_id.to_string(),
            exp: exp as usize,
        })
    }

    fn encode_claims(&self, claims: &Claims) -> Result<String, AuthError> {
        Ok(encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )?)
    }

    /// Returns the user id carried by a valid, unexpired token.
    pub fn verify(&self, token: &str) -> Result<i64, AuthError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;
        data.claims
            .sub
            .parse()
            .map_err(|_| AuthError::InvalidSubject)
    }

    pub fn cookie(&self, token: &str) -> String {
        format!(
            "{}={}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
            SESSION_COOKIE, token, self.ttl_secs
        )
    }

    pub fn clear_cookie() -> String {
        format!("{}=; HttpOnly; Path=/; SameSite=Lax; Max-Age=0", SESSION_COOKIE)
    }
}

/// Requires a logged-in user and extracts their id.
pub fn with_user(
    sessions: Arc<Sessions>,
) -> impl Filter<Extract = (i64,), Error = Rejection> + Clone {
    warp::cookie::optional::<String>(SESSION_COOKIE)
        .and(warp::any().map(move || sessions.clone()))
        .and_then(authorize)
}

async fn authorize(token: Option<String>, sessions: Arc<Sessions>) -> Result<i64, Rejection> {
    let token = token.ok_or(AppError::Unauthorized)?;
    sessions.verify(&token).map_err(|e| {
        warn!("Rejected session token: {}", e);
        Rejection::from(AppError::Unauthorized)
    })
}
