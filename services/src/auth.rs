//! Revocable bearer tokens: HMAC-SHA256 signed `header.payload.signature`
//! tokens checked against a small persistent revocation set before signature
//! verification. Revocations live in a JSON snapshot file that is pruned and
//! rewritten on every mutation.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("unauthorized")]
    InvalidToken,
    #[error("unauthorized")]
    TokenExpired,
    #[error("unauthorized")]
    TokenRevoked,
    #[error("token encoding error: {0}")]
    Encoding(String),
    #[error("revocation store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub remember: bool,
}

/// Identity attached to a verified connection or request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthedUser {
    pub id: String,
    pub username: String,
}

const SESSION_TTL_HOURS: i64 = 24;
const REMEMBER_TTL_DAYS: i64 = 30;

fn token_digest(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// sha256(token) → expiry epoch seconds, snapshotted to disk.
struct RevocationStore {
    path: Option<PathBuf>,
    entries: RwLock<HashMap<String, i64>>,
}

impl RevocationStore {
    fn open(path: Option<PathBuf>) -> Self {
        let entries = path
            .as_deref()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|raw| serde_json::from_str::<HashMap<String, i64>>(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            entries: RwLock::new(entries),
        }
    }

    async fn is_revoked(&self, digest: &str, now: i64) -> bool {
        self.entries
            .read()
            .await
            .get(digest)
            .map(|expiry| *expiry > now)
            .unwrap_or(false)
    }

    async fn insert(&self, digest: String, expiry: i64) -> Result<(), AuthError> {
        let mut entries = self.entries.write().await;
        let now = Utc::now().timestamp();
        entries.retain(|_, exp| *exp > now);
        entries.insert(digest, expiry);
        self.persist(&entries)
    }

    fn persist(&self, entries: &HashMap<String, i64>) -> Result<(), AuthError> {
        let Some(path) = &self.path else { return Ok(()) };
        let raw = serde_json::to_string(entries).map_err(|e| AuthError::Store(e.to_string()))?;
        std::fs::write(path, raw).map_err(|e| AuthError::Store(e.to_string()))
    }
}

pub struct AuthService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    revocations: RevocationStore,
}

impl AuthService {
    /// `revocation_path == None` keeps revocations in memory only (tests,
    /// development).
    pub fn new(secret: &str, revocation_path: Option<PathBuf>) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            revocations: RevocationStore::open(revocation_path),
        }
    }

    /// Sign a token for a user. `remember` stretches the lifetime.
    pub fn issue(&self, user_id: &str, username: &str, remember: bool) -> Result<String, AuthError> {
        let now = Utc::now();
        let ttl = if remember {
            Duration::days(REMEMBER_TTL_DAYS)
        } else {
            Duration::hours(SESSION_TTL_HOURS)
        };
        let claims = Claims {
            sub: user_id.to_string(),
            username: username.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            remember,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| AuthError::Encoding(e.to_string()))
    }

    /// Full verification: revocation set first, then signature (constant-time
    /// inside the JWT crate), then expiry.
    pub async fn verify(&self, token: &str) -> Result<AuthedUser, AuthError> {
        let now = Utc::now().timestamp();
        if self.revocations.is_revoked(&token_digest(token), now).await {
            return Err(AuthError::TokenRevoked);
        }

        let data = decode::<Claims>(token, &self.decoding, &Validation::new(Algorithm::HS256))
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken,
            })?;

        Ok(AuthedUser {
            id: data.claims.sub,
            username: data.claims.username,
        })
    }

    /// Revoke a token until its natural expiry. The token must still verify;
    /// revoking garbage is refused.
    pub async fn revoke(&self, token: &str) -> Result<(), AuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = false;
        let data = decode::<Claims>(token, &self.decoding, &validation).map_err(|e| {
            warn!(error = %e, "refused to revoke unverifiable token");
            AuthError::InvalidToken
        })?;
        self.revocations
            .insert(token_digest(token), data.claims.exp)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> AuthService {
        AuthService::new("test-secret", None)
    }

    #[tokio::test]
    async fn issue_then_verify_roundtrip() {
        let auth = service();
        let token = auth.issue("u1", "speedy", false).expect("issue");
        let user = auth.verify(&token).await.expect("verify");
        assert_eq!(user, AuthedUser { id: "u1".into(), username: "speedy".into() });
    }

    #[tokio::test]
    async fn tampered_tokens_fail() {
        let auth = service();
        let token = auth.issue("u1", "speedy", false).expect("issue");
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(matches!(auth.verify(&tampered).await, Err(AuthError::InvalidToken)));

        let other = AuthService::new("another-secret", None);
        assert!(matches!(other.verify(&token).await, Err(AuthError::InvalidToken)));
    }

    #[tokio::test]
    async fn revoked_tokens_are_rejected() {
        let auth = service();
        let token = auth.issue("u1", "speedy", true).expect("issue");
        auth.verify(&token).await.expect("valid before revocation");
        auth.revoke(&token).await.expect("revoke");
        assert!(matches!(auth.verify(&token).await, Err(AuthError::TokenRevoked)));
    }

    #[tokio::test]
    async fn revocations_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("revoked.json");

        let auth = AuthService::new("test-secret", Some(path.clone()));
        let token = auth.issue("u1", "speedy", false).expect("issue");
        auth.revoke(&token).await.expect("revoke");
        drop(auth);

        let reopened = AuthService::new("test-secret", Some(path));
        assert!(matches!(reopened.verify(&token).await, Err(AuthError::TokenRevoked)));
    }

    #[tokio::test]
    async fn expired_entries_are_pruned_on_mutation() {
        let auth = service();
        auth.revocations
            .insert("stale".into(), Utc::now().timestamp() - 10)
            .await
            .expect("seed");
        let token = auth.issue("u1", "speedy", false).expect("issue");
        auth.revoke(&token).await.expect("revoke");
        let entries = auth.revocations.entries.read().await;
        assert!(!entries.contains_key("stale"));
        assert_eq!(entries.len(), 1);
    }
}
