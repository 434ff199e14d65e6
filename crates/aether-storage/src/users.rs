// User and issued-token repositories over the KV store
//
// Users are keyed by uid with a username index; issued tokens are stored as
// SHA-256 digests so the store never holds a usable credential.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use aether_core::{KernelError, KvStore, Result};

use crate::password::{hash_password, verify_password};

const NS_USERS: &str = "users";
const NS_USERS_BY_NAME: &str = "users.by_name";
const NS_TOKENS: &str = "tokens";

/// Authorization role of a user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    User,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

/// One account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub uid: String,
    pub username: String,
    pub role: Role,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

/// User repository
#[derive(Clone)]
pub struct UserStore {
    kv: Arc<dyn KvStore>,
}

impl UserStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Create an account; fails when the username is taken
    pub async fn create(&self, username: &str, password: &str, role: Role) -> Result<User> {
        if username.trim().is_empty() {
            return Err(KernelError::invalid("username must not be empty"));
        }
        if self.get_by_username(username).await?.is_some() {
            return Err(KernelError::invalid(format!(
                "username already taken: {username}"
            )));
        }
        let user = User {
            uid: Uuid::now_v7().to_string(),
            username: username.to_string(),
            role,
            password_hash: hash_password(password)?,
            created_at: Utc::now(),
        };
        self.persist(&user).await?;
        Ok(user)
    }

    /// Fetch by uid
    pub async fn get(&self, uid: &str) -> Result<Option<User>> {
        match self.kv.get(NS_USERS, uid).await? {
            Some(value) => Ok(Some(
                serde_json::from_value(value).map_err(|e| KernelError::storage(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    /// Fetch by username via the name index
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let Some(uid) = self.kv.get(NS_USERS_BY_NAME, username).await? else {
            return Ok(None);
        };
        let uid = uid.as_str().unwrap_or_default().to_string();
        self.get(&uid).await
    }

    /// Check a username/password pair; returns the user on success
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Option<User>> {
        let Some(user) = self.get_by_username(username).await? else {
            return Ok(None);
        };
        if verify_password(password, &user.password_hash)? {
            Ok(Some(user))
        } else {
            Ok(None)
        }
    }

    /// All accounts, ordered by uid
    pub async fn list(&self) -> Result<Vec<User>> {
        self.kv
            .list(NS_USERS)
            .await?
            .into_iter()
            .map(|(_, value)| {
                serde_json::from_value(value).map_err(|e| KernelError::storage(e.to_string()))
            })
            .collect()
    }

    /// Whether any account exists (used for first-boot bootstrap)
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.kv.list(NS_USERS).await?.is_empty())
    }

    async fn persist(&self, user: &User) -> Result<()> {
        let value =
            serde_json::to_value(user).map_err(|e| KernelError::storage(e.to_string()))?;
        self.kv.put(NS_USERS, &user.uid, value).await?;
        self.kv
            .put(
                NS_USERS_BY_NAME,
                &user.username,
                serde_json::Value::String(user.uid.clone()),
            )
            .await
    }
}

/// SHA-256 digest of a token, hex-encoded, for storage
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IssuedToken {
    uid: String,
    expires_at: DateTime<Utc>,
    revoked: bool,
}

/// Issued-token repository; survives restart so sessions stay verifiable
#[derive(Clone)]
pub struct TokenStore {
    kv: Arc<dyn KvStore>,
}

impl TokenStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Record a freshly issued token
    pub async fn record(&self, token: &str, uid: &str, expires_at: DateTime<Utc>) -> Result<()> {
        let entry = IssuedToken {
            uid: uid.to_string(),
            expires_at,
            revoked: false,
        };
        let value =
            serde_json::to_value(&entry).map_err(|e| KernelError::storage(e.to_string()))?;
        self.kv.put(NS_TOKENS, &hash_token(token), value).await
    }

    /// Whether the token is known, unexpired, and not revoked
    pub async fn is_active(&self, token: &str) -> Result<bool> {
        match self.kv.get(NS_TOKENS, &hash_token(token)).await? {
            Some(value) => {
                let entry: IssuedToken = serde_json::from_value(value)
                    .map_err(|e| KernelError::storage(e.to_string()))?;
                Ok(!entry.revoked && entry.expires_at > Utc::now())
            }
            None => Ok(false),
        }
    }

    /// Revoke a token; idempotent
    pub async fn revoke(&self, token: &str) -> Result<()> {
        let key = hash_token(token);
        if let Some(value) = self.kv.get(NS_TOKENS, &key).await? {
            let mut entry: IssuedToken =
                serde_json::from_value(value).map_err(|e| KernelError::storage(e.to_string()))?;
            entry.revoked = true;
            let value =
                serde_json::to_value(&entry).map_err(|e| KernelError::storage(e.to_string()))?;
            self.kv.put(NS_TOKENS, &key, value).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aether_core::MemoryKv;

    #[tokio::test]
    async fn create_and_authenticate() {
        let store = UserStore::new(MemoryKv::shared());
        let user = store.create("alice", "s3cret", Role::User).await.unwrap();
        assert_eq!(user.username, "alice");

        let found = store.authenticate("alice", "s3cret").await.unwrap();
        assert!(found.is_some());
        assert!(store.authenticate("alice", "wrong").await.unwrap().is_none());
        assert!(store.authenticate("nobody", "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_usernames_are_rejected() {
        let store = UserStore::new(MemoryKv::shared());
        store.create("bob", "pw", Role::User).await.unwrap();
        assert!(store.create("bob", "pw2", Role::Admin).await.is_err());
    }

    #[tokio::test]
    async fn token_lifecycle() {
        let store = TokenStore::new(MemoryKv::shared());
        let expires = Utc::now() + chrono::Duration::hours(1);
        store.record("tok-1", "u1", expires).await.unwrap();

        assert!(store.is_active("tok-1").await.unwrap());
        assert!(!store.is_active("unknown").await.unwrap());

        store.revoke("tok-1").await.unwrap();
        assert!(!store.is_active("tok-1").await.unwrap());
    }

    #[tokio::test]
    async fn expired_tokens_are_inactive() {
        let store = TokenStore::new(MemoryKv::shared());
        let expired = Utc::now() - chrono::Duration::hours(1);
        store.record("old", "u1", expired).await.unwrap();
        assert!(!store.is_active("old").await.unwrap());
    }

    #[test]
    fn token_digest_is_stable_hex() {
        let digest = hash_token("abc");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, hash_token("abc"));
        assert_ne!(digest, hash_token("abd"));
    }
}
