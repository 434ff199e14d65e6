// JWT session tokens
// Decision: HS256 with a symmetric secret; expiry is carried in epoch
// milliseconds and checked manually so the claim shape matches the protocol

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use aether_storage::Role;

/// Claims carried by every session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub sub: String,
    pub username: String,
    pub role: Role,
    /// Expiry as epoch milliseconds
    pub exp: i64,
    /// Issued-at as epoch milliseconds
    pub iat: i64,
}

/// Token service
#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    lifetime: Duration,
}

impl JwtService {
    pub fn new(secret: &str, lifetime: Duration) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            lifetime,
        }
    }

    /// Issue a token; returns the token and its expiry instant
    pub fn issue(&self, uid: &str, username: &str, role: Role) -> Result<(String, DateTime<Utc>)> {
        let now = Utc::now();
        let expires_at = now + self.lifetime;
        let claims = Claims {
            sub: uid.to_string(),
            username: username.to_string(),
            role,
            exp: expires_at.timestamp_millis(),
            iat: now.timestamp_millis(),
        };
        let token = encode(&Header::default(), &claims, &self.encoding_key)
            .context("failed to encode token")?;
        Ok((token, expires_at))
    }

    /// Verify signature and expiry
    pub fn verify(&self, token: &str) -> Result<Claims> {
        // exp is epoch-ms by protocol contract; the library's exp check
        // assumes seconds, so expiry is validated by hand below.
        let mut validation = Validation::default();
        validation.validate_exp = false;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &self.decoding_key, &validation)
            .context("invalid token")?;
        if data.claims.exp <= Utc::now().timestamp_millis() {
            anyhow::bail!("token expired");
        }
        Ok(data.claims)
    }

    pub fn lifetime(&self) -> Duration {
        self.lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> JwtService {
        JwtService::new("test-secret", Duration::hours(1))
    }

    #[test]
    fn issue_and_verify_round_trip() {
        let service = service();
        let (token, expires_at) = service.issue("u1", "alice", Role::User).unwrap();
        assert!(expires_at > Utc::now());

        let claims = service.verify(&token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.role, Role::User);
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let service = JwtService::new("test-secret", Duration::milliseconds(-1));
        let (token, _) = service.issue("u1", "alice", Role::User).unwrap();
        assert!(service.verify(&token).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (token, _) = service().issue("u1", "alice", Role::Admin).unwrap();
        let other = JwtService::new("different-secret", Duration::hours(1));
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(service().verify("not-a-token").is_err());
    }
}
