//! Bearer token issuance for admin and credentialed sessions.
//!
//! Tokens let the in-IDE CLI authenticate back to the platform API. They are
//! HMAC-SHA256 signed and carry the username and an expiry timestamp.

use chrono::Utc;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

/// Length of a generated signing secret in bytes
const SECRET_LENGTH: usize = 32;

type HmacSha256 = Hmac<Sha256>;

/// Issues bearer tokens for a given identity.
///
/// Only admin and credentialed sessions ever receive a token; the spec
/// builder calls this at most once per session build.
pub trait TokenIssuer: Send + Sync {
    fn issue(&self, username: &str) -> String;
}

/// HMAC-SHA256 token issuer with a shared signing secret
pub struct HmacTokenIssuer {
    secret: String,
    ttl_hours: i64,
}

impl HmacTokenIssuer {
    pub const fn new(secret: String, ttl_hours: i64) -> Self {
        Self { secret, ttl_hours }
    }

    /// Generate a cryptographically secure signing secret
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; SECRET_LENGTH];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verify a token, returning the username when valid and unexpired
    pub fn verify(&self, token: &str) -> Option<String> {
        let (payload, signature) = token.rsplit_once('.')?;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(payload.as_bytes());
        mac.verify_slice(&hex::decode(signature).ok()?).ok()?;

        let (username, expiry) = payload.rsplit_once('.')?;
        let expiry: i64 = expiry.parse().ok()?;
        if expiry < Utc::now().timestamp() {
            return None;
        }
        Some(username.to_string())
    }
}

impl TokenIssuer for HmacTokenIssuer {
    fn issue(&self, username: &str) -> String {
        let expiry = Utc::now() + chrono::Duration::hours(self.ttl_hours);
        let payload = format!("{username}.{}", expiry.timestamp());
        let signature = self.sign(&payload);
        format!("{payload}.{signature}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let issuer = HmacTokenIssuer::new("test-secret".to_string(), 6);
        let token = issuer.issue("abc123");
        assert_eq!(issuer.verify(&token), Some("abc123".to_string()));
    }

    #[test]
    fn test_tampered_token_rejected() {
        let issuer = HmacTokenIssuer::new("test-secret".to_string(), 6);
        let token = issuer.issue("abc123");
        let tampered = token.replacen("abc123", "xyz789", 1);
        assert_eq!(issuer.verify(&tampered), None);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = HmacTokenIssuer::new("secret-a".to_string(), 6);
        let other = HmacTokenIssuer::new("secret-b".to_string(), 6);
        let token = issuer.issue("abc123");
        assert_eq!(other.verify(&token), None);
    }

    #[test]
    fn test_expired_token_rejected() {
        let issuer = HmacTokenIssuer::new("test-secret".to_string(), -1);
        let token = issuer.issue("abc123");
        assert_eq!(issuer.verify(&token), None);
    }

    #[test]
    fn test_generated_secrets_differ() {
        assert_ne!(
            HmacTokenIssuer::generate_secret(),
            HmacTokenIssuer::generate_secret()
        );
    }
}
