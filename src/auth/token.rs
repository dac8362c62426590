use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::time::Duration;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Session tokens assert a completed secret exchange.
pub const TOKEN_VERSION_SESSION: i64 = 1;
/// Device tickets assert a completed attestation. A reserved version per
/// purpose keeps a ticket from being presented where a session is required.
pub const TOKEN_VERSION_DEVICE_TICKET: i64 = 2;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("invalid token format")]
    Format,
    #[error("invalid signature")]
    Signature,
    #[error("token expired")]
    Expired,
    #[error("token version mismatch")]
    Version,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(rename = "v")]
    pub ver: i64,
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
}

/// Mints and verifies stateless signed tokens. Wire form is
/// `base64url(payload_json) "." base64url(HMAC-SHA256(key, base64url(payload_json)))`
/// with no padding. One key is shared across versions.
#[derive(Clone)]
pub struct TokenManager {
    secret: Vec<u8>,
}

impl TokenManager {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    pub fn sign(&self, sid: &str, version: i64, ttl: Duration) -> Result<String, serde_json::Error> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            ver: version,
            sid: sid.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
        };

        let payload = serde_json::to_vec(&claims)?;
        let encoded_payload = URL_SAFE_NO_PAD.encode(payload);
        let signature = self.compute_hmac(encoded_payload.as_bytes());
        Ok(format!(
            "{}.{}",
            encoded_payload,
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let (encoded_payload, encoded_signature) =
            token.split_once('.').ok_or(TokenError::Format)?;
        if encoded_signature.contains('.') {
            return Err(TokenError::Format);
        }

        let actual = URL_SAFE_NO_PAD
            .decode(encoded_signature)
            .map_err(|_| TokenError::Signature)?;
        let expected = self.compute_hmac(encoded_payload.as_bytes());
        if !bool::from(expected.ct_eq(&actual)) {
            return Err(TokenError::Signature);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(encoded_payload)
            .map_err(|_| TokenError::Format)?;
        let claims: Claims = serde_json::from_slice(&payload).map_err(|_| TokenError::Format)?;

        if Utc::now().timestamp() > claims.exp {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    /// Verify and additionally require the claims to sit in the expected
    /// version slot. Cross-version substitution always fails.
    pub fn verify_with_version(
        &self,
        token: &str,
        expected_version: i64,
    ) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.ver != expected_version {
            return Err(TokenError::Version);
        }
        Ok(claims)
    }

    fn compute_hmac(&self, data: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length, so construction cannot fail.
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("HMAC-SHA256 key of any length");
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> TokenManager {
        TokenManager::new(b"test-session-key")
    }

    #[test]
    fn sign_verify_round_trip() {
        let tm = manager();
        let token = tm
            .sign("device-abc", TOKEN_VERSION_DEVICE_TICKET, Duration::from_secs(900))
            .unwrap();
        let claims = tm
            .verify_with_version(&token, TOKEN_VERSION_DEVICE_TICKET)
            .unwrap();
        assert_eq!(claims.sid, "device-abc");
        assert_eq!(claims.ver, TOKEN_VERSION_DEVICE_TICKET);
        assert_eq!(claims.exp, claims.iat + 900);
    }

    #[test]
    fn version_mismatch_rejected() {
        let tm = manager();
        let ticket = tm
            .sign("device-abc", TOKEN_VERSION_DEVICE_TICKET, Duration::from_secs(900))
            .unwrap();
        assert_eq!(
            tm.verify_with_version(&ticket, TOKEN_VERSION_SESSION),
            Err(TokenError::Version)
        );

        let session = tm
            .sign("sid-123", TOKEN_VERSION_SESSION, Duration::from_secs(900))
            .unwrap();
        assert_eq!(
            tm.verify_with_version(&session, TOKEN_VERSION_DEVICE_TICKET),
            Err(TokenError::Version)
        );
    }

    #[test]
    fn expired_token_rejected() {
        let tm = manager();
        let token = tm
            .sign("sid-123", TOKEN_VERSION_SESSION, Duration::from_secs(0))
            .unwrap();
        // exp == iat, and verification requires now <= exp, so wait past the
        // second boundary.
        std::thread::sleep(Duration::from_millis(1100));
        assert_eq!(tm.verify(&token), Err(TokenError::Expired));
    }

    #[test]
    fn tampered_payload_rejected() {
        let tm = manager();
        let token = tm
            .sign("sid-123", TOKEN_VERSION_SESSION, Duration::from_secs(60))
            .unwrap();
        let (payload, signature) = token.split_once('.').unwrap();
        let mut forged = payload.to_string();
        forged.make_ascii_uppercase();
        assert_eq!(
            tm.verify(&format!("{forged}.{signature}")),
            Err(TokenError::Signature)
        );
    }

    #[test]
    fn wrong_key_rejected() {
        let token = manager()
            .sign("sid-123", TOKEN_VERSION_SESSION, Duration::from_secs(60))
            .unwrap();
        let other = TokenManager::new(b"another-key");
        assert_eq!(other.verify(&token), Err(TokenError::Signature));
    }

    #[test]
    fn malformed_tokens_rejected() {
        let tm = manager();
        assert_eq!(tm.verify("no-dot-here"), Err(TokenError::Format));
        assert_eq!(tm.verify("a.b.c"), Err(TokenError::Format));
        assert_eq!(tm.verify(""), Err(TokenError::Format));
    }
}
