pub mod challenge;
pub mod jwk;
pub mod secret;
pub mod token;

pub use challenge::{Challenge, ChallengeError, ChallengeStore};
pub use jwk::{
    canonical_jwk_json, device_id_from_jwk, parse_ec_public_jwk, parse_ec_public_jwk_str,
    verify_ecdsa_signature, EcPublicJwk,
};
pub use secret::{hash_secret, verify_secret};
pub use token::{Claims, TokenError, TokenManager, TOKEN_VERSION_DEVICE_TICKET, TOKEN_VERSION_SESSION};

/// Device ids are url-safe base64 (uuid-like), 10..=128 chars.
pub fn validate_device_id_format(device_id: &str) -> bool {
    if device_id.len() < 10 || device_id.len() > 128 {
        return false;
    }
    device_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
