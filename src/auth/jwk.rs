use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::EncodedPoint;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid public key")]
pub struct InvalidJwk;

/// Public portion of an EC JWK (P-256 only). Field declaration order is the
/// canonical serialization order: `kty, crv, x, y`. Device ids are defined
/// with respect to that exact ordering, so the canonical form is always
/// rebuilt from parsed fields and never taken from caller-supplied text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcPublicJwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
    pub y: String,
}

/// Parse and validate an EC public JWK from a decoded JSON value, returning
/// the verification key and the normalized JWK fields. Rejects anything that
/// is not an on-curve P-256 point.
pub fn parse_ec_public_jwk(raw: &Value) -> Result<(VerifyingKey, EcPublicJwk), InvalidJwk> {
    let jwk: EcPublicJwk = serde_json::from_value(raw.clone()).map_err(|_| InvalidJwk)?;
    let key = verifying_key_from_jwk(&jwk)?;
    Ok((key, jwk))
}

/// Same as [`parse_ec_public_jwk`] but from serialized JSON text, as stored
/// in the device registry.
pub fn parse_ec_public_jwk_str(raw: &str) -> Result<(VerifyingKey, EcPublicJwk), InvalidJwk> {
    let jwk: EcPublicJwk = serde_json::from_str(raw).map_err(|_| InvalidJwk)?;
    let key = verifying_key_from_jwk(&jwk)?;
    Ok((key, jwk))
}

fn verifying_key_from_jwk(jwk: &EcPublicJwk) -> Result<VerifyingKey, InvalidJwk> {
    if jwk.kty != "EC" || jwk.crv != "P-256" || jwk.x.is_empty() || jwk.y.is_empty() {
        return Err(InvalidJwk);
    }

    let x = decode_coordinate(&jwk.x)?;
    let y = decode_coordinate(&jwk.y)?;
    let point = EncodedPoint::from_affine_coordinates(
        p256::FieldBytes::from_slice(&x),
        p256::FieldBytes::from_slice(&y),
        false,
    );
    VerifyingKey::from_encoded_point(&point).map_err(|_| InvalidJwk)
}

fn decode_coordinate(encoded: &str) -> Result<[u8; 32], InvalidJwk> {
    let bytes = URL_SAFE_NO_PAD.decode(encoded).map_err(|_| InvalidJwk)?;
    if bytes.is_empty() || bytes.len() > 32 {
        return Err(InvalidJwk);
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}

/// Canonical JSON form of the key: members in exactly `kty, crv, x, y` order.
pub fn canonical_jwk_json(jwk: &EcPublicJwk) -> String {
    // Struct serialization emits fields in declaration order.
    serde_json::to_string(jwk).unwrap_or_default()
}

/// `device_id = base64url(SHA-256(canonical_json(kty,crv,x,y)))`, unpadded.
pub fn device_id_from_jwk(jwk: &EcPublicJwk) -> String {
    let digest = Sha256::digest(canonical_jwk_json(jwk).as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Verify an ECDSA-P256/SHA-256 signature over `message`. Accepts either the
/// raw 64-byte `r || s` concatenation or DER encoding.
pub fn verify_ecdsa_signature(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let parsed = if signature.len() == 64 {
        Signature::from_slice(signature)
    } else {
        Signature::from_der(signature)
    };
    match parsed {
        Ok(sig) => key.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}
