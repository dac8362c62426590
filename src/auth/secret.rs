use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

/// Hash a shared secret as an argon2id PHC string
/// (`$argon2id$v=19$m=..,t=..,p=..$salt$hash`).
pub fn hash_secret(secret: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default().hash_password(secret.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a shared secret against a stored argon2id PHC string. Comparison of
/// the derived key is constant-time; a malformed stored hash verifies false
/// rather than erroring, so the login response shape stays uniform.
pub fn verify_secret(secret: &str, encoded: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(encoded) else {
        return false;
    };
    Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify() {
        let hash = hash_secret("correct horse battery").unwrap();
        assert!(hash.starts_with("$argon2id$v=19$"));
        assert!(verify_secret("correct horse battery", &hash));
        assert!(!verify_secret("wrong secret", &hash));
    }

    #[test]
    fn malformed_hash_verifies_false() {
        assert!(!verify_secret("anything", "not-a-phc-string"));
        assert!(!verify_secret("anything", ""));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let h1 = hash_secret("same input").unwrap();
        let h2 = hash_secret("same input").unwrap();
        assert_ne!(h1, h2);
        assert!(verify_secret("same input", &h1));
        assert!(verify_secret("same input", &h2));
    }
}
