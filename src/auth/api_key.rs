//! API key generation and credential hashing.
//!
//! Keys are random, shown exactly once at registration, and stored only as a
//! SHA-256 digest (the digest is the lookup key, so it must be
//! deterministic). Passwords get argon2 with a per-hash salt.

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, SaltString};
use argon2::{Argon2, PasswordVerifier};
use rand::Rng;
use sha2::{Digest, Sha256};

pub const API_KEY_PREFIX_LEN: usize = 12;

/// Generate a fresh API key and its display prefix.
pub fn generate_api_key() -> (String, String) {
    let mut bytes = [0u8; 24];
    rand::rng().fill(&mut bytes);
    let key = format!("rk_{}", hex::encode(bytes));
    let prefix = key[..API_KEY_PREFIX_LEN].to_string();
    (key, prefix)
}

/// Deterministic digest used as the lookup column.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, credential_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(credential_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_unique_and_prefixed() {
        let (a, prefix_a) = generate_api_key();
        let (b, _) = generate_api_key();
        assert_ne!(a, b);
        assert!(a.starts_with("rk_"));
        assert_eq!(prefix_a.len(), API_KEY_PREFIX_LEN);
        assert!(a.starts_with(&prefix_a));
    }

    #[test]
    fn key_hashing_is_deterministic() {
        let (key, _) = generate_api_key();
        assert_eq!(hash_api_key(&key), hash_api_key(&key));
        assert_ne!(hash_api_key(&key), hash_api_key("rk_other"));
    }

    #[test]
    fn password_round_trip() {
        let hash = hash_password("correct horse battery").unwrap();
        assert!(verify_password("correct horse battery", &hash));
        assert!(!verify_password("wrong", &hash));
        // Salted: same password, different hash
        assert_ne!(hash, hash_password("correct horse battery").unwrap());
    }
}
