//! Argon2id password hashing.

use argon2::password_hash::SaltString;
use argon2::{
    Algorithm, Argon2, Params, PasswordHash, PasswordHasher as _, PasswordVerifier, Version,
};
use rand::rngs::OsRng;
use tracing::{error, warn};

/// Hashes and verifies passwords as PHC strings.
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    /// 19 MiB memory, 2 iterations, 1 lane.
    pub fn new() -> anyhow::Result<Self> {
        let params = Params::new(19456, 2, 1, None)
            .map_err(|e| anyhow::anyhow!("Invalid password hashing configuration: {}", e))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn hash_password(&self, password: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "Password hashing failed");
                anyhow::anyhow!("Password processing failed")
            })?;
        Ok(hash.to_string())
    }

    /// Returns `false` for a wrong password or an unparsable stored hash.
    pub fn verify_password(&self, password: &str, stored_hash: &str) -> bool {
        let parsed = match PasswordHash::new(stored_hash) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "Stored password hash is not a valid PHC string");
                return false;
            }
        };
        self.argon2
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_and_verify() {
        let hasher = PasswordHasher::new().unwrap();
        let hash = hasher.hash_password("hunter22").unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify_password("hunter22", &hash));
        assert!(!hasher.verify_password("hunter23", &hash));
    }

    #[test]
    fn test_salts_differ() {
        let hasher = PasswordHasher::new().unwrap();
        let a = hasher.hash_password("same").unwrap();
        let b = hasher.hash_password("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_garbage_hash_does_not_verify() {
        let hasher = PasswordHasher::new().unwrap();
        assert!(!hasher.verify_password("anything", "not-a-phc-string"));
    }
}
