//! Password-based key derivation (Argon2id).

use argon2::Argon2;
use rand::RngCore;

use crate::crypto::aead::MasterKey;
use crate::error::{KuraError, Result};

pub const SALT_SIZE: usize = 16;

/// Generate a random per-database salt.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit master key from a password and salt.
pub fn derive_key(password: &[u8], salt: &[u8; SALT_SIZE]) -> Result<MasterKey> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(password, salt, &mut key)
        .map_err(|e| KuraError::Crypto(format!("key derivation failed: {}", e)))?;
    Ok(MasterKey::new(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let k1 = derive_key(b"hunter2", &salt).unwrap();
        let k2 = derive_key(b"hunter2", &salt).unwrap();
        assert_eq!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_different_password_different_key() {
        let salt = [7u8; SALT_SIZE];
        let k1 = derive_key(b"hunter2", &salt).unwrap();
        let k2 = derive_key(b"hunter3", &salt).unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_different_salt_different_key() {
        let k1 = derive_key(b"pw", &[1u8; SALT_SIZE]).unwrap();
        let k2 = derive_key(b"pw", &[2u8; SALT_SIZE]).unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }
}
