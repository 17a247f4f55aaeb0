use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
use aes_gcm_siv::{Aes256GcmSiv, Nonce};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::CryptoBackend;
use crate::error::{KuraError, Result};

/// 256-bit master key. Key material is zeroed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    key: [u8; 32],
}

impl MasterKey {
    pub fn new(key: [u8; 32]) -> Self {
        MasterKey { key }
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != 32 {
            return Err(KuraError::Crypto("master key must be 32 bytes".into()));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(slice);
        Ok(MasterKey { key })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

const NONCE_SIZE: usize = 12;
const TAG_OVERHEAD: usize = 16;

/// AES-256-GCM-SIV backend.
///
/// GCM-SIV is nonce-misuse resistant, so even a repeated counter (possible
/// only after a crash between meta flushes) does not break confidentiality.
pub struct AeadBackend {
    cipher: Aes256GcmSiv,
}

impl AeadBackend {
    pub fn new(master_key: &MasterKey) -> Self {
        let cipher = Aes256GcmSiv::new_from_slice(master_key.as_bytes()).expect("valid key size");
        AeadBackend { cipher }
    }

    fn build_nonce(domain: u32, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..4].copy_from_slice(&domain.to_le_bytes());
        nonce[4..12].copy_from_slice(&counter.to_le_bytes());
        nonce
    }
}

impl CryptoBackend for AeadBackend {
    fn encrypt(&self, domain: u32, counter: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = Self::build_nonce(domain, counter);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let ciphertext = self
            .cipher
            .encrypt(nonce, payload)
            .map_err(|e| KuraError::Crypto(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, aad: &[u8], buf: &[u8]) -> Result<Vec<u8>> {
        if buf.len() < NONCE_SIZE + TAG_OVERHEAD {
            return Err(KuraError::Crypto("ciphertext too short".into()));
        }
        let nonce = Nonce::from_slice(&buf[..NONCE_SIZE]);
        let payload = Payload {
            msg: &buf[NONCE_SIZE..],
            aad,
        };
        self.cipher
            .decrypt(nonce, payload)
            .map_err(|_| KuraError::Crypto("authentication failed".into()))
    }

    fn hash(&self, data: &[u8]) -> [u8; 32] {
        let digest = Sha256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    fn overhead(&self) -> usize {
        NONCE_SIZE + TAG_OVERHEAD
    }
}

/// Encryption overhead without a backend instance (nonce + tag).
pub const fn aead_overhead() -> usize {
    NONCE_SIZE + TAG_OVERHEAD
}
