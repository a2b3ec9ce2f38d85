//! Keyed AEAD ciphers for tunnel traffic
//!
//! Two algorithms are supported: AES-256-GCM (the default for short-lived
//! per-request tunnels) and ChaCha20-Poly1305 (the default for persistent
//! multiplexed tunnels). Both use 32-byte keys and 12-byte nonces.
//!
//! Key material is derived from a small integer key id shared with the
//! remote endpoint: `SHA-256("<template>-<key_id>")`. Sealed output is
//! `nonce || ciphertext+tag` with a fresh random nonce per message; the
//! framing layer above prepends the length prefix.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CryptoError;

/// AEAD key size (256 bits)
pub const KEY_LEN: usize = 32;

/// AEAD nonce size (96 bits)
pub const NONCE_LEN: usize = 12;

/// Poly1305 / GCM authentication tag size
pub const TAG_LEN: usize = 16;

/// Fixed template mixed with the integer key id to derive key material.
///
/// Must match the remote endpoint byte-for-byte.
const KEY_TEMPLATE: &str = "rust-gateway-tunnel-key";

/// Supported AEAD algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// AES-256-GCM (per-request tunnel default)
    Aes256Gcm,
    /// ChaCha20-Poly1305 (multiplexed tunnel default)
    ChaCha20Poly1305,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aes256Gcm => write!(f, "aes-256-gcm"),
            Self::ChaCha20Poly1305 => write!(f, "chacha20-poly1305"),
        }
    }
}

/// Derive a 32-byte key from the shared integer key id.
///
/// The schedule is deliberately simple: both ends hash the same fixed
/// template string suffixed with the decimal key id.
#[must_use]
pub fn derive_key(key_id: u32) -> [u8; KEY_LEN] {
    let material = format!("{KEY_TEMPLATE}-{key_id}");
    let digest = Sha256::digest(material.as_bytes());
    digest.into()
}

enum CipherInner {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

/// A keyed AEAD cipher.
///
/// `Cipher` is cheap to share behind an `Arc` and is safe for concurrent
/// use: sealing draws a fresh random nonce per call and keeps no counter
/// state.
pub struct Cipher {
    inner: CipherInner,
    algorithm: Algorithm,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

impl Cipher {
    /// Create a cipher for `algorithm` keyed by `key_id`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if the derived key cannot be
    /// loaded (which would indicate an algorithm/key-size mismatch).
    pub fn new(key_id: u32, algorithm: Algorithm) -> Result<Self, CryptoError> {
        let key = derive_key(key_id);
        Self::from_key(&key, algorithm)
    }

    /// Create a cipher from raw key material.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if `key` is not 32 bytes.
    pub fn from_key(key: &[u8], algorithm: Algorithm) -> Result<Self, CryptoError> {
        let inner = match algorithm {
            Algorithm::Aes256Gcm => {
                let aes = Aes256Gcm::new_from_slice(key).map_err(|_| {
                    CryptoError::InvalidKeyLength {
                        algorithm: "aes-256-gcm",
                    }
                })?;
                CipherInner::Aes(Box::new(aes))
            }
            Algorithm::ChaCha20Poly1305 => {
                let chacha = ChaCha20Poly1305::new_from_slice(key).map_err(|_| {
                    CryptoError::InvalidKeyLength {
                        algorithm: "chacha20-poly1305",
                    }
                })?;
                CipherInner::ChaCha(Box::new(chacha))
            }
        };
        Ok(Self { inner, algorithm })
    }

    /// The algorithm this cipher was constructed with
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Seal `plaintext`, returning `nonce || ciphertext+tag`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::SealFailed` if the AEAD backend rejects the
    /// input (only possible for pathological plaintext lengths).
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = match &self.inner {
            CipherInner::Aes(aes) => aes
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                .map_err(|_| CryptoError::SealFailed)?,
            CipherInner::ChaCha(chacha) => chacha
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                .map_err(|_| CryptoError::SealFailed)?,
        };

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open `nonce || ciphertext+tag` produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::CiphertextTooShort` for inputs shorter than
    /// nonce + tag, and `CryptoError::Authentication` for any tag mismatch
    /// (wrong key, flipped bit, truncation past the header).
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::CiphertextTooShort(data.len()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);

        match &self.inner {
            CipherInner::Aes(aes) => aes
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Authentication),
            CipherInner::ChaCha(chacha) => chacha
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Authentication),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_deterministic() {
        assert_eq!(derive_key(125), derive_key(125));
        assert_ne!(derive_key(125), derive_key(126));
    }

    #[test]
    fn test_seal_open_roundtrip_both_algorithms() {
        for algo in [Algorithm::Aes256Gcm, Algorithm::ChaCha20Poly1305] {
            let cipher = Cipher::new(125, algo).unwrap();
            let plaintext = b"this is a secret message that needs to be encrypted";

            let sealed = cipher.seal(plaintext).unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + TAG_LEN);
            assert_ne!(&sealed[NONCE_LEN..], plaintext.as_slice());

            let opened = cipher.open(&sealed).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_nonces_are_fresh() {
        let cipher = Cipher::new(1, Algorithm::ChaCha20Poly1305).unwrap();
        let a = cipher.seal(b"same input").unwrap();
        let b = cipher.seal(b"same input").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_wrong_key() {
        let sealer = Cipher::new(125, Algorithm::Aes256Gcm).unwrap();
        let opener = Cipher::new(126, Algorithm::Aes256Gcm).unwrap();

        let sealed = sealer.seal(b"another secret message").unwrap();
        assert!(matches!(
            opener.open(&sealed),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_open_tampered_ciphertext() {
        let cipher = Cipher::new(125, Algorithm::ChaCha20Poly1305).unwrap();
        let mut sealed = cipher.seal(b"message that will be tampered").unwrap();

        let mid = sealed.len() / 2;
        sealed[mid] ^= 0x01;

        assert!(matches!(
            cipher.open(&sealed),
            Err(CryptoError::Authentication)
        ));
    }

    #[test]
    fn test_open_too_short() {
        let cipher = Cipher::new(125, Algorithm::Aes256Gcm).unwrap();
        let result = cipher.open(&[0u8; NONCE_LEN + TAG_LEN - 1]);
        assert!(matches!(result, Err(CryptoError::CiphertextTooShort(_))));
    }

    #[test]
    fn test_algorithms_are_incompatible() {
        let key = derive_key(7);
        let aes = Cipher::from_key(&key, Algorithm::Aes256Gcm).unwrap();
        let chacha = Cipher::from_key(&key, Algorithm::ChaCha20Poly1305).unwrap();

        let sealed = aes.seal(b"cross-algorithm").unwrap();
        assert!(chacha.open(&sealed).is_err());
    }
}
