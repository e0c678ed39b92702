use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng},
};
use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

const NONCE_LEN: usize = 12;

/// AES-256-GCM sealing for credentials at rest. The key comes from the
/// process environment and is never stored alongside ciphertext.
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl Sealer {
    pub fn from_base64(key_b64: &str) -> Result<Self> {
        let key_bytes = BASE64
            .decode(key_b64.trim())
            .context("CREDENTIAL_SEAL_KEY is not valid base64")?;
        if key_bytes.len() != 32 {
            bail!(
                "CREDENTIAL_SEAL_KEY must decode to 32 bytes, got {}",
                key_bytes.len()
            );
        }
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
        })
    }

    /// Output layout: nonce (12 bytes) || ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| anyhow::anyhow!("credential seal failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Fails without exposing any of the sealed bytes.
    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_LEN {
            bail!("sealed credential is truncated");
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| anyhow::anyhow!("credential unseal failed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> String {
        BASE64.encode([7u8; 32])
    }

    #[test]
    fn seal_round_trip() {
        let sealer = Sealer::from_base64(&key()).unwrap();
        let sealed = sealer.seal(b"apiVersion: v1").unwrap();
        assert_ne!(&sealed[NONCE_LEN..], b"apiVersion: v1");
        assert_eq!(sealer.unseal(&sealed).unwrap(), b"apiVersion: v1");
    }

    #[test]
    fn nonces_differ_per_sealing() {
        let sealer = Sealer::from_base64(&key()).unwrap();
        let a = sealer.seal(b"same").unwrap();
        let b = sealer.seal(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_key_fails_without_panicking() {
        let sealer = Sealer::from_base64(&key()).unwrap();
        let other = Sealer::from_base64(&BASE64.encode([8u8; 32])).unwrap();
        let sealed = sealer.seal(b"secret").unwrap();
        assert!(other.unseal(&sealed).is_err());
    }

    #[test]
    fn rejects_short_keys() {
        assert!(Sealer::from_base64(&BASE64.encode([1u8; 16])).is_err());
        assert!(Sealer::from_base64("not base64 !!!").is_err());
    }

    #[test]
    fn rejects_truncated_ciphertext() {
        let sealer = Sealer::from_base64(&key()).unwrap();
        assert!(sealer.unseal(&[0u8; 4]).is_err());
    }
}
