//! AES-256-GCM encryption for stored API keys
//!
//! Wire format is `ivHex:tagHex:cipherHex` with a 12-byte IV and a 16-byte
//! authentication tag, each hex-encoded. The key is a 64-character hex
//! string (32 bytes) supplied through configuration and validated at
//! startup.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use rand::RngCore;

use crate::error::CipherError;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_HEX_LEN: usize = 64;

/// Encrypts and decrypts provider secrets.
///
/// Construction fails fast on a malformed key so a bad deployment surfaces
/// at startup rather than on the first credential lookup.
#[derive(Clone)]
pub struct SecretCipher {
    key: Key<Aes256Gcm>,
}

impl std::fmt::Debug for SecretCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl SecretCipher {
    /// Build a cipher from a 64-character hex key.
    pub fn from_hex_key(key_hex: &str) -> Result<Self, CipherError> {
        if key_hex.len() != KEY_HEX_LEN {
            return Err(CipherError::InvalidKey(format!(
                "expected {KEY_HEX_LEN} hex characters, got {}",
                key_hex.len()
            )));
        }
        let bytes = hex::decode(key_hex)
            .map_err(|_| CipherError::InvalidKey("key is not valid hex".to_string()))?;
        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(&bytes),
        })
    }

    /// Generate a fresh random key in the hex form `from_hex_key` accepts.
    pub fn generate_key() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }

    /// Encrypt a plaintext secret into `ivHex:tagHex:cipherHex`.
    ///
    /// A fresh random IV is drawn per call; encrypting the same plaintext
    /// twice yields different output.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let cipher = Aes256Gcm::new(&self.key);

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let nonce = Nonce::from_slice(&iv);

        // The aead crate appends the tag to the ciphertext; the wire format
        // carries them in separate segments.
        let mut sealed = cipher
            .encrypt(nonce, Payload::from(plaintext.as_bytes()))
            .map_err(|_| CipherError::EncryptFailed)?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(sealed)
        ))
    }

    /// Decrypt an `ivHex:tagHex:cipherHex` payload.
    ///
    /// Structural problems (wrong segment count, bad hex, wrong IV or tag
    /// length) report `Malformed`; a structurally valid payload whose tag
    /// does not verify reports `TagMismatch`.
    pub fn decrypt(&self, payload: &str) -> Result<String, CipherError> {
        let parts: Vec<&str> = payload.split(':').collect();
        if parts.len() != 3 {
            return Err(CipherError::Malformed(format!(
                "expected 3 segments, got {}",
                parts.len()
            )));
        }

        let iv = hex::decode(parts[0])
            .map_err(|_| CipherError::Malformed("iv segment is not valid hex".to_string()))?;
        let tag = hex::decode(parts[1])
            .map_err(|_| CipherError::Malformed("tag segment is not valid hex".to_string()))?;
        let ciphertext = hex::decode(parts[2]).map_err(|_| {
            CipherError::Malformed("ciphertext segment is not valid hex".to_string())
        })?;

        if iv.len() != IV_LEN {
            return Err(CipherError::Malformed(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        if tag.len() != TAG_LEN {
            return Err(CipherError::Malformed(format!(
                "tag must be {TAG_LEN} bytes, got {}",
                tag.len()
            )));
        }

        let cipher = Aes256Gcm::new(&self.key);
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(nonce, Payload::from(sealed.as_slice()))
            .map_err(|_| CipherError::TagMismatch)?;

        String::from_utf8(plaintext)
            .map_err(|_| CipherError::Malformed("plaintext is not valid utf-8".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> SecretCipher {
        SecretCipher::from_hex_key(&SecretCipher::generate_key()).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let c = cipher();
        let sealed = c.encrypt("sk-ant-REDACTED").unwrap();
        assert_eq!(c.decrypt(&sealed).unwrap(), "sk-ant-REDACTED");
    }

    #[test]
    fn test_round_trip_empty_and_colon_plaintext() {
        let c = cipher();
        // The payload format uses ':' as a separator; plaintext containing
        // ':' must still round-trip because only hex reaches the wire.
        for plaintext in ["", "a:b:c:d", "::::"] {
            let sealed = c.encrypt(plaintext).unwrap();
            assert_eq!(c.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_encrypt_is_randomized() {
        let c = cipher();
        let a = c.encrypt("secret").unwrap();
        let b = c.encrypt("secret").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_payload_shape() {
        let c = cipher();
        let sealed = c.encrypt("secret").unwrap();
        let parts: Vec<&str> = sealed.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), IV_LEN * 2);
        assert_eq!(parts[1].len(), TAG_LEN * 2);
    }

    #[test]
    fn test_corrupted_ciphertext_fails_tag_check() {
        let c = cipher();
        let sealed = c.encrypt("secret").unwrap();
        let (prefix, last) = sealed.split_at(sealed.len() - 1);
        let flipped = if last == "0" { "1" } else { "0" };
        let corrupted = format!("{prefix}{flipped}");

        assert!(matches!(
            c.decrypt(&corrupted),
            Err(CipherError::TagMismatch)
        ));
    }

    #[test]
    fn test_wrong_key_fails_tag_check() {
        let sealed = cipher().encrypt("secret").unwrap();
        assert!(matches!(
            cipher().decrypt(&sealed),
            Err(CipherError::TagMismatch)
        ));
    }

    #[test]
    fn test_malformed_payloads_rejected() {
        let c = cipher();
        for payload in [
            "",
            "onlyonesegment",
            "two:segments",
            "a:b:c:d",
            "zz:00:00",
            "000000000000000000000000:zz:00",
        ] {
            assert!(matches!(c.decrypt(payload), Err(CipherError::Malformed(_))));
        }

        // Structurally hex but wrong segment lengths.
        let short_iv = format!("{}:{}:{}", "00", "0".repeat(32), "00");
        assert!(matches!(c.decrypt(&short_iv), Err(CipherError::Malformed(_))));
        let short_tag = format!("{}:{}:{}", "0".repeat(24), "00", "00");
        assert!(matches!(c.decrypt(&short_tag), Err(CipherError::Malformed(_))));
    }

    #[test]
    fn test_invalid_keys_rejected() {
        assert!(matches!(
            SecretCipher::from_hex_key("too-short"),
            Err(CipherError::InvalidKey(_))
        ));
        let non_hex = "g".repeat(64);
        assert!(matches!(
            SecretCipher::from_hex_key(&non_hex),
            Err(CipherError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let rendered = format!("{:?}", cipher());
        assert!(rendered.contains("[REDACTED]"));
    }
}
