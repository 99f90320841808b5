//! Passphrase-based codec for single-patient transfer files.
//!
//! Stand-alone and store-agnostic: the payload is an opaque string. A 256-bit
//! key is derived from the passphrase with PBKDF2-HMAC-SHA256 and the payload
//! is sealed with AES-256-GCM, so tampering is detected rather than producing
//! garbled plaintext. The result is framed as a small JSON envelope holding
//! the salt, the nonce and the ciphertext, each base64-encoded.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine as _, engine::general_purpose};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

const KEY_SIZE: usize = 32; // 256 bits
const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12; // 96 bits for GCM

/// PBKDF2 cost factor. Deliberately slow to make offline passphrase guessing
/// expensive. Not recorded in the envelope, so changing it invalidates every
/// previously written export file.
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Opaque decryption failure.
///
/// A wrong passphrase, a flipped bit and a malformed envelope all produce this
/// same error, so an attacker cannot use it to validate passphrase guesses.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("could not decrypt: wrong passphrase or corrupted file")]
pub struct CryptoError;

/// Everything a recipient needs, besides the passphrase, to decrypt a
/// transfer file. All three fields are base64-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub salt: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl Envelope {
    pub fn to_json(&self) -> Result<String, CryptoError> {
        serde_json::to_string(self).map_err(|_| CryptoError)
    }

    pub fn from_json(raw: &str) -> Result<Self, CryptoError> {
        serde_json::from_str(raw).map_err(|_| CryptoError)
    }
}

fn derive_key(passphrase: &str, salt: &[u8]) -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, &mut key);
    key
}

/// Encrypt a serialized aggregate under a passphrase.
///
/// A fresh random salt and nonce are drawn on every call, so encrypting the
/// same plaintext twice never yields the same envelope.
pub fn encrypt(plaintext: &str, passphrase: &str) -> Result<Envelope, CryptoError> {
    let mut salt = [0u8; SALT_SIZE];
    OsRng.fill_bytes(&mut salt);
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
        .map_err(|_| CryptoError)?;

    Ok(Envelope {
        salt: general_purpose::STANDARD.encode(salt),
        nonce: general_purpose::STANDARD.encode(nonce_bytes),
        ciphertext: general_purpose::STANDARD.encode(ciphertext),
    })
}

/// Recover the plaintext from an envelope. Fails with the generic
/// [`CryptoError`] on a wrong passphrase or any tampering.
pub fn decrypt(envelope: &Envelope, passphrase: &str) -> Result<String, CryptoError> {
    let salt = general_purpose::STANDARD
        .decode(&envelope.salt)
        .map_err(|_| CryptoError)?;
    let nonce = general_purpose::STANDARD
        .decode(&envelope.nonce)
        .map_err(|_| CryptoError)?;
    let ciphertext = general_purpose::STANDARD
        .decode(&envelope.ciphertext)
        .map_err(|_| CryptoError)?;
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError);
    }

    let key = derive_key(passphrase, &salt);
    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|_| CryptoError)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_restores_plaintext() {
        let envelope = encrypt("hello world", "pw1234").expect("encrypt");
        assert_eq!(decrypt(&envelope, "pw1234").expect("decrypt"), "hello world");
    }

    #[test]
    fn roundtrip_handles_empty_and_non_ascii() {
        for plaintext in ["", "é à ü — 東京 🩺", "ligne 1\nligne 2"] {
            let envelope = encrypt(plaintext, "phrase secrète").expect("encrypt");
            assert_eq!(
                decrypt(&envelope, "phrase secrète").expect("decrypt"),
                plaintext
            );
        }
    }

    #[test]
    fn wrong_passphrase_is_rejected() {
        let envelope = encrypt("hello world", "pw1234").expect("encrypt");
        assert_eq!(decrypt(&envelope, "pw1235"), Err(CryptoError));
    }

    #[test]
    fn flipped_ciphertext_bit_is_rejected() {
        let envelope = encrypt("sensitive record", "pw1234").expect("encrypt");
        let mut raw = general_purpose::STANDARD
            .decode(&envelope.ciphertext)
            .expect("decode");
        for i in 0..raw.len() {
            raw[i] ^= 0x01;
            let tampered = Envelope {
                ciphertext: general_purpose::STANDARD.encode(&raw),
                ..envelope.clone()
            };
            assert_eq!(decrypt(&tampered, "pw1234"), Err(CryptoError));
            raw[i] ^= 0x01;
        }
    }

    #[test]
    fn fresh_salt_and_nonce_every_call() {
        let first = encrypt("same plaintext", "same passphrase").expect("encrypt");
        let second = encrypt("same plaintext", "same passphrase").expect("encrypt");
        assert_ne!(first.salt, second.salt);
        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn envelope_json_roundtrip() {
        let envelope = encrypt("payload", "pw").expect("encrypt");
        let parsed = Envelope::from_json(&envelope.to_json().expect("to_json")).expect("from_json");
        assert_eq!(parsed, envelope);
        assert_eq!(decrypt(&parsed, "pw").expect("decrypt"), "payload");
    }

    #[test]
    fn malformed_envelope_is_rejected() {
        assert_eq!(Envelope::from_json("not json"), Err(CryptoError));
        assert_eq!(Envelope::from_json(r#"{"salt":"AA=="}"#), Err(CryptoError));

        let garbage = Envelope {
            salt: "%%%".to_string(),
            nonce: "AAAA".to_string(),
            ciphertext: "AAAA".to_string(),
        };
        assert_eq!(decrypt(&garbage, "pw"), Err(CryptoError));
    }
}
