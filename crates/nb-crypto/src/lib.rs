//! Encrypted payload attributes.
//!
//! A protected attribute travels as `base64(b64(c1).b64(c2)...)` where
//! each `cN` is an RSA-encrypted chunk of the base64-encoded plaintext.
//! Chunks are 117 bytes: the PKCS#1 v1.5 ceiling for 1024-bit keys. This
//! is a pluggable capability layered on top of the envelope payload, not
//! part of the core control flow.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

/// PKCS#1 v1.5 payload limit for a 1024-bit modulus (128 - 11 bytes).
pub const CHUNK_SIZE: usize = 117;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("RSA operation failed: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("invalid key material: {0}")]
    Key(String),

    #[error("malformed ciphertext: {0}")]
    Format(#[from] base64::DecodeError),

    #[error("decrypted attribute is not valid UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Producer side: seals attribute values with the recipient's public key.
pub struct AttributeEncrypter {
    key: RsaPublicKey,
}

impl AttributeEncrypter {
    pub fn new(key: RsaPublicKey) -> Self {
        Self { key }
    }

    pub fn from_public_key_pem(pem: &str) -> Result<Self, CryptoError> {
        RsaPublicKey::from_public_key_pem(pem)
            .map(Self::new)
            .map_err(|error| CryptoError::Key(error.to_string()))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let encoded = BASE64.encode(plaintext.as_bytes());
        let mut rng = rand::thread_rng();

        let mut sealed_chunks = Vec::new();
        for chunk in encoded.as_bytes().chunks(CHUNK_SIZE) {
            let ciphertext = self.key.encrypt(&mut rng, Pkcs1v15Encrypt, chunk)?;
            sealed_chunks.push(BASE64.encode(ciphertext));
        }

        Ok(BASE64.encode(sealed_chunks.join(".")))
    }
}

/// Consumer side: opens attribute values with the matching private key.
pub struct AttributeDecrypter {
    key: RsaPrivateKey,
}

impl AttributeDecrypter {
    pub fn new(key: RsaPrivateKey) -> Self {
        Self { key }
    }

    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        RsaPrivateKey::from_pkcs8_pem(pem)
            .map(Self::new)
            .map_err(|error| CryptoError::Key(error.to_string()))
    }

    pub fn decrypt(&self, attribute: &str) -> Result<String, CryptoError> {
        let joined = String::from_utf8(BASE64.decode(attribute)?)?;

        let mut encoded = Vec::new();
        for sealed in joined.split('.') {
            let ciphertext = BASE64.decode(sealed)?;
            let chunk = self.key.decrypt(Pkcs1v15Encrypt, &ciphertext)?;
            encoded.extend_from_slice(&chunk);
        }

        let plaintext = BASE64.decode(&encoded)?;
        Ok(String::from_utf8(plaintext)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (AttributeEncrypter, AttributeDecrypter) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).expect("generate key");
        let public = RsaPublicKey::from(&private);
        (AttributeEncrypter::new(public), AttributeDecrypter::new(private))
    }

    #[test]
    fn short_attribute_round_trips() {
        let (encrypter, decrypter) = keypair();
        let sealed = encrypter.encrypt("4111-1111-1111-1111").unwrap();
        assert_eq!(decrypter.decrypt(&sealed).unwrap(), "4111-1111-1111-1111");
    }

    #[test]
    fn long_attribute_spans_multiple_chunks_and_round_trips() {
        let (encrypter, decrypter) = keypair();
        let plaintext = "x".repeat(500);

        let sealed = encrypter.encrypt(&plaintext).unwrap();
        let joined = String::from_utf8(BASE64.decode(&sealed).unwrap()).unwrap();
        assert!(
            joined.split('.').count() > 1,
            "500 chars of base64 must not fit one 117-byte chunk"
        );

        assert_eq!(decrypter.decrypt(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn unicode_survives_the_codec() {
        let (encrypter, decrypter) = keypair();
        let plaintext = "grüße aus köln ✓";
        let sealed = encrypter.encrypt(plaintext).unwrap();
        assert_eq!(decrypter.decrypt(&sealed).unwrap(), plaintext);
    }

    #[test]
    fn sealed_value_is_opaque_base64() {
        let (encrypter, _) = keypair();
        let sealed = encrypter.encrypt("secret").unwrap();
        assert!(!sealed.contains("secret"));
        assert!(BASE64.decode(&sealed).is_ok());
    }

    #[test]
    fn garbage_input_is_a_format_error() {
        let (_, decrypter) = keypair();
        assert!(matches!(
            decrypter.decrypt("@@not-base64@@"),
            Err(CryptoError::Format(_))
        ));
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let (encrypter, _) = keypair();
        let (_, other_decrypter) = keypair();
        let sealed = encrypter.encrypt("secret").unwrap();
        assert!(other_decrypter.decrypt(&sealed).is_err());
    }
}
