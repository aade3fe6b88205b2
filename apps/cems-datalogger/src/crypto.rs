use crate::time::signature_timestamp;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockEncryptMut, KeyInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::{Digest, Sha256};
use thiserror::Error;

type Aes256EcbEnc = ecb::Encryptor<aes::Aes256>;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("public key is neither SPKI nor PKCS#1 PEM")]
    PublicKey,
    #[error("rsa encryption failed: {0}")]
    Rsa(#[from] rsa::Error),
}

/// AES-256-ECB with PKCS#7, key = SHA-256(token_id), base64 output.
pub fn encrypt_payload(plain: &str, token_id: &str) -> String {
    let key = Sha256::digest(token_id.as_bytes());
    let cipher = Aes256EcbEnc::new(&key).encrypt_padded_vec_mut::<Pkcs7>(plain.as_bytes());
    STANDARD.encode(cipher)
}

pub fn load_public_key(pem: &str) -> Result<RsaPublicKey, CryptoError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|_| CryptoError::PublicKey)
}

pub fn signature_message(token_id: &str, now: DateTime<Utc>) -> String {
    format!("{}$*{}", token_id, signature_timestamp(now))
}

/// RSA-OAEP (SHA-256, MGF1-SHA-256) over `"{token_id}$*{site time}"`, base64.
pub fn generate_signature(
    token_id: &str,
    key: &RsaPublicKey,
    now: DateTime<Utc>,
) -> Result<String, CryptoError> {
    let message = signature_message(token_id, now);
    let encrypted = key.encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), message.as_bytes())?;
    Ok(STANDARD.encode(encrypted))
}

/// Token plus parsed regulator key; produces a fresh signature per attempt.
#[derive(Clone, Debug)]
pub struct Signer {
    token_id: String,
    key: RsaPublicKey,
}

impl Signer {
    pub fn new(token_id: impl Into<String>, public_key_pem: &str) -> Result<Self, CryptoError> {
        Ok(Self {
            token_id: token_id.into(),
            key: load_public_key(public_key_pem)?,
        })
    }

    #[cfg(test)]
    pub fn from_key(token_id: impl Into<String>, key: RsaPublicKey) -> Self {
        Self {
            token_id: token_id.into(),
            key,
        }
    }

    #[cfg(test)]
    pub fn token_id(&self) -> &str {
        &self.token_id
    }

    pub fn sign(&self, now: DateTime<Utc>) -> Result<String, CryptoError> {
        generate_signature(&self.token_id, &self.key, now)
    }
}

/// Inverse of `encrypt_payload`; the device itself never decrypts.
#[cfg(test)]
pub(crate) fn decrypt_payload(encoded: &str, token_id: &str) -> Option<String> {
    use aes::cipher::BlockDecryptMut;
    let key = Sha256::digest(token_id.as_bytes());
    let cipher = STANDARD.decode(encoded.trim()).ok()?;
    let plain = ecb::Decryptor::<aes::Aes256>::new(&key)
        .decrypt_padded_vec_mut::<Pkcs7>(&cipher)
        .ok()?;
    String::from_utf8(plain).ok()
}

/// Key generation is slow; every test in the crate shares one 2048-bit pair.
#[cfg(test)]
pub(crate) fn test_signer(token_id: &str) -> (Signer, rsa::RsaPrivateKey) {
    static KEY: std::sync::OnceLock<rsa::RsaPrivateKey> = std::sync::OnceLock::new();
    let private = KEY
        .get_or_init(|| rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
        .clone();
    let public = RsaPublicKey::from(&private);
    (Signer::from_key(token_id, public), private)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "Hvg_LrxeePXexh7TM76jQqWsWGRV4M4gvX1_tvKDMN4=";
    const REGULATOR_TEST_KEY: &str = "-----BEGIN PUBLIC KEY-----
MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEA1O3KxMEcKajtHHAW+IlQ
7aHFTZGeC3nHq/ZomJtcmBQ9+hd4Epq7fiEQhsDpItFu3y1TmXtozHNqXFxRqllK
Zw8e9li3RrbGRZBFrKy1wQ70XUr3uv0w4TV0cHgvAlnLXdAkaGDyYDf+fVsqIYJD
GFOIzGYCdzY5vMNpEidIIEqKsCUyJqAc/wf2eIwKm4bhca+YW670532p4RGYapyR
3Hjs90hAH+8I4V8Oklw8NEtkX+acSlcKd+FQcUA14IWBrX+fB6bhkA2jyzsfVXVr
VVxLYJ89LBETrXSd5eKLTgdNJNSiSrIqjSNCgxsNGuauccYZnef/QmVD2/YI60kE
pwIDAQAB
-----END PUBLIC KEY-----";

    #[test]
    fn payload_round_trips() {
        let plain = r#"{"data":[{"stationId":"station_8203"}]}"#;
        let encoded = encrypt_payload(plain, TOKEN);
        assert_ne!(encoded, plain);
        assert_eq!(decrypt_payload(&encoded, TOKEN).unwrap(), plain);
    }

    #[test]
    fn block_aligned_plaintext_gets_a_full_padding_block() {
        let plain = "0123456789abcdef";
        let raw = STANDARD.decode(encrypt_payload(plain, TOKEN)).unwrap();
        assert_eq!(raw.len(), 32);
    }

    #[test]
    fn wrong_token_does_not_decrypt_cleanly() {
        let encoded = encrypt_payload("{\"a\":1}", TOKEN);
        let decoded = decrypt_payload(&encoded, "other-token");
        assert!(decoded.map(|plain| plain != "{\"a\":1}").unwrap_or(true));
    }

    #[test]
    fn ciphertext_length_and_round_trip_across_inputs() {
        let tokens = [TOKEN, "station_8203", "t"];
        let inputs = [
            "",
            "x",
            "0123456789abcde",
            "0123456789abcdef",
            "0123456789abcdef0123456789abcdef",
            r#"{"parameter":"SO₂","unit":"µg/m³"}"#,
        ];
        for token in tokens {
            for plain in inputs {
                let encoded = encrypt_payload(plain, token);
                let raw = STANDARD.decode(&encoded).unwrap();
                assert_eq!(raw.len(), (plain.len() / 16 + 1) * 16, "{plain:?}");
                assert_eq!(decrypt_payload(&encoded, token).as_deref(), Some(plain));
            }
        }
        assert_ne!(encrypt_payload("x", tokens[0]), encrypt_payload("x", tokens[1]));
    }

    #[test]
    fn encryption_is_deterministic_per_token() {
        assert_eq!(encrypt_payload("x", TOKEN), encrypt_payload("x", TOKEN));
    }

    #[test]
    fn regulator_spki_key_loads() {
        let signer = Signer::new(TOKEN, REGULATOR_TEST_KEY).unwrap();
        let signature = signer.sign(Utc::now()).unwrap();
        assert_eq!(STANDARD.decode(signature).unwrap().len(), 256);
    }

    #[test]
    fn garbage_key_is_rejected() {
        assert!(matches!(
            Signer::new(TOKEN, "not a key"),
            Err(CryptoError::PublicKey)
        ));
    }

    #[test]
    fn signature_decrypts_to_token_and_site_time() {
        let (signer, private) = test_signer(TOKEN);
        let now = DateTime::parse_from_rfc3339("2025-03-10T01:07:13.042Z")
            .unwrap()
            .with_timezone(&Utc);
        let signature = signer.sign(now).unwrap();
        let raw = STANDARD.decode(signature).unwrap();
        let message = private.decrypt(Oaep::new::<Sha256>(), &raw).unwrap();
        assert_eq!(
            String::from_utf8(message).unwrap(),
            format!("{TOKEN}$*2025-03-10 06:37:13.042")
        );
    }
}
