//! WeCom callback crypto.
//!
//! WeCom signs every callback with SHA-1 over the sorted
//! `[token, timestamp, nonce, ciphertext]` and encrypts payloads with
//! AES-256-CBC keyed by the app's `EncodingAESKey`.

use aes::cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding};
use base64::{
    Engine, alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig, general_purpose::STANDARD},
};
use serde::Deserialize;
use sha1::{Digest, Sha1};

#[cfg(test)]
use mockall::automock;

use crate::error::{RelayError, Result};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// WeCom pads plaintext to a multiple of 32 bytes, not the AES block size.
const PKCS7_BLOCK: usize = 32;
const RANDOM_PREFIX_LEN: usize = 16;
const LENGTH_FIELD_LEN: usize = 4;

/// `EncodingAESKey` is unpadded base64 whose last character may carry
/// non-zero trailing bits.
const AES_KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Verification and decryption of callback payloads.
#[cfg_attr(test, automock)]
pub trait MessageCrypto: Send + Sync + 'static {
    /// Verify the URL handshake and return the decrypted echo string.
    fn verify_url(&self, signature: &str, timestamp: &str, nonce: &str, echostr: &str)
    -> Result<String>;

    /// Verify and decrypt a callback body, returning the plaintext XML.
    fn decrypt_message(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        body: &[u8],
    ) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct EncryptedEnvelope {
    #[serde(rename = "Encrypt")]
    encrypt: String,
}

pub struct WxBizMsgCrypt {
    token: String,
    key: [u8; 32],
    receive_id: String,
}

impl WxBizMsgCrypt {
    pub fn new(token: &str, encoding_aes_key: &str, receive_id: &str) -> Result<Self> {
        let decoded = AES_KEY_ENGINE
            .decode(encoding_aes_key.trim())
            .map_err(|e| RelayError::Config(format!("invalid EncodingAESKey: {e}")))?;
        let key: [u8; 32] = decoded
            .try_into()
            .map_err(|_| RelayError::Config("EncodingAESKey must decode to 32 bytes".into()))?;
        Ok(Self {
            token: token.to_string(),
            key,
            receive_id: receive_id.to_string(),
        })
    }

    fn verify_signature(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        ciphertext: &str,
    ) -> Result<()> {
        let expected = signature_of(&self.token, timestamp, nonce, ciphertext);
        if constant_time_eq(&expected, signature) {
            Ok(())
        } else {
            Err(RelayError::Crypto("signature mismatch".into()))
        }
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        let mut buf = STANDARD
            .decode(ciphertext.trim())
            .map_err(|e| RelayError::Crypto(format!("ciphertext is not base64: {e}")))?;
        if buf.is_empty() || buf.len() % 16 != 0 {
            return Err(RelayError::Crypto(format!(
                "ciphertext length {} is not a multiple of the block size",
                buf.len()
            )));
        }

        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.key[..16])
            .map_err(|e| RelayError::Crypto(format!("cipher init failed: {e}")))?;
        let plain = cipher
            .decrypt_padded_mut::<NoPadding>(&mut buf)
            .map_err(|e| RelayError::Crypto(format!("decrypt failed: {e}")))?;
        let plain = strip_pkcs7(plain)?;

        let header = RANDOM_PREFIX_LEN + LENGTH_FIELD_LEN;
        if plain.len() < header {
            return Err(RelayError::Crypto("plaintext too short".into()));
        }
        let mut len_bytes = [0u8; LENGTH_FIELD_LEN];
        len_bytes.copy_from_slice(&plain[RANDOM_PREFIX_LEN..header]);
        let end = header + u32::from_be_bytes(len_bytes) as usize;
        if end > plain.len() {
            return Err(RelayError::Crypto("message length exceeds plaintext".into()));
        }

        if &plain[end..] != self.receive_id.as_bytes() {
            return Err(RelayError::Crypto("receive id mismatch".into()));
        }

        String::from_utf8(plain[header..end].to_vec())
            .map_err(|e| RelayError::Crypto(format!("plaintext is not UTF-8: {e}")))
    }
}

impl MessageCrypto for WxBizMsgCrypt {
    fn verify_url(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        echostr: &str,
    ) -> Result<String> {
        self.verify_signature(signature, timestamp, nonce, echostr)?;
        self.decrypt(echostr)
    }

    fn decrypt_message(
        &self,
        signature: &str,
        timestamp: &str,
        nonce: &str,
        body: &[u8],
    ) -> Result<String> {
        let body = std::str::from_utf8(body)
            .map_err(|e| RelayError::Crypto(format!("body is not UTF-8: {e}")))?;
        let envelope: EncryptedEnvelope = quick_xml::de::from_str(body)?;
        self.verify_signature(signature, timestamp, nonce, &envelope.encrypt)?;
        self.decrypt(&envelope.encrypt)
    }
}

/// Lowercase hex SHA-1 of the sorted, concatenated parts.
fn signature_of(token: &str, timestamp: &str, nonce: &str, ciphertext: &str) -> String {
    let mut parts = [token, timestamp, nonce, ciphertext];
    parts.sort_unstable();
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}

fn strip_pkcs7(buf: &[u8]) -> Result<&[u8]> {
    let pad = buf.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > PKCS7_BLOCK || pad > buf.len() {
        return Err(RelayError::Crypto(format!("invalid padding byte {pad}")));
    }
    Ok(&buf[..buf.len() - pad])
}

/// Constant-time string comparison.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}
