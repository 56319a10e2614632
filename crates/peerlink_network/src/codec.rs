//! Envelope codec: AES-256-GCM under the shared network key, wrapped in
//! URL-safe base64 so tokens travel as plain HTTP bodies and JSON strings.

use std::fmt;
use std::str::FromStr;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::NetworkError;

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Why a token could not be turned back into plaintext.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("token is not valid base64: {0}")]
    Base64(String),

    #[error("token too short ({0} bytes)")]
    Truncated(usize),

    #[error("authentication failed (wrong network key or corrupted token)")]
    Authentication,

    #[error("plaintext is not valid UTF-8")]
    Utf8,

    #[error("plaintext is not valid JSON: {0}")]
    Json(String),
}

/// Why a plaintext could not be turned into a token.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("encryption failed")]
    Encryption,

    #[error("value could not be serialized: {0}")]
    Json(#[from] serde_json::Error),
}

/// The symmetric key shared by every node of one network.
#[derive(Clone)]
pub struct NetworkKey([u8; KEY_LEN]);

impl NetworkKey {
    /// Generate a fresh key in its textual (URL-safe base64) form, ready to
    /// be handed out of band to every member of a network.
    pub fn generate() -> String {
        let bytes: [u8; KEY_LEN] = rand::random();
        URL_SAFE.encode(bytes)
    }

    /// Parse a key from its textual form.
    pub fn parse(text: &str) -> Result<Self, NetworkError> {
        text.parse()
    }
}

impl FromStr for NetworkKey {
    type Err = NetworkError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let bytes = URL_SAFE
            .decode(text.trim())
            .map_err(|e| NetworkError::Validation(format!("Network key is not base64: {e}")))?;
        let key: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            NetworkError::Validation(format!(
                "Network key must be {KEY_LEN} bytes, got {}",
                b.len()
            ))
        })?;
        Ok(Self(key))
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(..)")
    }
}

/// Encrypts and decrypts wire payloads for one network.
#[derive(Clone)]
pub struct Codec {
    cipher: Aes256Gcm,
}

impl Codec {
    pub fn new(key: &NetworkKey) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
        Self { cipher }
    }

    /// Encrypt `plaintext` into a transport-safe token.
    pub fn encode(&self, plaintext: &str) -> Result<String, EncodeError> {
        let nonce_bytes: [u8; NONCE_LEN] = rand::random();
        let nonce = Nonce::from_slice(&nonce_bytes);

        // Only plaintexts beyond the GCM length limit (~64 GiB) fail here.
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| EncodeError::Encryption)?;

        let mut token = nonce_bytes.to_vec();
        token.extend_from_slice(&ciphertext);
        Ok(URL_SAFE.encode(token))
    }

    /// Reverse [`encode`](Self::encode).
    pub fn decode(&self, token: &str) -> Result<String, DecodeError> {
        let data = URL_SAFE
            .decode(token.trim())
            .map_err(|e| DecodeError::Base64(e.to_string()))?;
        if data.len() <= NONCE_LEN {
            return Err(DecodeError::Truncated(data.len()));
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| DecodeError::Authentication)?;

        String::from_utf8(plaintext).map_err(|_| DecodeError::Utf8)
    }

    /// Serialize `value` to JSON and encode it.
    pub fn encode_json<T: Serialize>(&self, value: &T) -> Result<String, EncodeError> {
        self.encode(&serde_json::to_string(value)?)
    }

    /// Decode a token and parse the plaintext as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self, token: &str) -> Result<T, DecodeError> {
        let plaintext = self.decode(token)?;
        serde_json::from_str(&plaintext).map_err(|e| DecodeError::Json(e.to_string()))
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Codec(..)")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Codec {
        Codec::new(&NetworkKey::parse(&NetworkKey::generate()).unwrap())
    }

    #[test]
    fn test_roundtrip_preserves_plaintext() {
        let codec = codec();
        let long = "x".repeat(10_000);
        for text in ["", "hello", "{\"args\":[2,3]}", "ünïcødé ✓", long.as_str()] {
            let token = codec.encode(text).unwrap();
            assert_eq!(codec.decode(&token).unwrap(), text);
        }
    }

    #[test]
    fn test_token_is_transport_safe() {
        let token = codec().encode("payload").unwrap();
        assert!(
            token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '='))
        );
        assert!(!token.contains("payload"));
    }

    #[test]
    fn test_same_plaintext_encodes_differently() {
        let codec = codec();
        assert_ne!(codec.encode("same").unwrap(), codec.encode("same").unwrap());
    }

    #[test]
    fn test_wrong_key_fails_authentication() {
        let token = codec().encode("secret").unwrap();
        let err = codec().decode(&token).unwrap_err();
        assert_eq!(err, DecodeError::Authentication);
    }

    #[test]
    fn test_tampered_token_fails() {
        let codec = codec();
        let mut raw = URL_SAFE.decode(codec.encode("secret").unwrap()).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let err = codec.decode(&URL_SAFE.encode(raw)).unwrap_err();
        assert_eq!(err, DecodeError::Authentication);
    }

    #[test]
    fn test_garbage_and_short_tokens_fail() {
        let codec = codec();
        assert!(matches!(codec.decode("not base64!!"), Err(DecodeError::Base64(_))));
        assert!(matches!(
            codec.decode(&URL_SAFE.encode([0u8; 4])),
            Err(DecodeError::Truncated(4))
        ));
    }

    #[test]
    fn test_trailing_newline_is_tolerated() {
        let codec = codec();
        let token = format!("{}\n", codec.encode("body").unwrap());
        assert_eq!(codec.decode(&token).unwrap(), "body");
    }

    #[test]
    fn test_json_helpers() {
        let codec = codec();
        let token = codec.encode_json(&serde_json::json!({"a": 1})).unwrap();
        let value: serde_json::Value = codec.decode_json(&token).unwrap();
        assert_eq!(value["a"], 1);

        let not_json = codec.encode("plain text").unwrap();
        assert!(matches!(
            codec.decode_json::<serde_json::Value>(&not_json),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_key_parsing_validates_length() {
        assert!(NetworkKey::parse(&NetworkKey::generate()).is_ok());
        assert!(matches!(
            NetworkKey::parse(&URL_SAFE.encode([1u8; 16])),
            Err(NetworkError::Validation(_))
        ));
        assert!(matches!(
            NetworkKey::parse("***"),
            Err(NetworkError::Validation(_))
        ));

        let text = NetworkKey::generate();
        let parsed: NetworkKey = text.parse().unwrap();
        let token = Codec::new(&parsed).encode("shared").unwrap();
        let codec = Codec::new(&NetworkKey::from_str(&text).unwrap());
        assert_eq!(codec.decode(&token).unwrap(), "shared");
    }

    #[test]
    fn test_unserializable_value_fails_to_encode() {
        let mut map = std::collections::HashMap::new();
        map.insert(vec![1u8], "non-string key");
        assert!(matches!(codec().encode_json(&map), Err(EncodeError::Json(_))));
    }
}
