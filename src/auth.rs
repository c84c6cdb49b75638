//! Credentials, login verification, and authentication tokens.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::Value;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use crate::event::Event;

const MIN_KEY_LEN: usize = 8;
const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The verifier rejected the login payload.
    #[error("login rejected")]
    Rejected,
    #[error("malformed credentials: {0}")]
    Malformed(String),
    /// The verifier itself failed (I/O, upstream, bug).
    #[error("verifier failure: {0}")]
    Verifier(String),
    #[error("token is not valid url-safe base64")]
    TokenEncoding,
    #[error("token failed authentication")]
    TokenRejected,
}

/// Identity key for a player session. Hashing and equality consider only the
/// random key; attributes are opaque baggage for verifiers and games.
#[derive(Debug, Clone)]
pub struct Credentials {
    random_key: String,
    attributes: HashMap<String, Value>,
}

impl Credentials {
    /// Random keys must be at least eight url-safe characters.
    pub fn new(random_key: impl Into<String>) -> Result<Self, AuthError> {
        let random_key = random_key.into();
        if random_key.len() < MIN_KEY_LEN {
            return Err(AuthError::Malformed(format!(
                "random key shorter than {MIN_KEY_LEN} characters"
            )));
        }
        if !random_key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(AuthError::Malformed(
                "random key contains non-url-safe characters".into(),
            ));
        }
        Ok(Self {
            random_key,
            attributes: HashMap::new(),
        })
    }

    /// Mints credentials with a fresh 16-character random key.
    pub fn generate() -> Self {
        let random_key: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        Self {
            random_key,
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn random_key(&self) -> &str {
        &self.random_key
    }

    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }
}

impl PartialEq for Credentials {
    fn eq(&self, other: &Self) -> bool {
        self.random_key == other.random_key
    }
}

impl Eq for Credentials {}

impl Hash for Credentials {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.random_key.hash(state);
    }
}

/// Maps the first (login) event of a connection to credentials.
///
/// Returning an error — any error — produces a single `LOG_IN_FAILURE`
/// frame and a closed connection.
#[async_trait]
pub trait CredentialsVerifier: Send + Sync {
    async fn verify(&self, login: &Event) -> Result<Credentials, AuthError>;
}

/// Mints and verifies opaque session tokens: AES-256-GCM over the
/// credentials' random key, 12-byte random nonce prepended to the
/// ciphertext, url-safe base64 without padding.
pub struct TokenFabric {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for TokenFabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenFabric").finish_non_exhaustive()
    }
}

impl TokenFabric {
    pub fn new(key: &[u8; 32]) -> Self {
        let key = Key::<Aes256Gcm>::from_slice(key);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Fabric with a process-local random key. Tokens do not survive a
    /// restart, which is the intended lifetime for reconnect tokens.
    pub fn generate() -> Self {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        Self {
            cipher: Aes256Gcm::new(&key),
        }
    }

    pub fn mint(&self, random_key: &str) -> Result<String, AuthError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, random_key.as_bytes())
            .map_err(|_| AuthError::TokenRejected)?;
        let mut packed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        packed.extend_from_slice(&nonce);
        packed.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(packed))
    }

    /// Recovers the random key a token was minted over.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let packed = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| AuthError::TokenEncoding)?;
        if packed.len() <= NONCE_LEN {
            return Err(AuthError::TokenEncoding);
        }
        let (nonce, ciphertext) = packed.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| AuthError::TokenRejected)?;
        String::from_utf8(plain).map_err(|_| AuthError::TokenRejected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;

    #[test]
    fn credentials_equality_ignores_attributes() {
        let a = Credentials::new("abcdefgh").unwrap();
        let b = Credentials::new("abcdefgh")
            .unwrap()
            .with_attribute("side", Value::from("other"));
        assert_eq!(a, b);
    }

    #[test]
    fn short_or_unsafe_keys_are_rejected() {
        assert!(Credentials::new("short").is_err());
        assert!(Credentials::new("has space!").is_err());
        assert!(Credentials::new("abc_def-123").is_ok());
    }

    #[test]
    fn token_round_trip_recovers_the_key() {
        let fabric = TokenFabric::generate();
        let creds = Credentials::generate();
        let token = fabric.mint(creds.random_key()).unwrap();
        assert_eq!(fabric.verify(&token).unwrap(), creds.random_key());
    }

    #[test]
    fn distinct_mints_of_the_same_key_differ() {
        let fabric = TokenFabric::generate();
        let a = fabric.mint("abcdefgh").unwrap();
        let b = fabric.mint("abcdefgh").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_tokens_are_rejected() {
        let fabric = TokenFabric::generate();
        let token = fabric.mint("abcdefgh").unwrap();
        let mut garbled: String = token.clone();
        // Flip the final character to corrupt the tag.
        let last = garbled.pop().unwrap();
        garbled.push(if last == 'A' { 'B' } else { 'A' });
        assert!(fabric.verify(&garbled).is_err());
        assert!(fabric.verify("not base64 ***").is_err());
    }

    #[tokio::test]
    async fn verifier_contract_is_object_safe() {
        struct AcceptAll;
        #[async_trait]
        impl CredentialsVerifier for AcceptAll {
            async fn verify(&self, _login: &Event) -> Result<Credentials, AuthError> {
                Ok(Credentials::generate())
            }
        }
        let verifier: Box<dyn CredentialsVerifier> = Box::new(AcceptAll);
        let creds = verifier
            .verify(&Event::log_in(Payload::None))
            .await
            .unwrap();
        assert!(creds.random_key().len() >= 8);
    }
}
