// src/crypto.rs
use async_trait::async_trait;

pub type CryptoError = Box<dyn std::error::Error + Send + Sync>;

/// Optional payload encryption. When configured on a consumer every payload
/// is decrypted before it is parsed as JSON.
#[async_trait]
pub trait Crypto: Send + Sync {
    async fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;

    async fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError>;
}
