use crate::error::StorageError;

/// Reversible transform applied to session payloads around storage.
///
/// `decrypt(encrypt(p))` must return `p` for every payload.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, StorageError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, StorageError>;
}
