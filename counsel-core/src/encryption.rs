use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use hkdf::Hkdf;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Encrypts chat text at rest with a key derived per chat room.
#[derive(Clone)]
pub struct ChatCipher {
    master_key: Vec<u8>,
}

impl std::fmt::Debug for ChatCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatCipher").finish_non_exhaustive()
    }
}

impl ChatCipher {
    /// A 64 character master key is read as hex; anything else is used as raw
    /// bytes, truncated or zero padded to 32 bytes.
    pub fn new(master_key: &str) -> Result<Self> {
        let master_key = if master_key.len() == 64 {
            hex::decode(master_key)
                .map_err(|e| Error::Encryption(format!("Invalid hex master key: {}", e)))?
        } else {
            let mut key_bytes = master_key.as_bytes().to_vec();
            key_bytes.resize(32, 0);
            key_bytes
        };
        Ok(Self { master_key })
    }

    /// Output is base64(nonce || ciphertext).
    pub fn encrypt(&self, chat_id: Uuid, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new(&self.room_key(chat_id)?);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|e| Error::Encryption(format!("Encryption failed: {}", e)))?;

        let mut sealed = nonce.to_vec();
        sealed.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(&sealed))
    }

    pub fn decrypt(&self, chat_id: Uuid, sealed: &str) -> Result<String> {
        let sealed = STANDARD
            .decode(sealed)
            .map_err(|e| Error::Encryption(format!("Base64 decode failed: {}", e)))?;

        if sealed.len() < 12 {
            return Err(Error::Encryption("Invalid encrypted data: too short".to_string()));
        }

        let (nonce, ciphertext) = sealed.split_at(12);
        let cipher = Aes256Gcm::new(&self.room_key(chat_id)?);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Encryption(format!("Decryption failed: {}", e)))?;

        String::from_utf8(plaintext)
            .map_err(|e| Error::Encryption(format!("Invalid UTF-8 after decryption: {}", e)))
    }

    fn room_key(&self, chat_id: Uuid) -> Result<Key<Aes256Gcm>> {
        let hk = Hkdf::<Sha256>::new(None, &self.master_key);
        let mut okm = [0u8; 32];
        hk.expand(chat_id.as_bytes(), &mut okm)
            .map_err(|e| Error::Encryption(format!("HKDF expansion failed: {}", e)))?;
        Ok(*Key::<Aes256Gcm>::from_slice(&okm))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER_KEY: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    #[test]
    fn test_encrypt_decrypt() {
        let cipher = ChatCipher::new(MASTER_KEY).unwrap();
        let chat_id = Uuid::new_v4();
        let original = "Please send the signed retainer before Friday.";

        let sealed = cipher.encrypt(chat_id, original).unwrap();
        assert_ne!(sealed, original);
        assert_eq!(cipher.decrypt(chat_id, &sealed).unwrap(), original);
    }

    #[test]
    fn test_other_room_cannot_decrypt() {
        let cipher = ChatCipher::new(MASTER_KEY).unwrap();
        let sealed = cipher.encrypt(Uuid::new_v4(), "privileged").unwrap();
        assert!(cipher.decrypt(Uuid::new_v4(), &sealed).is_err());
    }

    #[test]
    fn test_short_key_is_padded() {
        let cipher = ChatCipher::new("dev").unwrap();
        let chat_id = Uuid::new_v4();
        let sealed = cipher.encrypt(chat_id, "hi").unwrap();
        assert_eq!(cipher.decrypt(chat_id, &sealed).unwrap(), "hi");
    }
}
