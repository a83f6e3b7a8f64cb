//! Encryption at rest for provider API keys and project credentials.
//!
//! Each blob is sealed with AES-256-GCM under a key derived from the master
//! key and the blob's `key_id` through HKDF-SHA256, so rotating one
//! credential never touches another. Blob layout: `nonce (12) || ciphertext`.

use std::sync::Arc;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use ed25519_dalek::SigningKey;
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;

use crate::db::Database;
use crate::error::SecretsError;
use crate::model::Credential;

const NONCE_LEN: usize = 12;
const KEY_SALT: &[u8] = b"beadwork-secrets-v1";

/// Credential type tag for Ed25519 SSH keys.
pub const SSH_ED25519: &str = "ssh_ed25519";

/// Symmetric encryption service keyed by a master secret.
pub struct SecretsCrypto {
    master_key: SecretString,
}

impl SecretsCrypto {
    /// The master key must be at least 32 bytes.
    pub fn new(master_key: SecretString) -> Result<Self, SecretsError> {
        if master_key.expose_secret().len() < 32 {
            return Err(SecretsError::InvalidMasterKey);
        }
        Ok(Self { master_key })
    }

    /// A crypto service with a random, process-lifetime master key.
    ///
    /// Anything sealed with it is unreadable after restart.
    pub fn ephemeral() -> Self {
        let mut raw = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut raw);
        Self {
            master_key: SecretString::from(hex::encode(raw)),
        }
    }

    pub fn generate_key_id() -> String {
        format!("key-{}", uuid::Uuid::new_v4())
    }

    fn cipher(&self, key_id: &str) -> Result<Aes256Gcm, SecretsError> {
        let hk = Hkdf::<Sha256>::new(Some(KEY_SALT), self.master_key.expose_secret().as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(key_id.as_bytes(), &mut okm)
            .map_err(|e| SecretsError::EncryptionFailed(format!("key derivation: {}", e)))?;
        Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&okm)))
    }

    pub fn encrypt(&self, key_id: &str, plaintext: &[u8]) -> Result<Vec<u8>, SecretsError> {
        let cipher = self.cipher(key_id)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecretsError::EncryptionFailed(e.to_string()))?;
        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    pub fn decrypt(&self, key_id: &str, blob: &[u8]) -> Result<Vec<u8>, SecretsError> {
        if blob.len() <= NONCE_LEN {
            return Err(SecretsError::DecryptionFailed("blob too short".to_string()));
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        self.cipher(key_id)?
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecretsError::DecryptionFailed(format!("authentication failed for {}", key_id)))
    }

    pub fn encrypt_str(&self, key_id: &str, secret: &SecretString) -> Result<Vec<u8>, SecretsError> {
        self.encrypt(key_id, secret.expose_secret().as_bytes())
    }

    pub fn decrypt_str(&self, key_id: &str, blob: &[u8]) -> Result<SecretString, SecretsError> {
        let raw = self.decrypt(key_id, blob)?;
        String::from_utf8(raw)
            .map(SecretString::from)
            .map_err(|_| SecretsError::DecryptionFailed("plaintext is not UTF-8".to_string()))
    }
}

/// Render an Ed25519 public key as an OpenSSH `authorized_keys` line.
pub fn openssh_public_key(key: &ed25519_dalek::VerifyingKey, comment: &str) -> String {
    const ALGO: &[u8] = b"ssh-ed25519";
    let bytes = key.as_bytes();
    let mut wire = Vec::with_capacity(4 + ALGO.len() + 4 + bytes.len());
    wire.extend_from_slice(&(ALGO.len() as u32).to_be_bytes());
    wire.extend_from_slice(ALGO);
    wire.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    wire.extend_from_slice(bytes);
    format!("ssh-ed25519 {} {}", STANDARD.encode(wire), comment)
}

/// Project SSH credentials with private keys sealed at rest.
pub struct CredentialService {
    db: Arc<dyn Database>,
    crypto: Arc<SecretsCrypto>,
}

impl CredentialService {
    pub fn new(db: Arc<dyn Database>, crypto: Arc<SecretsCrypto>) -> Self {
        Self { db, crypto }
    }

    fn seal_new_key(&self, credential: &mut Credential) -> Result<(), SecretsError> {
        let signing = SigningKey::generate(&mut rand::rngs::OsRng);
        let key_id = SecretsCrypto::generate_key_id();
        credential.private_key_encrypted = self.crypto.encrypt(&key_id, signing.as_bytes())?;
        credential.public_key =
            openssh_public_key(&signing.verifying_key(), &format!("beadwork-{}", credential.id));
        credential.key_id = key_id;
        Ok(())
    }

    /// Create and store a fresh Ed25519 key pair for `project_id`.
    pub async fn generate_ssh_ed25519(
        &self,
        project_id: &str,
        description: &str,
    ) -> Result<Credential, SecretsError> {
        let now = Utc::now();
        let mut credential = Credential {
            id: format!("cred-{}", uuid::Uuid::new_v4()),
            project_id: project_id.to_string(),
            credential_type: SSH_ED25519.to_string(),
            private_key_encrypted: Vec::new(),
            public_key: String::new(),
            key_id: String::new(),
            description: description.to_string(),
            created_at: now,
            updated_at: now,
            rotated_at: None,
        };
        self.seal_new_key(&mut credential)?;
        self.db.upsert_credential(&credential).await?;
        tracing::info!(
            credential_id = %credential.id,
            project_id,
            "Generated SSH credential"
        );
        Ok(credential)
    }

    /// Replace the key pair of an existing credential.
    pub async fn rotate(&self, credential_id: &str) -> Result<Credential, SecretsError> {
        let mut credential = self.db.get_credential(credential_id).await?;
        self.seal_new_key(&mut credential)?;
        let now = Utc::now();
        credential.rotated_at = Some(now);
        credential.updated_at = now;
        self.db.upsert_credential(&credential).await?;
        tracing::info!(credential_id, "Rotated SSH credential");
        Ok(credential)
    }

    /// Decrypted private key seed.
    pub async fn private_key(&self, credential_id: &str) -> Result<SigningKey, SecretsError> {
        let credential = self.db.get_credential(credential_id).await?;
        let raw = self
            .crypto
            .decrypt(&credential.key_id, &credential.private_key_encrypted)?;
        let seed: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| SecretsError::DecryptionFailed("private key has wrong length".to_string()))?;
        Ok(SigningKey::from_bytes(&seed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn crypto() -> SecretsCrypto {
        SecretsCrypto::new(SecretString::from("0123456789abcdef0123456789abcdef".to_string()))
            .unwrap()
    }

    #[test]
    fn test_short_master_key_rejected() {
        let err = SecretsCrypto::new(SecretString::from("short".to_string()));
        assert!(matches!(err, Err(SecretsError::InvalidMasterKey)));
    }

    #[test]
    fn test_seal_and_open() {
        let crypto = crypto();
        let blob = crypto.encrypt("k1", b"sk-live-123").unwrap();
        assert_ne!(&blob[NONCE_LEN..], b"sk-live-123");
        assert_eq!(crypto.decrypt("k1", &blob).unwrap(), b"sk-live-123");
    }

    #[test]
    fn test_wrong_key_id_fails() {
        let crypto = crypto();
        let blob = crypto.encrypt("k1", b"secret").unwrap();
        assert!(crypto.decrypt("k2", &blob).is_err());
        assert!(crypto.decrypt("k1", &blob[..4]).is_err());
    }

    #[test]
    fn test_openssh_line_shape() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let line = openssh_public_key(&key.verifying_key(), "me");
        let parts: Vec<&str> = line.split(' ').collect();
        assert_eq!(parts[0], "ssh-ed25519");
        assert_eq!(parts[2], "me");
        let wire = STANDARD.decode(parts[1]).unwrap();
        assert_eq!(wire.len(), 4 + 11 + 4 + 32);
        assert_eq!(&wire[4..15], b"ssh-ed25519");
    }

    #[tokio::test]
    async fn test_generate_and_rotate_credential() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let service = CredentialService::new(db.clone(), Arc::new(crypto()));

        let created = service.generate_ssh_ed25519("p1", "deploy key").await.unwrap();
        assert_eq!(created.credential_type, SSH_ED25519);
        assert!(created.public_key.starts_with("ssh-ed25519 "));
        assert!(created.rotated_at.is_none());

        let key = service.private_key(&created.id).await.unwrap();
        let expected = openssh_public_key(&key.verifying_key(), &format!("beadwork-{}", created.id));
        assert_eq!(created.public_key, expected);

        let rotated = service.rotate(&created.id).await.unwrap();
        assert!(rotated.rotated_at.is_some());
        assert_ne!(rotated.public_key, created.public_key);
        assert_ne!(rotated.key_id, created.key_id);
        assert_eq!(db.list_credentials("p1").await.unwrap().len(), 1);
    }
}
