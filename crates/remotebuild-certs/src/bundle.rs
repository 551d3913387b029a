//! Password-sealed client certificate bundles.
//!
//! A bundle carries the client certificate, its private key and the CA
//! certificate. On disk and on the wire it is sealed with ChaCha20-Poly1305
//! under a key derived from the bundle password with Argon2id:
//!
//! ```text
//! "RBB1" | salt (16 bytes) | nonce (12 bytes) | ciphertext + tag
//! ```

use argon2::Argon2;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CertError;

const MAGIC: &[u8; 4] = b"RBB1";
const SALT_SIZE: usize = 16;
/// Nonce size for ChaCha20-Poly1305.
const NONCE_SIZE: usize = 12;
const HEADER_SIZE: usize = MAGIC.len() + SALT_SIZE + NONCE_SIZE;

/// PEM-encoded client certificate bundle.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ClientBundle {
    /// PEM-encoded client certificate.
    pub cert_pem: String,
    /// PEM-encoded client private key.
    pub key_pem: String,
    /// PEM-encoded CA certificate the server chains to.
    pub ca_cert_pem: String,
}

impl std::fmt::Debug for ClientBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientBundle")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .field("ca_cert_pem", &self.ca_cert_pem)
            .finish()
    }
}

fn derive_cipher(password: &str, salt: &[u8]) -> Result<ChaCha20Poly1305, CertError> {
    let mut key_bytes = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key_bytes)
        .map_err(|e| CertError::Bundle(format!("key derivation failed: {e}")))?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key_bytes));
    key_bytes.zeroize();
    Ok(cipher)
}

impl ClientBundle {
    /// Seal the bundle under `password`.
    pub fn seal(&self, password: &str) -> Result<Vec<u8>, CertError> {
        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let mut plaintext = serde_json::to_vec(self)?;
        let sealed = derive_cipher(password, &salt)?
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| CertError::Bundle(format!("encryption failed: {e}")));
        plaintext.zeroize();
        let sealed = sealed?;

        let mut out = Vec::with_capacity(HEADER_SIZE + sealed.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Open a sealed bundle. A wrong password and a corrupted file are
    /// indistinguishable.
    pub fn open(data: &[u8], password: &str) -> Result<Self, CertError> {
        if data.len() < HEADER_SIZE || &data[..MAGIC.len()] != MAGIC {
            return Err(CertError::Bundle("not a client bundle".into()));
        }
        let salt = &data[MAGIC.len()..MAGIC.len() + SALT_SIZE];
        let nonce = &data[MAGIC.len() + SALT_SIZE..HEADER_SIZE];

        let mut plaintext = derive_cipher(password, salt)?
            .decrypt(Nonce::from_slice(nonce), &data[HEADER_SIZE..])
            .map_err(|_| CertError::Bundle("wrong password or corrupted bundle".into()))?;
        let bundle = serde_json::from_slice(&plaintext);
        plaintext.zeroize();
        Ok(bundle?)
    }
}
