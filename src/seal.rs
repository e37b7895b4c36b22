//! Sealed storage bound to the local user.
//!
//! Everything the agent keeps at rest that must not be readable by other
//! users (the device token, the retention registry, private keys) goes
//! through a [`SecretSeal`]. The default [`LocalKeySeal`] encrypts with
//! ChaCha20-Poly1305 under a per-user key file and authenticates the current
//! username as associated data.

use anyhow::{Context, Result, bail};
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::RngCore;
use std::path::Path;

use crate::error::AgentError;
use crate::platform::common::{atomic_write, current_username};

const SEAL_MAGIC: &[u8; 4] = b"CHS1";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Opaque encrypt/decrypt keyed to the local user identity.
pub trait SecretSeal: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>>;
    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>>;
}

/// ChaCha20-Poly1305 seal with a key stored next to the agent state.
pub struct LocalKeySeal {
    cipher: ChaCha20Poly1305,
    identity: Vec<u8>,
}

impl LocalKeySeal {
    /// Load the key at `key_path`, generating one on first use.
    pub fn open_or_create(key_path: &Path) -> Result<Self> {
        let key = if key_path.exists() {
            let bytes = std::fs::read(key_path)
                .with_context(|| format!("Failed to read seal key: {}", key_path.display()))?;
            if bytes.len() != KEY_LEN {
                bail!(
                    "Seal key {} has unexpected length {}",
                    key_path.display(),
                    bytes.len()
                );
            }
            let mut key = [0u8; KEY_LEN];
            key.copy_from_slice(&bytes);
            key
        } else {
            let mut key = [0u8; KEY_LEN];
            rand::thread_rng().fill_bytes(&mut key);
            atomic_write(key_path, &key)
                .with_context(|| format!("Failed to create seal key: {}", key_path.display()))?;
            tracing::info!("Created local seal key at {}", key_path.display());
            key
        };

        let identity = current_username().unwrap_or_default();
        Ok(Self::from_key(key, &identity))
    }

    pub fn from_key(key: [u8; KEY_LEN], identity: &str) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&key)),
            identity: identity.as_bytes().to_vec(),
        }
    }
}

impl SecretSeal for LocalKeySeal {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &self.identity,
                },
            )
            .map_err(|e| anyhow::anyhow!("Failed to seal data: {}", e))?;

        let mut out = Vec::with_capacity(SEAL_MAGIC.len() + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(SEAL_MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        let header = SEAL_MAGIC.len() + NONCE_LEN;
        if sealed.len() < header || &sealed[..SEAL_MAGIC.len()] != SEAL_MAGIC {
            bail!("Sealed data has an unknown format");
        }

        let nonce = Nonce::from_slice(&sealed[SEAL_MAGIC.len()..header]);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[header..],
                    aad: &self.identity,
                },
            )
            .map_err(|_| anyhow::anyhow!("Sealed data could not be opened for this user"))
    }
}

/// Seal `data` and write it atomically to `path`.
pub fn write_sealed(seal: &dyn SecretSeal, path: &Path, data: &[u8]) -> Result<(), AgentError> {
    let persistence = |e: anyhow::Error| AgentError::PersistenceFailure {
        path: path.to_path_buf(),
        message: format!("{:#}", e),
    };

    let sealed = seal.seal(data).map_err(persistence)?;
    atomic_write(path, &sealed).map_err(persistence)
}

/// Read and unseal `path`. A missing file is `Ok(None)`.
pub fn read_sealed(seal: &dyn SecretSeal, path: &Path) -> Result<Option<Vec<u8>>, AgentError> {
    if !path.exists() {
        return Ok(None);
    }

    let persistence = |e: anyhow::Error| AgentError::PersistenceFailure {
        path: path.to_path_buf(),
        message: format!("{:#}", e),
    };

    let sealed = std::fs::read(path)
        .with_context(|| format!("Failed to read {}", path.display()))
        .map_err(persistence)?;
    seal.unseal(&sealed).map(Some).map_err(persistence)
}

/// Store the device token sealed at `path`.
pub fn save_secret_string(seal: &dyn SecretSeal, path: &Path, value: &str) -> Result<(), AgentError> {
    write_sealed(seal, path, value.as_bytes())
}

/// Load a sealed string; unreadable secrets are logged and treated as absent.
pub fn load_secret_string(seal: &dyn SecretSeal, path: &Path) -> Option<String> {
    match read_sealed(seal, path) {
        Ok(Some(bytes)) => match String::from_utf8(bytes) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::error!("Sealed secret {} is not valid UTF-8", path.display());
                None
            }
        },
        Ok(None) => None,
        Err(e) => {
            tracing::error!("{}", e);
            None
        }
    }
}
