//! Owner signing keys
//!
//! Every container is bound to an ECDSA P-256 owner key at export time. The
//! public half travels in the header (SPKI DER); the private half stays with
//! the exporting party and signs header fields and update tokens.

use crate::error::{Result, SmaError};
use crate::io::write_atomic;
use p256::ecdsa::{signature::Signer, Signature, SigningKey};
use p256::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::Zeroizing;

/// ECDSA P-256 owner keypair. The secret scalar is zeroized on drop.
#[derive(Clone)]
pub struct OwnerKeyPair {
    signing: SigningKey,
}

impl OwnerKeyPair {
    /// Generate a fresh random keypair
    pub fn generate() -> Self {
        OwnerKeyPair {
            signing: SigningKey::random(&mut OsRng),
        }
    }

    /// Load a keypair from PKCS#8 DER
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let signing = SigningKey::from_pkcs8_der(der)
            .map_err(|e| SmaError::Key(format!("Invalid PKCS#8 private key: {}", e)))?;
        Ok(OwnerKeyPair { signing })
    }

    /// Export the private key as PKCS#8 DER
    pub fn to_pkcs8_der(&self) -> Result<Zeroizing<Vec<u8>>> {
        let document = self
            .signing
            .to_pkcs8_der()
            .map_err(|e| SmaError::Key(format!("PKCS#8 export failed: {}", e)))?;
        Ok(Zeroizing::new(document.as_bytes().to_vec()))
    }

    /// Public key as SPKI DER, the form stored in container headers
    pub fn public_key_spki(&self) -> Result<Vec<u8>> {
        let document = self
            .signing
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| SmaError::Key(format!("SPKI export failed: {}", e)))?;
        Ok(document.as_bytes().to_vec())
    }

    /// Sign with ECDSA P-256 / SHA-256, fixed 64-byte r‖s encoding
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        let signature: Signature = self.signing.sign(message);
        signature.to_bytes().to_vec()
    }
}

impl std::fmt::Debug for OwnerKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let spki = self.public_key_spki().unwrap_or_default();
        f.debug_struct("OwnerKeyPair")
            .field("public_key", &hex::encode(spki))
            .finish_non_exhaustive()
    }
}

/// Supplies the owner's private key for signing at export time
pub trait OwnerKeyProvider: Send + Sync {
    fn owner_key(&self) -> Result<OwnerKeyPair>;
}

impl OwnerKeyProvider for OwnerKeyPair {
    fn owner_key(&self) -> Result<OwnerKeyPair> {
        Ok(self.clone())
    }
}

/// Key provider backed by a PKCS#8 DER file.
///
/// The key is generated and written (atomically) the first time it is
/// requested if the file does not exist yet.
pub struct FileKeyProvider {
    path: PathBuf,
    cached: Mutex<Option<OwnerKeyPair>>,
}

impl FileKeyProvider {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileKeyProvider {
            path: path.as_ref().to_path_buf(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl OwnerKeyProvider for FileKeyProvider {
    fn owner_key(&self) -> Result<OwnerKeyPair> {
        let mut cached = self.cached.lock();
        if let Some(key) = cached.as_ref() {
            return Ok(key.clone());
        }

        let key = if self.path.exists() {
            debug!("Loading owner key from {:?}", self.path);
            let der = Zeroizing::new(std::fs::read(&self.path)?);
            OwnerKeyPair::from_pkcs8_der(&der)?
        } else {
            info!("Generating new owner key at {:?}", self.path);
            let key = OwnerKeyPair::generate();
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            write_atomic(&self.path, &key.to_pkcs8_der()?)?;
            key
        };

        *cached = Some(key.clone());
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::verify_signature;
    use tempfile::TempDir;

    #[test]
    fn test_pkcs8_roundtrip() {
        let key = OwnerKeyPair::generate();
        let der = key.to_pkcs8_der().unwrap();
        let restored = OwnerKeyPair::from_pkcs8_der(&der).unwrap();

        assert_eq!(
            key.public_key_spki().unwrap(),
            restored.public_key_spki().unwrap()
        );
    }

    #[test]
    fn test_invalid_pkcs8_rejected() {
        assert!(matches!(
            OwnerKeyPair::from_pkcs8_der(b"garbage"),
            Err(SmaError::Key(_))
        ));
    }

    #[test]
    fn test_file_provider_generates_then_reloads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("owner.der");

        let first = FileKeyProvider::new(&path).owner_key().unwrap();
        assert!(path.exists());

        let second = FileKeyProvider::new(&path).owner_key().unwrap();
        let spki = first.public_key_spki().unwrap();
        assert_eq!(spki, second.public_key_spki().unwrap());

        let signature = second.sign(b"payload");
        assert!(verify_signature(&spki, b"payload", &signature));
    }
}
