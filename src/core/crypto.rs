//! Cryptographic primitives for SMA containers
//!
//! Provides the building blocks the container codec and token protocol use:
//! - PBKDF2-HMAC-SHA256 password verifier (`key_hash`), never used as a key
//! - HMAC-SHA256 file secret, the actual AES-256-GCM key
//! - AES-256-GCM with a detached 128-bit tag and associated data
//! - ECDSA P-256 / SHA-256 signature verification against SPKI public keys
//!
//! **Design**:
//! - Each encryption draws a fresh random 96-bit nonce
//! - The tag is stored separately from the ciphertext (container layout)
//! - Secrets and decrypted plaintext are returned in `Zeroizing` buffers

use crate::error::{Rejection, Result, SmaError};
use aes_gcm::{
    aead::{generic_array::GenericArray, AeadInPlace, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use std::cell::Cell;
use zeroize::Zeroizing;

/// PBKDF2 iteration count for the password verifier
pub const KEY_HASH_ITERATIONS: u32 = 150_000;

/// Salt size (128 bits)
pub const SALT_SIZE: usize = 16;

/// Key and key-hash size (256 bits)
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits / 16 bytes)
pub const TAG_SIZE: usize = 16;

const FILE_SECRET_LABEL: &[u8] = b"SMA-FILE-SECRET-v1";

type HmacSha256 = Hmac<Sha256>;

/// AES-256 key derived from the container password, wiped on drop
pub type FileSecret = Zeroizing<[u8; KEY_SIZE]>;

thread_local! {
    static DECRYPT_CALLS: Cell<u64> = const { Cell::new(0) };
}

/// Number of AEAD decryptions attempted on the current thread.
pub fn aead_decrypt_calls() -> u64 {
    DECRYPT_CALLS.with(|calls| calls.get())
}

/// AES-256-GCM output in container layout order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedPayload {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; NONCE_SIZE],
    pub tag: [u8; TAG_SIZE],
}

/// Fill a fixed-size array from the OS RNG
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}

/// PBKDF2-HMAC-SHA256 of the password. Used only to reject wrong passwords
/// cheaply before any AEAD work.
pub fn derive_key_hash(password: &str, salt: &[u8; SALT_SIZE], iterations: u32) -> [u8; KEY_SIZE] {
    let mut out = [0u8; KEY_SIZE];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// Recompute the key hash and compare in constant time
pub fn verify_key_hash(
    password: &str,
    salt: &[u8; SALT_SIZE],
    expected: &[u8; KEY_SIZE],
    iterations: u32,
) -> bool {
    let computed = Zeroizing::new(derive_key_hash(password, salt, iterations));
    constant_time_eq(computed.as_slice(), expected)
}

/// HMAC-SHA256 over a fixed label, keyed by the password.
///
/// Salt-independent: every container protected by the same password shares
/// this key.
pub fn derive_file_secret(password: &str) -> Result<FileSecret> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(password.as_bytes())
        .map_err(|e| SmaError::Key(format!("HMAC key setup failed: {}", e)))?;
    mac.update(FILE_SECRET_LABEL);
    let digest = mac.finalize().into_bytes();

    let mut secret = Zeroizing::new([0u8; KEY_SIZE]);
    secret.copy_from_slice(&digest);
    Ok(secret)
}

/// Encrypt with AES-256-GCM, binding `aad` into the tag
pub fn aead_encrypt(plaintext: &[u8], key: &[u8; KEY_SIZE], aad: &[u8]) -> Result<SealedPayload> {
    let cipher = Aes256Gcm::new(key.into());
    let nonce: [u8; NONCE_SIZE] = random_bytes();

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad, buffer.as_mut_slice())
        .map_err(|e| SmaError::Key(format!("AES-GCM encryption failed: {}", e)))?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedPayload {
        ciphertext: buffer,
        nonce,
        tag: tag_bytes,
    })
}

/// Decrypt and authenticate. A wrong key, a modified ciphertext, and a
/// different `aad` are indistinguishable and all yield
/// `Rejected(TamperedOrWrongState)`.
pub fn aead_decrypt(
    sealed: &SealedPayload,
    key: &[u8; KEY_SIZE],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    DECRYPT_CALLS.with(|calls| calls.set(calls.get() + 1));

    let cipher = Aes256Gcm::new(key.into());
    let mut buffer = Zeroizing::new(sealed.ciphertext.clone());
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(&sealed.nonce),
            aad,
            buffer.as_mut_slice(),
            GenericArray::from_slice(&sealed.tag),
        )
        .map_err(|_| SmaError::Rejected(Rejection::TamperedOrWrongState))?;

    Ok(buffer)
}

/// Verify an ECDSA P-256 signature (64-byte r‖s) against an SPKI DER key
pub fn verify_signature(spki_der: &[u8], message: &[u8], signature: &[u8]) -> bool {
    let Ok(key) = VerifyingKey::from_public_key_der(spki_der) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    key.verify(message, &signature).is_ok()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
