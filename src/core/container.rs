//! Sealed SMA containers on disk
//!
//! [`SmaFile`] ties together the header, the AEAD-sealed LZ4 payload and
//! the atomic write path:
//!
//! - export: compress metadata + files, seal under the file secret with the
//!   allow-list as associated data, write atomically
//! - open: owner signature, then password verifier, then AEAD, then
//!   decompress. A wrong password never reaches the AEAD.
//! - token application: verify the token offline, then re-seal the same
//!   plaintext under the amended allow-list

use crate::cancel::CancelToken;
use crate::compression::{encode_payload, PackagedFile, PayloadReader};
use crate::config::SmaConfig;
use crate::crypto::{self, SealedPayload};
use crate::error::Result;
use crate::header::{check_allowed_entries, SmaHeader, SmaKind};
use crate::io::{peek_kind, read_container, write_container, RawContainer};
use crate::keys::OwnerKeyPair;
use crate::metadata::PayloadMetadata;
use crate::token::{now_ticks, UpdateToken};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Secrets and collaborators needed to seal a new container
pub struct SealParams<'a> {
    pub password: &'a str,
    pub owner: &'a OwnerKeyPair,
    pub allowed_hashes: Vec<String>,
    pub config: &'a SmaConfig,
    pub cancel: &'a CancelToken,
}

/// Result of applying an update token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenOutcome {
    /// The allow-list already had the token's effect; nothing was written
    Unchanged,
    /// The container was re-sealed under this allow-list
    Updated(Vec<String>),
}

/// Handle to a container file of a known kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmaFile {
    path: PathBuf,
    kind: SmaKind,
}

impl SmaFile {
    pub fn new<P: AsRef<Path>>(path: P, kind: SmaKind) -> Self {
        SmaFile {
            path: path.as_ref().to_path_buf(),
            kind,
        }
    }

    /// Identify the kind of an existing file from its magic
    pub fn detect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let kind = peek_kind(path.as_ref())?;
        Ok(Self::new(path, kind))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> SmaKind {
        self.kind
    }

    /// Seal `metadata` and `files` into a new container at `path`.
    ///
    /// All work happens in memory before the atomic write, so a failure or
    /// cancellation leaves whatever was at `path` untouched.
    pub fn export<P: AsRef<Path>, M: PayloadMetadata>(
        path: P,
        kind: SmaKind,
        metadata: &M,
        files: &[PackagedFile],
        params: SealParams<'_>,
    ) -> Result<(Self, SmaHeader)> {
        let file = Self::new(path, kind);
        info!("Exporting {} container to {:?}", kind, file.path);

        let config = params.config;
        let header = SmaHeader::issue(
            params.password,
            params.owner,
            params.allowed_hashes,
            config.kdf_iterations,
        )?;

        let payload = encode_payload(
            metadata,
            files,
            &config.compression,
            config.chunk_size,
            params.cancel,
        )?;
        params.cancel.check()?;

        let secret = crypto::derive_file_secret(params.password)?;
        let sealed = crypto::aead_encrypt(&payload, &secret, &header.aad())?;
        debug!(
            "Sealed {} payload bytes for {}",
            payload.len(),
            header.file_id
        );

        params.cancel.check()?;
        write_container(
            &file.path,
            &RawContainer {
                kind,
                header: header.clone(),
                sealed,
            },
        )?;

        info!("Exported {} {} ({} files)", kind, header.file_id, files.len());
        Ok((file, header))
    }

    /// Read and verify the header without a password
    pub fn read_header(&self) -> Result<SmaHeader> {
        let raw = read_container(&self.path, self.kind)?;
        raw.header.validate()?;
        Ok(raw.header)
    }

    /// Open the container with `password`
    pub fn try_open(&self, password: &str, config: &SmaConfig) -> Result<OpenedContainer> {
        info!("Opening {} container at {:?}", self.kind, self.path);
        let raw = read_container(&self.path, self.kind)?;
        open_raw(raw, password, config.kdf_iterations)
    }

    /// Verify `token` and re-seal the payload under the amended allow-list.
    ///
    /// The token is checked before anything else (wrong file, expiry,
    /// signature). Re-sealing needs the file secret, so the caller must
    /// also hold the password.
    pub fn apply_token(
        &self,
        token: &UpdateToken,
        password: &str,
        config: &SmaConfig,
    ) -> Result<TokenOutcome> {
        let raw = read_container(&self.path, self.kind)?;
        raw.header.validate()?;
        token.verify(&raw.header, now_ticks())?;
        check_allowed_entries(&token.payload.add_hashes)?;

        let amended = token.payload.amend(&raw.header.allowed_hashes);
        if amended == raw.header.allowed_hashes {
            debug!("Token already applied to {}", raw.header.file_id);
            return Ok(TokenOutcome::Unchanged);
        }

        raw.header.check_password(password, config.kdf_iterations)?;
        let secret = crypto::derive_file_secret(password)?;
        let plaintext = crypto::aead_decrypt(&raw.sealed, &secret, &raw.header.aad())
            .map_err(|e| {
                warn!("Payload of {} failed authentication", raw.header.file_id);
                e
            })?;

        let header = raw.header.with_allowed_hashes(amended)?;
        let sealed = crypto::aead_encrypt(&plaintext, &secret, &header.aad())?;
        let allowed = header.allowed_hashes.clone();
        write_container(
            &self.path,
            &RawContainer {
                kind: self.kind,
                header,
                sealed,
            },
        )?;

        info!(
            "Applied update token to {}: {} allowed hashes",
            token.payload.file_id,
            allowed.len()
        );
        Ok(TokenOutcome::Updated(allowed))
    }
}

/// Open an already-parsed container
pub fn open_raw(raw: RawContainer, password: &str, kdf_iterations: u32) -> Result<OpenedContainer> {
    raw.header.validate()?;

    if let Err(e) = raw.header.check_password(password, kdf_iterations) {
        warn!("Wrong password for {}", raw.header.file_id);
        return Err(e);
    }

    let secret = crypto::derive_file_secret(password)?;
    let plaintext = crypto::aead_decrypt(&raw.sealed, &secret, &raw.header.aad())
        .map_err(|e| {
            warn!("Payload of {} failed authentication", raw.header.file_id);
            e
        })?;

    debug!(
        "Decrypted {} payload bytes for {}",
        plaintext.len(),
        raw.header.file_id
    );
    Ok(OpenedContainer {
        kind: raw.kind,
        header: raw.header,
        plaintext,
    })
}

/// A container whose payload has been authenticated and decrypted.
/// The plaintext is wiped when this is dropped.
pub struct OpenedContainer {
    kind: SmaKind,
    header: SmaHeader,
    plaintext: Zeroizing<Vec<u8>>,
}

impl OpenedContainer {
    pub fn kind(&self) -> SmaKind {
        self.kind
    }

    pub fn header(&self) -> &SmaHeader {
        &self.header
    }

    pub fn file_id(&self) -> Uuid {
        self.header.file_id
    }

    /// Stream over the decompressed payload
    pub fn payload(&self, chunk_size: usize) -> PayloadReader<&[u8]> {
        PayloadReader::with_chunk_size(&self.plaintext[..], chunk_size)
    }

    /// Parse just the metadata section
    pub fn read_metadata<M: PayloadMetadata>(&self) -> Result<M> {
        self.payload(crate::compression::DEFAULT_CHUNK_SIZE)
            .read_metadata()
    }
}

impl std::fmt::Debug for OpenedContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenedContainer")
            .field("kind", &self.kind)
            .field("file_id", &self.header.file_id)
            .field("payload_len", &self.plaintext.len())
            .finish()
    }
}

/// Seal an in-memory payload; used by tests and benchmarks that do not
/// need a file on disk
pub fn seal_raw(
    kind: SmaKind,
    header: SmaHeader,
    plaintext: &[u8],
    password: &str,
) -> Result<RawContainer> {
    let secret = crypto::derive_file_secret(password)?;
    let sealed: SealedPayload = crypto::aead_encrypt(plaintext, &secret, &header.aad())?;
    Ok(RawContainer {
        kind,
        header,
        sealed,
    })
}
