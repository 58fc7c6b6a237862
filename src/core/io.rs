//! Disk I/O for SMA containers
//!
//! Byte layout (integers little-endian):
//!
//! ```text
//! magic(4) | version(u8) | headerLen(i32) | header JSON
//!          | nonce(12) | tag(16) | cipherLen(i32) | cipher
//! ```
//!
//! Writes never touch the target path directly: bytes go to a temporary
//! sibling, are synced, then renamed over the target.

use crate::crypto::{SealedPayload, NONCE_SIZE, TAG_SIZE};
use crate::error::{Result, SmaError};
use crate::header::{SmaHeader, SmaKind, FORMAT_VERSION, MAGIC_SIZE, MAX_HEADER_LEN};
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// A container as laid out on disk, before any password is involved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawContainer {
    pub kind: SmaKind,
    pub header: SmaHeader,
    pub sealed: SealedPayload,
}

impl RawContainer {
    /// Serialize to the on-disk layout
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let header_json = self.header.to_json_bytes()?;
        let header_len = checked_len(header_json.len(), "header")?;
        let cipher_len = checked_len(self.sealed.ciphertext.len(), "ciphertext")?;

        let mut out = Vec::with_capacity(
            MAGIC_SIZE + 1 + 4 + header_json.len() + NONCE_SIZE + TAG_SIZE + 4
                + self.sealed.ciphertext.len(),
        );
        out.extend_from_slice(&self.kind.magic());
        out.push(self.header.version);
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header_json);
        out.extend_from_slice(&self.sealed.nonce);
        out.extend_from_slice(&self.sealed.tag);
        out.extend_from_slice(&cipher_len.to_le_bytes());
        out.extend_from_slice(&self.sealed.ciphertext);
        Ok(out)
    }

    /// Parse the on-disk layout, requiring the magic of `expected`
    pub fn from_bytes(bytes: &[u8], expected: SmaKind) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);

        let magic: [u8; MAGIC_SIZE] = read_array(&mut cursor, "magic")?;
        if magic != expected.magic() {
            return Err(SmaError::BadMagic {
                expected: expected.magic(),
                found: magic,
            });
        }

        let [version] = read_array::<1>(&mut cursor, "version")?;
        if version != FORMAT_VERSION {
            return Err(SmaError::BadVersion(version));
        }

        let header_len = read_len(&mut cursor, "header")?;
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(SmaError::Malformed(format!(
                "header length {} out of range",
                header_len
            )));
        }
        let mut header_json = vec![0u8; header_len];
        read_exact(&mut cursor, &mut header_json, "header")?;
        let header = SmaHeader::from_json_bytes(&header_json)?;
        if header.version != version {
            return Err(SmaError::Malformed(format!(
                "header version {} disagrees with framing version {}",
                header.version, version
            )));
        }

        let nonce: [u8; NONCE_SIZE] = read_array(&mut cursor, "nonce")?;
        let tag: [u8; TAG_SIZE] = read_array(&mut cursor, "tag")?;

        let cipher_len = read_len(&mut cursor, "ciphertext")?;
        let remaining = bytes.len() - cursor.position() as usize;
        if cipher_len != remaining {
            return Err(SmaError::Malformed(format!(
                "ciphertext length {} but {} bytes remain",
                cipher_len, remaining
            )));
        }
        let mut ciphertext = vec![0u8; cipher_len];
        read_exact(&mut cursor, &mut ciphertext, "ciphertext")?;

        Ok(RawContainer {
            kind: expected,
            header,
            sealed: SealedPayload {
                ciphertext,
                nonce,
                tag,
            },
        })
    }
}

/// Write a container atomically (temp sibling + rename)
pub fn write_container<P: AsRef<Path>>(path: P, container: &RawContainer) -> Result<()> {
    let bytes = container.to_bytes()?;
    debug!(
        "Writing {} container {} ({} bytes) to {:?}",
        container.kind,
        container.header.file_id,
        bytes.len(),
        path.as_ref()
    );
    write_atomic(path.as_ref(), &bytes)
}

/// Read a container, failing with `BadMagic` unless it is of `expected` kind
pub fn read_container<P: AsRef<Path>>(path: P, expected: SmaKind) -> Result<RawContainer> {
    let bytes = std::fs::read(path.as_ref())?;
    RawContainer::from_bytes(&bytes, expected)
}

/// Identify a container's subtype from its magic without parsing the rest
pub fn peek_kind<P: AsRef<Path>>(path: P) -> Result<SmaKind> {
    let mut file = File::open(path.as_ref())?;
    let mut magic = [0u8; MAGIC_SIZE];
    file.read_exact(&mut magic).map_err(|e| truncated(e, "magic"))?;
    SmaKind::from_magic(&magic).ok_or_else(|| {
        SmaError::Malformed(format!("unknown magic {:?}", String::from_utf8_lossy(&magic)))
    })
}

/// Replace `path` with `bytes` without ever exposing a partial file
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    write_atomic_with(path, |file| {
        file.write_all(bytes)?;
        Ok(())
    })
}

/// Like [`write_atomic`], with the content produced by `fill`.
///
/// If `fill` fails the temporary file is removed and the target is left
/// untouched.
pub fn write_atomic_with<F>(path: &Path, fill: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let tmp_path = temp_sibling(path)?;

    let outcome = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        fill(&mut file)?;
        file.flush()?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    })();

    if outcome.is_err() {
        if let Err(e) = std::fs::remove_file(&tmp_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clean up temp file {:?}: {}", tmp_path, e);
            }
        }
    }
    outcome
}

fn temp_sibling(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| SmaError::Malformed(format!("path {:?} has no file name", path)))?
        .to_string_lossy();
    let tmp_name = format!(".{}.tmp.{}", file_name, Uuid::new_v4().simple());
    Ok(path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(tmp_name))
}

fn checked_len(len: usize, what: &str) -> Result<i32> {
    i32::try_from(len)
        .map_err(|_| SmaError::Malformed(format!("{} too large: {} bytes", what, len)))
}

fn read_len(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<usize> {
    let len = i32::from_le_bytes(read_array(cursor, what)?);
    usize::try_from(len)
        .map_err(|_| SmaError::Malformed(format!("negative {} length {}", what, len)))
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    read_exact(cursor, &mut buf, what)?;
    Ok(buf)
}

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8], what: &str) -> Result<()> {
    cursor.read_exact(buf).map_err(|e| truncated(e, what))
}

fn truncated(e: std::io::Error, what: &str) -> SmaError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        SmaError::Malformed(format!("truncated container: missing {}", what))
    } else {
        SmaError::Io(e)
    }
}
