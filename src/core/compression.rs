//! LZ4 payload stream
//!
//! The decrypted payload of every container is one LZ4 frame holding:
//!
//! ```text
//! metadataLength(i32) | metadata JSON | filesBlobLength(i32) | file bytes...
//! ```
//!
//! File bytes follow in the order of the metadata's `FileModData` list with
//! no per-file framing, so a reader must consume exactly `byteLength` bytes
//! per entry (including entries it decides to skip) to stay aligned.
//!
//! Frames are written with lz4_flex's fast compressor, which has no
//! high-compression mode, so payloads come out somewhat larger than an HC
//! encoder would produce. The reader accepts any conforming frame, including
//! HC output with linked blocks and a declared content size.

use crate::cancel::CancelToken;
use crate::error::{Result, SmaError};
use crate::metadata::{FileModData, PayloadMetadata};
use lz4_flex::frame::{self, FrameDecoder, FrameEncoder, FrameInfo};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

/// Upper bound on the metadata JSON
pub const MAX_METADATA_LEN: usize = 64 * 1024 * 1024;

/// Default streaming chunk size
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// LZ4 frame block size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSize {
    #[serde(rename = "max64kb")]
    Max64KB,
    #[serde(rename = "max256kb")]
    Max256KB,
    #[serde(rename = "max1mb")]
    Max1MB,
    #[serde(rename = "max4mb")]
    Max4MB,
}

impl From<BlockSize> for frame::BlockSize {
    fn from(size: BlockSize) -> Self {
        match size {
            BlockSize::Max64KB => frame::BlockSize::Max64KB,
            BlockSize::Max256KB => frame::BlockSize::Max256KB,
            BlockSize::Max1MB => frame::BlockSize::Max1MB,
            BlockSize::Max4MB => frame::BlockSize::Max4MB,
        }
    }
}

/// LZ4 frame parameters used when writing payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    pub block_size: BlockSize,

    /// Append an xxhash32 of the whole frame content
    pub content_checksum: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            block_size: BlockSize::Max256KB,
            content_checksum: true,
        }
    }
}

impl CompressionConfig {
    /// Small blocks, lowest memory use
    pub fn low_memory() -> Self {
        CompressionConfig {
            block_size: BlockSize::Max64KB,
            ..Default::default()
        }
    }

    /// Large blocks for texture-heavy payloads
    pub fn large_blocks() -> Self {
        CompressionConfig {
            block_size: BlockSize::Max4MB,
            ..Default::default()
        }
    }

    fn frame_info(&self) -> FrameInfo {
        let mut info = FrameInfo::new();
        info.block_size = self.block_size.into();
        info.content_checksum = self.content_checksum;
        info
    }
}

/// Where the bytes of a packaged file come from at export time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

/// A file to package, with its declared descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackagedFile {
    pub entry: FileModData,
    pub source: FileSource,
}

impl PackagedFile {
    pub fn from_bytes(bytes: Vec<u8>, game_paths: Vec<String>) -> Self {
        PackagedFile {
            entry: FileModData::for_bytes(&bytes, game_paths),
            source: FileSource::Bytes(bytes),
        }
    }

    /// Hash a file on disk; the bytes are streamed again at write time
    pub fn from_path<P: AsRef<Path>>(path: P, game_paths: Vec<String>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (hash, len) = crate::metadata::hash_reader(File::open(&path)?)?;
        Ok(PackagedFile {
            entry: FileModData::new(hash, game_paths, len),
            source: FileSource::Path(path),
        })
    }

    fn open(&self) -> Result<Box<dyn Read + '_>> {
        Ok(match &self.source {
            FileSource::Bytes(bytes) => Box::new(&bytes[..]),
            FileSource::Path(path) => Box::new(File::open(path)?),
        })
    }
}

/// Streaming payload writer.
///
/// Files must be written in the order the metadata declares them; each one
/// is length- and hash-checked against its declaration while streaming.
pub struct PayloadWriter<W: Write> {
    encoder: FrameEncoder<W>,
    declared: Vec<FileModData>,
    next: usize,
    chunk_size: usize,
}

impl<W: Write> PayloadWriter<W> {
    /// Write the metadata section and prepare for file bytes
    pub fn begin<M: PayloadMetadata>(
        sink: W,
        metadata: &M,
        config: &CompressionConfig,
        chunk_size: usize,
    ) -> Result<Self> {
        metadata.validate()?;
        let json = serde_json::to_vec(metadata)?;
        if json.len() > MAX_METADATA_LEN {
            return Err(SmaError::Malformed(format!(
                "metadata is {} bytes, limit is {}",
                json.len(),
                MAX_METADATA_LEN
            )));
        }
        let files_len = i32::try_from(metadata.declared_bytes()?)
            .map_err(|_| SmaError::Malformed("files blob exceeds i32::MAX bytes".into()))?;

        let mut encoder = FrameEncoder::with_frame_info(config.frame_info(), sink);
        encoder.write_all(&(json.len() as i32).to_le_bytes())?;
        encoder.write_all(&json)?;
        encoder.write_all(&files_len.to_le_bytes())?;

        debug!(
            "Payload metadata written: {} bytes, {} files, {} file bytes",
            json.len(),
            metadata.files().len(),
            files_len
        );

        Ok(PayloadWriter {
            encoder,
            declared: metadata.files().to_vec(),
            next: 0,
            chunk_size: chunk_size.max(1),
        })
    }

    /// Stream the next declared file
    pub fn write_file(&mut self, file: &PackagedFile, cancel: &CancelToken) -> Result<()> {
        let expected = self
            .declared
            .get(self.next)
            .ok_or_else(|| SmaError::Malformed("more files written than declared".into()))?;
        if expected.content_hash != file.entry.content_hash {
            return Err(SmaError::Malformed(format!(
                "file {} written where {} was declared",
                file.entry.content_hash, expected.content_hash
            )));
        }

        let mut reader = file.open()?;
        let mut hasher = Sha256::new();
        let mut buf = Zeroizing::new(vec![0u8; self.chunk_size]);
        let mut written = 0u64;
        loop {
            cancel.check()?;
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            written += n as u64;
            if written > expected.byte_length {
                return Err(SmaError::Malformed(format!(
                    "file {} is longer than its declared {} bytes",
                    expected.content_hash, expected.byte_length
                )));
            }
            hasher.update(&buf[..n]);
            self.encoder.write_all(&buf[..n])?;
        }

        if written != expected.byte_length {
            return Err(SmaError::UnexpectedEndOfStream {
                expected: expected.byte_length,
                read: written,
            });
        }
        let actual = hex::encode(hasher.finalize());
        if actual != expected.content_hash {
            return Err(SmaError::HashMismatch {
                expected: expected.content_hash.clone(),
                actual,
            });
        }

        debug!("Packaged {} ({} bytes)", expected.content_hash, written);
        self.next += 1;
        Ok(())
    }

    /// Close the LZ4 frame; every declared file must have been written
    pub fn finish(self) -> Result<W> {
        if self.next != self.declared.len() {
            return Err(SmaError::Malformed(format!(
                "{} of {} declared files written",
                self.next,
                self.declared.len()
            )));
        }
        self.encoder
            .finish()
            .map_err(|e| SmaError::Compression(e.to_string()))
    }
}

/// Compress metadata plus files into an in-memory payload
pub fn encode_payload<M: PayloadMetadata>(
    metadata: &M,
    files: &[PackagedFile],
    config: &CompressionConfig,
    chunk_size: usize,
    cancel: &CancelToken,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut writer = PayloadWriter::begin(Vec::new(), metadata, config, chunk_size)?;
    for file in files {
        writer.write_file(file, cancel)?;
    }
    Ok(Zeroizing::new(writer.finish()?))
}

/// Streaming payload reader.
///
/// Call [`read_metadata`](Self::read_metadata) first, then consume every
/// declared entry in order with [`copy_entry`](Self::copy_entry) or
/// [`skip_entry`](Self::skip_entry).
pub struct PayloadReader<R: Read> {
    decoder: FrameDecoder<R>,
    files_remaining: Option<u64>,
    chunk_size: usize,
}

impl<R: Read> PayloadReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_chunk_size(inner, DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(inner: R, chunk_size: usize) -> Self {
        PayloadReader {
            decoder: FrameDecoder::new(inner),
            files_remaining: None,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Parse the metadata section and the files blob length
    pub fn read_metadata<M: PayloadMetadata>(&mut self) -> Result<M> {
        if self.files_remaining.is_some() {
            return Err(SmaError::Malformed("metadata already read".into()));
        }

        let meta_len = self.read_len("metadata length")?;
        if meta_len > MAX_METADATA_LEN as u64 {
            return Err(SmaError::Malformed(format!(
                "metadata length {} exceeds limit {}",
                meta_len, MAX_METADATA_LEN
            )));
        }
        let mut json = vec![0u8; meta_len as usize];
        self.fill(&mut json)?;
        let metadata: M = serde_json::from_slice(&json)
            .map_err(|e| SmaError::Malformed(format!("metadata JSON: {}", e)))?;
        metadata.validate()?;

        let files_len = self.read_len("files blob length")?;
        let declared = metadata.declared_bytes()?;
        if files_len != declared {
            return Err(SmaError::Malformed(format!(
                "files blob is {} bytes but metadata declares {}",
                files_len, declared
            )));
        }

        debug!(
            "Payload metadata read: {} bytes, {} files, {} file bytes",
            meta_len,
            metadata.files().len(),
            files_len
        );
        self.files_remaining = Some(files_len);
        Ok(metadata)
    }

    /// Copy exactly `expected` bytes of the current entry into `sink`
    pub fn copy_entry<W: Write + ?Sized>(
        &mut self,
        expected: u64,
        sink: &mut W,
        cancel: &CancelToken,
    ) -> Result<u64> {
        let remaining = self
            .files_remaining
            .ok_or_else(|| SmaError::Malformed("metadata not read yet".into()))?;
        if expected > remaining {
            return Err(SmaError::Malformed(format!(
                "entry of {} bytes exceeds the {} bytes left in the files blob",
                expected, remaining
            )));
        }

        let mut buf = Zeroizing::new(vec![0u8; self.chunk_size]);
        let mut read = 0u64;
        while read < expected {
            cancel.check()?;
            let want = (expected - read).min(buf.len() as u64) as usize;
            let n = self.read_some(&mut buf[..want])?;
            if n == 0 {
                return Err(SmaError::UnexpectedEndOfStream { expected, read });
            }
            sink.write_all(&buf[..n])?;
            read += n as u64;
        }

        self.files_remaining = Some(remaining - expected);
        Ok(read)
    }

    /// Consume an entry without keeping its bytes
    pub fn skip_entry(&mut self, expected: u64, cancel: &CancelToken) -> Result<()> {
        self.copy_entry(expected, &mut io::sink(), cancel).map(|_| ())
    }

    /// Read an entry fully into memory
    pub fn read_entry(&mut self, expected: u64, cancel: &CancelToken) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(expected.min(self.chunk_size as u64 * 16) as usize);
        self.copy_entry(expected, &mut out, cancel)?;
        Ok(out)
    }

    /// Bytes of the files blob not consumed yet
    pub fn files_remaining(&self) -> u64 {
        self.files_remaining.unwrap_or(0)
    }

    /// Require that every entry was consumed and nothing trails the blob
    pub fn finish(mut self) -> Result<()> {
        match self.files_remaining {
            Some(0) => {}
            Some(left) => {
                return Err(SmaError::Malformed(format!(
                    "{} bytes of the files blob were not consumed",
                    left
                )))
            }
            None => return Err(SmaError::Malformed("metadata not read yet".into())),
        }
        let mut probe = [0u8; 1];
        if self.read_some(&mut probe)? != 0 {
            return Err(SmaError::Malformed("trailing bytes after files blob".into()));
        }
        Ok(())
    }

    fn read_len(&mut self, what: &str) -> Result<u64> {
        let mut bytes = [0u8; 4];
        self.fill(&mut bytes)?;
        let len = i32::from_le_bytes(bytes);
        u64::try_from(len).map_err(|_| SmaError::Malformed(format!("negative {}: {}", what, len)))
    }

    fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        let mut read = 0;
        while read < buf.len() {
            let n = self.read_some(&mut buf[read..])?;
            if n == 0 {
                return Err(SmaError::UnexpectedEndOfStream {
                    expected: buf.len() as u64,
                    read: read as u64,
                });
            }
            read += n;
        }
        Ok(())
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.decoder.read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(0),
                Err(e) => return Err(SmaError::Compression(e.to_string())),
            }
        }
    }
}
