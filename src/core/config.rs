//! Runtime configuration
//!
//! Loaded from TOML; every field has a default so an empty file is valid.
//!
//! ```toml
//! kdf_iterations = 150000
//! token_ttl_secs = 604800
//! chunk_size = 65536
//! cache_dir = "/var/lib/sma/cache"
//!
//! [compression]
//! block_size = "max256kb"
//! content_checksum = true
//! ```

use crate::compression::{CompressionConfig, DEFAULT_CHUNK_SIZE};
use crate::crypto::KEY_HASH_ITERATIONS;
use crate::error::{Result, SmaError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use validator::Validate;

/// Default lifetime of issued update tokens (7 days)
pub const DEFAULT_TOKEN_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SmaConfig {
    /// PBKDF2 iterations for the password verifier written into new headers
    /// and used to check passwords on open
    #[validate(range(min = 10000))]
    pub kdf_iterations: u32,

    #[validate(range(min = 1, max = 31536000))]
    pub token_ttl_secs: u64,

    /// Bytes per streamed chunk (cancellation granularity)
    #[validate(range(min = 512, max = 16777216))]
    pub chunk_size: usize,

    pub compression: CompressionConfig,

    /// Content-addressed cache root used by the command-line tool
    pub cache_dir: Option<PathBuf>,
}

impl Default for SmaConfig {
    fn default() -> Self {
        SmaConfig {
            kdf_iterations: KEY_HASH_ITERATIONS,
            token_ttl_secs: DEFAULT_TOKEN_TTL_SECS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            compression: CompressionConfig::default(),
            cache_dir: None,
        }
    }
}

impl SmaConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: SmaConfig =
            toml::from_str(text).map_err(|e| SmaError::Config(e.to_string()))?;
        config.check()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Run field validation
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| SmaError::Config(e.to_string()))
    }

    pub fn token_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_ttl_secs as i64)
    }

    /// Minimum allowed iterations; fast enough for test fixtures
    pub fn fast_kdf() -> Self {
        SmaConfig {
            kdf_iterations: 10_000,
            ..Default::default()
        }
    }
}
