//! Metadata carried inside the encrypted payload
//!
//! Every container payload starts with a JSON document describing what
//! follows it in the stream. Layer containers (Base/Outfit/Item) carry a
//! [`LayerDocument`]; Descriptor containers carry a [`DescriptorDocument`].

use crate::error::{Result, SmaError};
use crate::glamour::{GlamourState, LayerFilter};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use uuid::Uuid;

/// Length of a lowercase hex SHA-256 digest
pub const CONTENT_HASH_LEN: usize = 64;

/// Lowercase hex SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a reader to its end, returning the hex digest and byte count
pub fn hash_reader<R: Read>(mut reader: R) -> Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// One packaged file: its content hash, where the game loads it from, and
/// how many bytes of the payload stream it occupies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileModData {
    pub content_hash: String,
    pub game_paths: Vec<String>,
    pub byte_length: u64,
}

impl FileModData {
    pub fn new(content_hash: impl Into<String>, game_paths: Vec<String>, byte_length: u64) -> Self {
        FileModData {
            content_hash: content_hash.into(),
            game_paths,
            byte_length,
        }
    }

    /// Describe in-memory bytes
    pub fn for_bytes(bytes: &[u8], game_paths: Vec<String>) -> Self {
        FileModData::new(content_hash(bytes), game_paths, bytes.len() as u64)
    }

    /// File extension used when caching this entry (`mdl`, `tex`, ...)
    pub fn extension(&self) -> String {
        self.game_paths
            .first()
            .and_then(|path| path.rsplit('/').next())
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .unwrap_or_else(|| "dat".to_string())
    }

    /// Reject entries that could not have come from an honest exporter.
    ///
    /// The hash doubles as a cache file name, so anything but lowercase hex
    /// is refused.
    pub fn validate(&self) -> Result<()> {
        let well_formed = self.content_hash.len() == CONTENT_HASH_LEN
            && self
                .content_hash
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(SmaError::Malformed(format!(
                "invalid content hash {:?}",
                self.content_hash
            )));
        }
        if self.game_paths.is_empty() {
            return Err(SmaError::Malformed(format!(
                "file {} declares no game paths",
                self.content_hash
            )));
        }
        Ok(())
    }
}

/// Redirect of one or more game paths to another game path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileSwap {
    pub game_paths: Vec<String>,
    pub swap_target_path: String,
}

/// Description of one appearance layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetadataSummary {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub glamour_state: GlamourState,
    #[serde(default)]
    pub manipulation_string: String,
    #[serde(default)]
    pub customize_data: String,
    #[serde(default)]
    pub files: Vec<FileModData>,
    #[serde(default, rename = "FileSwaps")]
    pub swaps: Vec<FileSwap>,
}

impl MetadataSummary {
    pub fn new(name: impl Into<String>) -> Self {
        MetadataSummary {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Metadata of a Base, Outfit or Item container.
///
/// `filter` is absent for Bases and required for Outfits and Items.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerDocument {
    #[serde(flatten)]
    pub summary: MetadataSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<LayerFilter>,
}

/// Metadata of a Descriptor container: an actor record over layer file ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DescriptorDocument {
    pub name: String,
    pub base: Uuid,
    #[serde(default)]
    pub outfits: Vec<Uuid>,
    #[serde(default)]
    pub items: Vec<Uuid>,
    #[serde(default)]
    pub selected_outfit: Option<Uuid>,
    #[serde(default)]
    pub selected_items: Vec<Uuid>,
}

/// Metadata document at the head of a payload stream
pub trait PayloadMetadata: Serialize + DeserializeOwned {
    /// Packaged files, in stream order
    fn files(&self) -> &[FileModData];

    fn swaps(&self) -> &[FileSwap] {
        &[]
    }

    /// Total bytes the files occupy in the stream
    fn declared_bytes(&self) -> Result<u64> {
        self.files().iter().try_fold(0u64, |total, file| {
            total
                .checked_add(file.byte_length)
                .ok_or_else(|| SmaError::Malformed("declared file lengths overflow".into()))
        })
    }

    fn validate(&self) -> Result<()> {
        self.files().iter().try_for_each(FileModData::validate)
    }
}

impl PayloadMetadata for LayerDocument {
    fn files(&self) -> &[FileModData] {
        &self.summary.files
    }

    fn swaps(&self) -> &[FileSwap] {
        &self.summary.swaps
    }
}

impl PayloadMetadata for DescriptorDocument {
    fn files(&self) -> &[FileModData] {
        &[]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glamour::EquipSlot;

    #[test]
    fn test_content_hash_matches_reader_hash() {
        let data = b"model bytes".repeat(10_000);
        let (hash, len) = hash_reader(&data[..]).unwrap();
        assert_eq!(hash, content_hash(&data));
        assert_eq!(len, data.len() as u64);
        assert_eq!(hash.len(), CONTENT_HASH_LEN);
    }

    #[test]
    fn test_extension() {
        let entry = FileModData::new("00", vec!["chara/equipment/e0001/model/c0101e0001_top.MDL".into()], 1);
        assert_eq!(entry.extension(), "mdl");

        let entry = FileModData::new("00", vec!["chara/weird/noext".into()], 1);
        assert_eq!(entry.extension(), "dat");

        let entry = FileModData::new("00", vec![], 1);
        assert_eq!(entry.extension(), "dat");
    }

    #[test]
    fn test_validate_rejects_path_like_hash() {
        let good = FileModData::for_bytes(b"x", vec!["a/b.tex".into()]);
        assert!(good.validate().is_ok());

        let bad = FileModData::new("../../etc/passwd", vec!["a/b.tex".into()], 1);
        assert!(matches!(bad.validate(), Err(SmaError::Malformed(_))));

        let upper = FileModData::new(good.content_hash.to_uppercase(), vec!["a/b.tex".into()], 1);
        assert!(upper.validate().is_err());

        let no_paths = FileModData::new(good.content_hash.clone(), vec![], 1);
        assert!(no_paths.validate().is_err());
    }

    #[test]
    fn test_layer_document_json_is_flat() {
        let mut doc = LayerDocument {
            summary: MetadataSummary::new("Hat"),
            filter: Some(LayerFilter::equipment([EquipSlot::Head])),
        };
        doc.summary.files.push(FileModData::for_bytes(b"x", vec!["a/b.tex".into()]));

        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["Name"], "Hat");
        assert!(value["Files"].is_array());
        assert!(value["Filter"].is_object());

        let parsed: LayerDocument = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn test_base_document_omits_filter() {
        let doc = LayerDocument {
            summary: MetadataSummary::new("Base"),
            filter: None,
        };
        let json = serde_json::to_string(&doc).unwrap();
        assert!(!json.contains("Filter"));
    }

    #[test]
    fn test_declared_bytes() {
        let mut doc = LayerDocument::default();
        doc.summary.files.push(FileModData::new("a", vec![], 10));
        doc.summary.files.push(FileModData::new("b", vec![], 32));
        assert_eq!(doc.declared_bytes().unwrap(), 42);

        doc.summary.files.push(FileModData::new("c", vec![], u64::MAX));
        assert!(doc.declared_bytes().is_err());
    }
}
