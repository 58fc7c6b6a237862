//! Container header: subtype magic, signed JSON header and allow-list
//! associated data

use crate::crypto::{self, KEY_SIZE, SALT_SIZE};
use crate::error::{Rejection, Result, SmaError};
use crate::keys::OwnerKeyPair;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current on-disk format version
pub const FORMAT_VERSION: u8 = 1;

/// Size of the ASCII subtype tag at the start of every container
pub const MAGIC_SIZE: usize = 4;

/// Upper bound on the serialized header JSON
pub const MAX_HEADER_LEN: usize = 1024 * 1024;

/// Container subtype, identified on disk by a 4-byte magic tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SmaKind {
    /// Full character appearance
    Base,
    /// Override layer for a subset of equipment/customization
    Outfit,
    /// Single-piece override layer
    Item,
    /// Actor record referencing previously exported layers
    Descriptor,
}

impl SmaKind {
    pub const ALL: [SmaKind; 4] = [
        SmaKind::Base,
        SmaKind::Outfit,
        SmaKind::Item,
        SmaKind::Descriptor,
    ];

    /// 4-byte magic tag written at offset 0
    pub const fn magic(self) -> [u8; MAGIC_SIZE] {
        match self {
            SmaKind::Base => *b"SMAB",
            SmaKind::Outfit => *b"SMAO",
            SmaKind::Item => *b"SMAI",
            SmaKind::Descriptor => *b"SMAD",
        }
    }

    /// Parse a magic tag. Unknown tags return `None`.
    pub fn from_magic(magic: &[u8; MAGIC_SIZE]) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| &kind.magic() == magic)
    }

    /// Conventional file extension (without the dot)
    pub const fn extension(self) -> &'static str {
        match self {
            SmaKind::Base => "smab",
            SmaKind::Outfit => "smao",
            SmaKind::Item => "smai",
            SmaKind::Descriptor => "smad",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        Self::ALL.into_iter().find(|kind| kind.extension() == ext)
    }
}

impl std::fmt::Display for SmaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SmaKind::Base => "base",
            SmaKind::Outfit => "outfit",
            SmaKind::Item => "item",
            SmaKind::Descriptor => "descriptor",
        };
        f.write_str(name)
    }
}

/// SMA container header
///
/// Stored as UTF-8 JSON between the fixed framing bytes and the nonce. The
/// header is not encrypted, but it is protected two ways:
///
/// - `FileId`, `Salt`, `KeyHash` and `OwnerPubKey` are covered by the owner's
///   ECDSA signature (`OwnerHeaderSignature`).
/// - `AllowedHashes` is the AEAD associated data of the payload, so changing
///   it outside the token path breaks decryption.
///
/// Everything except `AllowedHashes` is fixed for the lifetime of the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SmaHeader {
    pub version: u8,

    pub file_id: Uuid,

    #[serde(with = "b64")]
    pub salt: [u8; SALT_SIZE],

    /// PBKDF2-HMAC-SHA256 password verifier
    #[serde(with = "b64")]
    pub key_hash: [u8; KEY_SIZE],

    /// SPKI DER encoded ECDSA P-256 public key
    #[serde(rename = "OwnerPubKey", with = "b64")]
    pub owner_pub_key: Vec<u8>,

    /// Ordered, duplicate-free list of content hashes. The only mutable field.
    #[serde(default)]
    pub allowed_hashes: Vec<String>,

    #[serde(default, with = "b64::option")]
    pub owner_header_signature: Option<Vec<u8>>,
}

impl SmaHeader {
    /// Issue a header for a new container, signed by `owner`
    pub fn issue(
        password: &str,
        owner: &OwnerKeyPair,
        allowed_hashes: Vec<String>,
        iterations: u32,
    ) -> Result<Self> {
        let salt: [u8; SALT_SIZE] = crypto::random_bytes();
        let mut header = SmaHeader {
            version: FORMAT_VERSION,
            file_id: Uuid::new_v4(),
            salt,
            key_hash: crypto::derive_key_hash(password, &salt, iterations),
            owner_pub_key: owner.public_key_spki()?,
            allowed_hashes: checked_allowed(allowed_hashes)?,
            owner_header_signature: None,
        };
        header.owner_header_signature = Some(owner.sign(&header.signed_bytes()));
        Ok(header)
    }

    /// Bytes covered by the owner header signature:
    /// `fileId(16) ‖ salt(16) ‖ keyHash(32) ‖ ownerPubKey`
    pub fn signed_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(16 + SALT_SIZE + KEY_SIZE + self.owner_pub_key.len());
        bytes.extend_from_slice(self.file_id.as_bytes());
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.key_hash);
        bytes.extend_from_slice(&self.owner_pub_key);
        bytes
    }

    /// Validate version, allow-list entries and owner signature
    pub fn validate(&self) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(SmaError::BadVersion(self.version));
        }
        check_allowed_entries(&self.allowed_hashes)?;
        self.verify_owner_signature()
    }

    /// Check the immutable fields against the owner's signature
    pub fn verify_owner_signature(&self) -> Result<()> {
        let signature = self
            .owner_header_signature
            .as_deref()
            .ok_or(SmaError::BadHeaderSignature)?;

        if crypto::verify_signature(&self.owner_pub_key, &self.signed_bytes(), signature) {
            Ok(())
        } else {
            Err(SmaError::BadHeaderSignature)
        }
    }

    /// Cheap password pre-check; never touches the payload
    pub fn check_password(&self, password: &str, iterations: u32) -> Result<()> {
        if crypto::verify_key_hash(password, &self.salt, &self.key_hash, iterations) {
            Ok(())
        } else {
            Err(Rejection::BadPassword.into())
        }
    }

    /// Associated data binding the payload to the current allow-list
    pub fn aad(&self) -> Vec<u8> {
        aad_for(&self.allowed_hashes)
    }

    /// Copy of this header with a different allow-list
    pub fn with_allowed_hashes(&self, allowed_hashes: Vec<String>) -> Result<Self> {
        Ok(SmaHeader {
            allowed_hashes: checked_allowed(allowed_hashes)?,
            ..self.clone()
        })
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self> {
        let header: SmaHeader = serde_json::from_slice(bytes)
            .map_err(|e| SmaError::Malformed(format!("header JSON: {}", e)))?;
        check_allowed_entries(&header.allowed_hashes)?;
        Ok(header)
    }
}

/// Reject entries that would make the joined associated data ambiguous:
/// empty strings and anything containing the `,` separator
pub fn check_allowed_entries(hashes: &[String]) -> Result<()> {
    match hashes.iter().find(|h| h.is_empty() || h.contains(',')) {
        Some(bad) => Err(SmaError::Malformed(format!(
            "invalid allow-list entry {:?}",
            bad
        ))),
        None => Ok(()),
    }
}

fn checked_allowed(hashes: Vec<String>) -> Result<Vec<String>> {
    check_allowed_entries(&hashes)?;
    Ok(normalize_allowed(hashes))
}

/// UTF-8 bytes of the comma-joined allow-list
pub fn aad_for(allowed_hashes: &[String]) -> Vec<u8> {
    allowed_hashes.join(",").into_bytes()
}

/// Drop duplicates while keeping first-seen order
pub fn normalize_allowed(hashes: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(hashes.len());
    for hash in hashes {
        if !out.contains(&hash) {
            out.push(hash);
        }
    }
    out
}

/// Base64 (standard alphabet) serde adapters for byte fields
pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let encoded = String::deserialize(deserializer)?;
        let bytes = STANDARD.decode(encoded).map_err(de::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes).map_err(|_| de::Error::custom(format!("unexpected length {}", len)))
    }

    pub mod option {
        use super::STANDARD;
        use base64::Engine as _;
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match bytes {
                Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|encoded| STANDARD.decode(encoded).map_err(de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITERATIONS: u32 = 1_000;

    fn issue() -> (SmaHeader, OwnerKeyPair) {
        let owner = OwnerKeyPair::generate();
        let header = SmaHeader::issue("pw", &owner, vec!["H1".into()], ITERATIONS).unwrap();
        (header, owner)
    }

    #[test]
    fn test_magic_roundtrip() {
        for kind in SmaKind::ALL {
            assert_eq!(SmaKind::from_magic(&kind.magic()), Some(kind));
            assert_eq!(SmaKind::from_extension(kind.extension()), Some(kind));
        }
        assert_eq!(SmaKind::from_magic(b"CART"), None);
        assert_eq!(SmaKind::from_extension(".SMAO"), Some(SmaKind::Outfit));
    }

    #[test]
    fn test_issue_and_validate() {
        let (header, _) = issue();
        assert_eq!(header.version, FORMAT_VERSION);
        header.validate().unwrap();
        header.check_password("pw", ITERATIONS).unwrap();
    }

    #[test]
    fn test_wrong_password_rejected() {
        let (header, _) = issue();
        let err = header.check_password("nope", ITERATIONS).unwrap_err();
        assert_eq!(err.rejection(), Some(Rejection::BadPassword));
    }

    #[test]
    fn test_json_field_names() {
        let (header, _) = issue();
        let json: serde_json::Value =
            serde_json::from_slice(&header.to_json_bytes().unwrap()).unwrap();

        for field in [
            "Version",
            "FileId",
            "Salt",
            "KeyHash",
            "OwnerPubKey",
            "AllowedHashes",
            "OwnerHeaderSignature",
        ] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(json["AllowedHashes"], serde_json::json!(["H1"]));
    }

    #[test]
    fn test_json_roundtrip() {
        let (header, _) = issue();
        let parsed = SmaHeader::from_json_bytes(&header.to_json_bytes().unwrap()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_null_signature_fails_validation() {
        let (mut header, _) = issue();
        header.owner_header_signature = None;

        let parsed = SmaHeader::from_json_bytes(&header.to_json_bytes().unwrap()).unwrap();
        assert!(matches!(parsed.validate(), Err(SmaError::BadHeaderSignature)));
    }

    #[test]
    fn test_immutable_field_tamper_detected() {
        let (mut header, _) = issue();
        header.salt[0] ^= 1;
        assert!(matches!(header.validate(), Err(SmaError::BadHeaderSignature)));

        let (mut header, _) = issue();
        header.file_id = Uuid::new_v4();
        assert!(matches!(header.validate(), Err(SmaError::BadHeaderSignature)));
    }

    #[test]
    fn test_owner_key_swap_detected() {
        let (mut header, _) = issue();
        let stranger = OwnerKeyPair::generate();
        header.owner_pub_key = stranger.public_key_spki().unwrap();
        assert!(matches!(header.validate(), Err(SmaError::BadHeaderSignature)));
    }

    #[test]
    fn test_allow_list_not_covered_by_header_signature() {
        let (header, _) = issue();
        let changed = header
            .with_allowed_hashes(vec!["H1".into(), "H2".into()])
            .unwrap();
        changed.validate().unwrap();
        assert_ne!(changed.aad(), header.aad());
    }

    #[test]
    fn test_ambiguous_allow_list_entries_rejected() {
        let (header, _) = issue();
        for entries in [vec![String::new()], vec!["a,b".to_string()], vec!["a".into(), "".into()]] {
            assert!(matches!(
                header.with_allowed_hashes(entries.clone()),
                Err(SmaError::Malformed(_))
            ));

            let mut edited = header.clone();
            edited.allowed_hashes = entries;
            assert!(matches!(edited.validate(), Err(SmaError::Malformed(_))));
            let json = edited.to_json_bytes().unwrap();
            assert!(matches!(
                SmaHeader::from_json_bytes(&json),
                Err(SmaError::Malformed(_))
            ));
        }
    }

    #[test]
    fn test_unknown_version() {
        let (mut header, _) = issue();
        header.version = 9;
        assert!(matches!(header.validate(), Err(SmaError::BadVersion(9))));
    }

    #[test]
    fn test_normalize_allowed_keeps_order() {
        let normalized = normalize_allowed(vec![
            "B".into(),
            "A".into(),
            "B".into(),
            "C".into(),
            "A".into(),
        ]);
        assert_eq!(normalized, vec!["B", "A", "C"]);
        assert_eq!(aad_for(&normalized), b"B,A,C".to_vec());
    }

    #[test]
    fn test_bad_base64_is_malformed() {
        let err = SmaHeader::from_json_bytes(br#"{"Version":1,"FileId":"00000000-0000-0000-0000-000000000000","Salt":"!!","KeyHash":"","OwnerPubKey":""}"#)
            .unwrap_err();
        assert!(matches!(err, SmaError::Malformed(_)));
    }
}
