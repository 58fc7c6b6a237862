//! Owner-signed update tokens
//!
//! A token amends a container's allow-list without the owner being present
//! at application time. It names the file, the hashes to add and remove,
//! an expiry and a random nonce; the owner signs a canonical binary
//! encoding of those fields.
//!
//! Verification order is fixed: wrong file, then expiry, then signature.

use crate::crypto;
use crate::error::{Rejection, Result, SmaError};
use crate::header::{b64, normalize_allowed, SmaHeader};
use crate::io::write_atomic;
use crate::keys::OwnerKeyPair;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};
use uuid::Uuid;

/// Domain separation prefix of the signed encoding
pub const TOKEN_DOMAIN: &[u8] = b"SMA-UPDATE-TOKEN-v1";

/// Size of the random token nonce
pub const TOKEN_NONCE_SIZE: usize = 16;

/// Ticks (100 ns) between 0001-01-01 and the Unix epoch
pub const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

const TICKS_PER_SECOND: i64 = 10_000_000;

/// Convert a UTC time to 100 ns ticks since 0001-01-01, saturating at the
/// `i64` bounds
pub fn ticks_from_datetime(time: DateTime<Utc>) -> i64 {
    time.timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(UNIX_EPOCH_TICKS)
        .saturating_add(i64::from(time.timestamp_subsec_nanos() / 100))
}

/// Inverse of [`ticks_from_datetime`], `None` when out of chrono's range
pub fn datetime_from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let since_epoch = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = (since_epoch.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    Utc.timestamp_opt(secs, nanos).single()
}

pub fn now_ticks() -> i64 {
    ticks_from_datetime(Utc::now())
}

/// The signed part of a token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TokenPayload {
    pub file_id: Uuid,
    #[serde(default)]
    pub add_hashes: Vec<String>,
    #[serde(default)]
    pub remove_hashes: Vec<String>,
    pub expires_utc_ticks: i64,
    #[serde(with = "b64")]
    pub nonce: Vec<u8>,
}

impl TokenPayload {
    /// Canonical little-endian encoding covered by the owner signature:
    ///
    /// ```text
    /// domain | fileId(16) | u32 n + n × (u32 len + utf8) add
    ///        | u32 n + n × (u32 len + utf8) remove
    ///        | i64 expiresUtcTicks | u32 len + nonce
    /// ```
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128);
        out.extend_from_slice(TOKEN_DOMAIN);
        out.extend_from_slice(self.file_id.as_bytes());
        write_string_list(&mut out, &self.add_hashes);
        write_string_list(&mut out, &self.remove_hashes);
        out.extend_from_slice(&self.expires_utc_ticks.to_le_bytes());
        write_bytes(&mut out, &self.nonce);
        out
    }

    /// `(old ∪ add) \ remove`, keeping first-seen order
    pub fn amend(&self, allowed: &[String]) -> Vec<String> {
        let merged = allowed
            .iter()
            .chain(self.add_hashes.iter())
            .filter(|hash| !self.remove_hashes.contains(hash))
            .cloned()
            .collect();
        normalize_allowed(merged)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        datetime_from_ticks(self.expires_utc_ticks)
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_string_list(out: &mut Vec<u8>, items: &[String]) {
    out.extend_from_slice(&(items.len() as u32).to_le_bytes());
    for item in items {
        write_bytes(out, item.as_bytes());
    }
}

/// Capability to amend one container's allow-list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateToken {
    pub payload: TokenPayload,
    #[serde(with = "b64")]
    pub owner_signature: Vec<u8>,
}

impl UpdateToken {
    /// Issue a token valid for `ttl` from now
    pub fn issue(
        owner: &OwnerKeyPair,
        file_id: Uuid,
        add_hashes: Vec<String>,
        remove_hashes: Vec<String>,
        ttl: Duration,
    ) -> Self {
        Self::issue_until(owner, file_id, add_hashes, remove_hashes, Utc::now() + ttl)
    }

    /// Issue a token expiring at a fixed instant
    pub fn issue_until(
        owner: &OwnerKeyPair,
        file_id: Uuid,
        add_hashes: Vec<String>,
        remove_hashes: Vec<String>,
        expires: DateTime<Utc>,
    ) -> Self {
        let nonce: [u8; TOKEN_NONCE_SIZE] = crypto::random_bytes();
        let payload = TokenPayload {
            file_id,
            add_hashes,
            remove_hashes,
            expires_utc_ticks: ticks_from_datetime(expires),
            nonce: nonce.to_vec(),
        };
        let owner_signature = owner.sign(&payload.canonical_bytes());
        debug!(
            "Issued update token for {} (+{} / -{})",
            file_id,
            payload.add_hashes.len(),
            payload.remove_hashes.len()
        );
        UpdateToken {
            payload,
            owner_signature,
        }
    }

    /// Check the token against a container header at `now_ticks`
    pub fn verify(&self, header: &SmaHeader, now_ticks: i64) -> Result<()> {
        let rejection = if self.payload.file_id != header.file_id {
            Some(Rejection::WrongFile)
        } else if now_ticks >= self.payload.expires_utc_ticks {
            Some(Rejection::Expired)
        } else if !crypto::verify_signature(
            &header.owner_pub_key,
            &self.payload.canonical_bytes(),
            &self.owner_signature,
        ) {
            Some(Rejection::BadSignature)
        } else {
            None
        };

        match rejection {
            Some(reason) => {
                warn!("Update token for {} rejected: {}", header.file_id, reason);
                Err(reason.into())
            }
            None => Ok(()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| SmaError::Malformed(format!("token JSON: {}", e)))
    }

    /// Write the token as JSON, atomically
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        write_atomic(path.as_ref(), self.to_json()?.as_bytes())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_for(owner: &OwnerKeyPair) -> SmaHeader {
        SmaHeader::issue("pw", owner, vec!["a".into(), "b".into()], 1_000).unwrap()
    }

    fn hashes(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ticks_roundtrip() {
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert_eq!(ticks_from_datetime(epoch), UNIX_EPOCH_TICKS);

        let time = Utc.timestamp_opt(1_700_000_000, 123_456_700).unwrap();
        assert_eq!(datetime_from_ticks(ticks_from_datetime(time)), Some(time));
    }

    #[test]
    fn test_extreme_ticks_do_not_overflow() {
        assert_eq!(datetime_from_ticks(i64::MIN), None);
        assert_eq!(datetime_from_ticks(i64::MIN + 1), None);

        let payload = TokenPayload {
            file_id: Uuid::nil(),
            add_hashes: vec![],
            remove_hashes: vec![],
            expires_utc_ticks: i64::MIN,
            nonce: vec![0; TOKEN_NONCE_SIZE],
        };
        assert_eq!(payload.expires_at(), None);
    }

    #[test]
    fn test_canonical_layout() {
        let payload = TokenPayload {
            file_id: Uuid::nil(),
            add_hashes: hashes(&["ab"]),
            remove_hashes: vec![],
            expires_utc_ticks: 5,
            nonce: vec![9, 9],
        };
        let mut expected = TOKEN_DOMAIN.to_vec();
        expected.extend_from_slice(&[0u8; 16]);
        expected.extend_from_slice(&1u32.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&0u32.to_le_bytes());
        expected.extend_from_slice(&5i64.to_le_bytes());
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(&[9, 9]);
        assert_eq!(payload.canonical_bytes(), expected);
    }

    #[test]
    fn test_list_boundaries_are_unambiguous() {
        let mut one = TokenPayload {
            file_id: Uuid::nil(),
            add_hashes: hashes(&["ab", "c"]),
            remove_hashes: vec![],
            expires_utc_ticks: 0,
            nonce: vec![],
        };
        let before = one.canonical_bytes();
        one.add_hashes = hashes(&["a", "bc"]);
        assert_ne!(before, one.canonical_bytes());
    }

    #[test]
    fn test_amend_is_ordered_and_idempotent() {
        let owner = OwnerKeyPair::generate();
        let token = UpdateToken::issue(
            &owner,
            Uuid::new_v4(),
            hashes(&["c", "a"]),
            hashes(&["b"]),
            Duration::hours(1),
        );
        let once = token.payload.amend(&hashes(&["a", "b"]));
        assert_eq!(once, hashes(&["a", "c"]));
        assert_eq!(token.payload.amend(&once), once);
    }

    #[test]
    fn test_verify_accepts_valid_token() {
        let owner = OwnerKeyPair::generate();
        let header = header_for(&owner);
        let token = UpdateToken::issue(&owner, header.file_id, hashes(&["c"]), vec![], Duration::hours(1));
        token.verify(&header, now_ticks()).unwrap();
    }

    #[test]
    fn test_verify_rejection_order() {
        let owner = OwnerKeyPair::generate();
        let header = header_for(&owner);
        let forger = OwnerKeyPair::generate();

        // Wrong file wins over expiry and signature
        let expired_forged_elsewhere = UpdateToken::issue_until(
            &forger,
            Uuid::new_v4(),
            vec![],
            vec![],
            Utc::now() - Duration::hours(1),
        );
        assert_eq!(
            expired_forged_elsewhere.verify(&header, now_ticks()).unwrap_err().rejection(),
            Some(Rejection::WrongFile)
        );

        // Expiry wins over signature
        let expired_forged = UpdateToken::issue_until(
            &forger,
            header.file_id,
            vec![],
            vec![],
            Utc::now() - Duration::hours(1),
        );
        assert_eq!(
            expired_forged.verify(&header, now_ticks()).unwrap_err().rejection(),
            Some(Rejection::Expired)
        );

        let forged = UpdateToken::issue(&forger, header.file_id, hashes(&["x"]), vec![], Duration::hours(1));
        assert_eq!(
            forged.verify(&header, now_ticks()).unwrap_err().rejection(),
            Some(Rejection::BadSignature)
        );
    }

    #[test]
    fn test_expiry_boundary() {
        let owner = OwnerKeyPair::generate();
        let header = header_for(&owner);
        let token = UpdateToken::issue(&owner, header.file_id, vec![], vec![], Duration::hours(1));
        let expires = token.payload.expires_utc_ticks;

        assert!(token.verify(&header, expires - 1).is_ok());
        assert_eq!(
            token.verify(&header, expires).unwrap_err().rejection(),
            Some(Rejection::Expired)
        );
    }

    #[test]
    fn test_tampered_payload_fails_signature() {
        let owner = OwnerKeyPair::generate();
        let header = header_for(&owner);
        let mut token = UpdateToken::issue(&owner, header.file_id, hashes(&["c"]), vec![], Duration::hours(1));
        token.payload.add_hashes.push("mallory".into());
        assert_eq!(
            token.verify(&header, now_ticks()).unwrap_err().rejection(),
            Some(Rejection::BadSignature)
        );
    }

    #[test]
    fn test_json_shape_and_file_roundtrip() {
        let owner = OwnerKeyPair::generate();
        let token = UpdateToken::issue(&owner, Uuid::new_v4(), hashes(&["c"]), vec![], Duration::days(7));

        let value: serde_json::Value = serde_json::from_str(&token.to_json().unwrap()).unwrap();
        assert!(value["Payload"]["FileId"].is_string());
        assert!(value["Payload"]["ExpiresUtcTicks"].is_i64());
        assert!(value["OwnerSignature"].is_string());

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("grant.json");
        token.save(&path).unwrap();
        assert_eq!(UpdateToken::load(&path).unwrap(), token);
    }

    #[test]
    fn test_nonce_makes_tokens_distinct() {
        let owner = OwnerKeyPair::generate();
        let id = Uuid::new_v4();
        let expires = Utc::now() + Duration::hours(1);
        let a = UpdateToken::issue_until(&owner, id, vec![], vec![], expires);
        let b = UpdateToken::issue_until(&owner, id, vec![], vec![], expires);
        assert_ne!(a.payload.nonce, b.payload.nonce);
        assert_eq!(a.payload.nonce.len(), TOKEN_NONCE_SIZE);
    }
}
