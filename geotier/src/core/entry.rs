use super::error::Result;
use super::types::{CacheLevel, Region};
use crate::compression::CompressionAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Cipher marker for entries stored without encryption
pub const NO_CIPHER: &str = "none";

/// Stored unit, serialized as JSON under `level:logical_key`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Logical key
    pub key: String,
    /// JSON-encoded value, or base64 of the transformed bytes when
    /// `compression` or `cipher` is set
    pub value: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed: DateTime<Utc>,
    /// Size of the serialized value before transforms
    pub size_bytes: usize,
    pub cache_level: CacheLevel,
    pub region: Region,
    /// SHA-256 hex digest of the serialized value
    pub checksum: String,
    #[serde(default = "no_compression")]
    pub compression: CompressionAlgorithm,
    #[serde(default = "no_cipher")]
    pub cipher: String,
}

fn no_compression() -> CompressionAlgorithm {
    CompressionAlgorithm::None
}

fn no_cipher() -> String {
    NO_CIPHER.to_string()
}

impl CacheEntry {
    /// Check if the entry has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Seconds left before expiration, rounded up; 0 once expired
    pub fn remaining_ttl_secs(&self, now: DateTime<Utc>) -> u64 {
        let remaining = (self.expires_at - now).num_milliseconds();
        if remaining <= 0 {
            0
        } else {
            (remaining as u64).div_ceil(1000)
        }
    }

    /// Record a read hit
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.access_count += 1;
        self.last_accessed = now;
    }

    pub fn is_transformed(&self) -> bool {
        self.compression != CompressionAlgorithm::None || self.cipher != NO_CIPHER
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// SHA-256 hex digest used as the integrity checksum
pub fn checksum(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn entry(now: DateTime<Utc>, ttl_secs: i64) -> CacheEntry {
        let value = r#"{"name":"a"}"#.to_string();
        CacheEntry {
            key: "u1:profile".to_string(),
            checksum: checksum(value.as_bytes()),
            size_bytes: value.len(),
            value,
            content_type: "application/json".to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            access_count: 0,
            last_accessed: now,
            cache_level: CacheLevel::Edge,
            region: Region::Americas,
            compression: CompressionAlgorithm::None,
            cipher: NO_CIPHER.to_string(),
        }
    }

    #[test]
    fn test_expiration_boundary() {
        let now = Utc::now();
        let entry = entry(now, 300);

        assert!(!entry.is_expired(now + Duration::seconds(299)));
        assert!(entry.is_expired(now + Duration::seconds(300)));
        assert_eq!(entry.remaining_ttl_secs(now + Duration::milliseconds(500)), 300);
        assert_eq!(entry.remaining_ttl_secs(now + Duration::seconds(400)), 0);
    }

    #[test]
    fn test_payload_field_names() {
        let now = Utc::now();
        let json: serde_json::Value =
            serde_json::from_slice(&entry(now, 60).to_bytes().unwrap()).unwrap();

        for field in [
            "key",
            "value",
            "content_type",
            "created_at",
            "expires_at",
            "access_count",
            "last_accessed",
            "size_bytes",
            "cache_level",
            "region",
            "checksum",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(json["cache_level"], "l1_edge");
        assert_eq!(json["region"], "americas");
    }

    #[test]
    fn test_missing_transform_fields_default_to_plain() {
        let now = Utc::now();
        let mut json = serde_json::to_value(entry(now, 60)).unwrap();
        let obj = json.as_object_mut().unwrap();
        obj.remove("compression");
        obj.remove("cipher");

        let parsed: CacheEntry = serde_json::from_value(json).unwrap();
        assert!(!parsed.is_transformed());
    }

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
