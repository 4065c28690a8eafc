//! Record metadata schema (`metadata.json`) and tag-id derivation.

use std::path::{Path, PathBuf};

use probe_proto::{RecordId, TagId, TagKind, TagValue, WorkMode};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

pub const METADATA_FILE: &str = "metadata.json";
pub const DATA_FILE: &str = "data.bin";

/// Longest accepted tag name, in bytes.
pub const MAX_TAG_NAME: usize = 16;

fn schema_version_default() -> u32 {
    1
}

/// Named annotation attached to a record. The value buffer is fixed-width;
/// interpretation follows `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Tag {
    pub id: TagId,
    #[serde(rename = "Type")]
    pub kind: TagKind,
    pub name: String,
    pub value: TagValue,
}

/// Per-record metadata blob. Unversioned files from older payloads parse as
/// schema version 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RecordMeta {
    #[serde(default = "schema_version_default")]
    pub schema_version: u32,
    pub name: String,
    pub mode: WorkMode,
    pub frequency: u64,
    pub created_unix_us: i64,
    #[serde(default)]
    pub duration_sec: f64,
    #[serde(default)]
    pub data_count: u32,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl RecordMeta {
    pub fn new(name: &str, mode: WorkMode, frequency: u64, created_unix_us: i64) -> Self {
        Self {
            schema_version: schema_version_default(),
            name: name.to_owned(),
            mode,
            frequency,
            created_unix_us,
            duration_sec: 0.0,
            data_count: 0,
            tags: Vec::new(),
        }
    }
}

/// Deterministic tag id: `MD5(name ‖ record-id-uppercase-hex-no-dashes)`.
/// Used as a unique key, not a security primitive.
pub fn derive_tag_id(name: &str, record: RecordId) -> TagId {
    let mut ctx = md5::Context::new();
    ctx.consume(name.as_bytes());
    ctx.consume(record.simple_upper().as_bytes());
    TagId::from_bytes(ctx.compute().0)
}

pub fn validate_tag_name(name: &str) -> StoreResult<()> {
    if name.is_empty() || name.len() > MAX_TAG_NAME || !name.is_ascii() {
        return Err(StoreError::InvalidTagName(name.to_owned()));
    }
    Ok(())
}

/// Record subdirectory: dashed lowercase id under the store root.
pub fn record_dir(root: &Path, id: RecordId) -> PathBuf {
    root.join(id.to_string())
}

pub fn load_meta(dir: &Path) -> StoreResult<RecordMeta> {
    let raw = std::fs::read(dir.join(METADATA_FILE))?;
    serde_json::from_slice(&raw).map_err(|e| StoreError::Metadata(e.to_string()))
}

pub fn save_meta(dir: &Path, meta: &RecordMeta) -> StoreResult<u64> {
    let raw = serde_json::to_vec_pretty(meta).map_err(|e| StoreError::Metadata(e.to_string()))?;
    std::fs::write(dir.join(METADATA_FILE), &raw)?;
    Ok(raw.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_id_matches_documented_derivation() {
        let record = RecordId::parse("01020304-0506-0708-090a-0b0c0d0e0f10").unwrap();
        let derived = derive_tag_id("note", record);

        let mut ctx = md5::Context::new();
        ctx.consume(b"note");
        ctx.consume(b"0102030405060708090A0B0C0D0E0F10");
        assert_eq!(derived, TagId::from_bytes(ctx.compute().0));
    }

    #[test]
    fn tag_id_is_stable_and_name_sensitive() {
        let record = RecordId::new();
        assert_eq!(derive_tag_id("a", record), derive_tag_id("a", record));
        assert_ne!(derive_tag_id("a", record), derive_tag_id("b", record));
        assert_ne!(derive_tag_id("a", record), derive_tag_id("a", RecordId::new()));
    }

    #[test]
    fn meta_json_uses_spec_field_names() {
        let meta = RecordMeta::new("flight-01", WorkMode::Llz, 109_500_000, 1_700_000_000_000_000);
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["Name"], "flight-01");
        assert_eq!(json["Mode"], "LLZ");
        assert_eq!(json["Frequency"], 109_500_000u64);
        assert_eq!(json["SchemaVersion"], 1);
        assert!(json["Tags"].as_array().unwrap().is_empty());
    }

    #[test]
    fn meta_without_schema_version_parses_as_v1() {
        let json = r#"{
            "Name": "old",
            "Mode": "GP",
            "Frequency": 329150000,
            "CreatedUnixUs": 0,
            "DurationSec": 1.5,
            "DataCount": 3,
            "Tags": []
        }"#;
        let meta: RecordMeta = serde_json::from_str(json).unwrap();
        assert_eq!(meta.schema_version, 1);
        assert_eq!(meta.mode, WorkMode::Gp);
    }

    #[test]
    fn tag_name_validation() {
        assert!(validate_tag_name("note").is_ok());
        assert!(validate_tag_name("").is_err());
        assert!(validate_tag_name("a-very-long-tag-name").is_err());
        assert!(validate_tag_name("имя").is_err());
    }
}
