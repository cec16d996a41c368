//! Block metadata and marker documents.
//!
//! `meta.json` describes a block (identifier, sample time range, external
//! labels); `deletion-mark.json` and `no-compact-mark.json` record lifecycle
//! decisions taken by other components. Decoding distinguishes documents that
//! are not valid JSON of the expected shape ([`MetaDecodeError::Malformed`])
//! from well-formed documents that violate the format's rules
//! ([`MetaDecodeError::Invalid`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;
use ulid::Ulid;

/// The only supported `meta.json` format version.
pub const TSDB_VERSION_1: u32 = 1;

/// The only supported deletion mark format version.
pub const DELETION_MARK_VERSION_1: u32 = 1;

/// The only supported no-compact mark format version.
pub const NO_COMPACT_MARK_VERSION_1: u32 = 1;

/// External label holding the tenant that owns a block.
pub const TENANT_ID_EXTERNAL_LABEL: &str = "__org_id__";

/// External label holding the split-and-merge shard a block was compacted for.
pub const COMPACTOR_SHARD_ID_EXTERNAL_LABEL: &str = "__compactor_shard_id__";

/// Legacy external label set by ingesters.
pub const INGESTER_ID_EXTERNAL_LABEL: &str = "__ingester_id__";

/// Legacy shard label, superseded by [`COMPACTOR_SHARD_ID_EXTERNAL_LABEL`].
pub const DEPRECATED_SHARD_ID_EXTERNAL_LABEL: &str = "__shard_id__";

#[derive(Debug, Error)]
pub enum MetaDecodeError {
    #[error("malformed document: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid document: {0}")]
    Invalid(String),
}

/// Content of a block's `meta.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    pub ulid: Ulid,
    /// Inclusive lower bound of the block's samples, in milliseconds.
    pub min_time: i64,
    /// Upper bound of the block's samples, in milliseconds.
    pub max_time: i64,
    #[serde(default)]
    pub stats: BlockStats,
    #[serde(default)]
    pub compaction: BlockCompaction,
    pub version: u32,
    #[serde(default)]
    pub thanos: ThanosMeta,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    #[serde(default)]
    pub num_samples: u64,
    #[serde(default)]
    pub num_series: u64,
    #[serde(default)]
    pub num_chunks: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockCompaction {
    #[serde(default)]
    pub level: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub sources: Vec<Ulid>,
}

/// Metadata added on top of the TSDB block format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThanosMeta {
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub downsample: Downsample,
    /// Component that produced the block.
    #[serde(default)]
    pub source: String,
    #[serde(
        default,
        deserialize_with = "null_as_default",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub files: Vec<BlockFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Downsample {
    #[serde(default)]
    pub resolution: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockFile {
    pub rel_path: String,
    #[serde(default)]
    pub size_bytes: u64,
}

impl BlockMeta {
    /// A level-1 block covering `[min_time, max_time]` with no labels.
    pub fn new(ulid: Ulid, min_time: i64, max_time: i64) -> Self {
        Self {
            ulid,
            min_time,
            max_time,
            stats: BlockStats::default(),
            compaction: BlockCompaction {
                level: 1,
                sources: vec![ulid],
            },
            version: TSDB_VERSION_1,
            thanos: ThanosMeta::default(),
        }
    }

    pub fn with_labels<K, V>(mut self, labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.thanos.labels = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    /// Check the rules every stored `meta.json` must follow.
    pub fn validate(&self) -> Result<(), MetaDecodeError> {
        if self.version != TSDB_VERSION_1 {
            return Err(MetaDecodeError::Invalid(format!(
                "unexpected meta file version {}",
                self.version
            )));
        }
        if self.min_time > self.max_time {
            return Err(MetaDecodeError::Invalid(format!(
                "min time {} is after max time {}",
                self.min_time, self.max_time
            )));
        }
        Ok(())
    }

    /// Compactor shard the block belongs to, empty when unsharded.
    pub fn compactor_shard_id(&self) -> &str {
        self.thanos
            .labels
            .get(COMPACTOR_SHARD_ID_EXTERNAL_LABEL)
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Content of a block's `deletion-mark.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMark {
    pub id: Ulid,
    /// Unix timestamp (seconds) at which the block was marked.
    pub deletion_time: i64,
    pub version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl DeletionMark {
    pub fn new(id: Ulid, deletion_time: DateTime<Utc>) -> Self {
        Self {
            id,
            deletion_time: deletion_time.timestamp(),
            version: DELETION_MARK_VERSION_1,
            details: String::new(),
        }
    }
}

/// Content of a block's `no-compact-mark.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoCompactMark {
    pub id: Ulid,
    pub version: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    /// Unix timestamp (seconds) at which the block was marked.
    pub no_compact_time: i64,
    pub reason: String,
}

impl NoCompactMark {
    pub fn new(id: Ulid, reason: impl Into<String>, marked_at: DateTime<Utc>) -> Self {
        Self {
            id,
            version: NO_COMPACT_MARK_VERSION_1,
            details: String::new(),
            no_compact_time: marked_at.timestamp(),
            reason: reason.into(),
        }
    }
}

pub fn decode_block_meta(data: &[u8]) -> Result<BlockMeta, MetaDecodeError> {
    let value: Value = serde_json::from_slice(data)?;
    require_fields(&value, &["ulid", "minTime", "maxTime", "version"])?;

    let meta: BlockMeta = serde_json::from_value(value)?;
    meta.validate()?;

    Ok(meta)
}

pub fn decode_deletion_mark(data: &[u8]) -> Result<DeletionMark, MetaDecodeError> {
    let value: Value = serde_json::from_slice(data)?;
    require_fields(&value, &["id", "deletion_time", "version"])?;

    let mark: DeletionMark = serde_json::from_value(value)?;
    if mark.version != DELETION_MARK_VERSION_1 {
        return Err(MetaDecodeError::Invalid(format!(
            "unexpected deletion mark version {}",
            mark.version
        )));
    }

    Ok(mark)
}

pub fn decode_no_compact_mark(data: &[u8]) -> Result<NoCompactMark, MetaDecodeError> {
    let value: Value = serde_json::from_slice(data)?;
    require_fields(&value, &["id", "no_compact_time", "version", "reason"])?;

    let mark: NoCompactMark = serde_json::from_value(value)?;
    if mark.version != NO_COMPACT_MARK_VERSION_1 {
        return Err(MetaDecodeError::Invalid(format!(
            "unexpected no-compact mark version {}",
            mark.version
        )));
    }

    Ok(mark)
}

pub fn encode_block_meta(meta: &BlockMeta) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(meta)
}

pub fn encode_deletion_mark(mark: &DeletionMark) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(mark)
}

pub fn encode_no_compact_mark(mark: &NoCompactMark) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec_pretty(mark)
}

fn require_fields(value: &Value, fields: &[&str]) -> Result<(), MetaDecodeError> {
    let object = value
        .as_object()
        .ok_or_else(|| MetaDecodeError::Invalid("expected a JSON object".to_string()))?;

    for field in fields {
        if object.get(*field).is_none_or(Value::is_null) {
            return Err(MetaDecodeError::Invalid(format!(
                "missing required field {field}"
            )));
        }
    }

    Ok(())
}

// Some writers encode empty maps and lists as `null`.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_ID: &str = "01FSTQ95C8FS0ZAGTQS2EF1NEG";

    fn block_id() -> Ulid {
        Ulid::from_string(BLOCK_ID).unwrap()
    }

    #[test]
    fn test_decode_block_meta() {
        let json = format!(
            r#"{{
                "ulid": "{BLOCK_ID}",
                "minTime": 10,
                "maxTime": 20,
                "stats": {{"numSamples": 100, "numSeries": 2, "numChunks": 4}},
                "compaction": {{"level": 1, "sources": ["{BLOCK_ID}"]}},
                "version": 1,
                "thanos": {{
                    "labels": {{"__compactor_shard_id__": "1_of_5"}},
                    "downsample": {{"resolution": 0}},
                    "source": "compactor",
                    "files": [{{"rel_path": "index", "size_bytes": 1024}}]
                }}
            }}"#
        );

        let meta = decode_block_meta(json.as_bytes()).unwrap();
        assert_eq!(meta.ulid, block_id());
        assert_eq!((meta.min_time, meta.max_time), (10, 20));
        assert_eq!(meta.stats.num_samples, 100);
        assert_eq!(meta.compactor_shard_id(), "1_of_5");
        assert_eq!(meta.thanos.files[0].rel_path, "index");
    }

    #[test]
    fn test_decode_block_meta_accepts_null_collections() {
        let json = format!(
            r#"{{"ulid": "{BLOCK_ID}", "minTime": 1, "maxTime": 2, "version": 1,
                "compaction": {{"level": 1, "sources": null}},
                "thanos": {{"labels": null, "downsample": {{"resolution": 0}}, "source": "", "files": null}}}}"#
        );

        let meta = decode_block_meta(json.as_bytes()).unwrap();
        assert!(meta.thanos.labels.is_empty());
        assert!(meta.compaction.sources.is_empty());
        assert_eq!(meta.compactor_shard_id(), "");
    }

    #[test]
    fn test_decode_block_meta_rejects_garbage() {
        let err = decode_block_meta(b"invalid!}").unwrap_err();
        assert!(matches!(err, MetaDecodeError::Malformed(_)));

        let json =
            format!(r#"{{"ulid": "{BLOCK_ID}", "minTime": "ten", "maxTime": 20, "version": 1}}"#);
        let err = decode_block_meta(json.as_bytes()).unwrap_err();
        assert!(matches!(err, MetaDecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_block_meta_rejects_invalid_documents() {
        let missing_range = format!(r#"{{"ulid": "{BLOCK_ID}", "version": 1}}"#);
        let inverted_range =
            format!(r#"{{"ulid": "{BLOCK_ID}", "minTime": 30, "maxTime": 20, "version": 1}}"#);
        let unknown_version =
            format!(r#"{{"ulid": "{BLOCK_ID}", "minTime": 10, "maxTime": 20, "version": 2}}"#);

        for json in [missing_range, inverted_range, unknown_version] {
            let err = decode_block_meta(json.as_bytes()).unwrap_err();
            assert!(matches!(err, MetaDecodeError::Invalid(_)), "{json}: {err}");
        }

        let err = decode_block_meta(b"[1, 2, 3]").unwrap_err();
        assert!(matches!(err, MetaDecodeError::Invalid(_)));
    }

    #[test]
    fn test_validate_block_meta() {
        assert!(BlockMeta::new(block_id(), 10, 20).validate().is_ok());
        assert!(BlockMeta::new(block_id(), 10, 10).validate().is_ok());

        let err = BlockMeta::new(block_id(), 30, 20).validate().unwrap_err();
        assert_eq!(err.to_string(), "invalid document: min time 30 is after max time 20");

        let mut meta = BlockMeta::new(block_id(), 10, 20);
        meta.version = 2;
        assert!(matches!(meta.validate(), Err(MetaDecodeError::Invalid(_))));
    }

    #[test]
    fn test_encoded_block_meta_decodes() {
        let meta = BlockMeta::new(block_id(), 10, 20)
            .with_labels([(COMPACTOR_SHARD_ID_EXTERNAL_LABEL, "3_of_10")]);

        let decoded = decode_block_meta(&encode_block_meta(&meta).unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_decode_deletion_mark() {
        let json = format!(r#"{{"id": "{BLOCK_ID}", "deletion_time": 1642000000, "version": 1}}"#);
        let mark = decode_deletion_mark(json.as_bytes()).unwrap();
        assert_eq!(mark.id, block_id());
        assert_eq!(mark.deletion_time, 1642000000);

        assert!(matches!(
            decode_deletion_mark(b"invalid!}"),
            Err(MetaDecodeError::Malformed(_))
        ));

        let json = format!(r#"{{"id": "{BLOCK_ID}", "version": 1}}"#);
        assert!(matches!(
            decode_deletion_mark(json.as_bytes()),
            Err(MetaDecodeError::Invalid(_))
        ));

        let json = format!(r#"{{"id": "{BLOCK_ID}", "deletion_time": 1, "version": 7}}"#);
        assert!(matches!(
            decode_deletion_mark(json.as_bytes()),
            Err(MetaDecodeError::Invalid(_))
        ));
    }

    #[test]
    fn test_decode_no_compact_mark() {
        let mark = NoCompactMark::new(block_id(), "manual", Utc::now());
        let decoded = decode_no_compact_mark(&encode_no_compact_mark(&mark).unwrap()).unwrap();
        assert_eq!(decoded, mark);

        let json = format!(r#"{{"id": "{BLOCK_ID}", "no_compact_time": 1, "version": 1}}"#);
        assert!(decode_no_compact_mark(json.as_bytes()).is_err());
    }
}
