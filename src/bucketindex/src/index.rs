//! The per-tenant bucket index.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use ulid::Ulid;

use crate::metadata::{BlockMeta, DeletionMark};

/// First index format.
pub const INDEX_VERSION_1: u32 = 1;

/// Adds the compactor shard identifier to every block.
pub const INDEX_VERSION_2: u32 = 2;

pub const INDEX_VERSION_CURRENT: u32 = INDEX_VERSION_2;

/// Summary of every healthy block and deletion mark of one tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub version: u32,

    /// Complete blocks, sorted by identifier.
    #[serde(default)]
    pub blocks: Vec<Block>,

    /// Deletion marks, sorted by block identifier.
    #[serde(default)]
    pub block_deletion_marks: Vec<BlockDeletionMark>,

    /// Unix timestamp (seconds) of the pass that produced this index.
    pub updated_at: i64,
}

impl Index {
    pub fn block_ids(&self) -> BTreeSet<Ulid> {
        self.blocks.iter().map(|b| b.id).collect()
    }

    pub fn block(&self, id: Ulid) -> Option<&Block> {
        self.blocks.iter().find(|b| b.id == id)
    }

    pub fn deletion_marks_by_id(&self) -> HashMap<Ulid, &BlockDeletionMark> {
        self.block_deletion_marks
            .iter()
            .map(|m| (m.id, m))
            .collect()
    }

    /// Remove a block and its deletion mark, if any.
    pub fn remove_block(&mut self, id: Ulid) {
        self.blocks.retain(|b| b.id != id);
        self.block_deletion_marks.retain(|m| m.id != id);
    }

    pub fn updated_at_time(&self) -> DateTime<Utc> {
        timestamp_to_time(self.updated_at)
    }
}

/// A complete block as recorded in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    #[serde(rename = "block_id")]
    pub id: Ulid,
    pub min_time: i64,
    pub max_time: i64,
    /// Unix timestamp (seconds) of the block's meta.json last modification.
    pub uploaded_at: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub compactor_shard_id: String,
}

impl Block {
    pub fn from_meta(meta: &BlockMeta, uploaded_at: DateTime<Utc>) -> Self {
        Self {
            id: meta.ulid,
            min_time: meta.min_time,
            max_time: meta.max_time,
            uploaded_at: uploaded_at.timestamp(),
            compactor_shard_id: meta.compactor_shard_id().to_string(),
        }
    }

    /// Whether the block has samples within `[min_time, max_time]`.
    pub fn within(&self, min_time: i64, max_time: i64) -> bool {
        self.min_time <= max_time && min_time <= self.max_time
    }

    pub fn uploaded_at_time(&self) -> DateTime<Utc> {
        timestamp_to_time(self.uploaded_at)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min = timestamp_millis_to_time(self.min_time);
        let max = timestamp_millis_to_time(self.max_time);
        write!(
            f,
            "{} ({} - {})",
            self.id,
            min.to_rfc3339(),
            max.to_rfc3339()
        )?;
        if !self.compactor_shard_id.is_empty() {
            write!(f, " shard {}", self.compactor_shard_id)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeletionMark {
    #[serde(rename = "block_id")]
    pub id: Ulid,
    /// Unix timestamp (seconds).
    pub deletion_time: i64,
}

impl BlockDeletionMark {
    pub fn from_mark(mark: &DeletionMark) -> Self {
        Self {
            id: mark.id,
            deletion_time: mark.deletion_time,
        }
    }

    pub fn deletion_time(&self) -> DateTime<Utc> {
        timestamp_to_time(self.deletion_time)
    }
}

fn timestamp_to_time(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

fn timestamp_millis_to_time(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::COMPACTOR_SHARD_ID_EXTERNAL_LABEL;

    fn block(id: Ulid, min_time: i64, max_time: i64) -> Block {
        Block {
            id,
            min_time,
            max_time,
            uploaded_at: 1_600_000_000,
            compactor_shard_id: String::new(),
        }
    }

    #[test]
    fn test_block_within() {
        let b = block(Ulid::new(), 10, 20);

        assert!(b.within(10, 20));
        assert!(b.within(0, 10));
        assert!(b.within(20, 30));
        assert!(b.within(15, 16));
        assert!(!b.within(0, 9));
        assert!(!b.within(21, 30));
    }

    #[test]
    fn test_block_from_meta() {
        let id = Ulid::new();
        let meta = BlockMeta::new(id, 10, 20)
            .with_labels([(COMPACTOR_SHARD_ID_EXTERNAL_LABEL, "1_of_5")]);
        let uploaded_at = Utc.timestamp_opt(1_650_000_000, 0).unwrap();

        let b = Block::from_meta(&meta, uploaded_at);
        assert_eq!(b.id, id);
        assert_eq!((b.min_time, b.max_time), (10, 20));
        assert_eq!(b.uploaded_at, 1_650_000_000);
        assert_eq!(b.uploaded_at_time(), uploaded_at);
        assert_eq!(b.compactor_shard_id, "1_of_5");
    }

    #[test]
    fn test_index_json_layout() {
        let id = Ulid::from_string("01FSTQ95C8FS0ZAGTQS2EF1NEG").unwrap();
        let mut sharded = block(id, 10, 20);
        sharded.compactor_shard_id = "2_of_4".to_string();

        let index = Index {
            version: INDEX_VERSION_CURRENT,
            blocks: vec![sharded],
            block_deletion_marks: vec![BlockDeletionMark {
                id,
                deletion_time: 1_700_000_000,
            }],
            updated_at: 1_700_000_100,
        };

        let json: serde_json::Value = serde_json::to_value(&index).unwrap();
        assert_eq!(json["version"], 2);
        assert_eq!(json["blocks"][0]["block_id"], "01FSTQ95C8FS0ZAGTQS2EF1NEG");
        assert_eq!(json["blocks"][0]["compactor_shard_id"], "2_of_4");
        assert_eq!(json["block_deletion_marks"][0]["block_id"], "01FSTQ95C8FS0ZAGTQS2EF1NEG");
        assert_eq!(json["block_deletion_marks"][0]["deletion_time"], 1_700_000_000);
        assert_eq!(json["updated_at"], 1_700_000_100);

        let decoded: Index = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, index);
    }

    #[test]
    fn test_version_1_blocks_have_no_shard() {
        let json = r#"{
            "version": 1,
            "blocks": [{"block_id": "01FSTQ95C8FS0ZAGTQS2EF1NEG", "min_time": 1, "max_time": 2, "uploaded_at": 3}],
            "updated_at": 4
        }"#;

        let index: Index = serde_json::from_str(json).unwrap();
        assert_eq!(index.version, INDEX_VERSION_1);
        assert_eq!(index.blocks[0].compactor_shard_id, "");
        assert!(index.block_deletion_marks.is_empty());

        let json = serde_json::to_value(&index.blocks[0]).unwrap();
        assert!(json.get("compactor_shard_id").is_none());
    }

    #[test]
    fn test_remove_block() {
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut index = Index {
            version: INDEX_VERSION_CURRENT,
            blocks: vec![block(a, 0, 1), block(b, 1, 2)],
            block_deletion_marks: vec![BlockDeletionMark {
                id: a,
                deletion_time: 1,
            }],
            updated_at: 0,
        };

        index.remove_block(a);
        assert_eq!(index.block_ids(), BTreeSet::from([b]));
        assert!(index.deletion_marks_by_id().is_empty());
        assert!(index.block(a).is_none());
        assert!(index.block(b).is_some());
    }

    #[test]
    fn test_block_display() {
        let id = Ulid::from_string("01FSTQ95C8FS0ZAGTQS2EF1NEG").unwrap();
        let mut b = block(id, 0, 7_200_000);
        assert_eq!(
            b.to_string(),
            "01FSTQ95C8FS0ZAGTQS2EF1NEG (1970-01-01T00:00:00+00:00 - 1970-01-01T02:00:00+00:00)"
        );

        b.compactor_shard_id = "1_of_2".to_string();
        assert!(b.to_string().ends_with(" shard 1_of_2"));
    }
}
