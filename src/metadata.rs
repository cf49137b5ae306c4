use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::SchemaTable;

/// Per-table sync state, persisted as
/// `<storage_path>/metadata/<schema>/<table>.json`.
///
/// The checksum is only meaningful while `row_count` matches the sink's
/// latest snapshot; both are overwritten together after a successful sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableMetadata {
    #[serde(default)]
    pub last_sync_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub row_count: i64,
    #[serde(default)]
    pub checksum: String,
}

pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn table_path(&self, table: &SchemaTable) -> PathBuf {
        self.root
            .join(&table.schema)
            .join(format!("{}.json", table.table))
    }

    /// A missing file reads as empty metadata (never-synced table).
    pub fn load(&self, table: &SchemaTable) -> Result<TableMetadata> {
        let path = self.table_path(table);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(TableMetadata::default())
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading metadata {}", path.display()))
            }
        };
        serde_json::from_slice(&data)
            .with_context(|| format!("parsing metadata {}", path.display()))
    }

    /// Atomic overwrite: write to a temp file in the same directory, rename
    /// over the target.
    pub fn save(&self, table: &SchemaTable, metadata: &TableMetadata) -> Result<()> {
        let path = self.table_path(table);
        let dir = path.parent().expect("table path has a parent");
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating metadata directory {}", dir.display()))?;

        let data = serde_json::to_vec(metadata).context("serializing table metadata")?;
        let tmp = dir.join(format!(".{}.json.tmp", table.table));
        std::fs::write(&tmp, data)
            .with_context(|| format!("writing metadata {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("publishing metadata {}", path.display()))?;
        Ok(())
    }

    pub fn delete(&self, table: &SchemaTable) -> Result<()> {
        let path = self.table_path(table);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting metadata {}", path.display())),
        }
    }

    pub fn delete_schema(&self, schema: &str) -> Result<()> {
        let dir = self.root.join(schema);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting metadata dir {}", dir.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        let meta = store.load(&SchemaTable::new("public", "users")).unwrap();
        assert_eq!(meta, TableMetadata::default());
        assert!(meta.last_sync_time.is_none());
        assert_eq!(meta.checksum, "");
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        let table = SchemaTable::new("public", "users");

        let meta = TableMetadata {
            last_sync_time: Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()),
            row_count: 42,
            checksum: "42:12345".into(),
        };
        store.save(&table, &meta).unwrap();
        assert_eq!(store.load(&table).unwrap(), meta);

        // Overwrite wins.
        let newer = TableMetadata {
            last_sync_time: Some(Utc.with_ymd_and_hms(2025, 6, 2, 12, 0, 0).unwrap()),
            row_count: 43,
            checksum: "43:99999".into(),
        };
        store.save(&table, &newer).unwrap();
        assert_eq!(store.load(&table).unwrap(), newer);
    }

    #[test]
    fn serialized_field_names_are_camel_case() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        let table = SchemaTable::new("s", "t");
        store
            .save(
                &table,
                &TableMetadata {
                    last_sync_time: Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()),
                    row_count: 1,
                    checksum: "1:77".into(),
                },
            )
            .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("s").join("t.json")).unwrap();
        assert!(raw.contains("\"lastSyncTime\""));
        assert!(raw.contains("\"rowCount\""));
        assert!(raw.contains("\"checksum\""));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        let table = SchemaTable::new("public", "gone");
        store.delete(&table).unwrap();
        store
            .save(&table, &TableMetadata::default())
            .unwrap();
        store.delete(&table).unwrap();
        store.delete(&table).unwrap();
        store.delete_schema("public").unwrap();
        store.delete_schema("public").unwrap();
    }
}
