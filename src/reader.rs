use anyhow::{Context, Result};
use futures::TryStreamExt;
use iceberg::io::FileIO;
use iceberg::table::{StaticTable, Table};
use iceberg::TableIdent;
use std::path::{Path, PathBuf};

use crate::error::BemiError;
use crate::types::SchemaTable;

/// Name of the per-table pointer file naming the current metadata file.
/// Updating it is the cross-process linearization point for commits.
pub const VERSION_HINT_FILE: &str = "version-hint.text";

/// A resolved snapshot of one sink table.
pub struct SnapshotInfo {
    pub snapshot_id: Option<i64>,
    pub schema: iceberg::spec::SchemaRef,
    pub data_files: Vec<String>,
}

/// Read-only view of the Iceberg warehouse.
///
/// Tables are resolved through their `version-hint.text` pointer, so one
/// call observes exactly one committed snapshot; successive calls may see
/// newer ones.
pub struct IcebergReader {
    warehouse: PathBuf,
    file_io: FileIO,
}

pub fn table_dir(warehouse: &Path, table: &SchemaTable) -> PathBuf {
    warehouse.join(&table.schema).join(&table.table)
}

pub fn version_hint_path(warehouse: &Path, table: &SchemaTable) -> PathBuf {
    table_dir(warehouse, table)
        .join("metadata")
        .join(VERSION_HINT_FILE)
}

impl IcebergReader {
    pub fn new(warehouse: impl Into<PathBuf>, file_io: FileIO) -> Self {
        Self {
            warehouse: warehouse.into(),
            file_io,
        }
    }

    /// Sink schema names, sorted.
    pub fn schemas(&self) -> Result<Vec<String>> {
        let mut schemas = Vec::new();
        let entries = match std::fs::read_dir(&self.warehouse) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(schemas),
            Err(e) => {
                return Err(BemiError::CatalogUnavailable(e.to_string()))
                    .context("listing warehouse schemas")
            }
        };
        for entry in entries {
            let entry = entry.context("reading warehouse directory")?;
            if entry.file_type().context("warehouse entry type")?.is_dir() {
                schemas.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        schemas.sort();
        Ok(schemas)
    }

    /// All sink tables, sorted by (schema, table).
    pub fn schema_tables(&self) -> Result<Vec<SchemaTable>> {
        let mut tables = Vec::new();
        for schema in self.schemas()? {
            let dir = self.warehouse.join(&schema);
            for entry in std::fs::read_dir(&dir)
                .with_context(|| format!("listing tables in {}", dir.display()))?
            {
                let entry = entry.context("reading schema directory")?;
                if !entry.file_type().context("table entry type")?.is_dir() {
                    continue;
                }
                let table = SchemaTable::new(&schema, entry.file_name().to_string_lossy());
                // Only directories with a committed pointer are tables.
                if version_hint_path(&self.warehouse, &table).exists() {
                    tables.push(table);
                }
            }
        }
        tables.sort();
        Ok(tables)
    }

    /// Load the current committed state of a table.
    pub async fn load_table(&self, table: &SchemaTable) -> Result<Table> {
        let hint_path = version_hint_path(&self.warehouse, table);
        let metadata_location = std::fs::read_to_string(&hint_path)
            .map(|s| s.trim().to_string())
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => BemiError::NotFound(table.to_string()),
                _ => BemiError::CatalogUnavailable(e.to_string()),
            })?;

        let ident = TableIdent::from_strs([&table.schema, &table.table])
            .context("building table identifier")?;
        let static_table =
            StaticTable::from_metadata_file(&metadata_location, ident, self.file_io.clone())
                .await
                .map_err(|e| BemiError::CatalogUnavailable(e.to_string()))
                .with_context(|| format!("loading table {table}"))?;
        Ok(static_table.into_table())
    }

    /// The table's current snapshot: schema and the flat list of data files
    /// reachable from the manifest list.
    pub async fn current_snapshot(&self, table: &SchemaTable) -> Result<SnapshotInfo> {
        let loaded = self.load_table(table).await?;
        let metadata = loaded.metadata();
        let schema = metadata.current_schema().clone();

        let Some(snapshot) = metadata.current_snapshot() else {
            return Ok(SnapshotInfo {
                snapshot_id: None,
                schema,
                data_files: Vec::new(),
            });
        };

        let manifest_list = snapshot
            .load_manifest_list(loaded.file_io(), metadata)
            .await
            .with_context(|| format!("loading manifest list for {table}"))?;

        let mut data_files = Vec::new();
        for manifest_file in manifest_list.entries() {
            let manifest = manifest_file
                .load_manifest(loaded.file_io())
                .await
                .with_context(|| format!("loading manifest for {table}"))?;
            for entry in manifest.entries() {
                if entry.is_alive() {
                    data_files.push(entry.data_file().file_path().to_string());
                }
            }
        }

        Ok(SnapshotInfo {
            snapshot_id: Some(snapshot.snapshot_id()),
            schema,
            data_files,
        })
    }

    /// Current Arrow schema of a sink table, or None when the table has
    /// never been committed. Used by the writer's evolution gate.
    pub async fn current_arrow_schema(
        &self,
        table: &SchemaTable,
    ) -> Result<Option<arrow::datatypes::Schema>> {
        match self.load_table(table).await {
            Ok(loaded) => {
                let schema = iceberg::arrow::schema_to_arrow_schema(
                    loaded.metadata().current_schema(),
                )
                .context("converting current table schema to arrow")?;
                Ok(Some(schema))
            }
            Err(e) => {
                if e.downcast_ref::<BemiError>()
                    .is_some_and(|e| matches!(e, BemiError::NotFound(_)))
                {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Record batches for a full scan; test and tooling convenience.
    pub async fn scan_all(&self, table: &SchemaTable) -> Result<Vec<arrow::record_batch::RecordBatch>> {
        let loaded = self.load_table(table).await?;
        let scan = loaded
            .scan()
            .select_all()
            .build()
            .with_context(|| format!("building scan for {table}"))?;
        let batches: Vec<_> = scan
            .to_arrow()
            .await
            .with_context(|| format!("starting scan for {table}"))?
            .try_collect()
            .await
            .with_context(|| format!("scanning {table}"))?;
        Ok(batches)
    }
}
