use anyhow::{anyhow, Context, Result};
use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use datafusion::catalog::memory::MemTable;
use datafusion::catalog::MemorySchemaProvider;
use datafusion::execution::SendableRecordBatchStream;
use datafusion::prelude::{DataFrame, SessionConfig, SessionContext};
use iceberg_datafusion::IcebergTableProvider;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::reader::IcebergReader;
use crate::types::SchemaTable;

pub const DEFAULT_CATALOG: &str = "datafusion";

/// The embedded analytical engine: a DataFusion session whose default
/// catalog mirrors the Iceberg warehouse, plus enough `pg_catalog` to keep
/// Postgres clients content.
///
/// `refresh` rebuilds the mirror from the Reader, so tables committed by a
/// separate sync process become visible without a restart.
pub struct QueryEngine {
    ctx: SessionContext,
    reader: IcebergReader,
}

impl QueryEngine {
    pub fn new(reader: IcebergReader) -> Self {
        let config = SessionConfig::new()
            .with_information_schema(true)
            .with_default_catalog_and_schema(DEFAULT_CATALOG, "public");
        let ctx = SessionContext::new_with_config(config);
        Self { ctx, reader }
    }

    /// Re-register every warehouse schema and table, replacing the previous
    /// registration wholesale.
    pub async fn refresh(&self) -> Result<()> {
        let catalog = self
            .ctx
            .catalog(DEFAULT_CATALOG)
            .ok_or_else(|| anyhow!("default catalog missing"))?;

        let mut by_schema: BTreeMap<String, Vec<SchemaTable>> = BTreeMap::new();
        for schema in self.reader.schemas()? {
            by_schema.entry(schema).or_default();
        }
        for table in self.reader.schema_tables()? {
            by_schema.entry(table.schema.clone()).or_default().push(table);
        }

        for (schema, tables) in &by_schema {
            let provider = MemorySchemaProvider::new();
            for table in tables {
                let loaded = match self.reader.load_table(table).await {
                    Ok(loaded) => loaded,
                    Err(e) => {
                        tracing::warn!(table = %table, error = %e, "skipping unreadable table");
                        continue;
                    }
                };
                match IcebergTableProvider::try_new_from_table(loaded).await {
                    Ok(table_provider) => {
                        provider
                            .register_table(table.table.clone(), Arc::new(table_provider))
                            .map_err(|e| anyhow!("registering table {table}: {e}"))?;
                    }
                    Err(e) => {
                        tracing::warn!(table = %table, error = %e, "skipping unregisterable table")
                    }
                }
            }
            catalog
                .register_schema(schema, Arc::new(provider))
                .map_err(|e| anyhow!("registering schema {schema}: {e}"))?;
        }

        let schema_names: Vec<String> = by_schema.keys().cloned().collect();
        let table_list: Vec<SchemaTable> = by_schema.values().flatten().cloned().collect();
        catalog
            .register_schema(
                "pg_catalog",
                Arc::new(build_pg_catalog(&schema_names, &table_list)?),
            )
            .map_err(|e| anyhow!("registering pg_catalog: {e}"))?;

        tracing::debug!(
            schemas = schema_names.len(),
            tables = table_list.len(),
            "engine view refreshed"
        );
        Ok(())
    }

    pub async fn plan(&self, sql: &str) -> datafusion::common::Result<DataFrame> {
        self.ctx.sql(sql).await
    }

    pub async fn execute(
        &self,
        sql: &str,
    ) -> datafusion::common::Result<SendableRecordBatchStream> {
        let df = self.ctx.sql(sql).await?;
        df.execute_stream().await
    }
}

/// Static `pg_catalog` compatibility tables built from the warehouse view.
fn build_pg_catalog(
    schemas: &[String],
    tables: &[SchemaTable],
) -> Result<MemorySchemaProvider> {
    let provider = MemorySchemaProvider::new();

    // Stable synthetic oids: schemas first, then tables.
    let schema_oid =
        |idx: usize| -> i64 { 16_384 + idx as i64 };
    let table_oid = |idx: usize| -> i64 { 24_576 + idx as i64 };
    let schema_oid_by_name: BTreeMap<&str, i64> = schemas
        .iter()
        .enumerate()
        .map(|(i, s)| (s.as_str(), schema_oid(i)))
        .collect();

    let pg_namespace = {
        let schema = Arc::new(Schema::new(vec![
            Field::new("oid", DataType::Int64, false),
            Field::new("nspname", DataType::Utf8, false),
            Field::new("nspowner", DataType::Int64, false),
        ]));
        let mut oids: Vec<i64> = vec![11];
        let mut names: Vec<String> = vec!["pg_catalog".to_string()];
        for (i, name) in schemas.iter().enumerate() {
            oids.push(schema_oid(i));
            names.push(name.clone());
        }
        let owners = vec![10i64; oids.len()];
        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(oids)),
                Arc::new(StringArray::from(names)),
                Arc::new(Int64Array::from(owners)),
            ],
        )
        .map(|batch| (schema, batch))
        .context("building pg_namespace")?
    };

    let pg_class = {
        let schema = Arc::new(Schema::new(vec![
            Field::new("oid", DataType::Int64, false),
            Field::new("relname", DataType::Utf8, false),
            Field::new("relnamespace", DataType::Int64, false),
            Field::new("relkind", DataType::Utf8, false),
        ]));
        let mut oids = Vec::with_capacity(tables.len());
        let mut names = Vec::with_capacity(tables.len());
        let mut namespaces = Vec::with_capacity(tables.len());
        for (i, table) in tables.iter().enumerate() {
            oids.push(table_oid(i));
            names.push(table.table.clone());
            namespaces.push(
                schema_oid_by_name
                    .get(table.schema.as_str())
                    .copied()
                    .unwrap_or(0),
            );
        }
        let kinds = vec!["r".to_string(); tables.len()];
        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(oids)),
                Arc::new(StringArray::from(names)),
                Arc::new(Int64Array::from(namespaces)),
                Arc::new(StringArray::from(kinds)),
            ],
        )
        .map(|batch| (schema, batch))
        .context("building pg_class")?
    };

    let pg_tables = {
        let schema = Arc::new(Schema::new(vec![
            Field::new("schemaname", DataType::Utf8, false),
            Field::new("tablename", DataType::Utf8, false),
            Field::new("tableowner", DataType::Utf8, false),
        ]));
        let schemas_col: Vec<String> = tables.iter().map(|t| t.schema.clone()).collect();
        let tables_col: Vec<String> = tables.iter().map(|t| t.table.clone()).collect();
        let owners = vec!["bemidb".to_string(); tables.len()];
        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from(schemas_col)),
                Arc::new(StringArray::from(tables_col)),
                Arc::new(StringArray::from(owners)),
            ],
        )
        .map(|batch| (schema, batch))
        .context("building pg_tables")?
    };

    let pg_type = {
        let schema = Arc::new(Schema::new(vec![
            Field::new("oid", DataType::Int64, false),
            Field::new("typname", DataType::Utf8, false),
            Field::new("typnamespace", DataType::Int64, false),
        ]));
        let known: [(i64, &str); 17] = [
            (16, "bool"),
            (17, "bytea"),
            (20, "int8"),
            (21, "int2"),
            (23, "int4"),
            (25, "text"),
            (114, "json"),
            (700, "float4"),
            (701, "float8"),
            (1043, "varchar"),
            (1082, "date"),
            (1083, "time"),
            (1114, "timestamp"),
            (1184, "timestamptz"),
            (1700, "numeric"),
            (2950, "uuid"),
            (3802, "jsonb"),
        ];
        let oids: Vec<i64> = known.iter().map(|(oid, _)| *oid).collect();
        let names: Vec<String> = known.iter().map(|(_, name)| name.to_string()).collect();
        let namespaces = vec![11i64; known.len()];
        RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(oids)),
                Arc::new(StringArray::from(names)),
                Arc::new(Int64Array::from(namespaces)),
            ],
        )
        .map(|batch| (schema, batch))
        .context("building pg_type")?
    };

    for (name, (schema, batch)) in [
        ("pg_namespace", pg_namespace),
        ("pg_class", pg_class),
        ("pg_tables", pg_tables),
        ("pg_type", pg_type),
    ] {
        let table = MemTable::try_new(schema, vec![vec![batch]])
            .with_context(|| format!("building {name}"))?;
        provider
            .register_table(name.to_string(), Arc::new(table))
            .map_err(|e| anyhow!("registering {name}: {e}"))?;
    }

    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_file_io;
    use futures::TryStreamExt;
    use tempfile::TempDir;

    fn engine_over(dir: &TempDir) -> QueryEngine {
        let reader = IcebergReader::new(dir.path(), build_file_io().unwrap());
        QueryEngine::new(reader)
    }

    #[tokio::test]
    async fn refresh_on_empty_warehouse_registers_pg_catalog() {
        let dir = TempDir::new().unwrap();
        let engine = engine_over(&dir);
        engine.refresh().await.unwrap();

        let stream = engine
            .execute("SELECT nspname FROM pg_catalog.pg_namespace ORDER BY oid")
            .await
            .unwrap();
        let batches: Vec<RecordBatch> = stream.try_collect().await.unwrap();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 1, "only pg_catalog itself is present");
    }

    #[tokio::test]
    async fn pg_type_answers_introspection() {
        let dir = TempDir::new().unwrap();
        let engine = engine_over(&dir);
        engine.refresh().await.unwrap();

        let stream = engine
            .execute("SELECT typname FROM pg_catalog.pg_type WHERE oid = 23")
            .await
            .unwrap();
        let batches: Vec<RecordBatch> = stream.try_collect().await.unwrap();
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 1);
        let names = batches[0]
            .column(0)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "int4");
    }

    #[tokio::test]
    async fn unknown_table_errors() {
        let dir = TempDir::new().unwrap();
        let engine = engine_over(&dir);
        engine.refresh().await.unwrap();
        assert!(engine.plan("SELECT * FROM missing_schema.missing").await.is_err());
    }
}
