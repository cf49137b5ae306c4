use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use std::io::Write;
use tempfile::NamedTempFile;
use tokio_postgres::NoTls;

use crate::error::BemiError;
use crate::types::{PgColumn, PgSchemaTable, SchemaTable};

/// Sentinel emitted by COPY for SQL NULL. A real cell equal to this string
/// would be misread as NULL; chosen to be unlikely in practice.
pub const PG_NULL_STRING: &str = "BEMIDB_NULL";

/// Source-side change detection, separated out so non-Postgres sources can
/// supply an equivalent composite checksum.
#[async_trait]
pub trait SourceChecksum {
    /// `"<count>:<sumhash>"`; `"0:"` for an empty table; `""` on error
    /// (never matches, forcing a full sync).
    async fn current_checksum(&self, table: &SchemaTable) -> String;
}

/// A live connection to the source database, holding the serializable
/// read-only deferrable snapshot for the duration of a sync run.
pub struct SourceConnection {
    client: tokio_postgres::Client,
}

impl SourceConnection {
    /// Connect and open the snapshot transaction. All reads issued through
    /// this connection observe one logical instant.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(BemiError::SourceUnavailable)
            .context("connecting to source database")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "source connection error");
            }
        });

        client
            .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL SERIALIZABLE READ ONLY DEFERRABLE")
            .await
            .context("opening snapshot transaction")?;

        tracing::info!("connected to source database");
        Ok(Self { client })
    }

    /// Keep the connection from idling out during long extracts.
    pub async fn ping(&self) -> Result<()> {
        self.client
            .batch_execute("SELECT 1")
            .await
            .context("pinging source connection")
    }

    /// Schemas in the source, excluding the catalog's own.
    pub async fn list_schemas(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT schema_name FROM information_schema.schemata \
                 WHERE schema_name NOT IN ('pg_catalog', 'pg_toast', 'information_schema') \
                 ORDER BY schema_name",
                &[],
            )
            .await
            .context("listing source schemas")?;

        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    /// Ordinary tables in a schema, with their parent partitioned table
    /// when the table is an inherited partition.
    pub async fn list_schema_tables(&self, schema: &str) -> Result<Vec<PgSchemaTable>> {
        let rows = self
            .client
            .query(
                "SELECT pg_class.relname, COALESCE(parent.relname, '') \
                 FROM pg_class \
                 JOIN pg_namespace ON pg_namespace.oid = pg_class.relnamespace \
                 LEFT JOIN pg_inherits ON pg_inherits.inhrelid = pg_class.oid \
                 LEFT JOIN pg_class AS parent ON pg_inherits.inhparent = parent.oid \
                 WHERE pg_namespace.nspname = $1 AND pg_class.relkind = 'r' \
                 ORDER BY pg_class.relname",
                &[&schema],
            )
            .await
            .with_context(|| format!("listing tables in schema {schema}"))?;

        Ok(rows
            .iter()
            .map(|row| {
                let parent: String = row.get(1);
                PgSchemaTable {
                    schema: schema.to_string(),
                    table: row.get(0),
                    parent_partitioned_table: (!parent.is_empty()).then_some(parent),
                }
            })
            .collect())
    }

    /// Column metadata ordered by the CSV header. The header order wins
    /// over ordinal positions: partitioned parents and column reorderings
    /// can desynchronize ordinals from the COPY output.
    pub async fn table_columns(
        &self,
        table: &SchemaTable,
        header: &[String],
    ) -> Result<Vec<PgColumn>> {
        let header: Vec<String> = header.to_vec();
        let rows = self
            .client
            .query(
                "SELECT \
                    column_name, \
                    data_type, \
                    udt_name, \
                    is_nullable, \
                    ordinal_position::int4, \
                    COALESCE(character_maximum_length, 0), \
                    COALESCE(numeric_precision, 0), \
                    COALESCE(numeric_scale, 0), \
                    COALESCE(datetime_precision, 0), \
                    pg_namespace.nspname \
                 FROM information_schema.columns \
                 JOIN pg_type ON pg_type.typname = udt_name \
                 JOIN pg_namespace ON pg_namespace.oid = pg_type.typnamespace \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY array_position($3, column_name)",
                &[&table.schema, &table.table, &header],
            )
            .await
            .with_context(|| format!("resolving columns for {table}"))?;

        Ok(rows
            .iter()
            .map(|row| {
                let nullable: String = row.get(3);
                PgColumn {
                    name: row.get(0),
                    data_type: row.get(1),
                    udt_name: row.get(2),
                    namespace: row.get(9),
                    is_nullable: nullable == "YES",
                    ordinal_position: row.get(4),
                    character_maximum_length: row.get(5),
                    numeric_precision: row.get(6),
                    numeric_scale: row.get(7),
                    datetime_precision: row.get(8),
                }
            })
            .collect())
    }

    /// Spool a whole table as CSV into a temporary file. The file is
    /// removed on drop, on every exit path.
    pub async fn copy_table_to_csv(&self, table: &SchemaTable) -> Result<NamedTempFile> {
        let mut spool = NamedTempFile::new().context("creating CSV spool file")?;

        let command = format!(
            "COPY {table} TO STDOUT WITH CSV HEADER NULL '{PG_NULL_STRING}'"
        );
        let stream = self
            .client
            .copy_out(command.as_str())
            .await
            .with_context(|| format!("starting COPY for {table}"))?;
        futures::pin_mut!(stream);

        let mut bytes_written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("reading COPY stream for {table}"))?;
            spool
                .write_all(&chunk)
                .context("writing to CSV spool file")?;
            bytes_written += chunk.len() as u64;
        }
        spool.flush().context("flushing CSV spool file")?;

        tracing::debug!(table = %table, bytes = bytes_written, spool = %spool.path().display(), "spooled table to CSV");
        Ok(spool)
    }
}

#[async_trait]
impl SourceChecksum for SourceConnection {
    async fn current_checksum(&self, table: &SchemaTable) -> String {
        // Count catches inserts and deletes; the order-insensitive summed
        // row hash catches updates.
        let query = format!(
            "SELECT COUNT(*)::int8, COALESCE(SUM(hashtext(CAST(t.* AS text)))::text, '') FROM {table} t"
        );
        match self.client.query_one(query.as_str(), &[]).await {
            Ok(row) => {
                let count: i64 = row.get(0);
                let sum: String = row.get(1);
                format!("{count}:{sum}")
            }
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "checksum query failed, forcing full sync");
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sentinel_is_stable() {
        // The sentinel is part of the on-disk spool contract.
        assert_eq!(PG_NULL_STRING, "BEMIDB_NULL");
    }

    #[test]
    fn copy_command_shape() {
        let table = SchemaTable::new("test_schema", "simple_table");
        let command = format!(
            "COPY {table} TO STDOUT WITH CSV HEADER NULL '{PG_NULL_STRING}'"
        );
        assert_eq!(
            command,
            "COPY \"test_schema\".\"simple_table\" TO STDOUT WITH CSV HEADER NULL 'BEMIDB_NULL'"
        );
    }
}
