use anyhow::{bail, Context, Result};
use arrow::array::{
    ArrayRef, BinaryBuilder, BooleanBuilder, Date32Array, Decimal128Array,
    FixedSizeBinaryBuilder, Float32Array, Float64Array, Int16Array, Int32Array, Int64Array,
    LargeBinaryBuilder, LargeStringArray, ListArray, StringArray, Time64MicrosecondArray,
    TimestampMicrosecondArray,
};
use arrow::buffer::{NullBuffer, OffsetBuffer};
use arrow::datatypes::{DataType, Field, FieldRef, Schema, SchemaRef, TimeUnit};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use iceberg::arrow::{arrow_schema_to_schema, schema_to_arrow_schema};
use iceberg::io::FileIO;
use iceberg::spec::{DataFile, DataFileFormat};
use iceberg::transaction::{ApplyTransactionAction, Transaction};
use iceberg::writer::base_writer::data_file_writer::DataFileWriterBuilder;
use iceberg::writer::file_writer::location_generator::{
    DefaultFileNameGenerator, DefaultLocationGenerator,
};
use iceberg::writer::file_writer::rolling_writer::RollingFileWriterBuilder;
use iceberg::writer::file_writer::ParquetWriterBuilder;
use iceberg::writer::{IcebergWriter as _, IcebergWriterBuilder};
use iceberg::{Catalog, NamespaceIdent, TableCreation, TableIdent};
use parquet::arrow::PARQUET_FIELD_ID_META_KEY;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::BemiError;
use crate::mapper::{map_column, MappedColumn};
use crate::reader::{table_dir, version_hint_path, IcebergReader, VERSION_HINT_FILE};
use crate::source::PG_NULL_STRING;
use crate::types::{PgColumn, SchemaTable};

/// Pull-based row supplier for `IcebergWriter::write`. Rows are ordered
/// string fields matching the column order; an empty batch ends the stream.
#[async_trait]
pub trait RowBatchSource: Send {
    async fn next_batch(&mut self) -> Result<Vec<Vec<String>>>;
}

#[derive(Debug, Default)]
pub struct WriteSummary {
    pub rows: u64,
    pub data_files: usize,
}

/// Writes full-table extracts into the Iceberg warehouse.
///
/// Each `write` materializes a fresh table state: Parquet data files via
/// the rolling writer pipeline, one `fast_append` commit, and finally an
/// atomic update of the table's `version-hint.text` pointer. Readers
/// resolve tables only through the pointer, so a failed write leaves the
/// previous snapshot visible and untouched.
pub struct IcebergWriter {
    catalog: Arc<dyn Catalog>,
    file_io: FileIO,
    warehouse: PathBuf,
    row_group_rows: usize,
}

impl IcebergWriter {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        file_io: FileIO,
        warehouse: impl Into<PathBuf>,
        row_group_rows: usize,
    ) -> Self {
        Self {
            catalog,
            file_io,
            warehouse: warehouse.into(),
            row_group_rows,
        }
    }

    pub async fn write(
        &self,
        table: &SchemaTable,
        columns: &[PgColumn],
        source: &mut dyn RowBatchSource,
    ) -> Result<WriteSummary> {
        let mapped = columns
            .iter()
            .map(map_column)
            .collect::<Result<Vec<_>, _>>()?;
        for column in mapped.iter().filter(|m| m.lossy) {
            tracing::warn!(
                table = %table,
                column = %column.name,
                "column mapped to a wide default decimal; values may lose precision"
            );
        }

        let create_schema = build_create_schema(&mapped);
        let iceberg_schema =
            arrow_schema_to_schema(&create_schema).context("deriving Iceberg schema")?;
        let derived = schema_to_arrow_schema(&iceberg_schema)
            .context("normalizing derived schema")?;

        // Evolution gate: the new schema must not narrow what readers
        // already observe.
        let reader = IcebergReader::new(&self.warehouse, self.file_io.clone());
        if let Some(current) = reader.current_arrow_schema(table).await? {
            check_schema_evolution(&current, &derived)?;
        }

        let iceberg_table = self.create_table(table, iceberg_schema).await?;
        let write_schema = Arc::new(
            schema_to_arrow_schema(iceberg_table.metadata().current_schema())
                .context("deriving write schema")?,
        );

        // ParquetWriterBuilder → RollingFileWriterBuilder → DataFileWriterBuilder
        let file_io = iceberg_table.file_io().clone();
        let location_gen = DefaultLocationGenerator::new(iceberg_table.metadata().clone())
            .context("location generator")?;
        let file_name_gen =
            DefaultFileNameGenerator::new("data".to_string(), None, DataFileFormat::Parquet);

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .set_max_row_group_size(self.row_group_rows)
            .build();
        let parquet_builder =
            ParquetWriterBuilder::new(props, iceberg_table.metadata().current_schema().clone());
        let rolling_builder = RollingFileWriterBuilder::new_with_default_file_size(
            parquet_builder,
            file_io,
            location_gen,
            file_name_gen,
        );
        let mut writer = DataFileWriterBuilder::new(rolling_builder)
            .build(None)
            .await
            .context("building Iceberg data file writer")?;

        let mut total_rows = 0u64;
        let streamed: Result<()> = loop {
            let rows = match source.next_batch().await {
                Ok(rows) => rows,
                Err(e) => break Err(e),
            };
            if rows.is_empty() {
                break Ok(());
            }
            total_rows += rows.len() as u64;

            let batch = match rows_to_batch(&write_schema, &rows) {
                Ok(batch) => batch,
                Err(e) => break Err(e),
            };
            if let Err(e) = writer.write(batch).await {
                break Err(e).context("writing batch to Iceberg");
            }
            tracing::debug!(table = %table, rows = total_rows, "wrote rows to Parquet");
        };

        let data_files = match streamed {
            Ok(()) => writer.close().await.context("closing Iceberg writer")?,
            Err(e) => {
                // Abandon the half-written table state; remove whatever the
                // writer already flushed so only committed files remain.
                if let Ok(files) = writer.close().await {
                    self.discard_files(&files).await;
                }
                return Err(e);
            }
        };

        let committed = if data_files.is_empty() {
            // Zero-row table: the creation metadata (no snapshot) is the
            // published state.
            iceberg_table
        } else {
            let file_count = data_files.len();
            let tx = Transaction::new(&iceberg_table);
            let action = tx.fast_append().add_data_files(data_files.clone());
            let tx = match action.apply(tx).context("applying fast append") {
                Ok(tx) => tx,
                Err(e) => {
                    self.discard_files(&data_files).await;
                    return Err(e);
                }
            };
            if let Err(e) = tx.commit(self.catalog.as_ref()).await {
                self.discard_files(&data_files).await;
                return Err(e).context("committing Iceberg transaction");
            }
            tracing::debug!(table = %table, files = file_count, "committed data files");
            self.catalog
                .load_table(&table_ident(table)?)
                .await
                .context("reloading committed table")?
        };

        let metadata_location = committed
            .metadata_location()
            .ok_or_else(|| BemiError::CatalogUnavailable("missing metadata location".into()))?;
        publish_version_hint(&self.warehouse, table, metadata_location)?;

        Ok(WriteSummary {
            rows: total_rows,
            data_files: data_files.len(),
        })
    }

    async fn create_table(
        &self,
        table: &SchemaTable,
        schema: iceberg::spec::Schema,
    ) -> Result<iceberg::table::Table> {
        let namespace = NamespaceIdent::new(table.schema.clone());
        if self
            .catalog
            .list_namespaces(None)
            .await
            .map_or(true, |ns| !ns.iter().any(|n| n == &namespace))
        {
            let _ = self
                .catalog
                .create_namespace(&namespace, Default::default())
                .await;
        }

        let creation = TableCreation::builder()
            .name(table.table.clone())
            .schema(schema)
            .build();
        self.catalog
            .create_table(&namespace, creation)
            .await
            .with_context(|| format!("creating Iceberg table {table}"))
    }

    async fn discard_files(&self, files: &[DataFile]) {
        for file in files {
            if let Err(e) = self.file_io.delete(file.file_path()).await {
                tracing::warn!(path = %file.file_path(), error = %e, "failed to remove abandoned data file");
            }
        }
    }

    /// Remove a sink table: its pointer, metadata and data files. Idempotent.
    pub fn delete_schema_table(&self, table: &SchemaTable) -> Result<()> {
        let dir = table_dir(&self.warehouse, table);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(table = %table, "deleted sink table");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting sink table {table}")),
        }
    }

    /// Remove a sink schema and every table under it. Idempotent.
    pub fn delete_schema(&self, schema: &str) -> Result<()> {
        let dir = self.warehouse.join(schema);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::info!(schema = %schema, "deleted sink schema");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting sink schema {schema}")),
        }
    }
}

fn table_ident(table: &SchemaTable) -> Result<TableIdent> {
    TableIdent::from_strs([&table.schema, &table.table]).context("building table identifier")
}

/// Publish the new metadata pointer: temp file + rename, so readers see
/// either the previous pointer or the new one.
fn publish_version_hint(warehouse: &Path, table: &SchemaTable, location: &str) -> Result<()> {
    let hint = version_hint_path(warehouse, table);
    let dir = hint.parent().expect("hint path has a parent");
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating metadata dir {}", dir.display()))?;

    let tmp = dir.join(format!(".{VERSION_HINT_FILE}.tmp"));
    std::fs::write(&tmp, location).context("writing version hint")?;
    std::fs::rename(&tmp, &hint).context("publishing version hint")?;
    Ok(())
}

/// Arrow schema for table creation, with Parquet field ids assigned in
/// column order (list elements get their own ids).
fn build_create_schema(mapped: &[MappedColumn]) -> Schema {
    let mut next_id = 0i32;
    let mut fields = Vec::with_capacity(mapped.len());
    for column in mapped {
        next_id += 1;
        let field_id = next_id;
        let data_type = if column.is_list {
            next_id += 1;
            let element = Field::new("element", column.data_type.clone(), true)
                .with_metadata(field_id_metadata(next_id));
            DataType::List(Arc::new(element))
        } else {
            column.data_type.clone()
        };
        fields.push(
            Field::new(&column.name, data_type, !column.required)
                .with_metadata(field_id_metadata(field_id)),
        );
    }
    Schema::new(fields)
}

fn field_id_metadata(id: i32) -> HashMap<String, String> {
    HashMap::from([(PARQUET_FIELD_ID_META_KEY.to_string(), id.to_string())])
}

/// The derived schema may add, drop, or widen columns; it must never
/// narrow or change the type of a column readers already observe.
pub(crate) fn check_schema_evolution(current: &Schema, derived: &Schema) -> Result<(), BemiError> {
    for old in current.fields() {
        if let Ok(new) = derived.field_with_name(old.name()) {
            if !is_widening(old.data_type(), new.data_type()) {
                return Err(BemiError::SchemaIncompatible {
                    column: old.name().clone(),
                    reason: format!("{} cannot change to {}", old.data_type(), new.data_type()),
                });
            }
        }
    }
    Ok(())
}

fn is_widening(old: &DataType, new: &DataType) -> bool {
    match (old, new) {
        (DataType::Int32, DataType::Int64) => true,
        (DataType::Float32, DataType::Float64) => true,
        (DataType::Decimal128(p1, s1), DataType::Decimal128(p2, s2)) => s1 == s2 && p2 >= p1,
        (DataType::List(old_elem), DataType::List(new_elem)) => {
            is_widening(old_elem.data_type(), new_elem.data_type())
        }
        (a, b) => data_types_equal(a, b),
    }
}

/// Structural equality that ignores field metadata (field ids differ when
/// column order changes between syncs).
fn data_types_equal(a: &DataType, b: &DataType) -> bool {
    match (a, b) {
        (DataType::List(ae), DataType::List(be)) => data_types_equal(ae.data_type(), be.data_type()),
        (a, b) => a == b,
    }
}

/// Build one RecordBatch from string rows, honoring the NULL sentinel.
fn rows_to_batch(schema: &SchemaRef, rows: &[Vec<String>]) -> Result<RecordBatch> {
    let width = schema.fields().len();
    for (i, row) in rows.iter().enumerate() {
        if row.len() != width {
            bail!("row {i} has {} fields, expected {width}", row.len());
        }
    }

    let mut arrays = Vec::with_capacity(width);
    for (idx, field) in schema.fields().iter().enumerate() {
        let cells: Vec<Option<&str>> = rows
            .iter()
            .map(|row| {
                let cell = row[idx].as_str();
                (cell != PG_NULL_STRING).then_some(cell)
            })
            .collect();
        let array = build_array(field.data_type(), &cells)
            .with_context(|| format!("parsing column \"{}\"", field.name()))?;
        arrays.push(array);
    }

    RecordBatch::try_new(schema.clone(), arrays).context("assembling record batch")
}

fn build_array(data_type: &DataType, cells: &[Option<&str>]) -> Result<ArrayRef> {
    match data_type {
        DataType::Boolean => {
            let mut builder = BooleanBuilder::with_capacity(cells.len());
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(s) => builder.append_value(parse_bool(s)?),
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        DataType::Int16 => {
            let values = parse_all(cells, |s| {
                s.parse::<i16>().with_context(|| format!("invalid int2: {s}"))
            })?;
            Ok(Arc::new(Int16Array::from(values)))
        }
        DataType::Int32 => {
            let values = parse_all(cells, |s| {
                s.parse::<i32>().with_context(|| format!("invalid int4: {s}"))
            })?;
            Ok(Arc::new(Int32Array::from(values)))
        }
        DataType::Int64 => {
            let values = parse_all(cells, |s| {
                s.parse::<i64>().with_context(|| format!("invalid int8: {s}"))
            })?;
            Ok(Arc::new(Int64Array::from(values)))
        }
        DataType::Float32 => {
            let values = parse_all(cells, |s| {
                s.parse::<f32>().with_context(|| format!("invalid float4: {s}"))
            })?;
            Ok(Arc::new(Float32Array::from(values)))
        }
        DataType::Float64 => {
            let values = parse_all(cells, |s| {
                s.parse::<f64>().with_context(|| format!("invalid float8: {s}"))
            })?;
            Ok(Arc::new(Float64Array::from(values)))
        }
        DataType::Decimal128(precision, scale) => {
            let values = parse_all(cells, |s| parse_decimal(s, *scale))?;
            let array = Decimal128Array::from(values)
                .with_precision_and_scale(*precision, *scale)
                .context("applying decimal precision and scale")?;
            Ok(Arc::new(array))
        }
        DataType::Utf8 => Ok(Arc::new(StringArray::from(cells.to_vec()))),
        DataType::LargeUtf8 => Ok(Arc::new(LargeStringArray::from(cells.to_vec()))),
        DataType::Date32 => {
            let values = parse_all(cells, parse_date_days)?;
            Ok(Arc::new(Date32Array::from(values)))
        }
        DataType::Time64(TimeUnit::Microsecond) => {
            let values = parse_all(cells, parse_time_micros)?;
            Ok(Arc::new(Time64MicrosecondArray::from(values)))
        }
        DataType::Timestamp(TimeUnit::Microsecond, tz) => {
            let values = match tz {
                Some(_) => parse_all(cells, parse_timestamptz_micros)?,
                None => parse_all(cells, parse_timestamp_micros)?,
            };
            let array = TimestampMicrosecondArray::from(values);
            Ok(match tz {
                Some(tz) => Arc::new(array.with_timezone(tz.as_ref())),
                None => Arc::new(array),
            })
        }
        DataType::Binary => {
            let mut builder = BinaryBuilder::new();
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(s) => builder.append_value(parse_bytea(s)?),
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        DataType::LargeBinary => {
            let mut builder = LargeBinaryBuilder::new();
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(s) => builder.append_value(parse_bytea(s)?),
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        DataType::FixedSizeBinary(16) => {
            let mut builder = FixedSizeBinaryBuilder::with_capacity(cells.len(), 16);
            for cell in cells {
                match cell {
                    None => builder.append_null(),
                    Some(s) => {
                        let parsed = uuid::Uuid::parse_str(s)
                            .with_context(|| format!("invalid uuid: {s}"))?;
                        builder
                            .append_value(parsed.as_bytes())
                            .context("appending uuid")?;
                    }
                }
            }
            Ok(Arc::new(builder.finish()))
        }
        DataType::List(element) => build_list_array(element, cells),
        other => bail!("no writer for arrow type {other}"),
    }
}

fn build_list_array(element: &FieldRef, cells: &[Option<&str>]) -> Result<ArrayRef> {
    let mut offsets: Vec<i32> = Vec::with_capacity(cells.len() + 1);
    offsets.push(0);
    let mut validity = Vec::with_capacity(cells.len());
    let mut flat: Vec<Option<String>> = Vec::new();

    for cell in cells {
        match cell {
            None => validity.push(false),
            Some(literal) => {
                flat.extend(parse_pg_array(literal)?);
                validity.push(true);
            }
        }
        offsets.push(flat.len() as i32);
    }

    let flat_refs: Vec<Option<&str>> = flat.iter().map(|e| e.as_deref()).collect();
    let values = build_array(element.data_type(), &flat_refs)?;
    let list = ListArray::new(
        element.clone(),
        OffsetBuffer::new(offsets.into()),
        values,
        Some(NullBuffer::from(validity)),
    );
    Ok(Arc::new(list))
}

fn parse_all<T>(
    cells: &[Option<&str>],
    parse: impl Fn(&str) -> Result<T>,
) -> Result<Vec<Option<T>>> {
    cells
        .iter()
        .map(|cell| cell.map(|s| parse(s)).transpose())
        .collect()
}

fn parse_bool(s: &str) -> Result<bool> {
    match s {
        "t" | "true" | "TRUE" | "T" => Ok(true),
        "f" | "false" | "FALSE" | "F" => Ok(false),
        other => bail!("invalid boolean: {other}"),
    }
}

fn parse_date_days(s: &str) -> Result<i32> {
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .with_context(|| format!("invalid date: {s}"))?;
    let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch");
    Ok(date.signed_duration_since(epoch).num_days() as i32)
}

fn parse_time_micros(s: &str) -> Result<i64> {
    // timetz values carry a zone offset; the stored value is the local
    // clock reading.
    let stripped = match s[1..].find(['+', '-']) {
        Some(pos) => &s[..pos + 1],
        None => s,
    };
    let time = NaiveTime::parse_from_str(stripped, "%H:%M:%S%.f")
        .with_context(|| format!("invalid time: {s}"))?;
    let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("midnight");
    Ok(time
        .signed_duration_since(midnight)
        .num_microseconds()
        .unwrap_or(0))
}

fn parse_timestamp_micros(s: &str) -> Result<i64> {
    let dt = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .with_context(|| format!("invalid timestamp: {s}"))?;
    Ok(dt.and_utc().timestamp_micros())
}

fn parse_timestamptz_micros(s: &str) -> Result<i64> {
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(dt.timestamp_micros());
    }
    // Offset-less fallback: interpret as UTC.
    parse_timestamp_micros(s)
}

fn parse_bytea(s: &str) -> Result<Vec<u8>> {
    if let Some(hexed) = s.strip_prefix("\\x") {
        return hex::decode(hexed).with_context(|| format!("invalid bytea hex: {s}"));
    }
    Ok(s.as_bytes().to_vec())
}

fn parse_decimal(s: &str, scale: i8) -> Result<i128> {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        bail!("invalid decimal: {s}");
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        bail!("invalid decimal: {s}");
    }

    let scale = scale.max(0) as usize;
    let mut frac = frac_part.to_string();
    frac.truncate(scale);
    while frac.len() < scale {
        frac.push('0');
    }

    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let combined = format!("{int_part}{frac}");
    let value: i128 = combined
        .parse()
        .with_context(|| format!("decimal out of range: {s}"))?;
    Ok(if negative { -value } else { value })
}

const ARRAY_NULL: &str = "NULL";

/// Parse a Postgres array literal (`{a,"b,c",NULL}`) into element strings.
fn parse_pg_array(literal: &str) -> Result<Vec<Option<String>>> {
    let trimmed = literal.trim();
    let inner = trimmed
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .with_context(|| format!("invalid array literal: {literal}"))?;

    if inner.is_empty() {
        return Ok(Vec::new());
    }

    let mut elements = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_quotes = false;
    let mut chars = inner.chars();

    while let Some(c) = chars.next() {
        match c {
            '"' if !in_quotes => {
                in_quotes = true;
                quoted = true;
            }
            '"' if in_quotes => in_quotes = false,
            '\\' if in_quotes => {
                let escaped = chars
                    .next()
                    .with_context(|| format!("dangling escape in array literal: {literal}"))?;
                current.push(escaped);
            }
            ',' if !in_quotes => {
                elements.push(finish_element(&mut current, &mut quoted));
            }
            c => current.push(c),
        }
    }
    elements.push(finish_element(&mut current, &mut quoted));

    Ok(elements)
}

fn finish_element(current: &mut String, quoted: &mut bool) -> Option<String> {
    let element = std::mem::take(current);
    let was_quoted = std::mem::take(quoted);
    if !was_quoted && element == ARRAY_NULL {
        None
    } else {
        Some(element)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;

    #[test]
    fn pg_array_literals() {
        assert_eq!(parse_pg_array("{}").unwrap(), vec![]);
        assert_eq!(
            parse_pg_array("{1,2,3}").unwrap(),
            vec![Some("1".into()), Some("2".into()), Some("3".into())]
        );
        assert_eq!(
            parse_pg_array("{a,NULL,c}").unwrap(),
            vec![Some("a".into()), None, Some("c".into())]
        );
        assert_eq!(
            parse_pg_array(r#"{"b,c","with \"quote\""}"#).unwrap(),
            vec![Some("b,c".into()), Some("with \"quote\"".into())]
        );
        // A quoted "NULL" is the string, not SQL NULL.
        assert_eq!(
            parse_pg_array(r#"{"NULL"}"#).unwrap(),
            vec![Some("NULL".into())]
        );
        assert!(parse_pg_array("not an array").is_err());
    }

    #[test]
    fn decimal_parsing() {
        assert_eq!(parse_decimal("123.45", 2).unwrap(), 12_345);
        assert_eq!(parse_decimal("123", 2).unwrap(), 12_300);
        assert_eq!(parse_decimal("-0.5", 3).unwrap(), -500);
        assert_eq!(parse_decimal("1.23456", 2).unwrap(), 123);
        assert_eq!(parse_decimal("0", 0).unwrap(), 0);
        assert!(parse_decimal("abc", 2).is_err());
    }

    #[test]
    fn scalar_parsers() {
        assert!(parse_bool("t").unwrap());
        assert!(!parse_bool("f").unwrap());
        assert!(parse_bool("yes").is_err());

        assert_eq!(parse_date_days("1970-01-02").unwrap(), 1);
        assert_eq!(parse_date_days("1969-12-31").unwrap(), -1);

        assert_eq!(parse_time_micros("00:00:01").unwrap(), 1_000_000);
        assert_eq!(parse_time_micros("00:00:00.000001").unwrap(), 1);
        assert_eq!(parse_time_micros("01:00:00+02").unwrap(), 3_600_000_000);

        assert_eq!(
            parse_timestamp_micros("1970-01-01 00:00:01").unwrap(),
            1_000_000
        );
        assert_eq!(
            parse_timestamptz_micros("1970-01-01 01:00:00+01").unwrap(),
            0
        );
        assert_eq!(
            parse_timestamptz_micros("1970-01-01 00:00:00.5").unwrap(),
            500_000
        );

        assert_eq!(parse_bytea("\\x68656c6c6f").unwrap(), b"hello");
        assert_eq!(parse_bytea("raw").unwrap(), b"raw");
    }

    fn schema_of(fields: Vec<Field>) -> SchemaRef {
        Arc::new(Schema::new(fields))
    }

    #[test]
    fn null_sentinel_round_trips_for_every_type() {
        let schema = schema_of(vec![
            Field::new("b", DataType::Boolean, true),
            Field::new("i", DataType::Int32, true),
            Field::new("l", DataType::Int64, true),
            Field::new("f", DataType::Float64, true),
            Field::new("d", DataType::Decimal128(10, 2), true),
            Field::new("s", DataType::Utf8, true),
            Field::new("dt", DataType::Date32, true),
            Field::new(
                "ts",
                DataType::Timestamp(TimeUnit::Microsecond, None),
                true,
            ),
            Field::new("bin", DataType::Binary, true),
            Field::new("u", DataType::FixedSizeBinary(16), true),
        ]);

        let row: Vec<String> = vec![PG_NULL_STRING.to_string(); 10];
        let batch = rows_to_batch(&schema, &[row]).unwrap();
        assert_eq!(batch.num_rows(), 1);
        for column in batch.columns() {
            assert!(column.is_null(0), "expected NULL in {:?}", column.data_type());
        }
    }

    #[test]
    fn typed_row_parses() {
        let schema = schema_of(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("active", DataType::Boolean, true),
            Field::new("score", DataType::Decimal128(8, 2), true),
        ]);

        let rows = vec![
            vec!["1".into(), "alice".into(), "t".into(), "12.50".into()],
            vec![
                "2".into(),
                PG_NULL_STRING.into(),
                "f".into(),
                PG_NULL_STRING.into(),
            ],
        ];
        let batch = rows_to_batch(&schema, &rows).unwrap();
        assert_eq!(batch.num_rows(), 2);

        let ids = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int32Array>()
            .unwrap();
        assert_eq!(ids.values(), &[1, 2]);

        let names = batch
            .column(1)
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        assert_eq!(names.value(0), "alice");
        assert!(names.is_null(1));

        let scores = batch
            .column(3)
            .as_any()
            .downcast_ref::<Decimal128Array>()
            .unwrap();
        assert_eq!(scores.value(0), 1250);
        assert!(scores.is_null(1));
    }

    #[test]
    fn list_column_parses() {
        let element = Arc::new(Field::new("element", DataType::Int32, true));
        let schema = schema_of(vec![Field::new(
            "tags",
            DataType::List(element),
            true,
        )]);

        let rows = vec![
            vec!["{1,2,3}".into()],
            vec![PG_NULL_STRING.into()],
            vec!["{}".into()],
            vec!["{4,NULL}".into()],
        ];
        let batch = rows_to_batch(&schema, &rows).unwrap();
        let lists = batch
            .column(0)
            .as_any()
            .downcast_ref::<ListArray>()
            .unwrap();
        assert_eq!(lists.len(), 4);
        assert_eq!(lists.value(0).len(), 3);
        assert!(lists.is_null(1));
        assert_eq!(lists.value(2).len(), 0);
        let last = lists.value(3);
        let last = last.as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(last.value(0), 4);
        assert!(last.is_null(1));
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let schema = schema_of(vec![
            Field::new("a", DataType::Int32, true),
            Field::new("b", DataType::Int32, true),
        ]);
        let rows = vec![vec!["1".into()]];
        assert!(rows_to_batch(&schema, &rows).is_err());
    }

    #[test]
    fn evolution_accepts_identity_add_drop_and_widening() {
        let current = Schema::new(vec![
            Field::new("id", DataType::Int32, false),
            Field::new("price", DataType::Float32, true),
            Field::new("obsolete", DataType::Utf8, true),
        ]);
        let derived = Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("price", DataType::Float64, true),
            Field::new("added", DataType::Utf8, true),
        ]);
        assert!(check_schema_evolution(&current, &derived).is_ok());
    }

    #[test]
    fn evolution_rejects_narrowing_and_type_changes() {
        let current = Schema::new(vec![Field::new("id", DataType::Int64, false)]);
        let derived = Schema::new(vec![Field::new("id", DataType::Int32, false)]);
        let err = check_schema_evolution(&current, &derived).unwrap_err();
        assert!(matches!(err, BemiError::SchemaIncompatible { .. }));

        let current = Schema::new(vec![Field::new("v", DataType::Utf8, true)]);
        let derived = Schema::new(vec![Field::new("v", DataType::Int32, true)]);
        assert!(check_schema_evolution(&current, &derived).is_err());
    }

    #[test]
    fn evolution_checks_decimal_precision() {
        let current = Schema::new(vec![Field::new("d", DataType::Decimal128(10, 2), true)]);
        let wider = Schema::new(vec![Field::new("d", DataType::Decimal128(12, 2), true)]);
        assert!(check_schema_evolution(&current, &wider).is_ok());

        let narrower = Schema::new(vec![Field::new("d", DataType::Decimal128(8, 2), true)]);
        assert!(check_schema_evolution(&current, &narrower).is_err());

        let rescaled = Schema::new(vec![Field::new("d", DataType::Decimal128(10, 4), true)]);
        assert!(check_schema_evolution(&current, &rescaled).is_err());
    }

    #[test]
    fn create_schema_assigns_field_ids() {
        let mapped = vec![
            MappedColumn {
                name: "id".into(),
                data_type: DataType::Int32,
                required: true,
                is_list: false,
                lossy: false,
            },
            MappedColumn {
                name: "tags".into(),
                data_type: DataType::Utf8,
                required: false,
                is_list: true,
                lossy: false,
            },
        ];
        let schema = build_create_schema(&mapped);
        assert_eq!(schema.fields().len(), 2);
        assert!(!schema.field(0).is_nullable());
        assert_eq!(
            schema.field(0).metadata().get(PARQUET_FIELD_ID_META_KEY),
            Some(&"1".to_string())
        );
        match schema.field(1).data_type() {
            DataType::List(element) => {
                assert_eq!(element.data_type(), &DataType::Utf8);
                assert_eq!(
                    element.metadata().get(PARQUET_FIELD_ID_META_KEY),
                    Some(&"3".to_string())
                );
            }
            other => panic!("expected list, got {other}"),
        }
        assert_eq!(
            schema.field(1).metadata().get(PARQUET_FIELD_ID_META_KEY),
            Some(&"2".to_string())
        );
    }
}
