use arrow::datatypes::{DataType, TimeUnit};

use crate::error::BemiError;
use crate::types::PgColumn;

/// Widest decimal we can represent when the source declares `numeric`
/// without precision. Values that do not fit are lossy.
const DEFAULT_DECIMAL_PRECISION: u8 = 38;
const DEFAULT_DECIMAL_SCALE: i8 = 9;

/// A source column mapped to its Iceberg-compatible Arrow shape.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedColumn {
    pub name: String,
    pub data_type: DataType,
    pub required: bool,
    pub is_list: bool,
    /// Set when the mapping cannot preserve full source fidelity
    /// (unconstrained numeric squeezed into a fixed decimal).
    pub lossy: bool,
}

/// Map a source column to its Iceberg field type.
///
/// Deterministic and stable across runs; changing a mapping is a breaking
/// schema evolution for every previously synced table.
pub fn map_column(column: &PgColumn) -> Result<MappedColumn, BemiError> {
    let is_list = column.udt_name.starts_with('_');
    let element = column.udt_name.trim_start_matches('_');

    let (data_type, lossy) = map_udt(column, element)?;

    Ok(MappedColumn {
        name: column.name.clone(),
        data_type,
        required: !column.is_nullable,
        is_list,
        lossy,
    })
}

fn map_udt(column: &PgColumn, udt_name: &str) -> Result<(DataType, bool), BemiError> {
    let mapped = match udt_name {
        "int2" => DataType::Int16,
        "int4" => DataType::Int32,
        "int8" => DataType::Int64,
        "numeric" => {
            if column.numeric_precision == 0 {
                // `numeric` without a declared precision
                return Ok((
                    DataType::Decimal128(DEFAULT_DECIMAL_PRECISION, DEFAULT_DECIMAL_SCALE),
                    true,
                ));
            }
            DataType::Decimal128(column.numeric_precision as u8, column.numeric_scale as i8)
        }
        "float4" => DataType::Float32,
        "float8" => DataType::Float64,
        "text" | "varchar" | "char" | "bpchar" | "name" => DataType::Utf8,
        "bool" => DataType::Boolean,
        "date" => DataType::Date32,
        "time" | "timetz" => DataType::Time64(TimeUnit::Microsecond),
        "timestamp" => DataType::Timestamp(TimeUnit::Microsecond, None),
        "timestamptz" => DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
        "bytea" => DataType::Binary,
        "uuid" => DataType::FixedSizeBinary(16),
        "json" | "jsonb" => DataType::Utf8,
        _ => {
            // User-defined enums and composites carry their text rendering.
            if column.namespace != "pg_catalog" {
                DataType::Utf8
            } else {
                return Err(BemiError::UnsupportedType {
                    namespace: column.namespace.clone(),
                    udt_name: column.udt_name.clone(),
                    column: column.name.clone(),
                });
            }
        }
    };

    Ok((mapped, false))
}
