use arrow::array::{
    Array, BinaryArray, BooleanArray, Date32Array, Decimal128Array, FixedSizeBinaryArray,
    Float32Array, Float64Array, Int16Array, Int32Array, Int64Array, LargeBinaryArray,
    LargeStringArray, ListArray, StringArray, Time64MicrosecondArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta};
use datafusion::sql::sqlparser::ast::{
    Ident, ObjectName, ObjectNamePart, Query, SetExpr, Statement, TableFactor,
};
use datafusion::sql::sqlparser::dialect::PostgreSqlDialect;
use datafusion::sql::sqlparser::parser::Parser;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use pgwire::api::results::{DataRowEncoder, FieldFormat, FieldInfo, Tag};
use pgwire::api::Type;
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::engine::QueryEngine;
use crate::error::BemiError;

const SERVER_VERSION: &str = "17.0";

/// One protocol-level result for one statement.
pub enum QueryOutcome {
    Rows {
        fields: Arc<Vec<FieldInfo>>,
        rows: BoxStream<'static, PgWireResult<DataRow>>,
    },
    Command(Tag),
    Empty,
}

/// Routes SQL from the wire into the embedded engine.
///
/// System queries are answered from built-ins, write intent is rejected
/// before planning, everything else is rewritten (schema prefix,
/// `pg_catalog` qualification) and streamed out of DataFusion.
pub struct QueryHandler {
    engine: Arc<QueryEngine>,
    schema_prefix: String,
}

impl QueryHandler {
    pub fn new(engine: Arc<QueryEngine>, schema_prefix: String) -> Self {
        Self {
            engine,
            schema_prefix,
        }
    }

    pub async fn handle_simple(
        &self,
        sql: &str,
        token: &CancellationToken,
    ) -> PgWireResult<Vec<QueryOutcome>> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Ok(vec![QueryOutcome::Empty]);
        }

        let statements = parse_statements(trimmed)?;
        let mut outcomes = Vec::with_capacity(statements.len());
        for statement in statements {
            outcomes.push(self.handle_statement(statement, token).await?);
        }
        Ok(outcomes)
    }

    pub async fn handle_one(
        &self,
        sql: &str,
        token: &CancellationToken,
    ) -> PgWireResult<QueryOutcome> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Ok(QueryOutcome::Empty);
        }
        let mut statements = parse_statements(trimmed)?;
        if statements.len() != 1 {
            return Err(user_error(
                "42601",
                "cannot insert multiple commands into a prepared statement",
            ));
        }
        self.handle_statement(statements.remove(0), token).await
    }

    async fn handle_statement(
        &self,
        statement: Statement,
        token: &CancellationToken,
    ) -> PgWireResult<QueryOutcome> {
        match statement {
            Statement::StartTransaction { .. } => Ok(QueryOutcome::Command(Tag::new("BEGIN"))),
            Statement::Commit { .. } => Ok(QueryOutcome::Command(Tag::new("COMMIT"))),
            Statement::Rollback { .. } => Ok(QueryOutcome::Command(Tag::new("ROLLBACK"))),
            Statement::Set(_) => Ok(QueryOutcome::Command(Tag::new("SET"))),
            Statement::Deallocate { .. } => Ok(QueryOutcome::Command(Tag::new("DEALLOCATE"))),
            Statement::Discard { .. } => Ok(QueryOutcome::Command(Tag::new("DISCARD ALL"))),

            Statement::ShowVariable { variable } => self.show_variable(&variable),

            Statement::Query(query) => {
                if let Some(outcome) = self.builtin_select(&query)? {
                    return Ok(outcome);
                }
                let mut statement = Statement::Query(query);
                rewrite_table_references(&mut statement, &self.schema_prefix);
                self.execute(&statement.to_string(), token).await
            }
            explain @ Statement::Explain { .. } => {
                self.execute(&explain.to_string(), token).await
            }
            show @ Statement::ShowTables { .. } => self.execute(&show.to_string(), token).await,
            show @ Statement::ShowColumns { .. } => self.execute(&show.to_string(), token).await,

            Statement::Insert(_)
            | Statement::Update { .. }
            | Statement::Delete(_)
            | Statement::Copy { .. }
            | Statement::Truncate { .. }
            | Statement::Merge { .. }
            | Statement::CreateTable(_)
            | Statement::CreateIndex(_)
            | Statement::CreateView { .. }
            | Statement::CreateSchema { .. }
            | Statement::Drop { .. }
            | Statement::AlterTable { .. }
            | Statement::Grant { .. }
            | Statement::Revoke { .. } => Err(readonly_error()),

            other => Err(user_error(
                "0A000",
                format!("statement is not supported: {other}"),
            )),
        }
    }

    /// Row description for the extended protocol's Describe.
    pub async fn describe(&self, sql: &str) -> PgWireResult<Vec<FieldInfo>> {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        let statements = parse_statements(trimmed)?;
        let Some(statement) = statements.into_iter().next() else {
            return Ok(Vec::new());
        };

        match statement {
            Statement::ShowVariable { variable } => {
                Ok(vec![text_field(&variable_name(&variable))])
            }
            Statement::Query(query) => {
                if let Some(name) = builtin_select_name(&query) {
                    return Ok(vec![text_field(name)]);
                }
                let mut statement = Statement::Query(query);
                rewrite_table_references(&mut statement, &self.schema_prefix);
                self.engine
                    .refresh()
                    .await
                    .map_err(|e| internal_error(e.to_string()))?;
                let df = self
                    .engine
                    .plan(&statement.to_string())
                    .await
                    .map_err(map_df_error)?;
                Ok(df
                    .schema()
                    .fields()
                    .iter()
                    .map(|field| {
                        FieldInfo::new(
                            field.name().clone(),
                            None,
                            None,
                            pg_type_for(field.data_type()),
                            FieldFormat::Text,
                        )
                    })
                    .collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn execute(&self, sql: &str, token: &CancellationToken) -> PgWireResult<QueryOutcome> {
        self.engine
            .refresh()
            .await
            .map_err(|e| internal_error(e.to_string()))?;

        let df = self.engine.plan(sql).await.map_err(map_df_error)?;
        let fields: Arc<Vec<FieldInfo>> = Arc::new(
            df.schema()
                .fields()
                .iter()
                .map(|field| {
                    FieldInfo::new(
                        field.name().clone(),
                        None,
                        None,
                        pg_type_for(field.data_type()),
                        FieldFormat::Text,
                    )
                })
                .collect(),
        );

        let batches = df.execute_stream().await.map_err(map_df_error)?;
        Ok(QueryOutcome::Rows {
            fields: fields.clone(),
            rows: encode_row_stream(fields, batches, token.clone()),
        })
    }

    fn show_variable(&self, variable: &[Ident]) -> PgWireResult<QueryOutcome> {
        let name = variable_name(variable);
        let value = match name.as_str() {
            "server_version" => SERVER_VERSION,
            "server_encoding" | "client_encoding" => "UTF8",
            "datestyle" => "ISO, MDY",
            "timezone" | "time zone" => "UTC",
            "transaction isolation level" | "transaction_isolation" => "read committed",
            "standard_conforming_strings" => "on",
            "integer_datetimes" => "on",
            "search_path" => "public",
            "max_identifier_length" => "63",
            "application_name" => "",
            _ => {
                return Err(user_error(
                    "42704",
                    format!("unrecognized configuration parameter \"{name}\""),
                ))
            }
        };
        Ok(single_row(&name, value))
    }

    /// Compatibility selects every Postgres client issues at connect time.
    fn builtin_select(&self, query: &Query) -> PgWireResult<Option<QueryOutcome>> {
        Ok(builtin_select_name(query).map(|name| match name {
            "version" => single_row("version", &format!("PostgreSQL {SERVER_VERSION} (BemiDB)")),
            "current_database" => single_row("current_database", "bemidb"),
            "current_schema" => single_row("current_schema", "public"),
            _ => unreachable!("builtin names are fixed"),
        }))
    }
}

fn builtin_select_name(query: &Query) -> Option<&'static str> {
    let normalized = query.to_string().to_lowercase();
    match normalized.as_str() {
        "select version()" | "select pg_catalog.version()" => Some("version"),
        "select current_database()" => Some("current_database"),
        "select current_schema()" | "select current_schema" => Some("current_schema"),
        _ => None,
    }
}

fn variable_name(variable: &[Ident]) -> String {
    variable
        .iter()
        .map(|ident| ident.value.to_lowercase())
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_statements(sql: &str) -> PgWireResult<Vec<Statement>> {
    Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| user_error("42601", format!("syntax error: {e}")))
}

fn single_row(name: &str, value: &str) -> QueryOutcome {
    let fields = Arc::new(vec![text_field(name)]);
    let encoded = {
        let mut encoder = DataRowEncoder::new(fields.clone());
        encoder
            .encode_field(&Some(value))
            .and_then(|_| encoder.finish())
    };
    QueryOutcome::Rows {
        fields,
        rows: futures::stream::iter(vec![encoded]).boxed(),
    }
}

fn text_field(name: &str) -> FieldInfo {
    FieldInfo::new(name.to_string(), None, None, Type::TEXT, FieldFormat::Text)
}

pub fn user_error(code: &str, message: impl Into<String>) -> PgWireError {
    PgWireError::UserError(Box::new(ErrorInfo::new(
        "ERROR".to_string(),
        code.to_string(),
        message.into(),
    )))
}

fn internal_error(message: impl Into<String>) -> PgWireError {
    user_error("XX000", message)
}

fn readonly_error() -> PgWireError {
    let err = BemiError::ReadOnlyViolation;
    user_error(err.sqlstate(), err.to_string())
}

fn canceled_error() -> PgWireError {
    let err = BemiError::QueryCanceled;
    user_error(err.sqlstate(), err.to_string())
}

fn map_df_error(e: datafusion::common::DataFusionError) -> PgWireError {
    let message = e.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("not found") || lowered.contains("does not exist") {
        user_error("42P01", message)
    } else {
        internal_error(message)
    }
}

/// Rewrite table references for execution against the sink catalog:
/// unqualified `pg_*` names resolve into `pg_catalog`, and when a schema
/// prefix is configured every user schema qualifier gets the prefix
/// (unqualified names resolve against the prefixed `public`). CTE names are
/// left alone.
fn rewrite_table_references(statement: &mut Statement, prefix: &str) {
    if let Statement::Query(query) = statement {
        let mut cte_names = HashSet::new();
        rewrite_query(query, prefix, &mut cte_names);
    }
}

fn rewrite_query(query: &mut Query, prefix: &str, cte_names: &mut HashSet<String>) {
    if let Some(with) = query.with.as_mut() {
        for cte in &mut with.cte_tables {
            cte_names.insert(cte.alias.name.value.clone());
            rewrite_query(&mut cte.query, prefix, cte_names);
        }
    }
    rewrite_set_expr(&mut query.body, prefix, cte_names);
}

fn rewrite_set_expr(body: &mut SetExpr, prefix: &str, cte_names: &mut HashSet<String>) {
    match body {
        SetExpr::Select(select) => {
            for table in &mut select.from {
                rewrite_table_factor(&mut table.relation, prefix, cte_names);
                for join in &mut table.joins {
                    rewrite_table_factor(&mut join.relation, prefix, cte_names);
                }
            }
        }
        SetExpr::Query(query) => rewrite_query(query, prefix, cte_names),
        SetExpr::SetOperation { left, right, .. } => {
            rewrite_set_expr(left, prefix, cte_names);
            rewrite_set_expr(right, prefix, cte_names);
        }
        _ => {}
    }
}

fn rewrite_table_factor(factor: &mut TableFactor, prefix: &str, cte_names: &mut HashSet<String>) {
    match factor {
        TableFactor::Table { name, .. } => rewrite_object_name(name, prefix, cte_names),
        TableFactor::Derived { subquery, .. } => rewrite_query(subquery, prefix, cte_names),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => {
            rewrite_table_factor(&mut table_with_joins.relation, prefix, cte_names);
            for join in &mut table_with_joins.joins {
                rewrite_table_factor(&mut join.relation, prefix, cte_names);
            }
        }
        _ => {}
    }
}

fn rewrite_object_name(name: &mut ObjectName, prefix: &str, cte_names: &HashSet<String>) {
    let idents: Vec<String> = name
        .0
        .iter()
        .filter_map(|part| part.as_ident().map(|ident| ident.value.clone()))
        .collect();

    match idents.as_slice() {
        [table] => {
            if cte_names.contains(table) {
                return;
            }
            if table.starts_with("pg_") {
                name.0
                    .insert(0, ObjectNamePart::Identifier(Ident::new("pg_catalog")));
            } else if !prefix.is_empty() {
                name.0.insert(
                    0,
                    ObjectNamePart::Identifier(Ident::new(format!("{prefix}public"))),
                );
            }
        }
        [schema, _table] => {
            if prefix.is_empty() || schema == "pg_catalog" || schema == "information_schema" {
                return;
            }
            let prefixed = format!("{prefix}{schema}");
            name.0[0] = ObjectNamePart::Identifier(Ident::new(prefixed));
        }
        _ => {}
    }
}

fn pg_type_for(data_type: &DataType) -> Type {
    match data_type {
        DataType::Boolean => Type::BOOL,
        DataType::Int8 | DataType::Int16 => Type::INT2,
        DataType::Int32 => Type::INT4,
        DataType::Int64 => Type::INT8,
        DataType::Float32 => Type::FLOAT4,
        DataType::Float64 => Type::FLOAT8,
        DataType::Decimal128(_, _) => Type::NUMERIC,
        DataType::Utf8 | DataType::LargeUtf8 => Type::TEXT,
        DataType::Date32 => Type::DATE,
        DataType::Time64(_) => Type::TIME,
        DataType::Timestamp(_, None) => Type::TIMESTAMP,
        DataType::Timestamp(_, Some(_)) => Type::TIMESTAMPTZ,
        DataType::Binary | DataType::LargeBinary => Type::BYTEA,
        DataType::FixedSizeBinary(16) => Type::UUID,
        DataType::List(element) => match element.data_type() {
            DataType::Int32 => Type::INT4_ARRAY,
            DataType::Int64 => Type::INT8_ARRAY,
            DataType::Utf8 | DataType::LargeUtf8 => Type::TEXT_ARRAY,
            _ => Type::TEXT,
        },
        _ => Type::TEXT,
    }
}

fn encode_row_stream(
    fields: Arc<Vec<FieldInfo>>,
    batches: datafusion::execution::SendableRecordBatchStream,
    token: CancellationToken,
) -> BoxStream<'static, PgWireResult<DataRow>> {
    let tail_token = token.clone();
    let rows = batches
        .map_err(map_df_error)
        .map_ok(move |batch| {
            let encoded = encode_batch(&batch, &fields);
            futures::stream::iter(encoded)
        })
        .try_flatten()
        .take_until(token.cancelled_owned())
        .chain(
            futures::stream::once(async move {
                tail_token.is_cancelled().then(|| Err(canceled_error()))
            })
            .filter_map(|tail| async move { tail }),
        );
    rows.boxed()
}

fn encode_batch(batch: &RecordBatch, fields: &Arc<Vec<FieldInfo>>) -> Vec<PgWireResult<DataRow>> {
    (0..batch.num_rows())
        .map(|row| {
            let mut encoder = DataRowEncoder::new(fields.clone());
            for column in batch.columns() {
                let value = format_value(column.as_ref(), row)
                    .map_err(|e| internal_error(e.to_string()))?;
                encoder.encode_field(&value)?;
            }
            encoder.finish()
        })
        .collect()
}

/// Postgres text rendering of one array cell.
fn format_value(array: &dyn Array, row: usize) -> anyhow::Result<Option<String>> {
    if array.is_null(row) {
        return Ok(None);
    }

    let rendered = match array.data_type() {
        DataType::Boolean => {
            let arr = downcast::<BooleanArray>(array)?;
            if arr.value(row) { "t".to_string() } else { "f".to_string() }
        }
        DataType::Int16 => downcast::<Int16Array>(array)?.value(row).to_string(),
        DataType::Int32 => downcast::<Int32Array>(array)?.value(row).to_string(),
        DataType::Int64 => downcast::<Int64Array>(array)?.value(row).to_string(),
        DataType::Float32 => downcast::<Float32Array>(array)?.value(row).to_string(),
        DataType::Float64 => downcast::<Float64Array>(array)?.value(row).to_string(),
        DataType::Decimal128(_, _) => downcast::<Decimal128Array>(array)?.value_as_string(row),
        DataType::Utf8 => downcast::<StringArray>(array)?.value(row).to_string(),
        DataType::LargeUtf8 => downcast::<LargeStringArray>(array)?.value(row).to_string(),
        DataType::Date32 => {
            let days = downcast::<Date32Array>(array)?.value(row);
            let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch");
            (epoch + TimeDelta::days(days as i64)).to_string()
        }
        DataType::Time64(TimeUnit::Microsecond) => {
            let micros = downcast::<Time64MicrosecondArray>(array)?.value(row);
            let midnight = NaiveTime::from_hms_opt(0, 0, 0).expect("midnight");
            (midnight + TimeDelta::microseconds(micros))
                .format("%H:%M:%S%.6f")
                .to_string()
        }
        DataType::Timestamp(TimeUnit::Microsecond, tz) => {
            let micros = downcast::<TimestampMicrosecondArray>(array)?.value(row);
            let dt = DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {micros}"))?;
            match tz {
                Some(_) => dt.format("%Y-%m-%d %H:%M:%S%.6f+00").to_string(),
                None => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            }
        }
        DataType::Binary => format!("\\x{}", hex::encode(downcast::<BinaryArray>(array)?.value(row))),
        DataType::LargeBinary => format!(
            "\\x{}",
            hex::encode(downcast::<LargeBinaryArray>(array)?.value(row))
        ),
        DataType::FixedSizeBinary(16) => {
            let bytes = downcast::<FixedSizeBinaryArray>(array)?.value(row);
            uuid::Uuid::from_slice(bytes)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| format!("\\x{}", hex::encode(bytes)))
        }
        DataType::List(_) => {
            let values = downcast::<ListArray>(array)?.value(row);
            let mut elements = Vec::with_capacity(values.len());
            for i in 0..values.len() {
                match format_value(values.as_ref(), i)? {
                    None => elements.push("NULL".to_string()),
                    Some(element) => elements.push(quote_array_element(&element)),
                }
            }
            format!("{{{}}}", elements.join(","))
        }
        _ => arrow::util::display::array_value_to_string(array, row)?,
    };
    Ok(Some(rendered))
}

fn downcast<T: 'static>(array: &dyn Array) -> anyhow::Result<&T> {
    array
        .as_any()
        .downcast_ref::<T>()
        .ok_or_else(|| anyhow::anyhow!("unexpected array layout for {}", array.data_type()))
}

fn quote_array_element(element: &str) -> String {
    let needs_quotes = element.is_empty()
        || element.eq_ignore_ascii_case("null")
        || element
            .chars()
            .any(|c| matches!(c, ',' | '"' | '\\' | '{' | '}') || c.is_whitespace());
    if needs_quotes {
        let escaped = element.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\"")
    } else {
        element.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::build_file_io;
    use crate::reader::IcebergReader;
    use tempfile::TempDir;

    fn handler(prefix: &str) -> (TempDir, QueryHandler) {
        let dir = TempDir::new().unwrap();
        let reader = IcebergReader::new(dir.path(), build_file_io().unwrap());
        let engine = Arc::new(QueryEngine::new(reader));
        let handler = QueryHandler::new(engine, prefix.to_string());
        (dir, handler)
    }

    fn rewritten(sql: &str, prefix: &str) -> String {
        let mut statements = Parser::parse_sql(&PostgreSqlDialect {}, sql).unwrap();
        rewrite_table_references(&mut statements[0], prefix);
        statements[0].to_string()
    }

    #[test]
    fn prefix_rewrites_qualified_names() {
        assert_eq!(
            rewritten("SELECT * FROM public.users", "t1_"),
            "SELECT * FROM t1_public.users"
        );
    }

    #[test]
    fn prefix_qualifies_bare_names_with_prefixed_public() {
        assert_eq!(
            rewritten("SELECT * FROM users", "t1_"),
            "SELECT * FROM t1_public.users"
        );
    }

    #[test]
    fn prefix_skips_system_schemas() {
        assert_eq!(
            rewritten("SELECT * FROM pg_catalog.pg_namespace", "t1_"),
            "SELECT * FROM pg_catalog.pg_namespace"
        );
        assert_eq!(
            rewritten("SELECT * FROM information_schema.tables", "t1_"),
            "SELECT * FROM information_schema.tables"
        );
    }

    #[test]
    fn bare_pg_names_resolve_into_pg_catalog() {
        assert_eq!(
            rewritten("SELECT * FROM pg_namespace", ""),
            "SELECT * FROM pg_catalog.pg_namespace"
        );
    }

    #[test]
    fn empty_prefix_leaves_user_tables_alone() {
        assert_eq!(
            rewritten("SELECT id FROM test_schema.simple_table", ""),
            "SELECT id FROM test_schema.simple_table"
        );
        assert_eq!(rewritten("SELECT id FROM users", ""), "SELECT id FROM users");
    }

    #[test]
    fn cte_names_are_not_rewritten() {
        assert_eq!(
            rewritten("WITH c AS (SELECT * FROM public.users) SELECT * FROM c", "t1_"),
            "WITH c AS (SELECT * FROM t1_public.users) SELECT * FROM c"
        );
    }

    #[test]
    fn joins_and_subqueries_are_rewritten() {
        assert_eq!(
            rewritten(
                "SELECT * FROM a JOIN public.b ON a.id = b.id WHERE a.id IN (SELECT id FROM a)",
                "t1_"
            )
            .matches("t1_public")
            .count(),
            // FROM-level references: `a` and `public.b`.
            2
        );
    }

    #[tokio::test]
    async fn write_statements_are_rejected() {
        let (_dir, handler) = handler("");
        let token = CancellationToken::new();
        for sql in [
            "INSERT INTO t VALUES (1)",
            "UPDATE t SET a = 1",
            "DELETE FROM t",
            "CREATE TABLE t (a int)",
            "DROP TABLE t",
            "ALTER TABLE t ADD COLUMN b int",
            "TRUNCATE TABLE t",
        ] {
            let err = handler.handle_simple(sql, &token).await.err();
            let Some(PgWireError::UserError(info)) = err else {
                panic!("expected rejection for {sql}");
            };
            assert_eq!(info.code(), "25006", "for {sql}");
        }
    }

    #[tokio::test]
    async fn transaction_noops_are_acknowledged() {
        let (_dir, handler) = handler("");
        let token = CancellationToken::new();
        for (sql, tag) in [
            ("BEGIN", "BEGIN"),
            ("COMMIT", "COMMIT"),
            ("ROLLBACK", "ROLLBACK"),
            ("SET client_encoding = 'UTF8'", "SET"),
        ] {
            let outcomes = handler.handle_simple(sql, &token).await.unwrap();
            assert_eq!(outcomes.len(), 1);
            assert!(
                matches!(&outcomes[0], QueryOutcome::Command(t) if format!("{t:?}").contains(tag)),
                "for {sql}"
            );
        }
    }

    #[tokio::test]
    async fn show_known_variable_answers_one_row() {
        let (_dir, handler) = handler("");
        let token = CancellationToken::new();
        let outcomes = handler
            .handle_simple("SHOW server_version", &token)
            .await
            .unwrap();
        let QueryOutcome::Rows { fields, mut rows } = outcomes.into_iter().next().unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name(), "server_version");
        assert!(rows.next().await.unwrap().is_ok());
        assert!(rows.next().await.is_none());
    }

    #[tokio::test]
    async fn show_unknown_variable_errors() {
        let (_dir, handler) = handler("");
        let token = CancellationToken::new();
        let err = handler
            .handle_simple("SHOW bogus_setting", &token)
            .await
            .err();
        let Some(PgWireError::UserError(info)) = err else {
            panic!("expected error");
        };
        assert_eq!(info.code(), "42704");
    }

    #[tokio::test]
    async fn version_select_is_builtin() {
        let (_dir, handler) = handler("");
        let token = CancellationToken::new();
        let outcomes = handler
            .handle_simple("SELECT version()", &token)
            .await
            .unwrap();
        assert!(matches!(outcomes[0], QueryOutcome::Rows { .. }));
    }

    #[tokio::test]
    async fn empty_query_yields_empty_outcome() {
        let (_dir, handler) = handler("");
        let token = CancellationToken::new();
        let outcomes = handler.handle_simple("   ", &token).await.unwrap();
        assert!(matches!(outcomes[0], QueryOutcome::Empty));
    }

    #[tokio::test]
    async fn missing_table_maps_to_undefined_table() {
        let (_dir, handler) = handler("");
        let token = CancellationToken::new();
        let err = handler
            .handle_simple("SELECT id FROM test_schema.simple_table", &token)
            .await
            .err();
        let Some(PgWireError::UserError(info)) = err else {
            panic!("expected error");
        };
        assert_eq!(info.code(), "42P01");
    }

    #[test]
    fn array_elements_are_quoted_when_needed() {
        assert_eq!(quote_array_element("plain"), "plain");
        assert_eq!(quote_array_element("a b"), "\"a b\"");
        assert_eq!(quote_array_element("a,b"), "\"a,b\"");
        assert_eq!(quote_array_element(""), "\"\"");
        assert_eq!(quote_array_element("NULL"), "\"NULL\"");
        assert_eq!(quote_array_element("say \"hi\""), "\"say \\\"hi\\\"\"");
    }

    #[test]
    fn pg_types_cover_the_mapped_surface() {
        assert_eq!(pg_type_for(&DataType::Boolean), Type::BOOL);
        assert_eq!(pg_type_for(&DataType::Int64), Type::INT8);
        assert_eq!(pg_type_for(&DataType::Decimal128(10, 2)), Type::NUMERIC);
        assert_eq!(
            pg_type_for(&DataType::Timestamp(TimeUnit::Microsecond, None)),
            Type::TIMESTAMP
        );
        assert_eq!(pg_type_for(&DataType::FixedSizeBinary(16)), Type::UUID);
    }

    #[test]
    fn value_formatting_matches_postgres_text() {
        let bools = BooleanArray::from(vec![Some(true), Some(false), None]);
        assert_eq!(format_value(&bools, 0).unwrap().as_deref(), Some("t"));
        assert_eq!(format_value(&bools, 1).unwrap().as_deref(), Some("f"));
        assert_eq!(format_value(&bools, 2).unwrap(), None);

        let dates = Date32Array::from(vec![Some(1)]);
        assert_eq!(
            format_value(&dates, 0).unwrap().as_deref(),
            Some("1970-01-02")
        );

        let decimals = Decimal128Array::from(vec![Some(12_345i128)])
            .with_precision_and_scale(10, 2)
            .unwrap();
        assert_eq!(
            format_value(&decimals, 0).unwrap().as_deref(),
            Some("123.45")
        );

        let binaries = BinaryArray::from(vec![Some(b"hi".as_ref())]);
        assert_eq!(
            format_value(&binaries, 0).unwrap().as_deref(),
            Some("\\x6869")
        );
    }
}
