use thiserror::Error;

/// Errors surfaced across the sync and query paths.
///
/// Per-table failures (`UnsupportedType`, `SchemaIncompatible`) are logged
/// by the syncer and do not abort a run; connection-level failures do.
#[derive(Debug, Error)]
pub enum BemiError {
    #[error("missing required configuration: {0}")]
    ConfigMissing(&'static str),

    #[error("source database unavailable: {0}")]
    SourceUnavailable(#[from] tokio_postgres::Error),

    #[error("unsupported column type {namespace}.{udt_name} for column \"{column}\"")]
    UnsupportedType {
        namespace: String,
        udt_name: String,
        column: String,
    },

    #[error("incompatible schema change for column \"{column}\": {reason}")]
    SchemaIncompatible { column: String, reason: String },

    #[error("iceberg catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cannot execute a write statement in a read-only session")]
    ReadOnlyViolation,

    #[error("query canceled on user request")]
    QueryCanceled,
}

impl BemiError {
    /// SQLSTATE code used when the error crosses the wire.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            BemiError::ReadOnlyViolation => "25006",
            BemiError::QueryCanceled => "57014",
            BemiError::NotFound(_) => "42P01",
            BemiError::UnsupportedType { .. } => "0A000",
            _ => "XX000",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_mapping() {
        assert_eq!(BemiError::ReadOnlyViolation.sqlstate(), "25006");
        assert_eq!(BemiError::QueryCanceled.sqlstate(), "57014");
        assert_eq!(BemiError::NotFound("x".into()).sqlstate(), "42P01");
    }

    #[test]
    fn unsupported_type_message_names_the_type() {
        let err = BemiError::UnsupportedType {
            namespace: "public".into(),
            udt_name: "geometry".into(),
            column: "geom".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("public.geometry"));
        assert!(msg.contains("geom"));
    }
}
