use std::fmt;

/// A schema-qualified table identity, rendered with strict quoting as
/// `"schema"."table"`. Used for both source-side and sink-side names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaTable {
    pub schema: String,
    pub table: String,
}

impl SchemaTable {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Unquoted `schema.table` id, the form used by include/exclude filters.
    pub fn id(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// The sink-side identity with the configured schema prefix applied.
    pub fn with_prefix(&self, prefix: &str) -> SchemaTable {
        SchemaTable {
            schema: format!("{}{}", prefix, self.schema),
            table: self.table.clone(),
        }
    }
}

impl fmt::Display for SchemaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.schema, self.table)
    }
}

/// A source table as enumerated from the catalog, carrying its parent
/// partitioned table when the table is itself a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgSchemaTable {
    pub schema: String,
    pub table: String,
    pub parent_partitioned_table: Option<String>,
}

impl PgSchemaTable {
    pub fn schema_table(&self) -> SchemaTable {
        SchemaTable::new(self.schema.clone(), self.table.clone())
    }
}

impl fmt::Display for PgSchemaTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\".\"{}\"", self.schema, self.table)
    }
}

/// One column as described by the source's information schema.
///
/// `(namespace, udt_name)` identifies the type; numeric attributes that the
/// catalog reports as NULL are stored as 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgColumn {
    pub name: String,
    pub data_type: String,
    pub udt_name: String,
    pub namespace: String,
    pub is_nullable: bool,
    pub ordinal_position: i32,
    pub character_maximum_length: i32,
    pub numeric_precision: i32,
    pub numeric_scale: i32,
    pub datetime_precision: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_table_display_is_quoted() {
        let st = SchemaTable::new("Sales", "Orders");
        assert_eq!(st.to_string(), "\"Sales\".\"Orders\"");
        assert_eq!(st.id(), "Sales.Orders");
    }

    #[test]
    fn prefix_applies_to_schema_only() {
        let st = SchemaTable::new("public", "users");
        let prefixed = st.with_prefix("tenant1_");
        assert_eq!(prefixed.schema, "tenant1_public");
        assert_eq!(prefixed.table, "users");
    }

    #[test]
    fn empty_prefix_is_identity() {
        let st = SchemaTable::new("public", "users");
        assert_eq!(st.with_prefix(""), st);
    }

    #[test]
    fn pg_schema_table_converts() {
        let pg = PgSchemaTable {
            schema: "public".into(),
            table: "events_2024".into(),
            parent_partitioned_table: Some("events".into()),
        };
        assert_eq!(pg.schema_table(), SchemaTable::new("public", "events_2024"));
        assert_eq!(pg.to_string(), "\"public\".\"events_2024\"");
    }
}
