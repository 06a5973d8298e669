use std::fmt;

use pg_escape::quote_identifier;
use tokio_postgres::types::{Kind, Type};

/// Widest varchar the warehouse accepts; unbounded source types are capped to this.
pub const MAX_VARCHAR_WIDTH: i32 = 65535;

/// A type alias for Postgres type modifiers.
///
/// Type modifiers specify additional type-specific attributes, such as the declared
/// length for varchar columns. For character types the stored modifier is the declared
/// length plus four bytes of header.
pub type TypeModifier = i32;

/// Header overhead included in character-type modifiers.
const VARLENA_HEADER_SIZE: TypeModifier = 4;

/// Converts a type OID to its [`Type`].
///
/// OIDs outside the built-in catalog (user-defined enums, composites) get a
/// placeholder type whose name encodes the OID; such columns fall through to the
/// text export path.
pub fn convert_type_oid_to_type(type_oid: u32) -> Type {
    Type::from_oid(type_oid).unwrap_or(Type::new(
        format!("unnamed_type({type_oid})"),
        type_oid,
        Kind::Simple,
        "pg_catalog".to_string(),
    ))
}

/// A fully qualified Postgres table name consisting of a schema and table name.
#[derive(Debug, Clone, Eq, PartialEq, PartialOrd, Ord)]
pub struct TableName {
    /// The schema containing the table.
    pub schema: String,
    /// The name of the table within the schema.
    pub name: String,
}

impl TableName {
    pub fn new(schema: String, name: String) -> TableName {
        Self { schema, name }
    }

    /// Returns the table name as a properly quoted Postgres identifier.
    pub fn as_quoted_identifier(&self) -> String {
        let quoted_schema = quote_identifier(&self.schema);
        let quoted_name = quote_identifier(&self.name);

        format!("{quoted_schema}.{quoted_name}")
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{0}.{1}", self.schema, self.name))
    }
}

/// Represents the schema of a single column in a source table.
///
/// Besides the raw source metadata, a column exposes the two derived projections the
/// pipeline needs: the warehouse column type it maps to and the expression used to
/// export its values. Both are pure functions of the column metadata, so the same
/// column always produces the same DDL and the same export query.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ColumnSchema {
    /// The name of the column.
    pub name: String,
    /// The Postgres data type of the column.
    pub typ: Type,
    /// Type-specific modifier value (e.g. declared length for varchar).
    pub modifier: TypeModifier,
    /// Whether the column can contain NULL values.
    pub nullable: bool,
}

impl ColumnSchema {
    /// Creates a new [`ColumnSchema`] with all fields specified.
    pub fn new(name: String, typ: Type, modifier: TypeModifier, nullable: bool) -> ColumnSchema {
        Self {
            name,
            typ,
            modifier,
            nullable,
        }
    }

    /// Returns the declared length carried in the type modifier, if any.
    fn declared_length(&self) -> Option<TypeModifier> {
        (self.modifier > VARLENA_HEADER_SIZE).then(|| self.modifier - VARLENA_HEADER_SIZE)
    }

    /// Returns the warehouse column type this column maps to.
    ///
    /// Numeric and temporal types carry over verbatim. Booleans become `char(1)` to
    /// match the `t`/`f` values the export emits. Unbounded text-like types are capped
    /// at the warehouse's maximum varchar width; bounded character types honor their
    /// declared length.
    pub fn warehouse_type(&self) -> String {
        match self.typ.name() {
            "bool" => "char(1)".to_string(),
            "int2" => "smallint".to_string(),
            "int4" => "integer".to_string(),
            "int8" => "bigint".to_string(),
            "float4" => "real".to_string(),
            "float8" => "double precision".to_string(),
            "numeric" => "numeric".to_string(),
            "date" => "date".to_string(),
            "timestamp" => "timestamp".to_string(),
            "timestamptz" => "timestamptz".to_string(),
            "time" | "timetz" => "varchar(32)".to_string(),
            "varchar" => match self.declared_length() {
                Some(length) => format!("varchar({length})"),
                None => format!("varchar({MAX_VARCHAR_WIDTH})"),
            },
            "bpchar" => match self.declared_length() {
                Some(length) => format!("char({length})"),
                None => "char(1)".to_string(),
            },
            // Everything else (text, json, jsonb, xml, uuid, bytea, enums, ...) is
            // exported as text and capped at the maximum varchar width.
            _ => format!("varchar({MAX_VARCHAR_WIDTH})"),
        }
    }

    /// Returns the expression used to select this column in the export query.
    ///
    /// Identity for all types except booleans, which are coerced to the single
    /// characters `t`/`f` so they load into the `char(1)` warehouse column.
    pub fn export_expression(&self) -> String {
        let identifier = quote_identifier(&self.name);

        match self.typ.name() {
            "bool" => format!("case when {identifier} then 't' else 'f' end"),
            _ => identifier.into_owned(),
        }
    }

    /// Returns the column definition used in the destination create-table statement.
    pub fn warehouse_definition(&self) -> String {
        let identifier = quote_identifier(&self.name);
        let not_null = if self.nullable { "" } else { " not null" };

        format!("{identifier} {}{not_null}", self.warehouse_type())
    }
}

/// Represents the complete schema of one source table.
///
/// The column order is fixed at discovery time and drives both the export column list
/// and the destination create-table statement; it must not be reordered within a run.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TableSchema {
    /// The fully qualified source table name.
    pub name: TableName,
    /// The ordered column schemas of the table.
    pub column_schemas: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn new(name: TableName, column_schemas: Vec<ColumnSchema>) -> TableSchema {
        Self {
            name,
            column_schemas,
        }
    }

    /// Derives the destination table name from the source name.
    ///
    /// The bare source name is used, with the configured suffix stripped when present.
    pub fn target_name(&self, strip_suffix: Option<&str>) -> String {
        match strip_suffix {
            Some(suffix) if !suffix.is_empty() => self
                .name
                .name
                .strip_suffix(suffix)
                .unwrap_or(&self.name.name)
                .to_string(),
            _ => self.name.name.clone(),
        }
    }

    /// Returns the comma-separated export expressions for all columns, in order.
    pub fn export_column_list(&self) -> String {
        self.column_schemas
            .iter()
            .map(|column| column.export_expression())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Returns the comma-separated column definitions for the destination table, in order.
    pub fn warehouse_column_list(&self) -> String {
        self.column_schemas
            .iter()
            .map(|column| column.warehouse_definition())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, typ: Type, modifier: TypeModifier, nullable: bool) -> ColumnSchema {
        ColumnSchema::new(name.to_string(), typ, modifier, nullable)
    }

    #[test]
    fn quoted_identifier_escapes_reserved_names() {
        let table = TableName::new("public".to_string(), "select".to_string());

        assert_eq!(table.as_quoted_identifier(), "public.\"select\"");
    }

    #[test]
    fn booleans_map_to_char_and_coerce_on_export() {
        let col = column("active", Type::BOOL, -1, false);

        assert_eq!(col.warehouse_type(), "char(1)");
        assert_eq!(
            col.export_expression(),
            "case when active then 't' else 'f' end"
        );
    }

    #[test]
    fn varchar_honors_the_declared_length() {
        let bounded = column("code", Type::VARCHAR, 32 + 4, true);
        let unbounded = column("code", Type::VARCHAR, -1, true);

        assert_eq!(bounded.warehouse_type(), "varchar(32)");
        assert_eq!(unbounded.warehouse_type(), "varchar(65535)");
    }

    #[test]
    fn unbounded_text_types_are_capped() {
        assert_eq!(
            column("body", Type::TEXT, -1, true).warehouse_type(),
            "varchar(65535)"
        );
        assert_eq!(
            column("payload", Type::JSONB, -1, true).warehouse_type(),
            "varchar(65535)"
        );
    }

    #[test]
    fn warehouse_definition_includes_nullability() {
        let col = column("id", Type::INT8, -1, false);

        assert_eq!(col.warehouse_definition(), "id bigint not null");
    }

    #[test]
    fn column_list_is_a_pure_function_of_the_schema() {
        let schema = TableSchema::new(
            TableName::new("public".to_string(), "users".to_string()),
            vec![
                column("id", Type::INT8, -1, false),
                column("name", Type::VARCHAR, 64 + 4, true),
                column("active", Type::BOOL, -1, false),
            ],
        );

        let first = schema.warehouse_column_list();
        let second = schema.warehouse_column_list();

        assert_eq!(first, second);
        assert_eq!(
            first,
            "id bigint not null, name varchar(64), active char(1) not null"
        );
    }

    #[test]
    fn unknown_oids_fall_back_to_a_named_placeholder() {
        assert_eq!(convert_type_oid_to_type(Type::BOOL.oid()), Type::BOOL);

        let custom = convert_type_oid_to_type(543210);
        assert_eq!(custom.name(), "unnamed_type(543210)");
        assert_eq!(
            ColumnSchema::new("tag".to_string(), custom, -1, true).warehouse_type(),
            "varchar(65535)"
        );
    }

    #[test]
    fn target_name_strips_the_configured_suffix() {
        let schema = TableSchema::new(
            TableName::new("public".to_string(), "orders_raw".to_string()),
            vec![],
        );

        assert_eq!(schema.target_name(Some("_raw")), "orders");
        assert_eq!(schema.target_name(Some("_tmp")), "orders_raw");
        assert_eq!(schema.target_name(None), "orders_raw");
    }
}
