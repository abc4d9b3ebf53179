//! Dialect-specific identifier and type catalogs.
//!
//! Pure mapping tables: language scalar type to column type, default-value
//! generator to SQL expression, identifier quoting, vendor-neutral function
//! rewrites, and the precise set of tolerated "already exists" error codes.
//! Everything engine-specific funnels through [`Dialect`] so another engine
//! can be plugged in without touching the compilers.

use crate::entity::ScalarType;

/// Engine-specific mapping tables. Pure data, no state.
pub trait Dialect: Send + Sync {
    /// Column type for a scalar value type.
    fn column_type(&self, scalar: ScalarType) -> &'static str;

    /// Column type used when a primary-key field is auto-incremented.
    fn auto_column_type(&self) -> &'static str;

    /// SQL expression for a named default-value generator, if the dialect
    /// knows it. Unknown values are treated as literals by the DDL compiler.
    fn default_expr(&self, value: &str) -> Option<&'static str>;

    /// Quote an identifier unconditionally.
    fn quote(&self, ident: &str) -> String;

    /// Rewrite a vendor-neutral function call into a dialect-specific
    /// expression. `args` are already-compiled argument expressions.
    /// Returns `None` when the call passes through unchanged.
    fn rewrite_function(&self, name: &str, args: &[String]) -> Option<String>;

    /// Whether a function requires an `OVER` window specification.
    fn is_window_function(&self, name: &str) -> bool;

    /// Whether a SQLSTATE code means "object already exists" and is safe to
    /// swallow during idempotent DDL application.
    fn is_duplicate_object(&self, code: &str) -> bool;

    /// Whether a SQLSTATE code means "database already exists".
    fn is_duplicate_database(&self, code: &str) -> bool;

    /// Engine-level prerequisites run once per tenant database.
    fn bootstrap_sql(&self) -> &'static [&'static str];
}

/// The reference PostgreSQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Dialect for Postgres {
    fn column_type(&self, scalar: ScalarType) -> &'static str {
        match scalar {
            ScalarType::SmallInt => "smallint",
            ScalarType::Int => "integer",
            ScalarType::BigInt => "bigint",
            ScalarType::Float => "real",
            ScalarType::Double => "double precision",
            // citext keeps text comparisons case-insensitive across the schema
            ScalarType::Text => "citext",
            ScalarType::Bool => "boolean",
            ScalarType::Timestamp => "timestamp",
            ScalarType::Decimal => "numeric",
            ScalarType::Uuid => "uuid",
        }
    }

    fn auto_column_type(&self) -> &'static str {
        "SERIAL"
    }

    fn default_expr(&self, value: &str) -> Option<&'static str> {
        match value.to_ascii_lowercase().as_str() {
            "now()" => Some("CURRENT_TIMESTAMP"),
            "uuid()" => Some("uuid_generate_v4()"),
            _ => None,
        }
    }

    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn rewrite_function(&self, name: &str, args: &[String]) -> Option<String> {
        let part = match name.to_ascii_lowercase().as_str() {
            "year" => "YEAR",
            "month" => "MONTH",
            "day" => "DAY",
            _ => return None,
        };
        if args.len() != 1 {
            return None;
        }
        Some(format!("EXTRACT({} FROM {})", part, args[0]))
    }

    fn is_window_function(&self, name: &str) -> bool {
        matches!(
            name.to_ascii_lowercase().as_str(),
            "row_number" | "rank" | "dense_rank"
        )
    }

    fn is_duplicate_object(&self, code: &str) -> bool {
        // 42P07 duplicate table/index/sequence, 42701 duplicate column,
        // 42710 duplicate object (constraints, extensions)
        matches!(code, "42P07" | "42701" | "42710")
    }

    fn is_duplicate_database(&self, code: &str) -> bool {
        code == "42P04"
    }

    fn bootstrap_sql(&self) -> &'static [&'static str] {
        &[
            "CREATE EXTENSION IF NOT EXISTS citext",
            "CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\"",
        ]
    }
}
