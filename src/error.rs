//! Error types for tenantdb.

use thiserror::Error;

/// The main error type for tenantdb operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// The registered value is not a usable entity definition.
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    /// A field directive or reference could not be resolved.
    #[error("Schema definition error in entity '{entity}', field '{field}': {message} (directive: '{directive}')")]
    SchemaDefinition {
        entity: String,
        field: String,
        directive: String,
        message: String,
    },

    /// A DDL command failed for a non-tolerated reason.
    #[error("Migration failed: {message}\nSQL: {command}")]
    Migration { command: String, message: String },

    /// Tenant database or connection setup failed.
    #[error("Provisioning error for tenant '{tenant}': {message}")]
    Provisioning { tenant: String, message: String },

    /// An identifier in the input SQL could not be resolved.
    #[error("Compile error in {clause}: cannot resolve '{identifier}': {message}")]
    Compile {
        identifier: String,
        clause: &'static str,
        message: String,
    },

    /// The input SQL is not syntactically valid.
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    /// Connection error.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Query execution error.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    /// Create a schema definition error for a field directive.
    pub fn schema(
        entity: impl Into<String>,
        field: impl Into<String>,
        directive: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::SchemaDefinition {
            entity: entity.into(),
            field: field.into(),
            directive: directive.into(),
            message: message.into(),
        }
    }

    /// Create a compile error for an unresolvable identifier.
    pub fn compile(
        identifier: impl Into<String>,
        clause: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self::Compile {
            identifier: identifier.into(),
            clause,
            message: message.into(),
        }
    }

    /// Create a syntax error at the given position.
    pub fn syntax(position: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            position,
            message: message.into(),
        }
    }

    /// Create a provisioning error for a tenant.
    pub fn provisioning(tenant: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provisioning {
            tenant: tenant.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for tenantdb operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::syntax(5, "unexpected character");
        assert_eq!(
            err.to_string(),
            "Syntax error at position 5: unexpected character"
        );
    }

    #[test]
    fn test_schema_error_names_offender() {
        let err = DbError::schema("Departments", "Emps", "fk:Missing", "no such field");
        let msg = err.to_string();
        assert!(msg.contains("Departments"));
        assert!(msg.contains("Emps"));
        assert!(msg.contains("fk:Missing"));
    }
}
