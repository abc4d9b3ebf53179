//! Identifier dictionary: lowercase lookup names to canonical schema names.
//!
//! The compiler resolves case-insensitive identifiers through this table.
//! It can be built from resolved entity metadata, or loaded from a live
//! database's `information_schema` so the dictionary reflects what actually
//! exists in the tenant.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::{PgPool, Row};

use crate::entity::EntityType;
use crate::error::{DbError, DbResult};

/// One table with its column lookup map (lowercase name to canonical name).
#[derive(Debug, Clone, Default)]
pub struct TableEntry {
    pub name: String,
    pub columns: HashMap<String, String>,
}

/// All tables known to one database, keyed by lowercase table name.
#[derive(Debug, Clone, Default)]
pub struct TableDict {
    tables: HashMap<String, TableEntry>,
}

impl TableDict {
    /// Build from resolved entity metadata, without touching a database.
    pub fn from_entities<'a>(entities: impl IntoIterator<Item = &'a Arc<EntityType>>) -> Self {
        let mut dict = TableDict::default();
        for entity in entities {
            let mut entry = TableEntry {
                name: entity.table_name.clone(),
                columns: HashMap::new(),
            };
            for field in &entity.fields {
                entry
                    .columns
                    .insert(field.name.to_lowercase(), field.name.clone());
            }
            dict.tables.insert(entity.table_name.to_lowercase(), entry);
        }
        dict
    }

    /// Load the public schema of a live database.
    pub async fn load(pool: &PgPool) -> DbResult<Self> {
        let rows = sqlx::query(
            "SELECT table_name, column_name FROM information_schema.columns \
             WHERE table_schema = 'public' ORDER BY table_name, ordinal_position",
        )
        .fetch_all(pool)
        .await
        .map_err(|e| DbError::Execution(e.to_string()))?;

        let mut dict = TableDict::default();
        for row in rows {
            let table: String = row
                .try_get("table_name")
                .map_err(|e| DbError::Execution(e.to_string()))?;
            let column: String = row
                .try_get("column_name")
                .map_err(|e| DbError::Execution(e.to_string()))?;
            let entry = dict
                .tables
                .entry(table.to_lowercase())
                .or_insert_with(|| TableEntry {
                    name: table.clone(),
                    columns: HashMap::new(),
                });
            entry.columns.insert(column.to_lowercase(), column);
        }
        Ok(dict)
    }

    /// Look up a table by any-cased name.
    pub fn table(&self, name: &str) -> Option<&TableEntry> {
        self.tables.get(&name.to_lowercase())
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl TableEntry {
    /// Canonical column name for an any-cased lookup.
    pub fn column(&self, name: &str) -> Option<&str> {
        self.columns.get(&name.to_lowercase()).map(String::as_str)
    }
}
