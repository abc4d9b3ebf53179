//! Tenant provisioning and query execution.
//!
//! [`Db`] holds the server configuration and the entity registry.
//! [`Db::tenant`] returns a handle whose database is guaranteed to exist
//! with the full registered schema migrated into it: the database is
//! created on first access, engine prerequisites are installed, and every
//! registered entity's DDL is applied idempotently. Queries run through the
//! tenant's cached [`SqlCompiler`] so callers write loosely-cased SQL.

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{Column, PgPool, Row};
use tracing::{debug, info};

use crate::config::{Config, Engine};
use crate::ddl::{sqlstate, DdlCompiler, DdlKind};
use crate::dialect::{Dialect, Postgres};
use crate::error::{DbError, DbResult};
use crate::registry::Registry;
use crate::sql::{SqlCompiler, TableDict};

/// Entry point: server configuration plus the shared entity registry.
pub struct Db {
    cfg: Config,
    registry: Arc<Registry>,
    dialect: Arc<dyn Dialect>,
}

impl Db {
    pub fn new(cfg: Config, registry: Arc<Registry>) -> Self {
        let dialect: Arc<dyn Dialect> = match cfg.engine {
            Engine::Postgres => Arc::new(Postgres),
        };
        Self {
            cfg,
            registry,
            dialect,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Get (and, if needed, provision) a tenant database.
    pub async fn tenant(&self, name: &str) -> DbResult<Tenant> {
        if !valid_tenant_name(name) {
            return Err(DbError::provisioning(
                name,
                "tenant name must be lowercase alphanumeric or '_'",
            ));
        }

        self.ensure_database(name).await?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&self.cfg.url(Some(name)))
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;

        self.bootstrap(name, &pool).await?;
        self.migrate(name, &pool).await?;

        let compiler = match self.registry.compiler_for(name) {
            Some(compiler) => compiler,
            None => {
                let dict = TableDict::load(&pool).await?;
                let compiler = Arc::new(SqlCompiler::new(dict, self.dialect.clone()));
                self.registry.cache_compiler(name, compiler)
            }
        };

        Ok(Tenant {
            name: name.to_string(),
            pool,
            compiler,
        })
    }

    /// Create the tenant database when it does not exist yet. Losing the
    /// creation race to another process is fine. The admin pool is closed
    /// no matter how the check or the creation turns out.
    async fn ensure_database(&self, name: &str) -> DbResult<()> {
        let admin = PgPoolOptions::new()
            .max_connections(5)
            .connect(&self.cfg.url(None))
            .await
            .map_err(|e| DbError::Connection(e.to_string()))?;
        let result = self.create_if_missing(name, &admin).await;
        admin.close().await;
        result
    }

    async fn create_if_missing(&self, name: &str, admin: &PgPool) -> DbResult<()> {
        let exists = sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(name)
            .fetch_optional(admin)
            .await
            .map_err(|e| DbError::provisioning(name, e.to_string()))?
            .is_some();
        if exists {
            return Ok(());
        }

        let create = format!("CREATE DATABASE {}", self.dialect.quote(name));
        match sqlx::query(&create).execute(admin).await {
            Ok(_) => info!(tenant = name, "created database"),
            Err(err) => {
                let dup = sqlstate(&err)
                    .map(|c| self.dialect.is_duplicate_database(&c))
                    .unwrap_or(false);
                if !dup {
                    return Err(DbError::provisioning(name, err.to_string()));
                }
                debug!(tenant = name, "database already exists");
            }
        }
        Ok(())
    }

    /// Install engine prerequisites (extensions) in the tenant database.
    async fn bootstrap(&self, name: &str, pool: &PgPool) -> DbResult<()> {
        for sql in self.dialect.bootstrap_sql() {
            if let Err(err) = sqlx::query(sql).execute(pool).await {
                let dup = sqlstate(&err)
                    .map(|c| self.dialect.is_duplicate_object(&c))
                    .unwrap_or(false);
                if !dup {
                    return Err(DbError::provisioning(name, err.to_string()));
                }
            }
        }
        Ok(())
    }

    /// Apply every registered entity's schema. Structural commands for all
    /// entities run first, foreign keys after, so cross-entity references
    /// never hit a missing table.
    async fn migrate(&self, tenant: &str, pool: &PgPool) -> DbResult<()> {
        let compiler = DdlCompiler::new(self.dialect.as_ref());
        let mut structural = Vec::new();
        let mut constraints = Vec::new();
        let mut migrated = Vec::new();

        for name in self.registry.entity_names() {
            if self.registry.is_migrated(tenant, &name) {
                continue;
            }
            let entity = self.registry.resolve(&name)?;
            for cmd in compiler.compile(&entity)? {
                if cmd.kind == DdlKind::ForeignKey {
                    constraints.push(cmd);
                } else {
                    structural.push(cmd);
                }
            }
            migrated.push(name);
        }
        if structural.is_empty() && constraints.is_empty() {
            return Ok(());
        }

        compiler.apply(pool, &structural).await?;
        compiler.apply(pool, &constraints).await?;
        for name in &migrated {
            self.registry.mark_migrated(tenant, name);
        }
        info!(tenant, entities = migrated.len(), "schema migrated");
        Ok(())
    }
}

/// Handle to one provisioned tenant database.
pub struct Tenant {
    name: String,
    pool: PgPool,
    compiler: Arc<SqlCompiler>,
}

impl Tenant {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Compile without executing; useful for logging and tests.
    pub fn compile(&self, sql: &str) -> DbResult<String> {
        self.compiler.parse(sql)
    }

    /// Run a mutation; returns the number of affected rows.
    pub async fn exec(&self, sql: &str, args: &[SqlValue]) -> DbResult<u64> {
        let compiled = self.compiler.parse(sql)?;
        debug!(tenant = %self.name, sql = %compiled, "exec");
        let result = bind_all(sqlx::query(&compiled), args)
            .execute(&self.pool)
            .await
            .map_err(|e| DbError::Execution(e.to_string()))?;
        Ok(result.rows_affected())
    }

    /// Run a query and collect all rows.
    pub async fn query(&self, sql: &str, args: &[SqlValue]) -> DbResult<Rows> {
        let compiled = self.compiler.parse(sql)?;
        debug!(tenant = %self.name, sql = %compiled, "query");
        let rows = bind_all(sqlx::query(&compiled), args)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| DbError::Execution(e.to_string()))?;
        Ok(Rows { rows })
    }

    /// Run a query expected to return exactly one row.
    pub async fn query_row(
        &self,
        sql: &str,
        args: &[SqlValue],
    ) -> DbResult<HashMap<String, serde_json::Value>> {
        let compiled = self.compiler.parse(sql)?;
        let row = bind_all(sqlx::query(&compiled), args)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DbError::Execution(e.to_string()))?;
        Ok(row_to_map(&row))
    }
}

/// Apply one entity's schema to an already-provisioned database, without
/// going through [`Db::tenant`]. Skips entities the registry has already
/// marked migrated for this tenant.
pub async fn migrate_entity(
    pool: &PgPool,
    tenant: &str,
    entity: &str,
    registry: &Registry,
    dialect: &dyn Dialect,
) -> DbResult<()> {
    if registry.is_migrated(tenant, entity) {
        return Ok(());
    }
    let resolved = registry.resolve(entity)?;
    let compiler = DdlCompiler::new(dialect);
    let commands = compiler.compile(&resolved)?;
    compiler.apply(pool, &commands).await?;
    registry.mark_migrated(tenant, entity);
    Ok(())
}

/// Parameter value for `exec`/`query`.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Uuid(uuid::Uuid),
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v as i64)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Int(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::Float(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Str(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Str(v)
    }
}

impl From<uuid::Uuid> for SqlValue {
    fn from(v: uuid::Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

fn bind_all<'q>(
    mut query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    args: &'q [SqlValue],
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    for arg in args {
        query = match arg {
            SqlValue::Null => query.bind(None::<String>),
            SqlValue::Bool(v) => query.bind(v),
            SqlValue::Int(v) => query.bind(v),
            SqlValue::Float(v) => query.bind(v),
            SqlValue::Str(v) => query.bind(v),
            SqlValue::Uuid(v) => query.bind(v),
        };
    }
    query
}

/// Query result set.
pub struct Rows {
    rows: Vec<PgRow>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Convert every row to a JSON-like map.
    pub fn to_maps(&self) -> Vec<HashMap<String, serde_json::Value>> {
        self.rows.iter().map(row_to_map).collect()
    }

    /// Pretty-printed JSON array; `[]` when empty.
    pub fn to_json(&self) -> DbResult<String> {
        let maps = self.to_maps();
        if maps.is_empty() {
            return Ok("[]".to_string());
        }
        serde_json::to_string_pretty(&maps).map_err(|e| DbError::Execution(e.to_string()))
    }

    /// Deserialize all rows into typed values.
    pub fn scan_into<T: DeserializeOwned>(&self) -> DbResult<Vec<T>> {
        self.to_maps()
            .into_iter()
            .map(|m| {
                serde_json::from_value(serde_json::Value::Object(m.into_iter().collect()))
                    .map_err(|e| DbError::Execution(e.to_string()))
            })
            .collect()
    }
}

fn valid_tenant_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Convert a PgRow to a map, handling Postgres-specific types.
fn row_to_map(row: &PgRow) -> HashMap<String, serde_json::Value> {
    use sqlx::ValueRef;

    let mut map = HashMap::new();

    for (i, column) in row.columns().iter().enumerate() {
        let name = column.name().to_string();
        let type_name = column.type_info().to_string();

        let value_ref = row.try_get_raw(i);
        if value_ref.is_err() || value_ref.as_ref().map(|v| v.is_null()).unwrap_or(true) {
            map.insert(name, serde_json::Value::Null);
            continue;
        }

        let value: serde_json::Value = match type_name.as_str() {
            "BOOL" => row
                .try_get::<bool, _>(i)
                .map(serde_json::Value::Bool)
                .unwrap_or(serde_json::Value::Null),
            "INT2" | "INT4" => row
                .try_get::<i32, _>(i)
                .map(|v| serde_json::Value::Number(v.into()))
                .unwrap_or(serde_json::Value::Null),
            "INT8" => row
                .try_get::<i64, _>(i)
                .map(|v| serde_json::Value::Number(v.into()))
                .unwrap_or(serde_json::Value::Null),
            "FLOAT4" => row
                .try_get::<f32, _>(i)
                .ok()
                .and_then(|v| serde_json::Number::from_f64(v as f64))
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            "FLOAT8" => row
                .try_get::<f64, _>(i)
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            "NUMERIC" => row
                .try_get::<rust_decimal::Decimal, _>(i)
                .map(|v| serde_json::Value::String(v.to_string()))
                .unwrap_or(serde_json::Value::Null),
            "UUID" => row
                .try_get::<uuid::Uuid, _>(i)
                .map(|v| serde_json::Value::String(v.to_string()))
                .unwrap_or(serde_json::Value::Null),
            "TIMESTAMPTZ" | "TIMESTAMP" => row
                .try_get::<chrono::DateTime<chrono::Utc>, _>(i)
                .map(|v| serde_json::Value::String(v.to_rfc3339()))
                .or_else(|_| {
                    row.try_get::<chrono::NaiveDateTime, _>(i)
                        .map(|v| serde_json::Value::String(v.to_string()))
                })
                .unwrap_or(serde_json::Value::Null),
            "DATE" => row
                .try_get::<chrono::NaiveDate, _>(i)
                .map(|v| serde_json::Value::String(v.to_string()))
                .unwrap_or(serde_json::Value::Null),
            "TEXT" | "VARCHAR" | "CHAR" | "NAME" | "CITEXT" => row
                .try_get::<String, _>(i)
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
            "BYTEA" => row
                .try_get::<Vec<u8>, _>(i)
                .map(|v| serde_json::Value::String(String::from_utf8_lossy(&v).into_owned()))
                .unwrap_or(serde_json::Value::Null),
            "JSONB" | "JSON" => row
                .try_get::<serde_json::Value, _>(i)
                .unwrap_or(serde_json::Value::Null),
            _ => row
                .try_get::<String, _>(i)
                .map(serde_json::Value::String)
                .unwrap_or_else(|_| serde_json::Value::String(format!("<{}>", type_name))),
        };

        map.insert(name, value);
    }

    map
}
