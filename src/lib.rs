//! Multi-tenant database access layer.
//!
//! Entities are declared once as metadata, registered in a [`registry::Registry`],
//! and materialized per tenant: [`tenant::Db::tenant`] creates the tenant
//! database on first access and migrates the full registered schema into it
//! with idempotent DDL. Queries then go through a schema-aware compiler that
//! resolves loosely-cased identifiers to the canonical quoted schema.
//!
//! ```rust,ignore
//! let registry = Arc::new(Registry::new());
//! registry.register(
//!     EntityDef::new("Employees")
//!         .field("EmployeeId", ScalarType::Int, "pk;df:auto")
//!         .field("FirstName", ScalarType::Text, "nvarchar(50)"),
//! )?;
//!
//! let db = Db::new(cfg, registry);
//! let tenant = db.tenant("a0001").await?;
//! let rows = tenant.query("select * from employees where year(createdon) = $1", &[2026.into()]).await?;
//! println!("{}", rows.to_json()?);
//! ```

pub mod config;
pub mod ddl;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod registry;
pub mod sql;
pub mod tenant;

pub use error::{DbError, DbResult};

pub mod prelude {
    pub use crate::config::{Config, Engine};
    pub use crate::dialect::{Dialect, Postgres};
    pub use crate::entity::{EntityDef, ScalarType};
    pub use crate::error::{DbError, DbResult};
    pub use crate::registry::Registry;
    pub use crate::sql::{SqlCompiler, TableDict};
    pub use crate::tenant::{migrate_entity, Db, Rows, SqlValue, Tenant};
}
