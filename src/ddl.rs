//! DDL compiler: entity metadata to idempotent schema commands.
//!
//! `compile` turns an [`EntityType`] into an ordered command list; `apply`
//! executes it, treating the dialect's "already exists" error class as
//! success so the same plan can run safely against an already-migrated
//! database. Ordering contract:
//!
//! 1. referenced entities, recursively, before the referencing one
//! 2. create-table with the primary-key columns only
//! 3. one add-column per non-key field, in declaration order (auto columns
//!    bracketed by their backing sequence commands, length limits as
//!    separate non-validating check constraints)
//! 4. index groups
//! 5. unique groups
//! 6. foreign keys, last, so every referenced table already exists

use std::collections::HashSet;

use sqlx::PgPool;
use tracing::{debug, info};

use crate::dialect::Dialect;
use crate::entity::{DefaultSpec, EntityField, EntityType};
use crate::error::{DbError, DbResult};

/// What a DDL command does; the provisioner uses this to defer foreign keys
/// until every entity's tables exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlKind {
    CreateTable,
    CreateSequence,
    AddColumn,
    AlterSequenceOwner,
    CheckConstraint,
    CreateIndex,
    CreateUniqueIndex,
    ForeignKey,
}

/// One schema-change command with its generated SQL.
#[derive(Debug, Clone)]
pub struct DdlCommand {
    pub kind: DdlKind,
    pub sql: String,
}

/// Compiles entity metadata into DDL for one dialect.
pub struct DdlCompiler<'a> {
    dialect: &'a dyn Dialect,
}

impl<'a> DdlCompiler<'a> {
    pub fn new(dialect: &'a dyn Dialect) -> Self {
        Self { dialect }
    }

    /// Compile an entity (and, first, everything it references) into an
    /// ordered command list. All foreign keys land at the end of the plan,
    /// after every table in it exists.
    pub fn compile(&self, entity: &EntityType) -> DbResult<Vec<DdlCommand>> {
        let mut out = Vec::new();
        let mut fks = Vec::new();
        let mut seen = HashSet::new();
        self.compile_into(entity, &mut seen, &mut out, &mut fks)?;
        out.append(&mut fks);
        Ok(out)
    }

    fn compile_into(
        &self,
        entity: &EntityType,
        seen: &mut HashSet<String>,
        out: &mut Vec<DdlCommand>,
        fks: &mut Vec<DdlCommand>,
    ) -> DbResult<()> {
        if !seen.insert(entity.table_name.clone()) {
            return Ok(());
        }
        for r in &entity.refs {
            self.compile_into(&r.entity, seen, out, fks)?;
        }

        out.push(self.create_table(entity)?);
        for field in entity.non_key_fields() {
            self.add_column(entity, field, out);
        }
        for (group, fields) in entity.index_groups() {
            out.push(self.create_index(entity, &group, &fields, false));
        }
        for (group, fields) in entity.unique_groups() {
            out.push(self.create_index(entity, &group, &fields, true));
        }
        for edge in entity.foreign_key_edges() {
            let q = |s: &str| self.dialect.quote(s);
            let from_cols: Vec<String> = edge.from_fields.iter().map(|f| q(f)).collect();
            let to_cols: Vec<String> = edge.to_fields.iter().map(|f| q(f)).collect();
            fks.push(DdlCommand {
                kind: DdlKind::ForeignKey,
                sql: format!(
                    "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({})",
                    q(&edge.from_table),
                    q(&format!(
                        "{}_{}_fkey",
                        edge.from_table,
                        edge.from_fields.join("_")
                    )),
                    from_cols.join(", "),
                    q(&edge.to_table),
                    to_cols.join(", "),
                ),
            });
        }
        Ok(())
    }

    fn create_table(&self, entity: &EntityType) -> DbResult<DdlCommand> {
        let pk = entity.primary_key();
        if pk.is_empty() {
            return Err(DbError::schema(
                &entity.table_name,
                "",
                "",
                "entity has no primary key",
            ));
        }
        let mut cols = Vec::new();
        let mut names = Vec::new();
        for field in &pk {
            let mut col = format!(
                "{} {}",
                self.dialect.quote(&field.name),
                self.column_type(field)
            );
            if let Some(DefaultSpec::Value(v)) = &field.default {
                col.push_str(" DEFAULT ");
                col.push_str(&self.default_expr(v));
            }
            cols.push(col);
            names.push(self.dialect.quote(&field.name));
        }
        Ok(DdlCommand {
            kind: DdlKind::CreateTable,
            sql: format!(
                "CREATE TABLE IF NOT EXISTS {}({}, PRIMARY KEY ({}))",
                self.dialect.quote(&entity.table_name),
                cols.join(", "),
                names.join(", "),
            ),
        })
    }

    fn add_column(&self, entity: &EntityType, field: &EntityField, out: &mut Vec<DdlCommand>) {
        let table = self.dialect.quote(&entity.table_name);
        let col = self.dialect.quote(&field.name);
        let mut sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            table,
            col,
            self.dialect.column_type(field.scalar)
        );
        if !field.nullable {
            sql.push_str(" NOT NULL");
        }
        match &field.default {
            Some(DefaultSpec::Auto) => {
                let seq_name = format!("{}_{}_seq", entity.table_name, field.name);
                let seq = self.dialect.quote(&seq_name);
                out.push(DdlCommand {
                    kind: DdlKind::CreateSequence,
                    sql: format!("CREATE SEQUENCE IF NOT EXISTS {}", seq),
                });
                sql.push_str(&format!(" DEFAULT nextval('{}')", seq));
                out.push(DdlCommand {
                    kind: DdlKind::AddColumn,
                    sql,
                });
                out.push(DdlCommand {
                    kind: DdlKind::AlterSequenceOwner,
                    sql: format!("ALTER SEQUENCE {} OWNED BY {}.{}", seq, table, col),
                });
            }
            Some(DefaultSpec::Value(v)) => {
                sql.push_str(" DEFAULT ");
                sql.push_str(&self.default_expr(v));
                out.push(DdlCommand {
                    kind: DdlKind::AddColumn,
                    sql,
                });
            }
            None => out.push(DdlCommand {
                kind: DdlKind::AddColumn,
                sql,
            }),
        }
        if field.max_len > 0 {
            // NOT VALID so retrofitting a limit onto populated tables cannot
            // fail on existing rows.
            out.push(DdlCommand {
                kind: DdlKind::CheckConstraint,
                sql: format!(
                    "ALTER TABLE IF EXISTS {} ADD CONSTRAINT {} CHECK (char_length({}) <= {}) NOT VALID",
                    table,
                    self.dialect.quote(&format!(
                        "{}_{}_check_length",
                        entity.table_name, field.name
                    )),
                    col,
                    field.max_len,
                ),
            });
        }
    }

    fn create_index(
        &self,
        entity: &EntityType,
        group: &str,
        fields: &[&EntityField],
        unique: bool,
    ) -> DdlCommand {
        let cols: Vec<String> = fields.iter().map(|f| self.dialect.quote(&f.name)).collect();
        DdlCommand {
            kind: if unique {
                DdlKind::CreateUniqueIndex
            } else {
                DdlKind::CreateIndex
            },
            sql: format!(
                "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
                if unique { "UNIQUE " } else { "" },
                self.dialect
                    .quote(&format!("{}_{}", entity.table_name, group)),
                self.dialect.quote(&entity.table_name),
                cols.join(", "),
            ),
        }
    }

    fn column_type(&self, field: &EntityField) -> &'static str {
        if field.default == Some(DefaultSpec::Auto) {
            self.dialect.auto_column_type()
        } else {
            self.dialect.column_type(field.scalar)
        }
    }

    fn default_expr(&self, value: &str) -> String {
        match self.dialect.default_expr(value) {
            Some(expr) => expr.to_string(),
            None => format!("'{}'", value.replace('\'', "''")),
        }
    }

    /// Execute commands strictly in order. A command failing with the
    /// dialect's "already exists" class is treated as success; anything else
    /// aborts with the offending SQL attached.
    pub async fn apply(&self, pool: &PgPool, commands: &[DdlCommand]) -> DbResult<()> {
        for cmd in commands {
            match sqlx::query(&cmd.sql).execute(pool).await {
                Ok(_) => info!(sql = %cmd.sql, "applied"),
                Err(err) => {
                    if let Some(code) = sqlstate(&err) {
                        if self.dialect.is_duplicate_object(&code) {
                            debug!(sql = %cmd.sql, code = %code, "already exists, skipping");
                            continue;
                        }
                    }
                    return Err(DbError::Migration {
                        command: cmd.sql.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// SQLSTATE of a driver error, when the engine reported one.
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Postgres;
    use crate::entity::{EntityDef, ScalarType};
    use crate::registry::Registry;
    use pretty_assertions::assert_eq;

    fn registry() -> Registry {
        let registry = Registry::new();
        registry
            .register_all([
                EntityDef::new("Departments")
                    .field("Id", ScalarType::Int, "pk;df:auto")
                    .field("Code", ScalarType::Text, "nvarchar(50);uk")
                    .field("Name", ScalarType::Text, "nvarchar(50);idx")
                    .has_many("Emps", "Employees", "fk:DepartmentId"),
                EntityDef::new("Employees")
                    .field("EmployeeId", ScalarType::Int, "pk;df:auto")
                    .field("Crc32", ScalarType::Int, "auto")
                    .nullable("DepartmentId", ScalarType::Int, ""),
            ])
            .unwrap();
        registry
    }

    fn compile(entity: &str) -> Vec<DdlCommand> {
        let registry = registry();
        let entity = registry.resolve(entity).unwrap();
        DdlCompiler::new(&Postgres).compile(&entity).unwrap()
    }

    #[test]
    fn test_create_table_holds_only_primary_key() {
        let cmds = compile("Employees");
        assert_eq!(
            cmds[0].sql,
            "CREATE TABLE IF NOT EXISTS \"Employees\"(\"EmployeeId\" SERIAL, PRIMARY KEY (\"EmployeeId\"))"
        );
    }

    #[test]
    fn test_auto_column_gets_backing_sequence() {
        let cmds = compile("Employees");
        let sqls: Vec<&str> = cmds.iter().map(|c| c.sql.as_str()).collect();
        let seq = sqls
            .iter()
            .position(|s| *s == "CREATE SEQUENCE IF NOT EXISTS \"Employees_Crc32_seq\"")
            .unwrap();
        assert_eq!(
            sqls[seq + 1],
            "ALTER TABLE \"Employees\" ADD COLUMN \"Crc32\" integer NOT NULL DEFAULT nextval('\"Employees_Crc32_seq\"')"
        );
        assert_eq!(
            sqls[seq + 2],
            "ALTER SEQUENCE \"Employees_Crc32_seq\" OWNED BY \"Employees\".\"Crc32\""
        );
    }

    #[test]
    fn test_referenced_entity_compiles_first() {
        let cmds = compile("Departments");
        let emp = cmds
            .iter()
            .position(|c| c.sql.contains("CREATE TABLE IF NOT EXISTS \"Employees\""))
            .unwrap();
        let dept = cmds
            .iter()
            .position(|c| c.sql.contains("CREATE TABLE IF NOT EXISTS \"Departments\""))
            .unwrap();
        assert!(emp < dept);
    }

    #[test]
    fn test_length_limit_is_separate_check_constraint() {
        let cmds = compile("Departments");
        let check = cmds
            .iter()
            .find(|c| c.kind == DdlKind::CheckConstraint && c.sql.contains("Code"))
            .unwrap();
        assert_eq!(
            check.sql,
            "ALTER TABLE IF EXISTS \"Departments\" ADD CONSTRAINT \"Departments_Code_check_length\" CHECK (char_length(\"Code\") <= 50) NOT VALID"
        );
    }

    #[test]
    fn test_indexes_and_uniques_after_columns() {
        let cmds = compile("Departments");
        let kinds: Vec<DdlKind> = cmds
            .iter()
            .filter(|c| c.sql.contains("\"Departments\""))
            .map(|c| c.kind)
            .collect();
        let idx = kinds.iter().position(|k| *k == DdlKind::CreateIndex).unwrap();
        let uk = kinds
            .iter()
            .position(|k| *k == DdlKind::CreateUniqueIndex)
            .unwrap();
        let last_col = kinds
            .iter()
            .rposition(|k| *k == DdlKind::AddColumn)
            .unwrap();
        assert!(last_col < idx);
        assert!(idx < uk);
    }

    #[test]
    fn test_unique_index_sql() {
        let cmds = compile("Departments");
        let uk = cmds
            .iter()
            .find(|c| c.kind == DdlKind::CreateUniqueIndex)
            .unwrap();
        assert_eq!(
            uk.sql,
            "CREATE UNIQUE INDEX IF NOT EXISTS \"Departments_Code_uk\" ON \"Departments\" (\"Code\")"
        );
    }

    #[test]
    fn test_foreign_keys_come_last() {
        let cmds = compile("Departments");
        let fk = cmds.iter().position(|c| c.kind == DdlKind::ForeignKey).unwrap();
        assert!(cmds[fk..].iter().all(|c| c.kind == DdlKind::ForeignKey));
        assert_eq!(
            cmds[fk].sql,
            "ALTER TABLE \"Employees\" ADD CONSTRAINT \"Employees_DepartmentId_fkey\" FOREIGN KEY (\"DepartmentId\") REFERENCES \"Departments\" (\"Id\")"
        );
    }
}
