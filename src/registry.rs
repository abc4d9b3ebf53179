//! Process-wide entity registry and caches.
//!
//! The registry is the explicit context object holding every shared cache:
//! registered definitions, resolved entity metadata, per-tenant migration
//! markers, and per-tenant SQL compilers. All maps are behind `RwLock` so
//! concurrent callers need no external locking; entries are immutable once
//! written, and racing first-writers converge because values are derived
//! deterministically from the same definitions.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use crate::entity::{
    fk_directive, DeclaredFk, EntityDef, EntityField, EntityType, FieldDef, FieldType, RefEdge,
};
use crate::error::{DbError, DbResult};
use crate::sql::SqlCompiler;

/// Registry of entity definitions and derived caches.
#[derive(Default)]
pub struct Registry {
    defs: RwLock<HashMap<String, EntityDef>>,
    resolved: RwLock<HashMap<String, Arc<EntityType>>>,
    migrated: RwLock<HashSet<(String, String)>>,
    compilers: RwLock<HashMap<String, Arc<SqlCompiler>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one entity definition. Additive and idempotent: registering
    /// the identical definition again is a no-op; a conflicting definition
    /// under the same name is rejected.
    pub fn register(&self, def: EntityDef) -> DbResult<()> {
        if def.name.trim().is_empty() {
            return Err(DbError::InvalidEntity(
                "entity definition must have a name".into(),
            ));
        }
        if def.fields.is_empty() && def.embeds.is_empty() {
            return Err(DbError::InvalidEntity(format!(
                "entity '{}' has no fields",
                def.name
            )));
        }
        let mut defs = self.defs.write().unwrap();
        match defs.get(&def.name) {
            Some(existing) if *existing == def => Ok(()),
            Some(_) => Err(DbError::InvalidEntity(format!(
                "entity '{}' is already registered with a different definition",
                def.name
            ))),
            None => {
                defs.insert(def.name.clone(), def);
                Ok(())
            }
        }
    }

    /// Register several definitions at once.
    pub fn register_all(&self, defs: impl IntoIterator<Item = EntityDef>) -> DbResult<()> {
        for def in defs {
            self.register(def)?;
        }
        Ok(())
    }

    /// Names of all registered entities, sorted for deterministic iteration.
    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.defs.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.defs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve an entity definition into its metadata. Resolution is a pure
    /// function of the registered definitions; the result is cached so two
    /// requests for the same entity return the identical `Arc` instance.
    pub fn resolve(&self, name: &str) -> DbResult<Arc<EntityType>> {
        if let Some(found) = self.resolved.read().unwrap().get(name) {
            return Ok(found.clone());
        }
        let defs = self.defs.read().unwrap().clone();
        let mut stack = Vec::new();
        self.build(name, &defs, &mut stack)
    }

    fn build(
        &self,
        name: &str,
        defs: &HashMap<String, EntityDef>,
        stack: &mut Vec<String>,
    ) -> DbResult<Arc<EntityType>> {
        let def = lookup(defs, name).ok_or_else(|| {
            DbError::InvalidEntity(format!("entity '{}' is not registered", name))
        })?;
        if let Some(found) = self.resolved.read().unwrap().get(&def.name) {
            return Ok(found.clone());
        }
        if stack.iter().any(|n| n.eq_ignore_ascii_case(&def.name)) {
            return Err(DbError::schema(
                &def.name,
                "",
                "",
                format!("reference cycle detected: {} -> {}", stack.join(" -> "), def.name),
            ));
        }
        stack.push(def.name.clone());
        let result = self.build_unguarded(def, defs, stack);
        stack.pop();
        let entity = result?;
        self.resolved
            .write()
            .unwrap()
            .entry(def.name.clone())
            .or_insert_with(|| entity.clone());
        // Re-read so concurrent first-writers converge on one instance.
        Ok(self.resolved.read().unwrap()[&def.name].clone())
    }

    fn build_unguarded(
        &self,
        def: &EntityDef,
        defs: &HashMap<String, EntityDef>,
        stack: &mut Vec<String>,
    ) -> DbResult<Arc<EntityType>> {
        let mut embed_trail = Vec::new();
        let flat = flatten(def, defs, &mut embed_trail)?;

        let mut fields = Vec::new();
        let mut declared_fks = Vec::new();
        let mut ref_defs = Vec::new();
        for fd in &flat {
            match &fd.typ {
                FieldType::Scalar(scalar) => {
                    let field = EntityField::from_def(&def.name, fd, *scalar)?;
                    if let Some(fk) = &field.foreign_key {
                        if fk.contains('.') {
                            declared_fks.push(declared_fk(&def.name, fd, fk, defs)?);
                        }
                        // A dotless fk on a scalar field is metadata only;
                        // no edge can be derived from it.
                    }
                    fields.push(field);
                }
                FieldType::Ref(remote) | FieldType::RefList(remote) => {
                    ref_defs.push((fd.clone(), remote.clone()));
                }
            }
        }
        if fields.is_empty() {
            return Err(DbError::InvalidEntity(format!(
                "entity '{}' has no column-mapped fields",
                def.name
            )));
        }

        let mut refs = Vec::new();
        for (fd, remote_name) in ref_defs {
            let remote = self.build(&remote_name, defs, stack)?;
            let payload = fk_directive(&fd.tag).ok_or_else(|| {
                DbError::schema(
                    &def.name,
                    &fd.name,
                    &fd.tag,
                    "reference field requires a fk directive",
                )
            })?;
            let mut remote_fields = Vec::new();
            for part in payload.split(',') {
                // Accept both `fk:Field` and `fk(Entity.Field)` spellings.
                let field_name = part.trim().rsplit('.').next().unwrap_or("").trim();
                let found = remote.field_by_name(field_name).ok_or_else(|| {
                    DbError::schema(
                        &def.name,
                        &fd.name,
                        &fd.tag,
                        format!(
                            "invalid foreign key: field '{}' does not exist on entity '{}'",
                            field_name, remote.table_name
                        ),
                    )
                })?;
                remote_fields.push(found.name.clone());
            }
            refs.push(RefEdge {
                entity: remote,
                remote_fields,
            });
        }

        Ok(Arc::new(EntityType {
            table_name: def.name.clone(),
            fields,
            refs,
            declared_fks,
        }))
    }

    /// Whether `(tenant, entity)` has already been migrated in this process.
    pub fn is_migrated(&self, tenant: &str, entity: &str) -> bool {
        self.migrated
            .read()
            .unwrap()
            .contains(&(tenant.to_string(), entity.to_string()))
    }

    pub fn mark_migrated(&self, tenant: &str, entity: &str) {
        self.migrated
            .write()
            .unwrap()
            .insert((tenant.to_string(), entity.to_string()));
    }

    pub(crate) fn compiler_for(&self, tenant: &str) -> Option<Arc<SqlCompiler>> {
        self.compilers.read().unwrap().get(tenant).cloned()
    }

    pub(crate) fn cache_compiler(&self, tenant: &str, compiler: Arc<SqlCompiler>) -> Arc<SqlCompiler> {
        let mut compilers = self.compilers.write().unwrap();
        compilers
            .entry(tenant.to_string())
            .or_insert(compiler)
            .clone()
    }
}

fn lookup<'a>(defs: &'a HashMap<String, EntityDef>, name: &str) -> Option<&'a EntityDef> {
    defs.get(name)
        .or_else(|| defs.values().find(|d| d.name.eq_ignore_ascii_case(name)))
}

/// Flatten a definition's fields, pulling embedded definitions in after the
/// explicit fields. Explicit fields win over embedded ones of the same name.
fn flatten(
    def: &EntityDef,
    defs: &HashMap<String, EntityDef>,
    trail: &mut Vec<String>,
) -> DbResult<Vec<FieldDef>> {
    let mut out = def.fields.clone();
    let mut seen: HashSet<String> = out.iter().map(|f| f.name.to_ascii_lowercase()).collect();
    for embed in &def.embeds {
        let embedded = lookup(defs, embed).ok_or_else(|| {
            DbError::schema(
                &def.name,
                embed,
                "",
                format!("embedded entity '{}' is not registered", embed),
            )
        })?;
        if trail.iter().any(|n| n.eq_ignore_ascii_case(embed)) {
            return Err(DbError::schema(
                &def.name,
                embed,
                "",
                "embedded definitions form a cycle",
            ));
        }
        trail.push(embed.clone());
        let inner = flatten(embedded, defs, trail)?;
        trail.pop();
        for field in inner {
            if seen.insert(field.name.to_ascii_lowercase()) {
                out.push(field);
            }
        }
    }
    Ok(out)
}

/// Validate a `fk(Entity.Field)` directive on a scalar field and derive the
/// outgoing edge. The named field must exist on the target; the edge always
/// points at the target's primary key.
fn declared_fk(
    entity: &str,
    field: &FieldDef,
    payload: &str,
    defs: &HashMap<String, EntityDef>,
) -> DbResult<DeclaredFk> {
    let (target_name, target_field) = payload
        .split_once('.')
        .ok_or_else(|| DbError::schema(entity, &field.name, &field.tag, "malformed fk directive"))?;
    let target = lookup(defs, target_name).ok_or_else(|| {
        DbError::schema(
            entity,
            &field.name,
            &field.tag,
            format!("invalid foreign key: entity '{}' is not registered", target_name),
        )
    })?;
    let mut trail = Vec::new();
    let flat = flatten(target, defs, &mut trail)?;
    if !flat
        .iter()
        .any(|f| f.name.eq_ignore_ascii_case(target_field.trim()))
    {
        return Err(DbError::schema(
            entity,
            &field.name,
            &field.tag,
            format!(
                "invalid foreign key: field '{}' does not exist on entity '{}'",
                target_field, target.name
            ),
        ));
    }
    let to_fields: Vec<String> = flat
        .iter()
        .filter_map(|f| match &f.typ {
            FieldType::Scalar(scalar) => {
                let ef = EntityField::from_def(&target.name, f, *scalar).ok()?;
                ef.primary_key.then(|| ef.name)
            }
            _ => None,
        })
        .collect();
    if to_fields.is_empty() {
        return Err(DbError::schema(
            entity,
            &field.name,
            &field.tag,
            format!("entity '{}' has no primary key to reference", target.name),
        ));
    }
    Ok(DeclaredFk {
        from_fields: vec![field.name.clone()],
        to_table: target.name.clone(),
        to_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::ScalarType;

    fn fixtures() -> Registry {
        let registry = Registry::new();
        registry
            .register_all([
                EntityDef::new("BaseInfo")
                    .field("CreatedOn", ScalarType::Timestamp, "df:now();idx")
                    .field("CreatedBy", ScalarType::Text, "nvarchar(50);idx")
                    .nullable("UpdatedOn", ScalarType::Timestamp, "idx")
                    .nullable("UpdatedBy", ScalarType::Text, "idx")
                    .nullable("Description", ScalarType::Text, ""),
                EntityDef::new("Departments")
                    .has_many("Emps", "Employees", "fk:DepartmentId")
                    .field("Id", ScalarType::Int, "pk;df:auto")
                    .field("Code", ScalarType::Text, "nvarchar(50);unique")
                    .field("Name", ScalarType::Text, "nvarchar(50);idx")
                    .nullable("ManagerId", ScalarType::Int, "fk(Employees.EmployeeId)")
                    .nullable("ParentId", ScalarType::Int, "fk(Departments.Id)"),
                EntityDef::new("Employees")
                    .embed("BaseInfo")
                    .field("EmployeeId", ScalarType::Int, "pk;df:auto")
                    .field("Code", ScalarType::Text, "nvarchar(50);unique")
                    .field("Title", ScalarType::Text, "nvarchar(50)")
                    .field("BasicSalary", ScalarType::Decimal, "")
                    .nullable("DepartmentId", ScalarType::Int, "foreignkey(Departments.Id)")
                    .field("Crc32", ScalarType::Int, "auto")
                    .has_many("WorkingDays", "WorkingDays", "fk:EmployeeId"),
                EntityDef::new("WorkingDays")
                    .field("Id", ScalarType::Int, "pk;df:auto")
                    .field("Day", ScalarType::Text, "nvarchar(50)")
                    .field("StartTime", ScalarType::Timestamp, "")
                    .field("EndTime", ScalarType::Timestamp, "")
                    .field("EmployeeId", ScalarType::Int, "foreignkey(Employees.EmployeeId)"),
            ])
            .unwrap();
        registry
    }

    #[test]
    fn test_resolve_flattens_embeds_in_order() {
        let registry = fixtures();
        let emp = registry.resolve("Employees").unwrap();
        let names: Vec<&str> = emp.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "EmployeeId",
                "Code",
                "Title",
                "BasicSalary",
                "DepartmentId",
                "Crc32",
                "CreatedOn",
                "CreatedBy",
                "UpdatedOn",
                "UpdatedBy",
                "Description",
            ]
        );
    }

    #[test]
    fn test_explicit_field_wins_over_embedded() {
        let registry = Registry::new();
        registry
            .register_all([
                EntityDef::new("Base")
                    .field("Code", ScalarType::Text, "nvarchar(10)")
                    .field("Extra", ScalarType::Int, ""),
                EntityDef::new("Owner")
                    .embed("Base")
                    .field("Id", ScalarType::Int, "pk")
                    .field("Code", ScalarType::Text, "nvarchar(99)"),
            ])
            .unwrap();
        let owner = registry.resolve("Owner").unwrap();
        let code = owner.field_by_name("Code").unwrap();
        assert_eq!(code.max_len, 99);
        assert!(owner.field_by_name("Extra").is_some());
    }

    #[test]
    fn test_resolution_is_cached_and_identical() {
        let registry = fixtures();
        let a = registry.resolve("Employees").unwrap();
        let b = registry.resolve("Employees").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        // Nested resolution shares the same instance too.
        let dept = registry.resolve("Departments").unwrap();
        assert!(Arc::ptr_eq(&dept.refs[0].entity, &a));
    }

    #[test]
    fn test_bad_fk_target_field_fails() {
        let registry = Registry::new();
        registry
            .register_all([
                EntityDef::new("Child").field("Id", ScalarType::Int, "pk"),
                EntityDef::new("Parent")
                    .field("Id", ScalarType::Int, "pk")
                    .has_many("Children", "Child", "fk:ParentId"),
            ])
            .unwrap();
        let err = registry.resolve("Parent").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("ParentId"), "{}", msg);
        assert!(msg.contains("Child"), "{}", msg);
    }

    #[test]
    fn test_ref_without_fk_directive_fails() {
        let registry = Registry::new();
        registry
            .register_all([
                EntityDef::new("Child").field("Id", ScalarType::Int, "pk"),
                EntityDef::new("Parent")
                    .field("Id", ScalarType::Int, "pk")
                    .has_many("Children", "Child", ""),
            ])
            .unwrap();
        assert!(registry.resolve("Parent").is_err());
    }

    #[test]
    fn test_reference_cycle_is_detected() {
        let registry = Registry::new();
        registry
            .register_all([
                EntityDef::new("A")
                    .field("Id", ScalarType::Int, "pk")
                    .field("BId", ScalarType::Int, "")
                    .has_many("Bs", "B", "fk:AId"),
                EntityDef::new("B")
                    .field("Id", ScalarType::Int, "pk")
                    .field("AId", ScalarType::Int, "")
                    .has_many("As", "A", "fk:BId"),
            ])
            .unwrap();
        let err = registry.resolve("A").unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_register_twice_is_idempotent() {
        let registry = Registry::new();
        let def = EntityDef::new("Things").field("Id", ScalarType::Int, "pk");
        registry.register(def.clone()).unwrap();
        registry.register(def).unwrap();
        assert_eq!(registry.len(), 1);
        let conflicting = EntityDef::new("Things").field("Id", ScalarType::BigInt, "pk");
        assert!(registry.register(conflicting).is_err());
    }

    #[test]
    fn test_unregistered_entity_is_invalid() {
        let registry = Registry::new();
        assert!(matches!(
            registry.resolve("Nope"),
            Err(DbError::InvalidEntity(_))
        ));
    }

    #[test]
    fn test_foreign_key_edges() {
        let registry = fixtures();
        let dept = registry.resolve("Departments").unwrap();
        let edges = dept.foreign_key_edges();
        // One collection edge (Employees.DepartmentId -> Departments.Id) and
        // two declared edges (ManagerId, ParentId).
        assert_eq!(edges.len(), 3);
        let collection = &edges[0];
        assert_eq!(collection.from_table, "Employees");
        assert_eq!(collection.from_fields, vec!["DepartmentId"]);
        assert_eq!(collection.to_table, "Departments");
        assert_eq!(collection.to_fields, vec!["Id"]);
        let manager = edges.iter().find(|e| e.from_fields == ["ManagerId"]).unwrap();
        assert_eq!(manager.to_table, "Employees");
        assert_eq!(manager.to_fields, vec!["EmployeeId"]);
    }

    #[test]
    fn test_self_reference_via_declared_fk() {
        let registry = fixtures();
        let dept = registry.resolve("Departments").unwrap();
        let parent = dept
            .declared_fks
            .iter()
            .find(|fk| fk.from_fields == ["ParentId"])
            .unwrap();
        assert_eq!(parent.to_table, "Departments");
        assert_eq!(parent.to_fields, vec!["Id"]);
    }

    #[test]
    fn test_migration_markers() {
        let registry = fixtures();
        assert!(!registry.is_migrated("t1", "Employees"));
        registry.mark_migrated("t1", "Employees");
        assert!(registry.is_migrated("t1", "Employees"));
        assert!(!registry.is_migrated("t2", "Employees"));
    }
}
