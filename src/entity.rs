//! Entity metadata model.
//!
//! Entities are declared with [`EntityDef`], a plain description of a record
//! type: an ordered list of fields, each carrying a scalar type or a
//! reference to another entity, plus a directive tag controlling its schema
//! mapping. The [`crate::registry::Registry`] resolves definitions into
//! immutable [`EntityType`] metadata used by the DDL compiler.
//!
//! # Directive tag syntax
//!
//! Semicolon-separated, case-insensitive, with synonym folding:
//!
//! ```text
//! pk                  primary key (synonyms: primary, primary_key, ...)
//! auto                auto-increment / backing sequence
//! df:<value>          default value or generator (now(), uuid())
//! size:<n>            max length, enforced as a check constraint
//! nvarchar(<n>)       same as size:<n>
//! fk:<Field>          the named field on the referenced entity holds this
//!                     entity's key (collection / back-reference)
//! fk(<Entity.Field>)  this entity owns a key pointing at Entity's primary key
//! idx[:<name>]        index group (default <field>_idx)
//! uk[:<name>]         unique group (default <field>_uk)
//! ```
//!
//! Unknown directives are ignored for forward compatibility.

use sha2::{Digest, Sha256};

/// Value types that map to exactly one scalar column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Text,
    Bool,
    Timestamp,
    Decimal,
    Uuid,
}

/// The declared type of a field: a scalar column, a singular reference to
/// another entity, or a collection of another entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    Scalar(ScalarType),
    Ref(String),
    RefList(String),
}

/// One declared field of an entity definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDef {
    pub name: String,
    pub typ: FieldType,
    pub optional: bool,
    pub tag: String,
}

/// A declarative entity definition: the unit of registration.
///
/// Built once, registered process-wide, immutable afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub name: String,
    pub embeds: Vec<String>,
    pub fields: Vec<FieldDef>,
}

impl EntityDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            embeds: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Add a non-nullable scalar field. Pass an empty tag for no directives.
    pub fn field(mut self, name: impl Into<String>, typ: ScalarType, tag: impl Into<String>) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            typ: FieldType::Scalar(typ),
            optional: false,
            tag: tag.into(),
        });
        self
    }

    /// Add a nullable scalar field (the "optional" wrapper of the model).
    pub fn nullable(mut self, name: impl Into<String>, typ: ScalarType, tag: impl Into<String>) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            typ: FieldType::Scalar(typ),
            optional: true,
            tag: tag.into(),
        });
        self
    }

    /// Embed another definition anonymously; its fields are flattened into
    /// this one, with explicit fields winning on name conflicts.
    pub fn embed(mut self, entity: impl Into<String>) -> Self {
        self.embeds.push(entity.into());
        self
    }

    /// Add a singular reference to another entity.
    pub fn has_one(
        mut self,
        name: impl Into<String>,
        entity: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            typ: FieldType::Ref(entity.into()),
            optional: true,
            tag: tag.into(),
        });
        self
    }

    /// Add a collection of another entity.
    pub fn has_many(
        mut self,
        name: impl Into<String>,
        entity: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        self.fields.push(FieldDef {
            name: name.into(),
            typ: FieldType::RefList(entity.into()),
            optional: true,
            tag: tag.into(),
        });
        self
    }
}

/// Default-value directive of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefaultSpec {
    /// Auto-increment via a backing sequence.
    Auto,
    /// Literal value or named generator function (`now()`, `uuid()`).
    Value(String),
}

/// Resolved metadata for one column-mapped field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityField {
    pub name: String,
    pub scalar: ScalarType,
    pub nullable: bool,
    pub primary_key: bool,
    pub default: Option<DefaultSpec>,
    /// -1 means unbounded.
    pub max_len: i64,
    /// Raw foreign-key directive payload, when present on a scalar field.
    pub foreign_key: Option<String>,
    pub index_group: Option<String>,
    pub unique_group: Option<String>,
    /// Stable content hash of the declaration, for change detection.
    pub hash_key: String,
}

/// Parsed form of one directive token.
enum Directive<'a> {
    Plain(&'a str),
    /// `head:payload`
    Colon(&'a str, &'a str),
    /// `head(payload)`
    Paren(&'a str, &'a str),
}

/// Fold a directive head through the synonym table.
fn fold_synonym(head: &str) -> &str {
    match head {
        "primary_key" | "primarykey" | "primary" | "primary_key_constraint" => "pk",
        "foreign_key" | "foreignkey" | "foreign" | "foreign_key_constraint" => "fk",
        "unique" | "unique_key" | "uniquekey" | "unique_key_constraint" => "uk",
        "index" | "index_key" | "indexkey" | "index_constraint" => "idx",
        "vachar" | "varchar" | "varchar2" | "nvarchar" => "text",
        "length" | "len" => "size",
        "default" | "default_value" | "default_value_constraint" => "df",
        "auto_increment" | "autoincrement" | "serial" | "serial_key" | "serialkey"
        | "serial_key_constraint" => "auto",
        other => other,
    }
}

fn split_directive(token: &str) -> Directive<'_> {
    if let Some(idx) = token.find(':') {
        Directive::Colon(&token[..idx], &token[idx + 1..])
    } else if let Some(idx) = token.find('(') {
        if token.ends_with(')') {
            Directive::Paren(&token[..idx], &token[idx + 1..token.len() - 1])
        } else {
            Directive::Plain(token)
        }
    } else {
        Directive::Plain(token)
    }
}

impl EntityField {
    /// Build resolved field metadata from a scalar declaration, applying its
    /// directive tag. `entity` is only used in error messages.
    pub(crate) fn from_def(
        entity: &str,
        def: &FieldDef,
        scalar: ScalarType,
    ) -> crate::error::DbResult<Self> {
        let mut field = EntityField {
            name: def.name.clone(),
            scalar,
            nullable: def.optional,
            primary_key: false,
            default: None,
            max_len: -1,
            foreign_key: None,
            index_group: None,
            unique_group: None,
            hash_key: declaration_hash(&def.name, &def.tag),
        };

        for raw in def.tag.split(';') {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            let directive = split_directive(raw);
            let (head, payload) = match &directive {
                Directive::Plain(h) => (*h, None),
                Directive::Colon(h, p) => (*h, Some(*p)),
                Directive::Paren(h, p) => (*h, Some(*p)),
            };
            let head = head.to_ascii_lowercase();
            match (fold_synonym(&head), payload) {
                ("pk", _) => field.primary_key = true,
                ("auto", _) => field.default = Some(DefaultSpec::Auto),
                ("df", Some(v)) => {
                    // `df:auto` is an accepted spelling of `auto`.
                    field.default = Some(if v.eq_ignore_ascii_case("auto") {
                        DefaultSpec::Auto
                    } else {
                        DefaultSpec::Value(v.to_string())
                    });
                }
                ("size", Some(n)) | ("text", Some(n)) => {
                    field.max_len = n.trim().parse().map_err(|_| {
                        crate::error::DbError::schema(
                            entity,
                            &def.name,
                            raw,
                            "length directive requires an integer",
                        )
                    })?;
                }
                ("fk", Some(v)) => field.foreign_key = Some(v.to_string()),
                ("idx", payload) => {
                    field.index_group = Some(match payload {
                        Some(n) if !n.is_empty() => n.to_string(),
                        _ => format!("{}_idx", def.name),
                    });
                }
                ("uk", payload) => {
                    field.unique_group = Some(match payload {
                        Some(n) if !n.is_empty() => n.to_string(),
                        _ => format!("{}_uk", def.name),
                    });
                }
                // Unknown directives are ignored, not errors.
                _ => {}
            }
        }
        Ok(field)
    }
}

/// Extract the foreign-key directive payload from a tag, if any.
pub(crate) fn fk_directive(tag: &str) -> Option<String> {
    for raw in tag.split(';') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }
        let (head, payload) = match split_directive(raw) {
            Directive::Plain(h) => (h, None),
            Directive::Colon(h, p) => (h, Some(p)),
            Directive::Paren(h, p) => (h, Some(p)),
        };
        if fold_synonym(&head.to_ascii_lowercase()) == "fk" {
            return payload.map(str::to_string);
        }
    }
    None
}

/// Hex SHA-256 of a field declaration (name plus directive tag).
fn declaration_hash(name: &str, tag: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(b";");
    hasher.update(tag.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A resolved reference edge: the remote entity holds fields pointing back at
/// this entity's primary key.
#[derive(Debug, Clone)]
pub struct RefEdge {
    pub entity: std::sync::Arc<EntityType>,
    /// Canonical names of the remote fields holding this entity's key.
    pub remote_fields: Vec<String>,
}

/// A foreign key declared on a scalar field of this entity, pointing at
/// another entity's primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredFk {
    pub from_fields: Vec<String>,
    pub to_table: String,
    pub to_fields: Vec<String>,
}

/// A derived foreign-key edge between two tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyEdge {
    pub from_table: String,
    pub from_fields: Vec<String>,
    pub to_table: String,
    pub to_fields: Vec<String>,
}

/// Fully resolved entity metadata. Immutable once built; shared via `Arc`
/// so the resolution cache can hand out the identical instance.
#[derive(Debug)]
pub struct EntityType {
    pub table_name: String,
    /// Column-mapped fields, flattened, in declaration order.
    pub fields: Vec<EntityField>,
    /// Reference edges to entities holding keys pointing back here.
    pub refs: Vec<RefEdge>,
    /// Foreign keys declared on this entity's own scalar fields.
    pub declared_fks: Vec<DeclaredFk>,
}

impl EntityType {
    /// Case-insensitive field lookup.
    pub fn field_by_name(&self, name: &str) -> Option<&EntityField> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn primary_key(&self) -> Vec<&EntityField> {
        self.fields.iter().filter(|f| f.primary_key).collect()
    }

    pub fn non_key_fields(&self) -> Vec<&EntityField> {
        self.fields.iter().filter(|f| !f.primary_key).collect()
    }

    /// Index groups in first-declaration order; member order follows field
    /// declaration order.
    pub fn index_groups(&self) -> Vec<(String, Vec<&EntityField>)> {
        group_by(&self.fields, |f| f.index_group.as_deref())
    }

    pub fn unique_groups(&self) -> Vec<(String, Vec<&EntityField>)> {
        group_by(&self.fields, |f| f.unique_group.as_deref())
    }

    /// Derive all foreign-key edges touching this entity. Reference edges
    /// point from the remote entity at this one; declared keys point from
    /// this entity outward. `to_fields` is always the target's primary key.
    pub fn foreign_key_edges(&self) -> Vec<ForeignKeyEdge> {
        let pk: Vec<String> = self.primary_key().iter().map(|f| f.name.clone()).collect();
        let mut edges = Vec::new();
        for r in &self.refs {
            edges.push(ForeignKeyEdge {
                from_table: r.entity.table_name.clone(),
                from_fields: r.remote_fields.clone(),
                to_table: self.table_name.clone(),
                to_fields: pk.clone(),
            });
        }
        for fk in &self.declared_fks {
            edges.push(ForeignKeyEdge {
                from_table: self.table_name.clone(),
                from_fields: fk.from_fields.clone(),
                to_table: fk.to_table.clone(),
                to_fields: fk.to_fields.clone(),
            });
        }
        edges
    }
}

fn group_by<'a>(
    fields: &'a [EntityField],
    key: impl Fn(&EntityField) -> Option<&str>,
) -> Vec<(String, Vec<&'a EntityField>)> {
    let mut groups: Vec<(String, Vec<&EntityField>)> = Vec::new();
    for field in fields {
        if let Some(name) = key(field) {
            match groups.iter_mut().find(|(g, _)| g == name) {
                Some((_, members)) => members.push(field),
                None => groups.push((name.to_string(), vec![field])),
            }
        }
    }
    groups
}
