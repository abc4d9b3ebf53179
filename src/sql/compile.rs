//! Schema-aware SQL compiler.
//!
//! Rewrites a loosely-cased SELECT statement into canonical, fully-qualified
//! SQL for one tenant database. Bare identifiers are resolved through the
//! [`TableDict`]; double-quoted identifiers pass through re-quoted but never
//! re-resolved. Clause keywords come out uppercase, everything the user
//! wrote inside expressions (function names, `like`, literals) keeps its
//! case. Window functions with no `OVER` adopt the statement's ORDER BY
//! into their window and suppress the outer clause.

use std::collections::HashMap;
use std::sync::Arc;

use crate::dialect::Dialect;
use crate::error::{DbError, DbResult};

use super::ast::*;
use super::dict::TableDict;
use super::parse;

/// Compiles user SQL against one database's identifier dictionary.
pub struct SqlCompiler {
    dict: TableDict,
    dialect: Arc<dyn Dialect>,
}

/// Output column shape of a (sub)query, used to resolve references against
/// derived tables.
enum Cols {
    /// Lowercase lookup name to canonical output name.
    Known(HashMap<String, String>),
    /// The query selects `*`; any column may come out of it.
    Open,
}

struct ScopeEntry {
    /// Lowercase name this source answers to (alias, or table name).
    key: String,
    /// Quoted qualifier to emit, e.g. `"Employees"` or `"sql"`.
    emit: String,
    cols: Cols,
}

#[derive(Default)]
struct Scope {
    entries: Vec<ScopeEntry>,
}

impl SqlCompiler {
    pub fn new(dict: TableDict, dialect: Arc<dyn Dialect>) -> Self {
        Self { dict, dialect }
    }

    /// Parse and compile one statement.
    pub fn parse(&self, sql: &str) -> DbResult<String> {
        let stmt = parse::parse(sql)?;
        let (compiled, _) = self.statement(&stmt)?;
        Ok(compiled)
    }

    fn statement(&self, stmt: &Statement) -> DbResult<(String, Cols)> {
        let mut scope = Scope::default();
        let mut from_sql = None;
        if let Some(source) = &stmt.from {
            from_sql = Some(self.table_source(source, &mut scope)?);
        }
        let mut join_sql = Vec::new();
        for join in &stmt.joins {
            let source = self.table_source(&join.source, &mut scope)?;
            join_sql.push((join.kind, source, &join.on));
        }

        // Compiled up front so select-list window functions can adopt it.
        let mut order_parts = Vec::new();
        for item in &stmt.order_by {
            let expr = self.expr(&item.expr, &scope, "ORDER BY")?;
            order_parts.push((expr, item.dir));
        }
        let adopted_window = if order_parts.is_empty() {
            None
        } else {
            let cols: Vec<String> = order_parts
                .iter()
                .map(|(e, dir)| {
                    format!(
                        "{} {}",
                        e,
                        match dir.unwrap_or(Dir::Asc) {
                            Dir::Asc => "ASC",
                            Dir::Desc => "DESC",
                        }
                    )
                })
                .collect();
            Some(format!("OVER (ORDER BY {})", cols.join(", ")))
        };

        let mut suppress_order = false;
        let mut items = Vec::new();
        let mut out_cols = Some(HashMap::new());
        for item in &stmt.items {
            let compiled = match &item.expr {
                Expr::Func {
                    name,
                    args,
                    star,
                    over: None,
                } if self.dialect.is_window_function(name) => {
                    let call = self.func_body(name, args, *star, &scope, "SELECT")?;
                    match &adopted_window {
                        Some(window) => {
                            suppress_order = true;
                            format!("{} {}", call, window)
                        }
                        // No ORDER BY to adopt; an empty window is still valid.
                        None => format!("{} OVER ()", call),
                    }
                }
                expr => self.expr(expr, &scope, "SELECT")?,
            };
            match (&item.alias, &item.expr) {
                (Some(alias), _) => {
                    if let Some(cols) = out_cols.as_mut() {
                        cols.insert(alias.text().to_lowercase(), alias.text().to_string());
                    }
                    items.push(format!("{} AS {}", compiled, self.quote(alias.text())));
                }
                (None, Expr::Star) => {
                    out_cols = None;
                    items.push(compiled);
                }
                (None, Expr::Column { column, .. }) => {
                    if let Some(cols) = out_cols.as_mut() {
                        let canonical = compiled
                            .rsplit('.')
                            .next()
                            .unwrap_or(&compiled)
                            .trim_matches('"')
                            .to_string();
                        cols.insert(column.text().to_lowercase(), canonical);
                    }
                    items.push(compiled);
                }
                (None, _) => items.push(compiled),
            }
        }

        let mut sql = String::from("SELECT ");
        if stmt.distinct {
            sql.push_str("DISTINCT ");
        }
        sql.push_str(&items.join(", "));
        if let Some(from) = from_sql {
            sql.push_str(" FROM ");
            sql.push_str(&from);
        }
        for (kind, source, on) in join_sql {
            let kw = match kind {
                JoinKind::Inner => "INNER JOIN",
                JoinKind::Left => "LEFT JOIN",
                JoinKind::Right => "RIGHT JOIN",
            };
            let on = self.expr(on, &scope, "JOIN")?;
            sql.push_str(&format!(" {} {} ON {}", kw, source, on));
        }
        if let Some(w) = &stmt.where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(&self.expr(w, &scope, "WHERE")?);
        }
        if !stmt.group_by.is_empty() {
            let parts: DbResult<Vec<String>> = stmt
                .group_by
                .iter()
                .map(|e| self.expr(e, &scope, "GROUP BY"))
                .collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&parts?.join(", "));
        }
        if let Some(h) = &stmt.having {
            sql.push_str(" HAVING ");
            sql.push_str(&self.expr(h, &scope, "HAVING")?);
        }
        if !order_parts.is_empty() && !suppress_order {
            let parts: Vec<String> = order_parts
                .iter()
                .map(|(e, dir)| match dir {
                    Some(Dir::Asc) => format!("{} ASC", e),
                    Some(Dir::Desc) => format!("{} DESC", e),
                    None => e.clone(),
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&parts.join(", "));
        }
        if let Some(limit) = &stmt.limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&self.expr(limit, &scope, "LIMIT")?);
        }
        if let Some(offset) = &stmt.offset {
            sql.push_str(" OFFSET ");
            sql.push_str(&self.expr(offset, &scope, "OFFSET")?);
        }

        let cols = match out_cols {
            Some(map) => Cols::Known(map),
            None => Cols::Open,
        };
        Ok((sql, cols))
    }

    /// Compile a FROM/JOIN source, pushing its scope entry.
    fn table_source(&self, source: &TableSource, scope: &mut Scope) -> DbResult<String> {
        match source {
            TableSource::Table { name, alias } => {
                let (emit_name, cols) = if name.is_quoted() {
                    // Quoted tables bypass the dictionary entirely.
                    (name.text().to_string(), Cols::Open)
                } else {
                    let entry = self.dict.table(name.text()).ok_or_else(|| {
                        DbError::compile(name.text(), "FROM", "unknown table")
                    })?;
                    (entry.name.clone(), Cols::Known(entry.columns.clone()))
                };
                let mut sql = self.quote(&emit_name);
                let (key, emit) = match alias {
                    Some(a) => {
                        sql.push_str(" AS ");
                        sql.push_str(&self.quote(a.text()));
                        (a.text().to_lowercase(), self.quote(a.text()))
                    }
                    None => (name.text().to_lowercase(), self.quote(&emit_name)),
                };
                scope.entries.push(ScopeEntry { key, emit, cols });
                Ok(sql)
            }
            TableSource::Derived { stmt, alias } => {
                let (inner, cols) = self.statement(stmt)?;
                let sql = format!("({}) AS {}", inner, self.quote(alias.text()));
                scope.entries.push(ScopeEntry {
                    key: alias.text().to_lowercase(),
                    emit: self.quote(alias.text()),
                    cols,
                });
                Ok(sql)
            }
        }
    }

    fn expr(&self, expr: &Expr, scope: &Scope, clause: &'static str) -> DbResult<String> {
        match expr {
            Expr::Star => Ok("*".to_string()),
            Expr::Num(n) => Ok(n.clone()),
            Expr::Str(s) => Ok(s.clone()),
            Expr::Param(n) => Ok(format!("${}", n)),
            Expr::Keyword(k) => Ok(k.to_uppercase()),
            Expr::Column { table, column } => self.column(table.as_ref(), column, scope, clause),
            Expr::Func {
                name,
                args,
                star,
                over,
            } => {
                let mut sql = self.func_body(name, args, *star, scope, clause)?;
                if let Some(window) = over {
                    sql.push(' ');
                    sql.push_str(&self.window(window, scope, clause)?);
                }
                Ok(sql)
            }
            Expr::Unary { op, expr } => {
                let inner = self.expr(expr, scope, clause)?;
                if op.chars().all(|c| c.is_alphabetic()) {
                    Ok(format!("{} {}", op.to_uppercase(), inner))
                } else {
                    Ok(format!("{}{}", op, inner))
                }
            }
            Expr::Bin { op, lhs, rhs } => {
                let lhs = self.expr(lhs, scope, clause)?;
                let rhs = self.expr(rhs, scope, clause)?;
                Ok(format!("{} {} {}", lhs, op, rhs))
            }
            Expr::List(items) => {
                let parts: DbResult<Vec<String>> =
                    items.iter().map(|e| self.expr(e, scope, clause)).collect();
                Ok(format!("({})", parts?.join(", ")))
            }
            Expr::Paren(inner) => Ok(format!("({})", self.expr(inner, scope, clause)?)),
            Expr::IsNull { expr, negated } => {
                let inner = self.expr(expr, scope, clause)?;
                Ok(if *negated {
                    format!("{} IS NOT NULL", inner)
                } else {
                    format!("{} IS NULL", inner)
                })
            }
        }
    }

    /// Function call without its window part. Vendor-neutral names are
    /// rewritten through the dialect; window function names are uppercased;
    /// everything else is emitted as written.
    fn func_body(
        &self,
        name: &str,
        args: &[Expr],
        star: bool,
        scope: &Scope,
        clause: &'static str,
    ) -> DbResult<String> {
        let compiled: DbResult<Vec<String>> =
            args.iter().map(|a| self.expr(a, scope, clause)).collect();
        let compiled = compiled?;
        if star {
            return Ok(format!("{}(*)", name));
        }
        if let Some(rewritten) = self.dialect.rewrite_function(name, &compiled) {
            return Ok(rewritten);
        }
        let emit_name = if self.dialect.is_window_function(name) {
            name.to_uppercase()
        } else {
            name.to_string()
        };
        Ok(format!("{}({})", emit_name, compiled.join(", ")))
    }

    fn window(&self, window: &Window, scope: &Scope, clause: &'static str) -> DbResult<String> {
        let mut parts = Vec::new();
        if !window.partition_by.is_empty() {
            let cols: DbResult<Vec<String>> = window
                .partition_by
                .iter()
                .map(|e| self.expr(e, scope, clause))
                .collect();
            parts.push(format!("PARTITION BY {}", cols?.join(", ")));
        }
        if !window.order_by.is_empty() {
            let cols: DbResult<Vec<String>> = window
                .order_by
                .iter()
                .map(|item| {
                    let e = self.expr(&item.expr, scope, clause)?;
                    Ok(format!(
                        "{} {}",
                        e,
                        match item.dir.unwrap_or(Dir::Asc) {
                            Dir::Asc => "ASC",
                            Dir::Desc => "DESC",
                        }
                    ))
                })
                .collect();
            parts.push(format!("ORDER BY {}", cols?.join(", ")));
        }
        Ok(format!("OVER ({})", parts.join(" ")))
    }

    fn column(
        &self,
        table: Option<&Name>,
        column: &Name,
        scope: &Scope,
        clause: &'static str,
    ) -> DbResult<String> {
        if let Some(table) = table {
            let entry = scope
                .entries
                .iter()
                .find(|e| e.key == table.text().to_lowercase());
            let qualifier = match (&entry, table.is_quoted()) {
                (Some(e), false) => e.emit.clone(),
                // A quoted qualifier is taken at face value.
                (_, true) => self.quote(table.text()),
                (None, false) => {
                    return Err(DbError::compile(
                        table.text(),
                        clause,
                        "unknown table or alias",
                    ))
                }
            };
            let col = if column.is_quoted() {
                self.quote(column.text())
            } else {
                match entry.map(|e| &e.cols) {
                    Some(Cols::Known(cols)) => {
                        let canonical =
                            cols.get(&column.text().to_lowercase()).ok_or_else(|| {
                                DbError::compile(
                                    format!("{}.{}", table.text(), column.text()),
                                    clause,
                                    "unknown column",
                                )
                            })?;
                        self.quote(canonical)
                    }
                    _ => self.quote(column.text()),
                }
            };
            return Ok(format!("{}.{}", qualifier, col));
        }

        if column.is_quoted() {
            return Ok(self.quote(column.text()));
        }
        let lookup = column.text().to_lowercase();
        let mut matches = scope.entries.iter().filter_map(|e| match &e.cols {
            Cols::Known(cols) => cols.get(&lookup).map(|c| (e, c)),
            Cols::Open => None,
        });
        match (matches.next(), matches.next()) {
            (Some((entry, canonical)), None) => {
                Ok(format!("{}.{}", entry.emit, self.quote(canonical)))
            }
            (Some(_), Some(_)) => Err(DbError::compile(
                column.text(),
                clause,
                "ambiguous column, qualify it",
            )),
            (None, _) => {
                let mut open = scope
                    .entries
                    .iter()
                    .filter(|e| matches!(e.cols, Cols::Open));
                match (open.next(), open.next()) {
                    (Some(entry), None) => {
                        Ok(format!("{}.{}", entry.emit, self.quote(column.text())))
                    }
                    _ => Err(DbError::compile(column.text(), clause, "unknown column")),
                }
            }
        }
    }

    fn quote(&self, ident: &str) -> String {
        self.dialect.quote(ident)
    }
}
