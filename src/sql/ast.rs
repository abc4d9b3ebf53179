//! Parsed form of a SELECT statement.
//!
//! The tree stores identifiers exactly as written; whether a name was
//! double-quoted matters later because quoted identifiers bypass dictionary
//! resolution. Operators and function names also keep their written case so
//! the compiler can emit them verbatim.

/// An identifier as it appeared in the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Name {
    Bare(String),
    Quoted(String),
}

impl Name {
    pub fn text(&self) -> &str {
        match self {
            Name::Bare(s) | Name::Quoted(s) => s,
        }
    }

    pub fn is_quoted(&self) -> bool {
        matches!(self, Name::Quoted(_))
    }
}

/// Sort direction. Absent means the engine default (ascending).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderItem {
    pub expr: Expr,
    pub dir: Option<Dir>,
}

/// An `OVER (...)` window specification.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub partition_by: Vec<Expr>,
    pub order_by: Vec<OrderItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// `*` in a select list or `count(*)`.
    Star,
    /// Possibly-qualified column reference.
    Column { table: Option<Name>, column: Name },
    Num(String),
    /// String literal, verbatim including quotes.
    Str(String),
    /// Positional parameter `$n`.
    Param(u32),
    /// Standalone keyword operand: NULL, TRUE, FALSE.
    Keyword(String),
    Func {
        name: String,
        args: Vec<Expr>,
        /// `count(*)` style call.
        star: bool,
        over: Option<Window>,
    },
    Unary { op: String, expr: Box<Expr> },
    /// Binary operation; `op` is kept as written (`like`, `AND`, `*`, ...).
    Bin {
        op: String,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// `IN (a, b, c)` right-hand list.
    List(Vec<Expr>),
    /// Explicitly parenthesized subexpression.
    Paren(Box<Expr>),
    /// `IS NULL` / `IS NOT NULL` postfix test.
    IsNull { expr: Box<Expr>, negated: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectItem {
    pub expr: Expr,
    /// Explicit `AS alias` or the implicit trailing-identifier form.
    pub alias: Option<Name>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub source: TableSource,
    pub on: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TableSource {
    Table {
        name: Name,
        alias: Option<Name>,
    },
    /// Parenthesized subquery; the alias is mandatory.
    Derived {
        stmt: Box<Statement>,
        alias: Name,
    },
}

/// One SELECT statement, possibly nested as a derived table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Statement {
    pub distinct: bool,
    pub items: Vec<SelectItem>,
    pub from: Option<TableSource>,
    pub joins: Vec<Join>,
    pub where_clause: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderItem>,
    pub limit: Option<Expr>,
    pub offset: Option<Expr>,
}
