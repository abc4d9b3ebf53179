//! Recursive-descent parser for the supported SELECT dialect.
//!
//! Works over the token stream from [`super::tokens`]. Grammar, loosest to
//! tightest binding: OR, AND, NOT, comparison (`=` `!=` `<>` `<` `>` `<=`
//! `>=` `like` `ilike` `in` `is [not] null`), additive (`+` `-` `||`),
//! multiplicative (`*` `/` `%`), unary sign, primary. Select items accept
//! both `expr AS alias` and the implicit `expr alias` form.

use super::ast::*;
use super::tokens::{tokenize, Tok, Token};
use crate::error::{DbError, DbResult};

/// Reserved words that terminate an implicit select-item alias.
const RESERVED: &[&str] = &[
    "select", "distinct", "from", "where", "group", "having", "order", "by", "limit", "offset",
    "as", "and", "or", "not", "like", "ilike", "in", "is", "null", "asc", "desc", "join", "inner",
    "left", "right", "outer", "on", "over", "partition", "true", "false", "between", "union",
];

/// Parse one SELECT statement; trailing `;` is allowed, anything else after
/// the statement is a syntax error.
pub fn parse(input: &str) -> DbResult<Statement> {
    let tokens = tokenize(input)?;
    let mut cur = Cursor {
        toks: &tokens,
        i: 0,
        end: input.len(),
    };
    let stmt = cur.statement()?;
    cur.eat_op(";");
    if let Some(t) = cur.peek() {
        return Err(DbError::syntax(t.pos, "unexpected trailing input"));
    }
    Ok(stmt)
}

struct Cursor<'a> {
    toks: &'a [Token],
    i: usize,
    end: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.toks.get(self.i)
    }

    fn peek2(&self) -> Option<&'a Token> {
        self.toks.get(self.i + 1)
    }

    fn bump(&mut self) -> Option<&'a Token> {
        let t = self.toks.get(self.i);
        if t.is_some() {
            self.i += 1;
        }
        t
    }

    fn pos(&self) -> usize {
        self.peek().map(|t| t.pos).unwrap_or(self.end)
    }

    fn err(&self, message: impl Into<String>) -> DbError {
        DbError::syntax(self.pos(), message)
    }

    /// Consume a keyword (case-insensitive bare identifier) if present.
    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.at_kw(kw) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn at_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Some(Token { tok: Tok::Ident(s), .. }) if s.eq_ignore_ascii_case(kw))
    }

    fn expect_kw(&mut self, kw: &str) -> DbResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.err(format!("expected {}", kw.to_uppercase())))
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.i += 1;
            true
        } else {
            false
        }
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.peek(), Some(Token { tok: Tok::Op(s), .. }) if s == op)
    }

    fn expect_op(&mut self, op: &str) -> DbResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.err(format!("expected '{}'", op)))
        }
    }

    fn statement(&mut self) -> DbResult<Statement> {
        self.expect_kw("select")?;
        let distinct = self.eat_kw("distinct");
        let mut items = vec![self.select_item()?];
        while self.eat_op(",") {
            items.push(self.select_item()?);
        }
        let mut stmt = Statement {
            distinct,
            items,
            ..Statement::default()
        };
        if self.eat_kw("from") {
            stmt.from = Some(self.table_source()?);
            while let Some(kind) = self.join_kind()? {
                let source = self.table_source()?;
                self.expect_kw("on")?;
                let on = self.expr()?;
                stmt.joins.push(Join { kind, source, on });
            }
        }
        if self.eat_kw("where") {
            stmt.where_clause = Some(self.expr()?);
        }
        if self.eat_kw("group") {
            self.expect_kw("by")?;
            stmt.group_by.push(self.expr()?);
            while self.eat_op(",") {
                stmt.group_by.push(self.expr()?);
            }
        }
        if self.eat_kw("having") {
            stmt.having = Some(self.expr()?);
        }
        if self.eat_kw("order") {
            self.expect_kw("by")?;
            stmt.order_by.push(self.order_item()?);
            while self.eat_op(",") {
                stmt.order_by.push(self.order_item()?);
            }
        }
        if self.eat_kw("limit") {
            stmt.limit = Some(self.expr()?);
        }
        if self.eat_kw("offset") {
            stmt.offset = Some(self.expr()?);
        }
        Ok(stmt)
    }

    fn select_item(&mut self) -> DbResult<SelectItem> {
        let expr = self.expr()?;
        let alias = if self.eat_kw("as") {
            Some(self.name().ok_or_else(|| self.err("expected alias after AS"))?)
        } else if matches!(expr, Expr::Star) {
            None
        } else {
            self.implicit_alias()
        };
        Ok(SelectItem { expr, alias })
    }

    /// A bare identifier directly after an expression acts as its alias,
    /// unless it is a reserved word.
    fn implicit_alias(&mut self) -> Option<Name> {
        match self.peek().map(|t| &t.tok) {
            Some(Tok::Ident(s)) if !RESERVED.iter().any(|k| s.eq_ignore_ascii_case(k)) => {
                let name = Name::Bare(s.clone());
                self.i += 1;
                Some(name)
            }
            Some(Tok::Quoted(s)) => {
                let name = Name::Quoted(s.clone());
                self.i += 1;
                Some(name)
            }
            _ => None,
        }
    }

    fn name(&mut self) -> Option<Name> {
        match self.peek().map(|t| &t.tok) {
            Some(Tok::Ident(s)) => {
                let name = Name::Bare(s.clone());
                self.i += 1;
                Some(name)
            }
            Some(Tok::Quoted(s)) => {
                let name = Name::Quoted(s.clone());
                self.i += 1;
                Some(name)
            }
            _ => None,
        }
    }

    fn table_source(&mut self) -> DbResult<TableSource> {
        if self.eat_op("(") {
            let stmt = self.statement()?;
            self.expect_op(")")?;
            self.eat_kw("as");
            let alias = self
                .implicit_alias()
                .ok_or_else(|| self.err("derived table requires an alias"))?;
            return Ok(TableSource::Derived {
                stmt: Box::new(stmt),
                alias,
            });
        }
        let name = self.name().ok_or_else(|| self.err("expected table name"))?;
        let alias = if self.eat_kw("as") {
            Some(self.name().ok_or_else(|| self.err("expected alias after AS"))?)
        } else {
            self.implicit_alias()
        };
        Ok(TableSource::Table { name, alias })
    }

    fn join_kind(&mut self) -> DbResult<Option<JoinKind>> {
        let kind = if self.at_kw("join") {
            JoinKind::Inner
        } else if self.at_kw("inner") {
            self.i += 1;
            JoinKind::Inner
        } else if self.at_kw("left") {
            self.i += 1;
            self.eat_kw("outer");
            JoinKind::Left
        } else if self.at_kw("right") {
            self.i += 1;
            self.eat_kw("outer");
            JoinKind::Right
        } else {
            return Ok(None);
        };
        self.expect_kw("join")?;
        Ok(Some(kind))
    }

    fn order_item(&mut self) -> DbResult<OrderItem> {
        let expr = self.expr()?;
        let dir = if self.eat_kw("asc") {
            Some(Dir::Asc)
        } else if self.eat_kw("desc") {
            Some(Dir::Desc)
        } else {
            None
        };
        Ok(OrderItem { expr, dir })
    }

    fn expr(&mut self) -> DbResult<Expr> {
        self.or_expr()
    }

    fn or_expr(&mut self) -> DbResult<Expr> {
        let mut lhs = self.and_expr()?;
        while self.at_kw("or") {
            let op = self.ident_text();
            let rhs = self.and_expr()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> DbResult<Expr> {
        let mut lhs = self.not_expr()?;
        while self.at_kw("and") {
            let op = self.ident_text();
            let rhs = self.not_expr()?;
            lhs = bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn not_expr(&mut self) -> DbResult<Expr> {
        if self.at_kw("not") {
            let op = self.ident_text();
            let expr = self.not_expr()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        self.cmp_expr()
    }

    fn cmp_expr(&mut self) -> DbResult<Expr> {
        let lhs = self.add_expr()?;
        for op in ["<=", ">=", "!=", "<>", "=", "<", ">"] {
            if self.at_op(op) {
                self.i += 1;
                let rhs = self.add_expr()?;
                return Ok(bin(op.to_string(), lhs, rhs));
            }
        }
        if self.at_kw("like") || self.at_kw("ilike") {
            let op = self.ident_text();
            let rhs = self.add_expr()?;
            return Ok(bin(op, lhs, rhs));
        }
        if self.at_kw("in") {
            let op = self.ident_text();
            self.expect_op("(")?;
            let mut list = vec![self.expr()?];
            while self.eat_op(",") {
                list.push(self.expr()?);
            }
            self.expect_op(")")?;
            return Ok(bin(op, lhs, Expr::List(list)));
        }
        if self.at_kw("between") {
            // Nested as `lhs between (low and high)` so both keywords keep
            // their written case on the way out.
            let op = self.ident_text();
            let low = self.add_expr()?;
            if !self.at_kw("and") {
                return Err(self.err("expected AND in BETWEEN"));
            }
            let and = self.ident_text();
            let high = self.add_expr()?;
            return Ok(bin(op, lhs, bin(and, low, high)));
        }
        if self.eat_kw("is") {
            let negated = self.eat_kw("not");
            self.expect_kw("null")?;
            return Ok(Expr::IsNull {
                expr: Box::new(lhs),
                negated,
            });
        }
        Ok(lhs)
    }

    fn add_expr(&mut self) -> DbResult<Expr> {
        let mut lhs = self.mul_expr()?;
        loop {
            let op = if self.at_op("+") {
                "+"
            } else if self.at_op("-") {
                "-"
            } else if self.at_op("||") {
                "||"
            } else {
                break;
            };
            self.i += 1;
            let rhs = self.mul_expr()?;
            lhs = bin(op.to_string(), lhs, rhs);
        }
        Ok(lhs)
    }

    fn mul_expr(&mut self) -> DbResult<Expr> {
        let mut lhs = self.unary_expr()?;
        loop {
            let op = if self.at_op("*") {
                "*"
            } else if self.at_op("/") {
                "/"
            } else if self.at_op("%") {
                "%"
            } else {
                break;
            };
            self.i += 1;
            let rhs = self.unary_expr()?;
            lhs = bin(op.to_string(), lhs, rhs);
        }
        Ok(lhs)
    }

    fn unary_expr(&mut self) -> DbResult<Expr> {
        if self.at_op("-") || self.at_op("+") {
            let op = match self.bump().map(|t| &t.tok) {
                Some(Tok::Op(s)) => s.clone(),
                _ => unreachable!(),
            };
            let expr = self.unary_expr()?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        self.primary()
    }

    fn primary(&mut self) -> DbResult<Expr> {
        match self.peek().map(|t| t.tok.clone()) {
            Some(Tok::Op(op)) if op == "(" => {
                self.i += 1;
                let inner = self.expr()?;
                self.expect_op(")")?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            Some(Tok::Op(op)) if op == "*" => {
                self.i += 1;
                Ok(Expr::Star)
            }
            Some(Tok::Num(n)) => {
                self.i += 1;
                Ok(Expr::Num(n))
            }
            Some(Tok::Str(s)) => {
                self.i += 1;
                Ok(Expr::Str(s))
            }
            Some(Tok::Param(n)) => {
                self.i += 1;
                Ok(Expr::Param(n))
            }
            Some(Tok::Ident(s)) => {
                if matches!(self.peek2(), Some(Token { tok: Tok::Op(p), .. }) if p == "(") {
                    self.i += 1;
                    return self.func_call(s);
                }
                self.i += 1;
                if s.eq_ignore_ascii_case("null")
                    || s.eq_ignore_ascii_case("true")
                    || s.eq_ignore_ascii_case("false")
                {
                    return Ok(Expr::Keyword(s));
                }
                self.maybe_qualified(Name::Bare(s))
            }
            Some(Tok::Quoted(s)) => {
                self.i += 1;
                self.maybe_qualified(Name::Quoted(s))
            }
            _ => Err(self.err("expected expression")),
        }
    }

    fn maybe_qualified(&mut self, first: Name) -> DbResult<Expr> {
        if self.eat_op(".") {
            let column = self
                .name()
                .ok_or_else(|| self.err("expected column name after '.'"))?;
            return Ok(Expr::Column {
                table: Some(first),
                column,
            });
        }
        Ok(Expr::Column {
            table: None,
            column: first,
        })
    }

    fn func_call(&mut self, name: String) -> DbResult<Expr> {
        self.expect_op("(")?;
        let mut args = Vec::new();
        let mut star = false;
        if self.eat_op("*") {
            star = true;
        } else if !self.at_op(")") {
            args.push(self.expr()?);
            while self.eat_op(",") {
                args.push(self.expr()?);
            }
        }
        self.expect_op(")")?;
        let over = if self.eat_kw("over") {
            Some(self.window()?)
        } else {
            None
        };
        Ok(Expr::Func {
            name,
            args,
            star,
            over,
        })
    }

    fn window(&mut self) -> DbResult<Window> {
        self.expect_op("(")?;
        let mut window = Window {
            partition_by: Vec::new(),
            order_by: Vec::new(),
        };
        if self.eat_kw("partition") {
            self.expect_kw("by")?;
            window.partition_by.push(self.expr()?);
            while self.eat_op(",") {
                window.partition_by.push(self.expr()?);
            }
        }
        if self.eat_kw("order") {
            self.expect_kw("by")?;
            window.order_by.push(self.order_item()?);
            while self.eat_op(",") {
                window.order_by.push(self.order_item()?);
            }
        }
        self.expect_op(")")?;
        Ok(window)
    }

    fn ident_text(&mut self) -> String {
        match self.bump().map(|t| &t.tok) {
            Some(Tok::Ident(s)) => s.clone(),
            _ => unreachable!("caller checked an identifier is next"),
        }
    }
}

fn bin(op: String, lhs: Expr, rhs: Expr) -> Expr {
    Expr::Bin {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn col(name: &str) -> Expr {
        Expr::Column {
            table: None,
            column: Name::Bare(name.into()),
        }
    }

    #[test]
    fn test_select_items_with_implicit_alias() {
        let stmt = parse("select row_number() stt,* from employees order by employeeid,createdOn")
            .unwrap();
        assert_eq!(stmt.items.len(), 2);
        assert_eq!(stmt.items[0].alias, Some(Name::Bare("stt".into())));
        assert!(matches!(stmt.items[0].expr, Expr::Func { ref name, .. } if name == "row_number"));
        assert_eq!(stmt.items[1].expr, Expr::Star);
        assert_eq!(stmt.items[1].alias, None);
        assert_eq!(stmt.order_by.len(), 2);
        assert_eq!(stmt.order_by[0].dir, None);
    }

    #[test]
    fn test_precedence_mul_before_cmp() {
        let stmt = parse("select employeeid from employees having employeeid*10>100").unwrap();
        let having = stmt.having.unwrap();
        match having {
            Expr::Bin { op, lhs, rhs } => {
                assert_eq!(op, ">");
                assert_eq!(*rhs, Expr::Num("100".into()));
                assert_eq!(
                    *lhs,
                    Expr::Bin {
                        op: "*".into(),
                        lhs: Box::new(col("employeeid")),
                        rhs: Box::new(Expr::Num("10".into())),
                    }
                );
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_like_preserved_as_written() {
        let stmt =
            parse("select * from employees where concat(firstName,' ', lastName) like '%jonny%'")
                .unwrap();
        match stmt.where_clause.unwrap() {
            Expr::Bin { op, lhs, rhs } => {
                assert_eq!(op, "like");
                assert!(matches!(*lhs, Expr::Func { ref name, .. } if name == "concat"));
                assert_eq!(*rhs, Expr::Str("'%jonny%'".into()));
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_derived_table_with_alias() {
        let stmt = parse(
            "select * from (select year(birthDate) year from employees) sql where sql.year = 1990",
        )
        .unwrap();
        match stmt.from.unwrap() {
            TableSource::Derived { stmt: inner, alias } => {
                assert_eq!(alias, Name::Bare("sql".into()));
                assert_eq!(inner.items[0].alias, Some(Name::Bare("year".into())));
            }
            other => panic!("unexpected source: {:?}", other),
        }
        match stmt.where_clause.unwrap() {
            Expr::Bin { lhs, .. } => assert_eq!(
                *lhs,
                Expr::Column {
                    table: Some(Name::Bare("sql".into())),
                    column: Name::Bare("year".into()),
                }
            ),
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_count_star_and_group_by_expr() {
        let stmt =
            parse("select year(birthDate) year,count(*) total from employees group by year(birthDate)")
                .unwrap();
        assert!(matches!(
            stmt.items[1].expr,
            Expr::Func { star: true, ref name, .. } if name == "count"
        ));
        assert_eq!(stmt.group_by.len(), 1);
    }

    #[test]
    fn test_join_on() {
        let stmt = parse(
            "select * from employees e left join departments d on e.departmentid = d.id",
        )
        .unwrap();
        assert_eq!(stmt.joins.len(), 1);
        assert_eq!(stmt.joins[0].kind, JoinKind::Left);
        match &stmt.from.unwrap() {
            TableSource::Table { alias, .. } => assert_eq!(alias, &Some(Name::Bare("e".into()))),
            other => panic!("unexpected source: {:?}", other),
        }
    }

    #[test]
    fn test_is_not_null_and_in_list() {
        let stmt = parse("select * from employees where code is not null and id in (1, 2, $1)")
            .unwrap();
        match stmt.where_clause.unwrap() {
            Expr::Bin { op, lhs, rhs } => {
                assert_eq!(op, "and");
                assert!(matches!(*lhs, Expr::IsNull { negated: true, .. }));
                match *rhs {
                    Expr::Bin { op, rhs, .. } => {
                        assert_eq!(op, "in");
                        assert!(matches!(*rhs, Expr::List(ref l) if l.len() == 3));
                    }
                    other => panic!("unexpected shape: {:?}", other),
                }
            }
            other => panic!("unexpected shape: {:?}", other),
        }
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let err = parse("select * from employees order").unwrap_err();
        assert!(err.to_string().contains("Syntax error"));
    }

    #[test]
    fn test_limit_offset() {
        let stmt = parse("select * from employees limit 10 offset 20").unwrap();
        assert_eq!(stmt.limit, Some(Expr::Num("10".into())));
        assert_eq!(stmt.offset, Some(Expr::Num("20".into())));
    }
}
