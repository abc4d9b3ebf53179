//! SQL tokenizer using nom.
//!
//! Splits raw query text into positioned tokens. Identifier and keyword case
//! is preserved here; the compiler decides what to canonicalize. String
//! literals keep their surrounding quotes so they can be emitted verbatim.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, digit1},
    combinator::{map, map_res, opt, recognize},
    sequence::{pair, preceded},
    IResult,
};

use crate::error::{DbError, DbResult};

/// Token payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tok {
    /// Bare identifier or keyword, case preserved.
    Ident(String),
    /// Double-quoted identifier, unescaped inner text.
    Quoted(String),
    /// Numeric literal, verbatim.
    Num(String),
    /// Single-quoted string literal, verbatim including quotes.
    Str(String),
    /// Positional parameter `$n`.
    Param(u32),
    /// Operator or punctuation.
    Op(String),
}

/// A token with its byte offset in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub tok: Tok,
    pub pos: usize,
}

/// Tokenize a full statement. Unrecognized characters are syntax errors
/// carrying the byte offset.
pub fn tokenize(input: &str) -> DbResult<Vec<Token>> {
    let mut rest = input;
    let mut out = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let pos = input.len() - rest.len();
        match token(rest) {
            Ok((next, tok)) => {
                out.push(Token { tok, pos });
                rest = next;
            }
            Err(_) => {
                let ch = rest.chars().next().unwrap_or('\0');
                let msg = if ch == '$' {
                    "invalid positional parameter".to_string()
                } else {
                    format!("unexpected character '{}'", ch)
                };
                return Err(DbError::syntax(pos, msg));
            }
        }
    }
    Ok(out)
}

fn token(input: &str) -> IResult<&str, Tok> {
    alt((quoted_ident, string_lit, number, param, operator, bare_ident))(input)
}

/// `"Name"` with `""` as an escaped quote.
fn quoted_ident(input: &str) -> IResult<&str, Tok> {
    delimited_escaped(input, '"').map(|(rest, inner)| (rest, Tok::Quoted(inner)))
}

/// `'text'` with `''` as an escaped quote; kept verbatim for emission.
fn string_lit(input: &str) -> IResult<&str, Tok> {
    let before = input.len();
    let (rest, _) = delimited_escaped(input, '\'')?;
    let taken = before - rest.len();
    Ok((rest, Tok::Str(input[..taken].to_string())))
}

fn delimited_escaped(input: &str, quote: char) -> IResult<&str, String> {
    let err = || nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Char));
    let mut chars = input.char_indices();
    match chars.next() {
        Some((_, c)) if c == quote => {}
        _ => return Err(err()),
    }
    let mut inner = String::new();
    let mut iter = input[quote.len_utf8()..].char_indices().peekable();
    while let Some((i, c)) = iter.next() {
        if c == quote {
            if matches!(iter.peek(), Some((_, next)) if *next == quote) {
                inner.push(quote);
                iter.next();
            } else {
                let end = quote.len_utf8() + i + quote.len_utf8();
                return Ok((&input[end..], inner));
            }
        } else {
            inner.push(c);
        }
    }
    Err(err())
}

fn number(input: &str) -> IResult<&str, Tok> {
    map(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |s: &str| Tok::Num(s.to_string()),
    )(input)
}

fn param(input: &str) -> IResult<&str, Tok> {
    map_res(preceded(char('$'), digit1), |s: &str| {
        s.parse().map(Tok::Param)
    })(input)
}

fn operator(input: &str) -> IResult<&str, Tok> {
    map(
        alt((
            tag("<="),
            tag(">="),
            tag("!="),
            tag("<>"),
            tag("||"),
            tag("("),
            tag(")"),
            tag(","),
            tag("."),
            tag("*"),
            tag("+"),
            tag("-"),
            tag("/"),
            tag("%"),
            tag("="),
            tag("<"),
            tag(">"),
            tag(";"),
        )),
        |s: &str| Tok::Op(s.to_string()),
    )(input)
}

fn bare_ident(input: &str) -> IResult<&str, Tok> {
    map(
        take_while1(|c: char| c.is_alphanumeric() || c == '_'),
        |s: &str| Tok::Ident(s.to_string()),
    )(input)
}
