//! Schema-aware SQL compilation pipeline.
//!
//! `tokens` splits raw text, `parse` builds the AST, `dict` holds the
//! identifier dictionary, and `compile` rewrites the statement into
//! canonical SQL for one tenant database.

pub mod ast;
mod compile;
pub mod dict;
pub mod parse;
pub mod tokens;

pub use compile::SqlCompiler;
pub use dict::{TableDict, TableEntry};
