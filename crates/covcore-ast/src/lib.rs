//! Minimal statement/expression syntax tree for the covcore engine
//!
//! This is deliberately small: just enough surface (control-flow
//! statements, short-circuit/ternary expressions, spans with a synthetic
//! marker) for the branch pre-instrumenter to walk a parsed program and
//! insert sentinel assignments at every control edge.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod expr;
pub mod span;
pub mod stmt;
pub mod visitor;

pub use expr::*;
pub use span::Span;
pub use stmt::*;
pub use visitor::{Visitor, walk_expression, walk_module, walk_statement, walk_try_statement};
