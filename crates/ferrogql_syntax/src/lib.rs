//! Syntax layer for ferrogql.
//!
//! This crate provides:
//! - `token`: Token kinds and token structures
//! - `lexer`: Tokenization
//! - `ast`: Owned syntax tree for executable documents
//! - `parser`: Recursive descent parser

pub mod ast;
pub mod lexer;
pub mod parser;
pub mod token;

pub use ast::*;
pub use lexer::Lexer;
pub use parser::{parse, Parser, SyntaxError, DEFAULT_MAX_DEPTH};
pub use token::{Token, TokenKind};
