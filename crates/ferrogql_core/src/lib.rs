//! Core types for ferrogql.
//!
//! This crate provides foundational types used throughout ferrogql:
//! - `span`: Source spans and line/column locations
//! - `error`: The GraphQL-shaped error carried by every result

pub mod error;
pub mod span;

pub use error::{ErrorCode, FormattedError, PathSegment};
pub use span::{LineIndex, Location, Span};
