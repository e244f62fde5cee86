//! Token kinds and structures for GraphQL executable documents.

use ferrogql_core::Span;
use std::fmt;

/// The kind of a token.
///
/// Keywords are contextual in GraphQL: the parser accepts every keyword kind
/// wherever a name is expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TokenKind {
    // Special tokens
    Eof,
    Error,

    // Literals
    Ident,
    IntLiteral,
    FloatLiteral,
    StringLiteral,
    BlockStringLiteral,

    // Keywords
    Query,
    Mutation,
    Subscription,
    Fragment,
    On,
    True,
    False,
    Null,

    // Punctuation
    LBrace,
    RBrace,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Colon,
    Spread,
    Eq,
    At,
    Bang,
    Dollar,
}

impl TokenKind {
    #[must_use]
    pub const fn is_keyword(self) -> bool {
        matches!(
            self,
            Self::Query
                | Self::Mutation
                | Self::Subscription
                | Self::Fragment
                | Self::On
                | Self::True
                | Self::False
                | Self::Null
        )
    }

    /// Returns true for tokens usable as a name.
    #[must_use]
    pub const fn is_name(self) -> bool {
        matches!(self, Self::Ident) || self.is_keyword()
    }

    #[must_use]
    pub fn from_keyword(text: &str) -> Option<Self> {
        let kind = match text {
            "query" => Self::Query,
            "mutation" => Self::Mutation,
            "subscription" => Self::Subscription,
            "fragment" => Self::Fragment,
            "on" => Self::On,
            "true" => Self::True,
            "false" => Self::False,
            "null" => Self::Null,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eof => "<EOF>",
            Self::Error => "invalid token",
            Self::Ident => "Name",
            Self::IntLiteral => "Int",
            Self::FloatLiteral => "Float",
            Self::StringLiteral => "String",
            Self::BlockStringLiteral => "BlockString",
            Self::Query => "\"query\"",
            Self::Mutation => "\"mutation\"",
            Self::Subscription => "\"subscription\"",
            Self::Fragment => "\"fragment\"",
            Self::On => "\"on\"",
            Self::True => "\"true\"",
            Self::False => "\"false\"",
            Self::Null => "\"null\"",
            Self::LBrace => "\"{\"",
            Self::RBrace => "\"}\"",
            Self::LParen => "\"(\"",
            Self::RParen => "\")\"",
            Self::LBracket => "\"[\"",
            Self::RBracket => "\"]\"",
            Self::Colon => "\":\"",
            Self::Spread => "\"...\"",
            Self::Eq => "\"=\"",
            Self::At => "\"@\"",
            Self::Bang => "\"!\"",
            Self::Dollar => "\"$\"",
        };
        f.write_str(s)
    }
}

/// A token with its span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    #[must_use]
    pub const fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}
