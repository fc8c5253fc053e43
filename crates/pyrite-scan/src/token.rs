//! The scanner's output records.

use std::fmt;
use std::sync::Arc;

use crate::code::CodeObject;

/// Decoded argument of a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenArg {
    /// The plain instruction argument: a pool index, arity, or jump
    /// operand, with any `EXTENDED_ARG` prefix already folded in.
    Arg(usize),
    /// A nested code object, carried through for the caller to recurse
    /// into.
    Code(Arc<CodeObject>),
}

/// Position of a token in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOffset {
    /// Byte offset of a real instruction.
    Real(usize),
    /// A synthetic marker inserted at a jump target. `index` counts the
    /// markers landing on the same offset.
    Synthetic {
        /// Byte offset the marker is anchored to.
        at: usize,
        /// Position among the markers at this offset.
        index: usize,
    },
}

impl TokenOffset {
    /// The byte offset this token sorts at. Synthetic markers compare
    /// as their anchor offset and precede the real instruction there.
    pub fn byte(self) -> usize {
        match self {
            TokenOffset::Real(offset) => offset,
            TokenOffset::Synthetic { at, .. } => at,
        }
    }
}

impl fmt::Display for TokenOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenOffset::Real(offset) => write!(f, "{offset}"),
            TokenOffset::Synthetic { at, index } => write!(f, "{at}_{index}"),
        }
    }
}

/// One annotated instruction (or synthetic marker) of the token stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// Grammar-facing name: the mnemonic, a rename, or `COME_FROM`.
    pub kind: String,
    /// Decoded argument, if the instruction has one.
    pub arg: Option<TokenArg>,
    /// Printable form of the argument: resolved name, constant repr,
    /// or jump target.
    pub pattr: Option<String>,
    /// Stream position.
    pub offset: TokenOffset,
    /// Source line beginning at this offset, if any.
    pub line_start: Option<u32>,
}

impl Token {
    /// True for synthetic `COME_FROM` markers.
    pub fn is_come_from(&self) -> bool {
        self.kind == "COME_FROM"
    }
}

impl fmt::Display for Token {
    /// One assembly-listing line: line number, offset, name, argument.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = self
            .line_start
            .map(|l| l.to_string())
            .unwrap_or_default();
        let attr = match (&self.pattr, &self.arg) {
            (Some(p), _) => p.clone(),
            (None, Some(TokenArg::Arg(a))) => a.to_string(),
            (None, Some(TokenArg::Code(code))) => format!("<code_object {}>", code.name),
            (None, None) => String::new(),
        };
        write!(
            f,
            "{:>5} {:>8}  {:<20} {}",
            line,
            self.offset.to_string(),
            self.kind,
            attr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_display() {
        assert_eq!(TokenOffset::Real(42).to_string(), "42");
        assert_eq!(
            TokenOffset::Synthetic { at: 42, index: 1 }.to_string(),
            "42_1"
        );
        assert_eq!(TokenOffset::Synthetic { at: 42, index: 1 }.byte(), 42);
    }

    #[test]
    fn test_token_display() {
        let token = Token {
            kind: "LOAD_NAME".to_string(),
            arg: Some(TokenArg::Arg(0)),
            pattr: Some("x".to_string()),
            offset: TokenOffset::Real(3),
            line_start: Some(2),
        };
        let line = token.to_string();
        assert!(line.contains("LOAD_NAME"));
        assert!(line.contains('x'));
        assert!(line.contains('3'));
    }
}
