//! Source positions and spans.
//!
//! Every AST node carries the span of its leftmost-to-rightmost tokens.
//! Spans are 1-based for lines and columns, matching what the diagnostic
//! reporter prints and what editors expect.

use serde::{Deserialize, Serialize};

/// A half-open region of source text identified by line/column coordinates.
///
/// `end_line`/`end_column` point one past the last character of the spanned
/// region, so a single-character token at line 1 column 5 has
/// `end_column == 6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl Span {
    pub fn new(line: u32, column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            line,
            column,
            end_line,
            end_column,
        }
    }

    /// A zero-width span at a point.
    pub fn point(line: u32, column: u32) -> Self {
        Self::new(line, column, line, column)
    }

    /// The smallest span covering both `self` and `other`.
    pub fn covering(self, other: Span) -> Span {
        let (line, column) = if (self.line, self.column) <= (other.line, other.column) {
            (self.line, self.column)
        } else {
            (other.line, other.column)
        };
        let (end_line, end_column) =
            if (self.end_line, self.end_column) >= (other.end_line, other.end_column) {
                (self.end_line, self.end_column)
            } else {
                (other.end_line, other.end_column)
            };
        Span {
            line,
            column,
            end_line,
            end_column,
        }
    }
}

impl Default for Span {
    fn default() -> Self {
        Span::point(1, 1)
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_covering_picks_outermost_bounds() {
        let a = Span::new(1, 5, 1, 10);
        let b = Span::new(2, 1, 3, 4);
        let c = a.covering(b);
        assert_eq!(c, Span::new(1, 5, 3, 4));
        // Order must not matter
        assert_eq!(b.covering(a), c);
    }

    #[test]
    fn test_point_is_zero_width() {
        let s = Span::point(4, 2);
        assert_eq!(s.line, s.end_line);
        assert_eq!(s.column, s.end_column);
    }
}
