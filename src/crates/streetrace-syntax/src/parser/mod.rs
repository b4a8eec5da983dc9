//! Recursive-descent parser over the token stream.
//!
//! Most functions peek one token and pick a branch from its kind. Whenever
//! only one token can be next, [`Parser::expect`] is used; it produces a
//! parse error naming what was found instead. Typed AST nodes are built
//! directly as productions complete, each carrying the covering span of its
//! tokens.
//!
//! Block structure arrives pre-tokenized: the lexer emits `Indent`/`Dedent`
//! pairs, so the parser treats them like ordinary delimiters.

mod decl;
mod expr;
mod stmt;

use crate::ast::{Decl, DslFile, VersionDecl};
use crate::diagnostic::{Diagnostic, ErrorCode};
use crate::lexer::tokenize;
use crate::source::Span;
use crate::token::{Keyword, Token, TokenKind};

/// The result returned by most parser functions.
pub type ParseResult<T> = Result<T, Diagnostic>;

/// Parse a whole `.sr` source into an AST.
///
/// Lex and parse errors halt at the first failure; the returned diagnostic
/// carries the offending span.
pub fn parse(source: &str) -> Result<DslFile, Diagnostic> {
    let tokens = tokenize(source)?;
    Parser::new(tokens).parse_file()
}

pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn parse_file(mut self) -> ParseResult<DslFile> {
        let start = self.peek_span();
        let version = self.parse_version_line()?;
        let mut decls = Vec::new();
        loop {
            self.skip_newlines();
            if self.check(&TokenKind::Eof) {
                break;
            }
            decls.push(self.parse_decl()?);
        }
        let end = decls.last().map(Decl::span).unwrap_or(start);
        Ok(DslFile {
            version,
            decls,
            span: start.covering(end),
        })
    }

    /// Optional first logical line: `streetrace vN(.N)?`.
    fn parse_version_line(&mut self) -> ParseResult<Option<VersionDecl>> {
        self.skip_newlines();
        if !self.check_keyword(Keyword::Streetrace) {
            return Ok(None);
        }
        // `streetrace` can also begin a dotted builtin reference in later
        // declarations; only a following version token makes this a header.
        if !matches!(self.peek_ahead(1).map(|t| &t.kind), Some(TokenKind::Version(_))) {
            return Ok(None);
        }
        let start = self.next_span();
        let (version, vspan) = match self.next() {
            Token {
                kind: TokenKind::Version(v),
                span,
            } => (v, span),
            token => {
                return Err(self.unexpected(&token, "a version like `v1` or `v1.2`"));
            }
        };
        self.expect_newline()?;
        Ok(Some(VersionDecl {
            version,
            span: start.covering(vspan),
        }))
    }

    // ------------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .unwrap_or_else(|| self.tokens.last().expect("token stream ends with Eof"))
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.peek().kind
    }

    fn peek_ahead(&self, n: usize) -> Option<&Token> {
        self.tokens.get(self.pos + n)
    }

    fn peek_span(&self) -> Span {
        self.peek().span
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn next_span(&mut self) -> Span {
        self.next().span
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.peek_kind() == kind
    }

    fn check_keyword(&self, kw: Keyword) -> bool {
        matches!(self.peek_kind(), TokenKind::Keyword(k) if *k == kw)
    }

    /// Consume the token if it matches, returning whether it did.
    fn eat(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.next();
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: Keyword) -> bool {
        if self.check_keyword(kw) {
            self.next();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> ParseResult<Span> {
        if self.check(kind) {
            Ok(self.next_span())
        } else {
            let token = self.peek().clone();
            Err(self.unexpected(&token, &kind.describe()))
        }
    }

    fn expect_keyword(&mut self, kw: Keyword) -> ParseResult<Span> {
        self.expect(&TokenKind::Keyword(kw))
    }

    /// Expect the logical line to end here. `Eof` and a pending `Dedent`
    /// also close a line.
    fn expect_newline(&mut self) -> ParseResult<()> {
        match self.peek_kind() {
            TokenKind::Newline => {
                self.next();
                Ok(())
            }
            TokenKind::Eof | TokenKind::Dedent => Ok(()),
            _ => {
                let token = self.peek().clone();
                Err(self.unexpected(&token, "end of line"))
            }
        }
    }

    fn skip_newlines(&mut self) {
        while self.check(&TokenKind::Newline) {
            self.next();
        }
    }

    /// Accept an identifier or any keyword used as a plain name.
    fn parse_name(&mut self) -> ParseResult<(String, Span)> {
        let token = self.next();
        match token.kind {
            TokenKind::Ident(name) => Ok((name, token.span)),
            TokenKind::Keyword(kw) => Ok((kw.as_str().to_string(), token.span)),
            _ => Err(self.unexpected(&token, "a name")),
        }
    }

    fn unexpected(&self, token: &Token, expected: &str) -> Diagnostic {
        Diagnostic::error(
            ErrorCode::ParseError,
            format!("expected {expected}, found {}", token.kind.describe()),
            token.span,
        )
        .with_span_label(format!("expected {expected}"))
    }
}

#[cfg(test)]
mod tests;
