//! Indentation-sensitive tokenizer for `.sr` sources.
//!
//! The lexer walks the code-point stream once. At the start of every logical
//! line it measures leading spaces against an indentation stack and emits
//! `Indent`/`Dedent` tokens; a dedent that lands between two known levels is
//! a lex error. Newlines inside triple-quoted strings or inside balanced
//! `(`/`[`/`{` nesting do not terminate the logical line.
//!
//! Tabs in indentation are forbidden. `$` fuses with the following
//! identifier into a single `Variable` token. Compound tokens (`vN.N`
//! versions, `provider/model` ids, dotted names, `pip://`/`mcp://` URIs and
//! `./` paths) are recognized here so the parser never has to glue them.

use crate::diagnostic::{Diagnostic, ErrorCode};
use crate::source::Span;
use crate::token::{Keyword, Token, TokenKind};

/// Tokenize a whole source file.
///
/// Returns the token stream terminated by `Eof`, or the first lex error as a
/// diagnostic. Trailing dedents are emitted before `Eof` so block structure
/// is always balanced.
pub fn tokenize(source: &str) -> Result<Vec<Token>, Diagnostic> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    indent_stack: Vec<usize>,
    bracket_depth: usize,
    at_line_start: bool,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            indent_stack: vec![0],
            bracket_depth: 0,
            at_line_start: true,
            tokens: Vec::new(),
        }
    }

    fn run(mut self) -> Result<Vec<Token>, Diagnostic> {
        while self.pos < self.chars.len() {
            if self.at_line_start && self.bracket_depth == 0 {
                self.lex_indentation()?;
                if self.pos >= self.chars.len() {
                    break;
                }
            }
            self.lex_token()?;
        }

        // Close the final logical line and any open blocks.
        if !matches!(self.tokens.last().map(|t| &t.kind), None | Some(TokenKind::Newline)) {
            self.push(TokenKind::Newline, self.point_span());
        }
        while self.indent_stack.len() > 1 {
            self.indent_stack.pop();
            self.push(TokenKind::Dedent, self.point_span());
        }
        self.push(TokenKind::Eof, self.point_span());
        Ok(self.tokens)
    }

    // ------------------------------------------------------------------
    // Indentation
    // ------------------------------------------------------------------

    fn lex_indentation(&mut self) -> Result<(), Diagnostic> {
        loop {
            let mut width = 0usize;
            while let Some(c) = self.peek() {
                match c {
                    ' ' => {
                        self.bump();
                        width += 1;
                    }
                    '\t' => {
                        return Err(Diagnostic::error(
                            ErrorCode::LexError,
                            "tabs are not allowed in indentation",
                            self.point_span(),
                        )
                        .with_help("indent with spaces"));
                    }
                    _ => break,
                }
            }
            match self.peek() {
                // Blank or comment-only lines never change indentation.
                Some('\n') => {
                    self.bump();
                    continue;
                }
                Some('#') => {
                    self.skip_comment();
                    if self.peek() == Some('\n') {
                        self.bump();
                    }
                    continue;
                }
                None => return Ok(()),
                Some(_) => {
                    self.apply_indent(width)?;
                    self.at_line_start = false;
                    return Ok(());
                }
            }
        }
    }

    fn apply_indent(&mut self, width: usize) -> Result<(), Diagnostic> {
        let current = *self.indent_stack.last().unwrap_or(&0);
        if width > current {
            self.indent_stack.push(width);
            self.push(TokenKind::Indent, self.point_span());
            return Ok(());
        }
        while width < *self.indent_stack.last().unwrap_or(&0) {
            self.indent_stack.pop();
            self.push(TokenKind::Dedent, self.point_span());
        }
        if width != *self.indent_stack.last().unwrap_or(&0) {
            return Err(Diagnostic::error(
                ErrorCode::LexError,
                "unindent does not match any outer indentation level",
                self.point_span(),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tokens
    // ------------------------------------------------------------------

    fn lex_token(&mut self) -> Result<(), Diagnostic> {
        let Some(c) = self.peek() else {
            return Ok(());
        };
        match c {
            ' ' => {
                self.bump();
                Ok(())
            }
            '\t' => {
                // Tabs between tokens are tolerated as plain spacing.
                self.bump();
                Ok(())
            }
            '\n' => {
                let span = self.point_span();
                self.bump();
                if self.bracket_depth == 0 {
                    if !matches!(
                        self.tokens.last().map(|t| &t.kind),
                        None | Some(TokenKind::Newline)
                    ) {
                        self.push(TokenKind::Newline, span);
                    }
                    self.at_line_start = true;
                }
                Ok(())
            }
            '#' => {
                self.skip_comment();
                Ok(())
            }
            '"' | '\'' => self.lex_string(c),
            '$' => self.lex_variable(),
            '.' => self.lex_dot(),
            c if c.is_ascii_digit() => self.lex_number(),
            c if is_ident_start(c) => self.lex_word(),
            _ => self.lex_punct(),
        }
    }

    fn lex_string(&mut self, quote: char) -> Result<(), Diagnostic> {
        let start = self.start();
        if self.peek_ahead(1) == Some(quote) && self.peek_ahead(2) == Some(quote) {
            return self.lex_triple_string(quote, start);
        }
        self.bump();
        let mut value = String::new();
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(Diagnostic::error(
                        ErrorCode::LexError,
                        "unterminated string literal",
                        self.span_from(start),
                    ));
                }
                Some('\\') => {
                    self.bump();
                    match self.peek() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('\\') => value.push('\\'),
                        Some('"') => value.push('"'),
                        Some('\'') => value.push('\''),
                        Some(other) => {
                            value.push('\\');
                            value.push(other);
                        }
                        None => {
                            return Err(Diagnostic::error(
                                ErrorCode::LexError,
                                "unterminated string literal",
                                self.span_from(start),
                            ));
                        }
                    }
                    self.bump();
                }
                Some(c) if c == quote => {
                    self.bump();
                    break;
                }
                Some(c) => {
                    value.push(c);
                    self.bump();
                }
            }
        }
        self.push(TokenKind::Str(value), self.span_from(start));
        Ok(())
    }

    /// Triple-quoted string: body is copied verbatim, delimiters stripped.
    fn lex_triple_string(&mut self, quote: char, start: (u32, u32)) -> Result<(), Diagnostic> {
        self.bump();
        self.bump();
        self.bump();
        let mut value = String::new();
        loop {
            if self.peek() == Some(quote)
                && self.peek_ahead(1) == Some(quote)
                && self.peek_ahead(2) == Some(quote)
            {
                self.bump();
                self.bump();
                self.bump();
                break;
            }
            match self.peek() {
                None => {
                    return Err(Diagnostic::error(
                        ErrorCode::LexError,
                        "unterminated triple-quoted string",
                        self.span_from(start),
                    ));
                }
                Some(c) => {
                    value.push(c);
                    self.bump();
                }
            }
        }
        self.push(TokenKind::TripleStr(value), self.span_from(start));
        Ok(())
    }

    fn lex_variable(&mut self) -> Result<(), Diagnostic> {
        let start = self.start();
        self.bump();
        if !self.peek().map(is_ident_start).unwrap_or(false) {
            return Err(Diagnostic::error(
                ErrorCode::LexError,
                "expected a variable name after `$`",
                self.span_from(start),
            ));
        }
        let name = self.read_ident();
        self.push(TokenKind::Variable(name), self.span_from(start));
        Ok(())
    }

    fn lex_dot(&mut self) -> Result<(), Diagnostic> {
        let start = self.start();
        // `./path` and `../path` import targets.
        if self.peek_ahead(1) == Some('/')
            || (self.peek_ahead(1) == Some('.') && self.peek_ahead(2) == Some('/'))
        {
            let mut path = String::new();
            while let Some(c) = self.peek() {
                if c.is_whitespace() {
                    break;
                }
                path.push(c);
                self.bump();
            }
            self.push(TokenKind::LocalPath(path), self.span_from(start));
            return Ok(());
        }
        self.bump();
        self.push(TokenKind::Dot, self.span_from(start));
        Ok(())
    }

    fn lex_number(&mut self) -> Result<(), Diagnostic> {
        let start = self.start();
        let mut text = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                text.push(c);
                self.bump();
            } else {
                break;
            }
        }
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_ahead(1).map(|c| c.is_ascii_digit()).unwrap_or(false)
        {
            is_float = true;
            text.push('.');
            self.bump();
            while let Some(c) = self.peek() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
        }
        let span = self.span_from(start);
        if is_float {
            let value: f64 = text.parse().map_err(|_| {
                Diagnostic::error(ErrorCode::LexError, "invalid float literal", span)
            })?;
            self.push(TokenKind::Float(value), span);
        } else {
            let value: i64 = text.parse().map_err(|_| {
                Diagnostic::error(ErrorCode::LexError, "integer literal too large", span)
            })?;
            self.push(TokenKind::Int(value), span);
        }
        Ok(())
    }

    fn lex_word(&mut self) -> Result<(), Diagnostic> {
        let start = self.start();
        let word = self.read_ident();

        // `pip://...` and `mcp://...` URIs.
        if (word == "pip" || word == "mcp")
            && self.peek() == Some(':')
            && self.peek_ahead(1) == Some('/')
            && self.peek_ahead(2) == Some('/')
        {
            let mut uri = word.clone();
            while let Some(c) = self.peek() {
                if c.is_whitespace() {
                    break;
                }
                uri.push(c);
                self.bump();
            }
            let kind = if word == "pip" {
                TokenKind::PipUri(uri)
            } else {
                TokenKind::McpUri(uri)
            };
            self.push(kind, self.span_from(start));
            return Ok(());
        }

        // `provider/model-name` fused into one token.
        if self.peek() == Some('/') && self.peek_ahead(1).map(is_model_char).unwrap_or(false) {
            let mut id = word;
            id.push('/');
            self.bump();
            while let Some(c) = self.peek() {
                if is_model_char(c) {
                    id.push(c);
                    self.bump();
                } else {
                    break;
                }
            }
            self.push(TokenKind::ProviderModel(id), self.span_from(start));
            return Ok(());
        }

        // `vN` / `vN.N` version markers.
        if is_version(&word) {
            let mut version = word;
            if self.peek() == Some('.')
                && self.peek_ahead(1).map(|c| c.is_ascii_digit()).unwrap_or(false)
            {
                version.push('.');
                self.bump();
                while let Some(c) = self.peek() {
                    if c.is_ascii_digit() {
                        version.push(c);
                        self.bump();
                    } else {
                        break;
                    }
                }
            }
            self.push(TokenKind::Version(version), self.span_from(start));
            return Ok(());
        }

        // `a.b.c` dotted names (not followed by a float-style digit).
        if self.peek() == Some('.') && self.peek_ahead(1).map(is_ident_start).unwrap_or(false) {
            let mut dotted = word;
            while self.peek() == Some('.')
                && self.peek_ahead(1).map(is_ident_start).unwrap_or(false)
            {
                dotted.push('.');
                self.bump();
                dotted.push_str(&self.read_ident());
            }
            self.push(TokenKind::DottedName(dotted), self.span_from(start));
            return Ok(());
        }

        let kind = match Keyword::from_str(&word) {
            Some(kw) => TokenKind::Keyword(kw),
            None => TokenKind::Ident(word),
        };
        self.push(kind, self.span_from(start));
        Ok(())
    }

    fn lex_punct(&mut self) -> Result<(), Diagnostic> {
        let start = self.start();
        let c = self.peek().unwrap_or('\0');
        let kind = match c {
            ':' => {
                self.bump();
                TokenKind::Colon
            }
            ';' => {
                self.bump();
                TokenKind::Semicolon
            }
            ',' => {
                self.bump();
                TokenKind::Comma
            }
            '(' => {
                self.bump();
                self.bracket_depth += 1;
                TokenKind::LParen
            }
            ')' => {
                self.bump();
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RParen
            }
            '[' => {
                self.bump();
                self.bracket_depth += 1;
                TokenKind::LBracket
            }
            ']' => {
                self.bump();
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBracket
            }
            '{' => {
                self.bump();
                self.bracket_depth += 1;
                TokenKind::LBrace
            }
            '}' => {
                self.bump();
                self.bracket_depth = self.bracket_depth.saturating_sub(1);
                TokenKind::RBrace
            }
            '=' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::EqEq
                } else {
                    TokenKind::Eq
                }
            }
            '!' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::NotEq
                } else {
                    return Err(Diagnostic::error(
                        ErrorCode::LexError,
                        "unexpected character `!`",
                        self.span_from(start),
                    )
                    .with_help("negation is spelled `not`"));
                }
            }
            '<' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Le
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                self.bump();
                if self.peek() == Some('=') {
                    self.bump();
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '-' => {
                self.bump();
                if self.peek() == Some('>') {
                    self.bump();
                    TokenKind::Arrow
                } else {
                    TokenKind::Minus
                }
            }
            '+' => {
                self.bump();
                TokenKind::Plus
            }
            '*' => {
                self.bump();
                TokenKind::Star
            }
            '/' => {
                self.bump();
                TokenKind::Slash
            }
            '?' => {
                self.bump();
                TokenKind::Question
            }
            '~' => {
                self.bump();
                TokenKind::Tilde
            }
            other => {
                return Err(Diagnostic::error(
                    ErrorCode::LexError,
                    format!("unexpected character `{other}`"),
                    self.span_from(start),
                ));
            }
        };
        self.push(kind, self.span_from(start));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cursor helpers
    // ------------------------------------------------------------------

    /// Read an identifier. Interior dashes followed by a letter are part of
    /// the name (`claude-sonnet`); a dash before a digit stays subtraction.
    fn read_ident(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if is_ident_continue(c) {
                word.push(c);
                self.bump();
            } else if c == '-'
                && !word.is_empty()
                && self.peek_ahead(1).map(|n| n.is_ascii_alphabetic()).unwrap_or(false)
            {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_ahead(&self, n: usize) -> Option<char> {
        self.chars.get(self.pos + n).copied()
    }

    fn bump(&mut self) {
        if let Some(c) = self.peek() {
            self.pos += 1;
            if c == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
    }

    fn start(&self) -> (u32, u32) {
        (self.line, self.column)
    }

    fn span_from(&self, start: (u32, u32)) -> Span {
        Span::new(start.0, start.1, self.line, self.column)
    }

    fn point_span(&self) -> Span {
        Span::point(self.line, self.column)
    }

    fn push(&mut self, kind: TokenKind, span: Span) {
        self.tokens.push(Token::new(kind, span));
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_model_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')
}

fn is_version(word: &str) -> bool {
    let mut chars = word.chars();
    chars.next() == Some('v') && {
        let rest: Vec<char> = chars.collect();
        !rest.is_empty() && rest.iter().all(|c| c.is_ascii_digit())
    }
}
