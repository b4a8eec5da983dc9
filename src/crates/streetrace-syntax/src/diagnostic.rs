//! Rustc-style diagnostics with stable error codes.
//!
//! A [`Diagnostic`] carries an error code, severity, a primary span, and any
//! number of labeled secondary spans. [`Diagnostic::render`] produces the
//! familiar `error[E0102]: ...` layout with a source excerpt and `^^^`
//! underlines. Rendering is plain text and fully deterministic so tests can
//! snapshot it; the CLI decides whether to colorize.

use serde::{Deserialize, Serialize};

use crate::source::Span;

/// Stable error codes for every compile-time failure class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    /// E0001: tokenization failure (bad character, tab indentation, partial
    /// dedent, unterminated string).
    LexError,
    /// E0002: the token stream does not match the grammar.
    ParseError,
    /// E0101: two top-level declarations of one kind share a name.
    DuplicateDefinition,
    /// E0102: a reference does not resolve to any declaration.
    UnresolvedName,
    /// E0103: a reference resolves to the wrong kind of thing.
    TypeMismatch,
    /// E0104: an escalation handler is not valid for its statement.
    BadEscalation,
    /// E0105: the workflow has no runnable flow or agent.
    NoEntryPoint,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::LexError => "E0001",
            ErrorCode::ParseError => "E0002",
            ErrorCode::DuplicateDefinition => "E0101",
            ErrorCode::UnresolvedName => "E0102",
            ErrorCode::TypeMismatch => "E0103",
            ErrorCode::BadEscalation => "E0104",
            ErrorCode::NoEntryPoint => "E0105",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

/// A secondary span with its own label, rendered below the primary one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub span: Span,
    pub message: String,
}

/// A single compiler diagnostic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub code: ErrorCode,
    pub severity: Severity,
    pub message: String,
    pub span: Span,
    /// Short text placed next to the primary underline. Empty is allowed.
    pub span_label: String,
    pub labels: Vec<Label>,
    pub help: Option<String>,
}

impl Diagnostic {
    pub fn error(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            code,
            severity: Severity::Error,
            message: message.into(),
            span,
            span_label: String::new(),
            labels: Vec::new(),
            help: None,
        }
    }

    pub fn warning(code: ErrorCode, message: impl Into<String>, span: Span) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, message, span)
        }
    }

    pub fn with_span_label(mut self, label: impl Into<String>) -> Self {
        self.span_label = label.into();
        self
    }

    pub fn with_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(Label {
            span,
            message: message.into(),
        });
        self
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Render the diagnostic against the source it was produced from.
    ///
    /// `file` is only used for the `-->` location line; `source` must be the
    /// exact text that was compiled or the excerpt will not line up.
    pub fn render(&self, file: &str, source: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{}[{}]: {}\n",
            self.severity.as_str(),
            self.code.as_str(),
            self.message
        ));
        out.push_str(&format!(
            " --> {}:{}:{}\n",
            file, self.span.line, self.span.column
        ));

        let lines: Vec<&str> = source.lines().collect();
        let gutter = self.span.line.to_string().len().max(2);
        let pad = " ".repeat(gutter);
        out.push_str(&format!("{pad} |\n"));
        self.render_span(&mut out, &lines, gutter, self.span, &self.span_label);
        for label in &self.labels {
            self.render_span(&mut out, &lines, gutter, label.span, &label.message);
        }
        out.push_str(&format!("{pad} |\n"));
        if let Some(help) = &self.help {
            out.push_str(&format!("{pad} = help: {help}\n"));
        }
        out
    }

    fn render_span(&self, out: &mut String, lines: &[&str], gutter: usize, span: Span, label: &str) {
        let idx = span.line.saturating_sub(1) as usize;
        let Some(line) = lines.get(idx) else {
            return;
        };
        out.push_str(&format!("{:>gutter$} | {}\n", span.line, line));
        let start = span.column.saturating_sub(1) as usize;
        let width = if span.end_line == span.line {
            (span.end_column.saturating_sub(span.column) as usize).max(1)
        } else {
            line.chars().count().saturating_sub(start).max(1)
        };
        let mut underline = format!("{} | {}{}", " ".repeat(gutter), " ".repeat(start), "^".repeat(width));
        if !label.is_empty() {
            underline.push(' ');
            underline.push_str(label);
        }
        underline.push('\n');
        out.push_str(&underline);
    }
}

/// An ordered batch of diagnostics for one file.
///
/// Compile-time errors accumulate here; the pipeline halts for the file once
/// the batch contains any error-severity entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticBatch {
    pub diagnostics: Vec<Diagnostic>,
}

impl DiagnosticBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    pub fn render(&self, file: &str, source: &str) -> String {
        let mut out = String::new();
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&d.render(file, source));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_points_at_span() {
        let source = "model main = anthropic/claude\nprompt p expecting Finding: \"\"\"x\"\"\"\n";
        let diag = Diagnostic::error(
            ErrorCode::UnresolvedName,
            "cannot find schema `Finding` in this file",
            Span::new(2, 20, 2, 27),
        )
        .with_span_label("not declared")
        .with_help("declare it with `schema Finding:`");

        let rendered = diag.render("review.sr", source);
        assert!(rendered.starts_with("error[E0102]: cannot find schema `Finding`"));
        assert!(rendered.contains(" --> review.sr:2:20"));
        assert!(rendered.contains("^^^^^^^ not declared"));
        assert!(rendered.contains("= help: declare it with"));
    }

    #[test]
    fn test_batch_error_detection() {
        let mut batch = DiagnosticBatch::new();
        assert!(!batch.has_errors());
        batch.push(Diagnostic::warning(
            ErrorCode::LexError,
            "odd but fine",
            Span::point(1, 1),
        ));
        assert!(!batch.has_errors());
        batch.push(Diagnostic::error(
            ErrorCode::ParseError,
            "nope",
            Span::point(1, 1),
        ));
        assert!(batch.has_errors());
    }

    #[test]
    fn test_render_is_deterministic() {
        let source = "flow main:\n    $x = 1\n";
        let diag = Diagnostic::error(ErrorCode::ParseError, "unexpected token", Span::new(2, 5, 2, 7));
        assert_eq!(diag.render("a.sr", source), diag.render("a.sr", source));
    }
}
