//! Front end for the StreetRace agent DSL.
//!
//! A small, indentation-sensitive declarative language for multi-step LLM
//! workflows. This crate covers the compilation front half:
//!
//! - **Lexer** — indentation-sensitive tokenization ([`lexer::tokenize`])
//! - **Parser** — recursive descent to a typed AST ([`parser::parse`])
//! - **Semantic analysis** — name resolution, prompt merging, scoping
//!   ([`semantic::analyze`])
//! - **Diagnostics** — rustc-style error rendering with stable codes
//!   ([`diagnostic::Diagnostic`])
//!
//! # Pipeline
//!
//! ```text
//! source (.sr) ──> tokenize ──> parse ──> analyze ──> DslFile (validated)
//! ```
//!
//! The validated AST is handed to `streetrace-compiler` for lowering into an
//! executable workflow.
//!
//! # Example
//!
//! ```rust
//! use streetrace_syntax::compile_front;
//!
//! let source = r#"
//! model main = anthropic/claude-sonnet
//!
//! prompt greet: """Say hello."""
//!
//! agent: instruction greet
//! "#;
//! let file = compile_front(source).expect("valid source");
//! assert_eq!(file.decls.len(), 3);
//! ```

pub mod ast;
pub mod diagnostic;
pub mod lexer;
pub mod parser;
pub mod semantic;
pub mod source;
pub mod token;

pub use ast::DslFile;
pub use diagnostic::{Diagnostic, DiagnosticBatch, ErrorCode, Severity};
pub use source::Span;

/// Run the whole front end: tokenize, parse, analyze.
///
/// Lex and parse failures surface as a single-entry batch; semantic failures
/// carry every diagnostic collected during the pass.
pub fn compile_front(source: &str) -> Result<DslFile, DiagnosticBatch> {
    let file = parser::parse(source).map_err(|diagnostic| DiagnosticBatch {
        diagnostics: vec![diagnostic],
    })?;
    tracing::debug!(decls = file.decls.len(), "parsed source file");
    semantic::analyze(file)
}
