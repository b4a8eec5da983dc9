//! Code generation for the StreetRace agent DSL.
//!
//! Takes the validated AST produced by `streetrace-syntax` and lowers it to
//! a [`CompiledWorkflow`]: declaration tables, flow instruction programs,
//! prompt templates and a source map tying every generated artifact back to
//! its source span.
//!
//! The compiled representation is an interpreted IR; `streetrace-runtime`
//! walks the instruction programs directly.
//!
//! # Guarantees
//!
//! - **Determinism**: identical source yields byte-identical serialized
//!   workflows (declaration tables are ordered maps, instruction lowering is
//!   a pure fold).
//! - **Source-map totality**: every instruction and prompt records a span
//!   resolvable through [`source_map::SourceMap`].

pub mod codegen;
pub mod source_map;
pub mod workflow;

pub use codegen::generate;
pub use source_map::{SourceMap, SpanId};
pub use workflow::CompiledWorkflow;

use streetrace_syntax::DiagnosticBatch;

/// Compile `.sr` source all the way to an executable workflow.
pub fn compile_source(source: &str) -> Result<CompiledWorkflow, DiagnosticBatch> {
    let file = streetrace_syntax::compile_front(source)?;
    Ok(generate(&file))
}
