//! Async runtime for compiled StreetRace workflows.
//!
//! Interprets the output of `streetrace-compiler`: dispatches LLM-backed
//! agents, drives loops, matches and parallel blocks, applies escalation
//! semantics, validates structured outputs against declared schemas and
//! compacts conversation history under model budgets.
//!
//! # Architecture
//!
//! ```text
//! run_async(session, message)
//!        │
//!        ▼
//!  entry-point selection ──► flow interpreter ──► agent pipeline
//!        │                        │                    │
//!        │                        │              LlmClient / ToolProvider
//!        ▼                        ▼                    ▼
//!   EventSink ◄──────────── events from every operation
//! ```
//!
//! Everything external sits behind three capabilities ([`LlmClient`],
//! [`ToolProvider`], [`SessionStore`]); the runtime itself never opens a
//! socket, reads an environment variable or touches a database.
//!
//! # Ordering and cancellation
//!
//! Within a single flow all events are totally ordered in source order.
//! Children of a `parallel` block interleave arbitrarily with each other
//! while staying ordered internally. Dropping the event stream cancels the
//! run: in-flight calls settle, nothing new dispatches and agent handles
//! are released.

pub mod agent;
pub mod capabilities;
pub mod compaction;
pub mod context;
pub mod error;
pub mod escalation;
pub mod events;
pub mod interpreter;
pub mod retry;
pub mod runner;
pub mod testing;
pub mod validation;
pub mod value;

pub use capabilities::{
    LlmChunk, LlmClient, LlmStream, Message, Role, Session, SessionStore, ToolHandle, ToolProvider,
};
pub use context::WorkflowContext;
pub use error::{ErrorKind, Result, RuntimeError};
pub use events::{Event, EventSink};
pub use runner::{select_entry, EntryPoint, WorkflowRuntime};
