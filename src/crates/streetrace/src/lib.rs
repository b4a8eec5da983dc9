//! CLI support library: configuration and workload caching.
//!
//! The binary in `main.rs` wires these together with the compiler and
//! runtime crates.

pub mod client;
pub mod config;
pub mod workload;

pub use client::EchoLlmClient;
pub use config::CliConfig;
pub use workload::WorkloadCache;
