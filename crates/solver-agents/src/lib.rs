//! Collaborators around the solver coordination core.
//!
//! - [`config`]: TOML configuration for races, consensus and backends
//! - [`process_adapter`]: backends that run as external executables
//! - [`text_adapter`]: best-effort extraction of agent results from free text
//! - [`telemetry`]: append-only JSONL race log

pub mod config;
pub mod process_adapter;
pub mod telemetry;
pub mod text_adapter;
