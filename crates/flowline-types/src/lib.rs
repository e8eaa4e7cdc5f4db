//! Shared domain types for Flowline.
//!
//! This crate contains the core domain types used across the Flowline
//! platform: workflow definitions, run/node execution records, execution
//! events, registered tool servers, and collaborator request/response types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod error;
pub mod event;
pub mod exec;
pub mod llm;
pub mod server;
pub mod workflow;
