//! Business logic and repository trait definitions for Flowline.
//!
//! This crate defines the "ports" (repository and collaborator traits) that
//! the infrastructure layer implements, plus the two core subsystems:
//!
//! - [`workflow`] -- DAG validation, variable resolution, node executors,
//!   and the scheduling loop that drives a run to completion.
//! - [`mcp`] -- the tool-server connection manager: transports, the JSON-RPC
//!   client with pending-request correlation, and the server lifecycle.
//!
//! It depends only on `flowline-types` -- never on `flowline-infra` or any
//! database crate.

pub mod event;
pub mod exec;
pub mod llm;
pub mod mcp;
pub mod pending;
pub mod repository;
pub mod workflow;
