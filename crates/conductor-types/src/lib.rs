//! Shared domain types for Conductor.
//!
//! This crate contains the data model used across the orchestration runtime:
//! workflow definitions, execution records and checkpoints, agent routing
//! descriptors, rollback actions, and configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod execution;
pub mod rollback;
pub mod workflow;
