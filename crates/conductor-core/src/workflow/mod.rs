//! Workflow engine core: definitions, execution, scheduling, and durable checkpointing.
//!
//! - `definition` -- YAML parsing, validation, input resolution
//! - `context` -- per-run variables, step outputs, template resolution
//! - `expression` -- JEXL evaluator for step conditions
//! - `cron` -- 5-field cron parsing and next-run computation
//! - `scheduler` -- cron job registry and wake loop
//! - `checkpoint` -- `StateStore` over an `ExecutionRepository`
//! - `retry` -- retry decisions and backoff delays
//! - `circuit` -- per-agent circuit breakers
//! - `dispatch` -- tool and agent adapter contracts and registries
//! - `engine` -- sequential step executor with failover and rollback

pub mod checkpoint;
pub mod circuit;
pub mod context;
pub mod cron;
pub mod definition;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod expression;
pub mod retry;
pub mod scheduler;

pub use engine::WorkflowEngine;
pub use error::{EngineError, StepError};
pub use scheduler::Scheduler;
