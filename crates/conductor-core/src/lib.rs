//! Business logic and repository trait definitions for Conductor.
//!
//! This crate defines the "ports" (repository, tool, agent adapter and
//! compensation traits) that the infrastructure layer implements. It depends
//! only on `conductor-types` -- never on `conductor-infra` or any database crate.

pub mod event;
pub mod hooks;
pub mod repository;
pub mod rollback;
pub mod routing;
pub mod workflow;
