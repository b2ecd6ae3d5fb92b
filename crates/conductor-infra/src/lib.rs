//! Infrastructure layer for Conductor.
//!
//! Implements the storage traits from `conductor-core` on SQLite, loads
//! `config.toml`, and provides the file and git compensation handlers.

pub mod compensation;
pub mod config;
pub mod sqlite;
