//! CLI command implementations.

pub mod branch;
pub mod config;
pub mod history;
pub mod remote;
pub mod repo;
