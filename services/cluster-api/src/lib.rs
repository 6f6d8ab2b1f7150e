//! clustree cluster API library.
//!
//! The crate ships the `cluster-api` binary; the library surface exists for
//! integration tests and reuse.

pub mod api;
pub mod authorization;
pub mod config;
pub mod db;
pub mod registry;
pub mod service;
pub mod solver;
pub mod state;
