//! Shared host pool allocation service.
//!
//! The crate ships a `pool-manager` binary; the library surface exists for
//! integration tests and embedding.

pub mod allocation;
pub mod api;
pub mod config;
pub mod db;
pub mod lock;
pub mod model;
pub mod pipeline;
pub mod state;
pub mod store;
