//! HTTP API for the matching engine
//!
//! JSON over HTTP: ranked matches, feedback submission, whole-tree
//! replacement, and a health probe.

pub mod server;

pub use server::{ApiServer, ApiServerConfig};
