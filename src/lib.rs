//! Front-door proxy for disaggregated Encode/Prefill/Decode inference.
//!
//! Requests enter through [`server`], are planned and walked through the
//! stages by [`runtime`], and hand intermediate results between stages via
//! the [`cache`] connectors. [`stage`] is a reference stage server speaking
//! the same protocol.

pub mod cache;
pub mod cli;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod runtime;
pub mod server;
pub mod stage;
