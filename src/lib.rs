//! Bulwark - Per-Requester Admission Limiting
//!
//! This crate decides whether a request may proceed by counting each
//! requester's calls to each protected operation within a fixed window. The
//! counts live in a shared store that performs the check-create-increment
//! atomically, so every instance of a service enforces the same limits.

pub mod boundary;
pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
