//! Shared types for the Bloatmark bufferbloat test platform.
//!
//! Everything that crosses a process boundary lives here: the WebSocket
//! wire protocol, the closed persona set, the grading tables, the test
//! phase plan, throughput/latency statistics, id generation, and the
//! environment configuration layer.

pub mod config;
pub mod grading;
pub mod ids;
pub mod model;
pub mod persona;
pub mod protocol;
pub mod stats;
