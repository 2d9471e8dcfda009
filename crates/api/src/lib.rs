//! Operator HTTP API and process wiring.

pub mod app;
pub mod middleware;
