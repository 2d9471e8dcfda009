//! Model call clients.

pub mod http;

pub use http::{HttpModelCall, ModelRequest};
