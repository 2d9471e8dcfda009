//! Shared building blocks for the message-processing core.
//!
//! This crate holds the **queue-agnostic** primitives every other crate speaks:
//! identifiers, the immutable [`Event`], and the core error type. No IO lives here.

pub mod error;
pub mod event;
pub mod id;

pub use error::{CoreError, CoreResult};
pub use event::Event;
pub use id::{DlqId, EventId};
