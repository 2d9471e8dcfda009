//! Stage pipeline over a per-event mutable context.
//!
//! A [`Pipeline`] drives one event through an ordered list of [`Stage`]s around a
//! terminal [`ModelCall`]. It knows nothing about queues: the caller builds a
//! [`PipelineContext`], calls [`Pipeline::run`], and routes the [`Outcome`].
//!
//! ```text
//! before_pipeline* ─► before_model_call* ─► model ─► after_model_call* ─► after_pipeline*
//!        │                    │                                               ▲
//!        └──── ShortCircuit ──┴───────────────────────────────────────────────┘
//! ```

pub mod context;
pub mod conversation;
pub mod error;
pub mod executor;
pub mod message;
pub mod stage;
pub mod stages;

pub use context::{ModelOutput, OutboundMessage, PipelineContext, PipelineResponse, ResponseSource};
pub use conversation::{ConversationError, ConversationStore, ConversationTurn, InMemoryConversationStore};
pub use error::{Hook, StageError};
pub use executor::{Outcome, Pipeline};
pub use message::{InboundMessage, MessageKind, OutboundReply};
pub use stage::{ModelCall, Stage, StageFlow};
