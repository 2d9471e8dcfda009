//! Built-in stages.

pub mod empty_input;
pub mod history;
pub mod reply_router;

pub use empty_input::EmptyInputGuard;
pub use history::{ConversationHistory, History};
pub use reply_router::ReplyRouter;
