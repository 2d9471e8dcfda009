//! Conversation history backends.

pub mod postgres;

pub use postgres::PostgresConversationStore;
