//! Conversation memory
//!
//! Per-session turn history and the follow-up merging that lets a question
//! like "What about Q2?" reuse what the session already established.

pub mod context_manager;
pub mod store;

pub use context_manager::{ContextConfig, ContextManager};
pub use store::{ConversationStore, ConversationTurn, SessionHistory, TurnSlot};
