//! Tutor module - conversation memory, model backends and reply formatting.

pub mod anthropic;
pub mod engine;
pub mod groq;
pub mod llm;
pub mod memory;
pub mod sanitize;
pub mod telegram;


pub use engine::{TurnError, TutorEngine, TutorSettings};
pub use llm::{Backends, CompletionBackend, ModelError};
pub use memory::{ContextMessage, ConversationStore, Role, StorageError, UserRecord};
pub use sanitize::{FormatMode, Rendered, Sanitizer};
pub use telegram::TelegramClient;
