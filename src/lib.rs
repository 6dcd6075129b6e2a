//! Telegram tutor bot: per-user conversation memory, LLM backends and
//! reply formatting for Telegram.

pub mod config;
pub mod tutor;
