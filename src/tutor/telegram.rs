//! Telegram delivery using teloxide.

use teloxide::prelude::*;
use teloxide::types::{ChatAction, ParseMode};
use tracing::{info, warn};

use crate::tutor::sanitize::Rendered;

/// Telegram's limit on message length, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// Telegram API client.
pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    /// Show "typing..." while the model works.
    pub async fn typing(&self, chat_id: ChatId) {
        if let Err(e) = self.bot.send_chat_action(chat_id, ChatAction::Typing).await {
            warn!("Failed to send typing action: {e}");
        }
    }

    /// Send a rendered reply. HTML that Telegram rejects is resent as plain text.
    pub async fn send_rendered(&self, chat_id: ChatId, rendered: &Rendered) -> Result<(), String> {
        if rendered.html && rendered.text.chars().count() <= MAX_MESSAGE_CHARS {
            match self
                .bot
                .send_message(chat_id, &rendered.text)
                .parse_mode(ParseMode::Html)
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) => warn!("HTML reply rejected, falling back to plain text: {e}"),
            }
        } else if rendered.html {
            info!("Reply too long for one HTML message, sending plain text");
        }

        let text = if rendered.html { &rendered.plain } else { &rendered.text };
        self.send_text(chat_id, text).await
    }

    /// Send plain text, split into as many messages as needed.
    pub async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<(), String> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            self.bot.send_message(chat_id, chunk).await.map_err(|e| {
                let msg = format!("Failed to send: {e}");
                warn!("{}", msg);
                msg
            })?;
        }
        Ok(())
    }
}

/// Split `text` into chunks of at most `max_chars` characters, preferring
/// to break after a newline.
pub fn split_message(text: &str, max_chars: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut rest = text;

    while rest.chars().count() > max_chars {
        let limit = rest
            .char_indices()
            .nth(max_chars)
            .map_or(rest.len(), |(i, _)| i);
        let cut = rest[..limit]
            .rfind('\n')
            .filter(|&i| i > 0)
            .map_or(limit, |i| i + 1);
        chunks.push(&rest[..cut]);
        rest = &rest[cut..];
    }

    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest);
    }
    chunks
}
