//! Chat completion backends and the registry that picks one per user.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::tutor::memory::ContextMessage;

/// A model that can continue a conversation.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Complete `messages` (oldest first) under `system_instruction`.
    async fn complete(
        &self,
        system_instruction: &str,
        messages: &[ContextMessage],
    ) -> Result<String, ModelError>;
}

#[derive(Debug)]
pub enum ModelError {
    Http(String),
    Api(String),
    Parse(String),
    Empty,
    Timeout(Duration),
    NoBackend,
}

impl std::fmt::Display for ModelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelError::Http(e) => write!(f, "HTTP error: {e}"),
            ModelError::Api(e) => write!(f, "API error: {e}"),
            ModelError::Parse(e) => write!(f, "Parse error: {e}"),
            ModelError::Empty => write!(f, "Empty response"),
            ModelError::Timeout(d) => write!(f, "No response within {}s", d.as_secs()),
            ModelError::NoBackend => write!(f, "No backend registered"),
        }
    }
}

impl std::error::Error for ModelError {}

/// Backends keyed by model id, in registration order.
pub struct Backends {
    default_model: String,
    entries: Vec<(String, Arc<dyn CompletionBackend>)>,
}

impl Backends {
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            entries: Vec::new(),
        }
    }

    /// Register `backend` under `model_id`, replacing any previous entry.
    pub fn register(&mut self, model_id: impl Into<String>, backend: Arc<dyn CompletionBackend>) {
        let model_id = model_id.into();
        if let Some(entry) = self.entries.iter_mut().find(|(id, _)| *id == model_id) {
            entry.1 = backend;
        } else {
            self.entries.push((model_id, backend));
        }
    }

    pub fn contains(&self, model_id: &str) -> bool {
        self.entries.iter().any(|(id, _)| id == model_id)
    }

    pub fn model_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(id, _)| id.as_str())
    }

    /// Backend for `requested`, else the default model, else the first registered one.
    pub fn resolve(&self, requested: Option<&str>) -> Option<(&str, &Arc<dyn CompletionBackend>)> {
        let find = |wanted: &str| {
            self.entries
                .iter()
                .find(|(id, _)| id == wanted)
                .map(|(id, backend)| (id.as_str(), backend))
        };
        requested
            .and_then(find)
            .or_else(|| find(&self.default_model))
            .or_else(|| self.entries.first().map(|(id, backend)| (id.as_str(), backend)))
    }
}
