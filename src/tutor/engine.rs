//! Tutor engine - ties conversation memory, the model backends and the
//! reply sanitizer together for each incoming message.

use std::fmt;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::tutor::llm::{Backends, ModelError};
use crate::tutor::memory::{ConversationStore, DEFAULT_CONTEXT_MESSAGES, NO_TOPIC, Role, StorageError};
use crate::tutor::sanitize::{FormatMode, Rendered, Sanitizer};

pub const GREETING: &str = "Привет! Я репетитор по информатике (ЕГЭ). \
Напиши любой вопрос, и разберём его вместе.\n\n\
/topic <тема> - выбрать тему\n/progress - мой прогресс\n\
/model - выбрать модель\n/reset - начать новый диалог";

const MODEL_FAILURE: &str = "⚠️ Модель сейчас не отвечает. Попробуй ещё раз, \
выбери другую модель через /model или начни новый диалог через /reset.";

const STORAGE_FAILURE: &str = "⚠️ Не получилось сохранить историю диалога. \
Попробуй ещё раз чуть позже или начни новый диалог через /reset.";

/// Default system instruction for the given house style.
pub fn default_system_prompt(mode: FormatMode) -> &'static str {
    match mode {
        FormatMode::Convert => {
            "Ты — опытный репетитор по информатике (ЕГЭ). \
             Отвечай структурировано. Используй заголовки и списки. \
             Не давай решение сразу, задавай наводящие вопросы."
        }
        FormatMode::Strip => {
            "Ты — опытный репетитор по информатике (ЕГЭ). \
             Пиши простым текстом без Markdown, HTML и заголовков. \
             Не давай решение сразу, задавай наводящие вопросы."
        }
    }
}

/// Why a tutoring turn produced no answer.
#[derive(Debug)]
pub enum TurnError {
    Storage(StorageError),
    Model(ModelError),
}

impl TurnError {
    /// Text shown to the student. Never includes error details.
    pub fn user_message(&self) -> &'static str {
        match self {
            TurnError::Storage(_) => STORAGE_FAILURE,
            TurnError::Model(_) => MODEL_FAILURE,
        }
    }
}

impl fmt::Display for TurnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurnError::Storage(e) => write!(f, "{e}"),
            TurnError::Model(e) => write!(f, "model call failed: {e}"),
        }
    }
}

impl std::error::Error for TurnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TurnError::Storage(e) => Some(e),
            TurnError::Model(e) => Some(e),
        }
    }
}

impl From<StorageError> for TurnError {
    fn from(e: StorageError) -> Self {
        TurnError::Storage(e)
    }
}

impl From<ModelError> for TurnError {
    fn from(e: ModelError) -> Self {
        TurnError::Model(e)
    }
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct TutorSettings {
    pub system_prompt: String,
    /// Turns sent to the model per call.
    pub context_messages: usize,
    pub model_timeout: Duration,
}

impl Default for TutorSettings {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(FormatMode::default()).to_string(),
            context_messages: DEFAULT_CONTEXT_MESSAGES,
            model_timeout: Duration::from_secs(60),
        }
    }
}

/// The tutor engine.
pub struct TutorEngine {
    store: ConversationStore,
    sanitizer: Sanitizer,
    backends: Backends,
    settings: TutorSettings,
}

impl TutorEngine {
    pub fn new(
        store: ConversationStore,
        sanitizer: Sanitizer,
        backends: Backends,
        settings: TutorSettings,
    ) -> Self {
        Self {
            store,
            sanitizer,
            backends,
            settings,
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Answer a student's message, turning failures into an apology.
    pub async fn handle_text(&self, user_id: &str, text: &str) -> Rendered {
        match self.answer(user_id, text).await {
            Ok(rendered) => rendered,
            Err(e) => {
                error!("Turn failed for user {}: {}", user_id, e);
                Rendered::plain(e.user_message())
            }
        }
    }

    /// Record the question, ask the model, record and return the answer.
    ///
    /// On a model failure the question stays in the history and no
    /// assistant turn is added.
    pub async fn answer(&self, user_id: &str, text: &str) -> Result<Rendered, TurnError> {
        let record = self.store.append_turn(user_id, Role::User, text).await?;
        let window = record.context_window(self.settings.context_messages);

        let (model_id, backend) = self
            .backends
            .resolve(record.current_model.as_deref())
            .ok_or(ModelError::NoBackend)?;
        if record.current_model.as_deref().is_some_and(|m| m != model_id) {
            warn!("User {} selected unknown model, using {}", user_id, model_id);
        }

        info!("🤖 Asking {} for user {} ({} turns)", model_id, user_id, window.len());
        let raw = tokio::time::timeout(
            self.settings.model_timeout,
            backend.complete(&self.settings.system_prompt, &window),
        )
        .await
        .map_err(|_| ModelError::Timeout(self.settings.model_timeout))??;

        let rendered = self.sanitizer.render(&raw);
        if rendered.plain.is_empty() {
            return Err(ModelError::Empty.into());
        }

        // The answer is already produced; failing to record it must not lose it.
        if let Err(e) = self
            .store
            .append_turn(user_id, Role::Assistant, rendered.plain.clone())
            .await
        {
            error!("Failed to record answer for user {}: {}", user_id, e);
        }

        Ok(rendered)
    }

    /// Make sure the student has a record and remember their name.
    pub async fn start(&self, user_id: &str, name: Option<&str>) -> Result<&'static str, StorageError> {
        let name = name.map(str::to_string);
        self.store
            .update(user_id, |record| {
                if record.name.is_none() {
                    record.name = name;
                }
            })
            .await?;
        Ok(GREETING)
    }

    pub async fn reset(&self, user_id: &str) -> Result<(), StorageError> {
        self.store.reset_history(user_id).await
    }

    /// Switch the student's model. Returns `false` for an unknown id.
    pub async fn select_model(&self, user_id: &str, model_id: &str) -> Result<bool, StorageError> {
        if !self.backends.contains(model_id) {
            return Ok(false);
        }
        let model = model_id.to_string();
        self.store
            .update(user_id, |record| record.current_model = Some(model))
            .await?;
        info!("User {} switched to {}", user_id, model_id);
        Ok(true)
    }

    /// Available models, marking the student's current one.
    pub async fn models_overview(&self, user_id: &str) -> Result<String, StorageError> {
        let record = self.store.load(user_id).await?;
        let current = self
            .backends
            .resolve(record.current_model.as_deref())
            .map(|(id, _)| id);

        let mut text = String::from("Доступные модели:");
        for id in self.backends.model_ids() {
            let marker = if Some(id) == current { "✅" } else { "▫️" };
            text.push_str(&format!("\n{marker} {id}"));
        }
        text.push_str("\n\nВыбрать: /model <название>");
        Ok(text)
    }

    /// Switch topic. The previous topic counts as completed and the model is
    /// told about the switch through a system turn.
    pub async fn set_topic(&self, user_id: &str, topic: &str) -> Result<(), StorageError> {
        let topic = topic.trim().to_string();
        self.store
            .update(user_id, |record| {
                let progress = &mut record.learning_progress;
                let previous = std::mem::replace(&mut progress.current_topic, topic.clone());
                if previous != NO_TOPIC && previous != topic {
                    progress.completed_topics.insert(previous);
                }
                record.push_turn(Role::System, format!("Ученик выбрал тему: {topic}"));
            })
            .await
    }

    /// Human-readable summary of the student's progress.
    pub async fn progress(&self, user_id: &str) -> Result<String, StorageError> {
        let record = self.store.load(user_id).await?;
        let progress = &record.learning_progress;

        let mut text = format!("📉 Текущая тема: {}", progress.current_topic);
        if progress.completed_topics.is_empty() {
            text.push_str("\nПройденных тем пока нет.");
        } else {
            text.push_str("\nПройдено:");
            for topic in &progress.completed_topics {
                text.push_str(&format!("\n• {topic}"));
            }
        }
        if !progress.common_mistakes.is_empty() {
            text.push_str("\nЧастые ошибки:");
            for mistake in &progress.common_mistakes {
                text.push_str(&format!("\n• {mistake}"));
            }
        }
        text.push_str(&format!(
            "\nСообщений в истории: {}",
            record.conversation_history.len()
        ));
        Ok(text)
    }
}
