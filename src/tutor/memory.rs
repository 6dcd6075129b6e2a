//! Per-user conversation memory, one JSON file per user.
//!
//! Records are always read and written whole. Every mutation runs as
//! load → mutate → save under a lock owned by that user alone, so two
//! updates for the same user never interleave while different users
//! proceed in parallel.

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt::{self, Write as _};
use std::fs::File;
use std::io::{self, Write as _};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Maximum number of turns retained per user.
pub const MAX_HISTORY: usize = 50;

/// Default number of turns sent to the model.
pub const DEFAULT_CONTEXT_MESSAGES: usize = 10;

/// Topic shown until the student picks one.
pub const NO_TOPIC: &str = "Не выбрана";

/// Errors that can occur while reading or writing user records.
#[derive(Debug)]
pub enum StorageError {
    /// Filesystem failure on read, write or rename.
    Io { path: PathBuf, source: io::Error },
    /// Failed to serialize a record.
    Serialize(serde_json::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "storage I/O error on '{}': {}", path.display(), source)
            }
            Self::Serialize(e) => write!(f, "failed to serialize user record: {}", e),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Serialize(e) => Some(e),
        }
    }
}

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Synthetic instruction injected into the history (topic switch etc).
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    #[serde(default = "now")]
    pub timestamp: NaiveDateTime,
}

/// A turn reduced to what a chat completion API expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

/// Study progress. Unknown keys written by other tools are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearningProgress {
    #[serde(default = "default_topic")]
    pub current_topic: String,
    #[serde(default)]
    pub completed_topics: BTreeSet<String>,
    #[serde(default)]
    pub common_mistakes: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for LearningProgress {
    fn default() -> Self {
        Self {
            current_topic: default_topic(),
            completed_topics: BTreeSet::new(),
            common_mistakes: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Everything persisted for one user.
///
/// Every field has a default so records written by older versions still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "now")]
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub conversation_history: Vec<Turn>,
    #[serde(default)]
    pub learning_progress: LearningProgress,
    #[serde(default)]
    pub current_model: Option<String>,
}

impl UserRecord {
    /// A fresh record with empty history.
    pub fn new(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            name: None,
            created_at: now(),
            conversation_history: Vec::new(),
            learning_progress: LearningProgress::default(),
            current_model: None,
        }
    }

    /// Append a turn stamped with the current time, evicting the oldest
    /// turns beyond [`MAX_HISTORY`].
    pub fn push_turn(&mut self, role: Role, content: impl Into<String>) {
        self.conversation_history.push(Turn {
            role,
            content: content.into(),
            timestamp: now(),
        });
        let len = self.conversation_history.len();
        if len > MAX_HISTORY {
            self.conversation_history.drain(..len - MAX_HISTORY);
        }
    }

    /// The last `max_messages` turns in chronological order, without timestamps.
    pub fn context_window(&self, max_messages: usize) -> Vec<ContextMessage> {
        let start = self.conversation_history.len().saturating_sub(max_messages);
        self.conversation_history[start..]
            .iter()
            .map(|turn| ContextMessage {
                role: turn.role,
                content: turn.content.clone(),
            })
            .collect()
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn default_topic() -> String {
    NO_TOPIC.to_string()
}

/// Durable store of [`UserRecord`]s.
pub struct ConversationStore {
    dir: PathBuf,
    /// Only users with an operation in flight have an entry.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConversationStore {
    /// Open a store rooted at `dir`, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::Io {
            path: dir.clone(),
            source: e,
        })?;
        info!("Conversation store at {:?}", dir);
        Ok(Self {
            dir,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Return the user's record, creating and persisting a fresh one if the
    /// user is new or the stored file is unreadable.
    pub async fn load(&self, user_id: &str) -> Result<UserRecord, StorageError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        self.load_or_create(user_id)
    }

    /// Replace the user's record wholesale.
    pub async fn save(&self, user_id: &str, record: &UserRecord) -> Result<(), StorageError> {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        self.write_record(user_id, record)
    }

    /// Load, apply `f`, save, all under the user's lock.
    pub async fn update<T, F>(&self, user_id: &str, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut UserRecord) -> T,
    {
        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;
        let mut record = self.load_or_create(user_id)?;
        let result = f(&mut record);
        self.write_record(user_id, &record)?;
        Ok(result)
    }

    /// Append one turn and return the updated record.
    pub async fn append_turn(
        &self,
        user_id: &str,
        role: Role,
        content: impl Into<String>,
    ) -> Result<UserRecord, StorageError> {
        let content = content.into();
        self.update(user_id, move |record| {
            record.push_turn(role, content);
            record.clone()
        })
        .await
    }

    /// The last `max_messages` turns as `{role, content}` pairs. Never writes.
    pub fn recent_context(
        &self,
        user_id: &str,
        max_messages: usize,
    ) -> Result<Vec<ContextMessage>, StorageError> {
        Ok(self
            .read_record(user_id)?
            .map(|record| record.context_window(max_messages))
            .unwrap_or_default())
    }

    /// Clear the history, keeping name, progress, model and creation time.
    pub async fn reset_history(&self, user_id: &str) -> Result<(), StorageError> {
        self.update(user_id, |record| record.conversation_history.clear())
            .await?;
        info!("🔄 History reset for user {}", user_id);
        Ok(())
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        // Entries nobody else holds belong to finished operations.
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn record_path(&self, user_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(user_id)))
    }

    fn load_or_create(&self, user_id: &str) -> Result<UserRecord, StorageError> {
        if let Some(record) = self.read_record(user_id)? {
            return Ok(record);
        }
        let record = UserRecord::new(user_id);
        self.write_record(user_id, &record)?;
        debug!("Created record for user {}", user_id);
        Ok(record)
    }

    /// `None` when the file is missing or cannot be parsed.
    fn read_record(&self, user_id: &str) -> Result<Option<UserRecord>, StorageError> {
        let path = self.record_path(user_id);
        let json = match std::fs::read_to_string(&path) {
            Ok(json) => json,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("Record for user {} is not valid UTF-8, starting fresh: {e}", user_id);
                return Ok(None);
            }
            Err(e) => return Err(StorageError::Io { path, source: e }),
        };

        match serde_json::from_str::<UserRecord>(&json) {
            Ok(mut record) => {
                if record.user_id.is_empty() {
                    record.user_id = user_id.to_string();
                }
                Ok(Some(record))
            }
            Err(e) => {
                warn!("Corrupt record for user {} at {:?}, starting fresh: {e}", user_id, path);
                Ok(None)
            }
        }
    }

    fn write_record(&self, user_id: &str, record: &UserRecord) -> Result<(), StorageError> {
        let path = self.record_path(user_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record).map_err(StorageError::Serialize)?;

        let io_err = |source: io::Error| StorageError::Io {
            path: tmp.clone(),
            source,
        };
        let mut file = File::create(&tmp).map_err(io_err)?;
        file.write_all(json.as_bytes()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        std::fs::rename(&tmp, &path).map_err(|e| StorageError::Io {
            path: path.clone(),
            source: e,
        })?;

        debug!(
            "💾 Saved user {} ({} turns)",
            user_id,
            record.conversation_history.len()
        );
        Ok(())
    }
}

/// File stem for a user id. Bytes outside `[A-Za-z0-9_-]` become `~xx`.
fn file_stem(user_id: &str) -> String {
    let mut stem = String::with_capacity(user_id.len() + 5);
    stem.push_str("user_");
    for b in user_id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' {
            stem.push(b as char);
        } else {
            let _ = write!(stem, "~{b:02x}");
        }
    }
    stem
}
