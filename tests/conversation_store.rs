//! Concurrency tests for the conversation store.
//!
//! Appends for one user must never lose updates; appends for different
//! users must not interfere.

use std::collections::HashSet;
use std::sync::Arc;

use tempfile::TempDir;
use tutorbot::tutor::memory::{ConversationStore, MAX_HISTORY, Role};

fn store() -> (TempDir, Arc<ConversationStore>) {
    let dir = TempDir::new().unwrap();
    let store = ConversationStore::open(dir.path()).unwrap();
    (dir, Arc::new(store))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_same_user_lose_nothing() {
    let (_dir, store) = store();

    let tasks: Vec<_> = (0..40)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store.append_turn("42", Role::User, format!("m{i}")).await.unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let record = store.load("42").await.unwrap();
    assert_eq!(record.conversation_history.len(), 40);
    let seen: HashSet<_> = record
        .conversation_history
        .iter()
        .map(|t| t.content.clone())
        .collect();
    assert_eq!(seen.len(), 40);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_respect_retention() {
    let (_dir, store) = store();

    let tasks: Vec<_> = (0..80)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move {
                store.append_turn("7", Role::Assistant, format!("a{i}")).await.unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    let record = store.load("7").await.unwrap();
    assert_eq!(record.conversation_history.len(), MAX_HISTORY);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_users_are_independent() {
    let (_dir, store) = store();

    let tasks: Vec<_> = (0..8)
        .flat_map(|user| (0..10).map(move |i| (user, i)))
        .map(|(user, i)| {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .append_turn(&user.to_string(), Role::User, format!("u{user} m{i}"))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    for user in 0..8 {
        let record = store.load(&user.to_string()).await.unwrap();
        assert_eq!(record.user_id, user.to_string());
        assert_eq!(record.conversation_history.len(), 10);
        assert!(record
            .conversation_history
            .iter()
            .all(|t| t.content.starts_with(&format!("u{user} "))));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reset_during_appends_leaves_consistent_record() {
    let (_dir, store) = store();
    store
        .update("1", |r| r.current_model = Some("llama-3.3-70b-versatile".to_string()))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            if i == 10 {
                store.reset_history("1").await.unwrap();
            } else {
                store.append_turn("1", Role::User, format!("m{i}")).await.unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let record = store.load("1").await.unwrap();
    assert!(record.conversation_history.len() < 20);
    assert_eq!(
        record.current_model.as_deref(),
        Some("llama-3.3-70b-versatile")
    );
    // Every file on disk is a complete record.
    for entry in std::fs::read_dir(store.dir()).unwrap() {
        let path = entry.unwrap().path();
        assert_eq!(path.extension().and_then(|e| e.to_str()), Some("json"));
    }
}
