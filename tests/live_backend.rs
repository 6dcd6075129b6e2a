//! Live calls against a real completion API.
//!
//! These tests require GROQ_API_KEY in the environment.
//!
//! Run with: cargo test --features integ_test --test live_backend

#[cfg(feature = "integ_test")]
mod tests {
    use tutorbot::tutor::groq::{GROQ_BASE_URL, GroqClient};
    use tutorbot::tutor::memory::{ContextMessage, Role};
    use tutorbot::tutor::{CompletionBackend, Sanitizer};

    fn client() -> Option<GroqClient> {
        let key = std::env::var("GROQ_API_KEY").ok()?;
        Some(GroqClient::new(
            reqwest::Client::new(),
            GROQ_BASE_URL,
            key,
            "llama-3.1-8b-instant".to_string(),
        ))
    }

    #[tokio::test]
    async fn test_groq_answers() {
        let Some(client) = client() else {
            eprintln!("Skipping test: GROQ_API_KEY not set");
            return;
        };

        let messages = vec![ContextMessage {
            role: Role::User,
            content: "Сколько будет 2+2? Ответь одним числом.".to_string(),
        }];
        let answer = client
            .complete("Ты репетитор по математике.", &messages)
            .await
            .expect("completion failed");
        assert!(answer.contains('4'), "unexpected answer: {answer}");
    }

    #[tokio::test]
    async fn test_live_answer_renders() {
        let Some(client) = client() else {
            eprintln!("Skipping test: GROQ_API_KEY not set");
            return;
        };

        let messages = vec![ContextMessage {
            role: Role::User,
            content: "Объясни, что такое бит, в двух предложениях.".to_string(),
        }];
        let answer = client
            .complete("Отвечай структурировано, используй **жирный** текст.", &messages)
            .await
            .expect("completion failed");

        let rendered = Sanitizer::default().render(&answer);
        assert!(!rendered.plain.is_empty());
        assert!(!rendered.plain.contains('*'));
    }
}
