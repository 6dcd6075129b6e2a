//! OpenAI-compatible chat completions client (Groq by default).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tutor::llm::{CompletionBackend, ModelError};
use crate::tutor::memory::ContextMessage;

pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

const TEMPERATURE: f32 = 0.7;

pub struct GroqClient {
    api_key: String,
    model: String,
    url: String,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

impl GroqClient {
    pub fn new(http: reqwest::Client, base_url: &str, api_key: String, model: String) -> Self {
        Self {
            api_key,
            model,
            url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            http,
        }
    }

    fn build_request<'a>(
        &'a self,
        system_instruction: &'a str,
        messages: &'a [ContextMessage],
    ) -> ApiRequest<'a> {
        let mut api_messages = Vec::with_capacity(messages.len() + 1);
        api_messages.push(ApiMessage {
            role: "system",
            content: system_instruction,
        });
        api_messages.extend(messages.iter().map(|m| ApiMessage {
            role: m.role.as_str(),
            content: &m.content,
        }));

        ApiRequest {
            model: &self.model,
            messages: api_messages,
            temperature: TEMPERATURE,
        }
    }
}

fn parse_response(body: &str) -> Result<String, ModelError> {
    let response: ApiResponse =
        serde_json::from_str(body).map_err(|e| ModelError::Parse(e.to_string()))?;

    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|text| !text.trim().is_empty())
        .ok_or(ModelError::Empty)
}

#[async_trait]
impl CompletionBackend for GroqClient {
    async fn complete(
        &self,
        system_instruction: &str,
        messages: &[ContextMessage],
    ) -> Result<String, ModelError> {
        let request = self.build_request(system_instruction, messages);

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| ModelError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ModelError::Http(e.to_string()))?;
        debug!("{} responded {status}", self.model);

        if !status.is_success() {
            return Err(ModelError::Api(format!("{status}: {body}")));
        }

        parse_response(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tutor::memory::Role;

    fn client() -> GroqClient {
        GroqClient::new(
            reqwest::Client::new(),
            "https://example.test/v1/",
            "key".to_string(),
            "llama-3.3-70b-versatile".to_string(),
        )
    }

    #[test]
    fn test_url_joins_base() {
        assert_eq!(client().url, "https://example.test/v1/chat/completions");
    }

    #[test]
    fn test_request_prepends_system_instruction() {
        let client = client();
        let messages = vec![
            ContextMessage { role: Role::User, content: "2+2?".to_string() },
            ContextMessage { role: Role::System, content: "тема: арифметика".to_string() },
        ];
        let request = client.build_request("Ты репетитор", &messages);
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["model"], "llama-3.3-70b-versatile");
        assert_eq!(
            json["messages"],
            serde_json::json!([
                {"role": "system", "content": "Ты репетитор"},
                {"role": "user", "content": "2+2?"},
                {"role": "system", "content": "тема: арифметика"}
            ])
        );
    }

    #[test]
    fn test_parse_response() {
        let body = r#"{"choices": [{"message": {"role": "assistant", "content": "4"}}]}"#;
        assert_eq!(parse_response(body).unwrap(), "4");
    }

    #[test]
    fn test_parse_empty_choices() {
        assert!(matches!(parse_response(r#"{"choices": []}"#), Err(ModelError::Empty)));
        let blank = r#"{"choices": [{"message": {"content": "  "}}]}"#;
        assert!(matches!(parse_response(blank), Err(ModelError::Empty)));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(parse_response("<html>"), Err(ModelError::Parse(_))));
    }
}
