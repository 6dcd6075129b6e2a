//! Anthropic Messages API client.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::tutor::llm::{CompletionBackend, ModelError};
use crate::tutor::memory::{ContextMessage, Role};

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const MAX_TOKENS: u32 = 2048;

pub struct AnthropicClient {
    api_key: String,
    model: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: String,
    messages: Vec<ApiMessage<'a>>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicClient {
    pub fn new(http: reqwest::Client, api_key: String, model: String) -> Self {
        Self { api_key, model, http }
    }

    /// The API has no system role inside `messages`: system turns are folded
    /// into the `system` field, and the conversation must open with a user turn.
    fn build_request<'a>(
        &'a self,
        system_instruction: &str,
        messages: &'a [ContextMessage],
    ) -> ApiRequest<'a> {
        let mut system = system_instruction.to_string();
        for m in messages.iter().filter(|m| m.role == Role::System) {
            system.push_str("\n\n");
            system.push_str(&m.content);
        }

        let api_messages = messages
            .iter()
            .filter(|m| m.role != Role::System)
            .skip_while(|m| m.role != Role::User)
            .map(|m| ApiMessage {
                role: m.role.as_str(),
                content: &m.content,
            })
            .collect();

        ApiRequest {
            model: &self.model,
            max_tokens: MAX_TOKENS,
            system,
            messages: api_messages,
        }
    }
}

fn parse_response(body: &str) -> Result<String, ModelError> {
    let response: ApiResponse =
        serde_json::from_str(body).map_err(|e| ModelError::Parse(e.to_string()))?;

    let text: String = response
        .content
        .into_iter()
        .filter_map(|block| block.text)
        .collect();

    if text.trim().is_empty() {
        Err(ModelError::Empty)
    } else {
        Ok(text)
    }
}

#[async_trait]
impl CompletionBackend for AnthropicClient {
    async fn complete(
        &self,
        system_instruction: &str,
        messages: &[ContextMessage],
    ) -> Result<String, ModelError> {
        let request = self.build_request(system_instruction, messages);

        let response = self
            .http
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
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
