use std::pin::Pin;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use argus_common::args::ModelArgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
}

/// One conversation entry in the model API's own shape: `content` is either
/// a plain string or an array of content blocks (text, tool_use,
/// tool_result).
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: Value,
}

impl ChatMessage {
    pub fn user_text(text: &str) -> Self {
        Self {
            role: ChatRole::User,
            content: Value::String(text.to_string()),
        }
    }

    pub fn assistant_blocks(blocks: Vec<Value>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: Value::Array(blocks),
        }
    }

    pub fn tool_result(call_id: &str, content: &str, is_error: bool) -> Self {
        Self {
            role: ChatRole::User,
            content: json!([{
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": content,
                "is_error": is_error,
            }]),
        }
    }
}

/// A tool as presented to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelTool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub enum ModelEvent {
    TextDelta(String),
    /// Arguments fully assembled; emitted when the tool_use block closes.
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    Done,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model API key not configured")]
    NoApiKey,

    #[error("model request failed: {0}")]
    Request(String),

    #[error("model API status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed model stream: {0}")]
    Decode(String),
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelEvent, ModelError>> + Send>>;

/// Boundary to model inference. The orchestrator only ever sees this trait.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn stream(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ModelTool],
    ) -> Result<ModelStream, ModelError>;
}

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic-messages streaming client.
pub struct AnthropicClient {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
}

impl AnthropicClient {
    pub fn new(args: &ModelArgs) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: args.model_api_url.clone(),
            api_key: args.model_api_key.clone(),
            model: args.model_name.clone(),
            max_tokens: args.model_max_tokens,
        }
    }
}

/// Server-sent events from the messages API, narrowed to what we consume.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamingEvent {
    ContentBlockStart {
        content_block: ContentBlockStart,
    },
    ContentBlockDelta {
        delta: Delta,
    },
    ContentBlockStop {},
    MessageStop,
    #[serde(other)]
    Ignored,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlockStart {
    Text {},
    ToolUse { id: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
}

#[async_trait]
impl ModelClient for AnthropicClient {
    async fn stream(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ModelTool],
    ) -> Result<ModelStream, ModelError> {
        let Some(api_key) = self.api_key.clone() else {
            return Err(ModelError::NoApiKey);
        };

        let mut body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": messages,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = Value::String(system.to_string());
        }
        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)
                .map_err(|e| ModelError::Decode(e.to_string()))?;
        }

        let mut api_key_header = reqwest::header::HeaderValue::try_from(api_key)
            .map_err(|_| ModelError::Request("invalid API key characters".into()))?;
        api_key_header.set_sensitive(true);

        let response = self
            .client
            .post(&self.url)
            .header("x-api-key", api_key_header)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(ModelError::Api { status, message });
        }

        let stream = try_stream! {
            use futures::StreamExt;

            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();
            let mut tool_id = String::new();
            let mut tool_name = String::new();
            let mut tool_json = String::new();

            while let Some(chunk) = bytes_stream.next().await {
                let chunk = chunk.map_err(|e| ModelError::Request(e.to_string()))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                // SSE events are separated by a blank line.
                while let Some(event_end) = buffer.find("\n\n") {
                    let event_data = buffer[..event_end].to_string();
                    buffer = buffer[event_end + 2..].to_string();

                    for line in event_data.lines() {
                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        let Ok(event) = serde_json::from_str::<StreamingEvent>(data) else {
                            continue;
                        };
                        match event {
                            StreamingEvent::ContentBlockStart { content_block } => {
                                if let ContentBlockStart::ToolUse { id, name } = content_block {
                                    tool_id = id;
                                    tool_name = name;
                                    tool_json.clear();
                                }
                            }
                            StreamingEvent::ContentBlockDelta { delta } => match delta {
                                Delta::TextDelta { text } => {
                                    yield ModelEvent::TextDelta(text);
                                }
                                Delta::InputJsonDelta { partial_json } => {
                                    tool_json.push_str(&partial_json);
                                }
                            },
                            StreamingEvent::ContentBlockStop {} => {
                                if !tool_id.is_empty() {
                                    let input = if tool_json.trim().is_empty() {
                                        json!({})
                                    } else {
                                        serde_json::from_str(&tool_json).map_err(|e| {
                                            ModelError::Decode(format!(
                                                "tool arguments are not valid JSON: {e}"
                                            ))
                                        })?
                                    };
                                    yield ModelEvent::ToolCall {
                                        id: std::mem::take(&mut tool_id),
                                        name: std::mem::take(&mut tool_name),
                                        input,
                                    };
                                }
                            }
                            StreamingEvent::MessageStop => {
                                yield ModelEvent::Done;
                            }
                            StreamingEvent::Ignored => {}
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
