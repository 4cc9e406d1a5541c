//! Runs the chat turn against a Messages-style streaming HTTP API and
//! re-emits its SSE event stream as ordered `delta` chunks.

use crate::sse::SseParser;
use crate::{ChatBackend, ChatRequest, ChunkEmitter};
use agent_proto::{ChunkType, CommandResult};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};

const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
const MAX_TOKENS: u32 = 8192;

pub struct RemoteApiBackend {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl RemoteApiBackend {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: api_url.into(),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    fn build_body(&self, request: &ChatRequest) -> Value {
        let mut messages: Vec<Value> = request
            .history
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();
        messages.push(json!({"role": "user", "content": request.message}));

        let mut body = json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "stream": true,
            "messages": messages,
        });
        if let Some(system) = &request.system {
            body["system"] = json!(system);
        }
        body
    }
}

#[async_trait]
impl ChatBackend for RemoteApiBackend {
    async fn run(&self, request: &ChatRequest, emitter: &ChunkEmitter<'_>) -> CommandResult {
        let body = self.build_body(request);

        let response = match self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                let message = format!("Failed to reach chat API: {e}");
                emitter.emit(ChunkType::Error, message.clone()).await;
                return CommandResult::failure(message);
            }
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            let message = format!("Chat API returned {status}: {text}");
            emitter.emit(ChunkType::Error, message.clone()).await;
            return CommandResult::failure(message);
        }

        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();
        let mut text = String::new();
        let mut input_tokens: u64 = 0;
        let mut output_tokens: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let message = format!("Chat stream interrupted: {e}");
                    emitter.emit(ChunkType::Error, message.clone()).await;
                    return CommandResult::failure(message);
                }
            };
            let chunk_str = String::from_utf8_lossy(&chunk);
            for payload in parser.feed(&chunk_str) {
                if payload == "[DONE]" {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(&payload) else {
                    continue;
                };
                match event.get("type").and_then(|v| v.as_str()) {
                    Some("content_block_delta") => {
                        if let Some(delta) = event.get("delta").and_then(|d| d.get("text")).and_then(|v| v.as_str()) {
                            text.push_str(delta);
                            emitter.emit(ChunkType::Delta, delta).await;
                        }
                    }
                    Some("message_start") => {
                        if let Some(usage) = event.get("message").and_then(|m| m.get("usage")) {
                            input_tokens = usage.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
                        }
                    }
                    Some("message_delta") => {
                        if let Some(usage) = event.get("usage") {
                            output_tokens = usage.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(output_tokens);
                        }
                    }
                    Some("content_block_start") => {
                        if event.get("content_block").and_then(|b| b.get("type")).and_then(|v| v.as_str()) == Some("tool_use") {
                            emitter.emit(ChunkType::Delta, "[tool use is not supported in this mode]").await;
                        }
                    }
                    _ => {}
                }
            }
        }

        let data = json!({
            "text": text,
            "usage": {
                "totalInputTokens": input_tokens,
                "totalOutputTokens": output_tokens,
                "totalTokens": input_tokens + output_tokens,
            }
        });
        emitter.emit(ChunkType::Done, data.to_string()).await;
        CommandResult::success(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_body_includes_history_and_system() {
        let backend = RemoteApiBackend::new("https://api.example.com/v1/messages", "key");
        let request = ChatRequest {
            message: "hello".to_string(),
            system: Some("be terse".to_string()),
            history: vec![crate::HistoryMessage { role: "user".to_string(), content: "prior".to_string() }],
            ..Default::default()
        };
        let body = backend.build_body(&request);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["system"], json!("be terse"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
        assert_eq!(body["messages"][1]["content"], json!("hello"));
    }
}
