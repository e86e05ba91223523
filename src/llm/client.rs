//! Chat completions client.
//!
//! Sends a single user message per call and asks the provider for a JSON
//! object response, the way all three roles talk to the model.

use crate::llm::json::extract_json;
use crate::llm::prompt_log::PromptLog;
use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from the LLM layer.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM client not configured: {0}")]
    NotConfigured(String),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("cannot connect to {0}")]
    Connect(String),

    #[error("API error {status}: {body}")]
    Http { status: u16, body: String },

    #[error("model returned an empty response")]
    EmptyResponse,

    #[error("model response is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl LlmError {
    /// Transport failures, rate limits and server errors are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            LlmError::Timeout(_) | LlmError::Connect(_) | LlmError::Request(_) => true,
            LlmError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// A model that answers a prompt with a JSON value.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Name of the underlying model, for reports.
    fn model_name(&self) -> &str;

    /// Send `prompt` and parse the reply as JSON.
    ///
    /// `prompt_name` identifies the caller in logs.
    async fn complete_json(&self, prompt_name: &str, prompt: &str) -> Result<Value, LlmError>;
}

/// Configuration for [`LlmClient`].
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub temperature: f32,
    pub timeout_seconds: u64,
    pub retries: usize,
    /// Show a spinner while waiting for the model
    pub show_progress: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://dashscope.aliyuncs.com/compatible-mode/v1".to_string(),
            api_key: String::new(),
            model_name: "qwen3-max".to_string(),
            temperature: 0.0,
            timeout_seconds: 120,
            retries: 2,
            show_progress: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    response_format: ResponseFormat,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// HTTP client for OpenAI-compatible endpoints.
pub struct LlmClient {
    config: LlmConfig,
    http_client: reqwest::Client,
    prompt_log: Option<PromptLog>,
}

impl LlmClient {
    /// Create a new client. Fails if the API key is empty.
    pub fn new(config: LlmConfig, prompt_log: Option<PromptLog>) -> Result<Self, LlmError> {
        if config.api_key.is_empty() {
            return Err(LlmError::NotConfigured("an API key is required".to_string()));
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| LlmError::Request(e.to_string()))?;

        info!(
            "LLM client ready: model {} at {}",
            config.model_name, config.base_url
        );

        Ok(Self {
            config,
            http_client,
            prompt_log,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }

    fn spinner(&self, prompt_name: &str) -> Option<ProgressBar> {
        if !self.config.show_progress {
            return None;
        }
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg} [{elapsed}]") {
            pb.set_style(style);
        }
        pb.set_message(format!("Waiting for {} ({})", self.config.model_name, prompt_name));
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    }

    /// One HTTP round trip, returning the raw message content.
    async fn send_once(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatCompletionRequest {
            model: &self.config.model_name,
            messages: vec![RequestMessage {
                role: "user",
                content: prompt,
            }],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
            temperature: self.config.temperature,
        };

        let response = self
            .http_client
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.config.timeout_seconds)
                } else if e.is_connect() {
                    LlmError::Connect(self.config.base_url.clone())
                } else {
                    LlmError::Request(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Http { status, body });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Request(format!("failed to decode response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(LlmError::EmptyResponse)
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn complete_json(&self, prompt_name: &str, prompt: &str) -> Result<Value, LlmError> {
        if let Some(ref log) = self.prompt_log {
            log.record(prompt_name, prompt);
        }
        debug!("Sending {} prompt ({} chars)", prompt_name, prompt.len());

        let spinner = self.spinner(prompt_name);
        let mut attempt = 0;
        let result = loop {
            match self.send_once(prompt).await {
                Ok(content) => break Ok(content),
                Err(e) if e.is_retryable() && attempt < self.config.retries => {
                    attempt += 1;
                    warn!(
                        "{} request failed ({}), retrying {}/{}",
                        prompt_name, e, attempt, self.config.retries
                    );
                    tokio::time::sleep(Duration::from_secs(2 * attempt as u64)).await;
                }
                Err(e) => break Err(e),
            }
        };
        if let Some(pb) = spinner {
            pb.finish_and_clear();
        }

        let content = result?;
        debug!("{} response: {}", prompt_name, content);

        extract_json(&content).ok_or_else(|| {
            let preview: String = content.chars().take(200).collect();
            LlmError::InvalidJson(preview)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    /// Answer successive connections with `(status, body)` pairs and return
    /// the raw requests received.
    async fn serve(responses: Vec<(u16, String)>) -> (String, JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v1", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let mut requests = Vec::new();
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                requests.push(read_request(&mut socket).await);
                let reply = format!(
                    "HTTP/1.1 {} Canned\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                socket.shutdown().await.unwrap();
            }
            requests
        });
        (base_url, handle)
    }

    async fn read_request(socket: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if text.len() >= end + 4 + length {
                    return text;
                }
            }
        }
        String::from_utf8_lossy(&buf).to_string()
    }

    fn completion(content: &str) -> String {
        serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": content}}]
        })
        .to_string()
    }

    fn client_for(base_url: String, retries: usize) -> LlmClient {
        let config = LlmConfig {
            base_url,
            api_key: "sk-test".to_string(),
            timeout_seconds: 10,
            retries,
            ..LlmConfig::default()
        };
        LlmClient::new(config, None).unwrap()
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let (base_url, server) = serve(vec![
            (503, "busy".to_string()),
            (200, completion("{\"plan\": []}")),
        ])
        .await;
        let client = client_for(base_url, 1);

        let value = client.complete_json("planner", "make a plan").await.unwrap();

        assert_eq!(value, serde_json::json!({"plan": []}));
        let requests = server.await.unwrap();
        assert_eq!(requests.len(), 2);
        let first = requests[0].to_ascii_lowercase();
        assert!(first.starts_with("post /v1/chat/completions "));
        assert!(first.contains("authorization: bearer sk-test"));
        assert!(requests[0].contains("\"json_object\""));
        assert!(requests[0].contains("make a plan"));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let (base_url, server) =
            serve(vec![(400, "{\"error\": \"bad request\"}".to_string())]).await;
        let client = client_for(base_url, 2);

        let result = client.complete_json("worker", "p").await;

        match result {
            Err(LlmError::Http { status, body }) => {
                assert_eq!(status, 400);
                assert!(body.contains("bad request"));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fenced_reply_is_extracted() {
        let (base_url, server) = serve(vec![(
            200,
            completion("Here you go:\n```json\n{\"satisfied\": true, \"answer\": \"42\"}\n```"),
        )])
        .await;
        let client = client_for(base_url, 0);

        let value = client.complete_json("evaluation", "p").await.unwrap();

        assert_eq!(value["satisfied"], true);
        assert_eq!(value["answer"], "42");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_prose_reply_is_invalid_json() {
        let (base_url, server) = serve(vec![(200, completion("I cannot help with that."))]).await;
        let client = client_for(base_url, 2);

        let result = client.complete_json("worker", "p").await;

        assert!(matches!(result, Err(LlmError::InvalidJson(ref preview)) if preview.contains("cannot help")));
        assert_eq!(server.await.unwrap().len(), 1);
    }

    #[test]
    fn test_client_requires_api_key() {
        let result = LlmClient::new(LlmConfig::default(), None);
        assert!(matches!(result, Err(LlmError::NotConfigured(_))));
    }

    #[test]
    fn test_endpoint_trims_trailing_slash() {
        let config = LlmConfig {
            base_url: "https://api.example.com/v1/".to_string(),
            api_key: "sk-test".to_string(),
            ..LlmConfig::default()
        };
        let client = LlmClient::new(config, None).unwrap();
        assert_eq!(client.endpoint(), "https://api.example.com/v1/chat/completions");
        assert_eq!(client.model_name(), "qwen3-max");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(LlmError::Timeout(10).is_retryable());
        assert!(LlmError::Http {
            status: 503,
            body: String::new()
        }
        .is_retryable());
        assert!(LlmError::Http {
            status: 429,
            body: String::new()
        }
        .is_retryable());
        assert!(!LlmError::Http {
            status: 401,
            body: String::new()
        }
        .is_retryable());
        assert!(!LlmError::InvalidJson("x".to_string()).is_retryable());
    }

    #[test]
    fn test_request_serialization() {
        let request = ChatCompletionRequest {
            model: "qwen3-max",
            messages: vec![RequestMessage {
                role: "user",
                content: "hi",
            }],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
            temperature: 0.0,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["response_format"]["type"], "json_object");
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_response_deserialization() {
        let body = r#"{"id": "x", "choices": [{"index": 0, "message": {"role": "assistant", "content": "{\"a\": 1}"}}]}"#;
        let response: ChatCompletionResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            response.choices[0].message.content.as_deref(),
            Some("{\"a\": 1}")
        );
    }
}
