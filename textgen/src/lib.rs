//! Minimal client for OpenAI-compatible chat completion APIs.
//!
//! This crate provides a focused client for `/chat/completions` endpoints
//! (OpenAI, Ollama, vLLM, and most self-hosted gateways) with:
//! - Non-streaming and streaming completions
//! - Optional bearer-token authentication
//! - Proper SSE parsing for streaming responses

use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;

const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";
const DEFAULT_MODEL: &str = "llama3.1";

const ENV_BASE_URL: &str = "TEXTGEN_BASE_URL";
const ENV_API_KEY: &str = "TEXTGEN_API_KEY";
const ENV_MODEL: &str = "TEXTGEN_MODEL";

/// Errors that can occur when using the client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Client for an OpenAI-compatible completion endpoint.
#[derive(Clone)]
pub struct TextGen {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl TextGen {
    /// Create a new client pointed at the given base URL (e.g. `https://api.openai.com/v1`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .connect_timeout(std::time::Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
        }
    }

    /// Create a client from `TEXTGEN_BASE_URL`, `TEXTGEN_API_KEY`, and
    /// `TEXTGEN_MODEL`. Unset variables fall back to local defaults.
    pub fn from_env() -> Result<Self, Error> {
        let base_url =
            std::env::var(ENV_BASE_URL).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        if base_url.trim().is_empty() {
            return Err(Error::Config(format!("{ENV_BASE_URL} is set but empty")));
        }
        let mut client = Self::new(base_url);
        if let Ok(key) = std::env::var(ENV_API_KEY) {
            if !key.trim().is_empty() {
                client = client.with_api_key(key);
            }
        }
        if let Ok(model) = std::env::var(ENV_MODEL) {
            if !model.trim().is_empty() {
                client = client.with_model(model);
            }
        }
        Ok(client)
    }

    /// Set the bearer token sent with every request.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set the default model for this client.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// The default model requests will use unless they override it.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether the client has a usable endpoint configured.
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.model.trim().is_empty()
    }

    /// Send a completion request and return the full response.
    pub async fn complete(&self, request: Request) -> Result<Response, Error> {
        let api_request = self.build_api_request(&request, false);
        let headers = self.build_headers()?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .headers(headers)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        parse_response(api_response)
    }

    /// Send a completion request and stream the response.
    pub async fn stream(
        &self,
        request: Request,
    ) -> Result<Pin<Box<dyn Stream<Item = Result<StreamEvent, Error>> + Send>>, Error> {
        let api_request = self.build_api_request(&request, true);
        let headers = self.build_headers()?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .headers(headers)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        // Use scan to maintain a buffer for incomplete SSE events across chunks
        let stream = response
            .bytes_stream()
            .scan(String::new(), |buffer, result| {
                let events = match result {
                    Ok(bytes) => {
                        buffer.push_str(&String::from_utf8_lossy(&bytes));
                        parse_sse_events_buffered(buffer)
                    }
                    Err(e) => vec![Err(Error::Network(e.to_string()))],
                };
                futures::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(stream))
    }

    fn build_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = &self.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {key}"))
                    .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
            );
        }
        Ok(headers)
    }

    fn build_api_request(&self, request: &Request, stream: bool) -> ApiRequest {
        // OpenAI-compatible APIs take the system prompt as the first message.
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(ApiMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().map(|m| ApiMessage {
            role: m.role.as_str().to_string(),
            content: m.content.clone(),
        }));

        ApiRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stop: request.stop.clone(),
            stream,
        }
    }
}

// ============================================================================
// Public types
// ============================================================================

/// A completion request.
#[derive(Debug, Clone)]
pub struct Request {
    pub model: Option<String>,
    pub max_tokens: Option<usize>,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub stop: Option<Vec<String>>,
}

impl Request {
    /// Create a new request with the given messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            max_tokens: Some(4096),
            system: None,
            messages,
            temperature: None,
            stop: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_stop(mut self, stop: Vec<String>) -> Self {
        self.stop = Some(stop);
        self
    }
}

/// A message in the conversation.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a user message.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create an assistant message.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }

    /// Create a system message.
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
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

/// A completion response.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: String,
    pub model: String,
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

impl FinishReason {
    fn parse(reason: &str) -> Self {
        match reason {
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

/// Token usage information.
#[derive(Debug, Clone, Default)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

// ============================================================================
// Streaming types
// ============================================================================

/// Events from a streaming response.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta { text: String },
    Finished { reason: FinishReason },
    Error { message: String },
    Done,
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    #[serde(default)]
    prompt_tokens: usize,
    #[serde(default)]
    completion_tokens: usize,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChunk {
    choices: Vec<ApiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct ApiStreamChoice {
    #[serde(default)]
    delta: ApiStreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiStreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorEnvelope {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

fn parse_response(api_response: ApiResponse) -> Result<Response, Error> {
    let choice = api_response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| Error::Parse("response contained no choices".to_string()))?;

    let finish_reason = choice
        .finish_reason
        .as_deref()
        .map(FinishReason::parse)
        .unwrap_or(FinishReason::Stop);

    let usage = api_response
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        })
        .unwrap_or_default();

    Ok(Response {
        id: api_response.id,
        model: api_response.model,
        content: choice.message.content.unwrap_or_default(),
        finish_reason,
        usage,
    })
}

/// Parse SSE events from a buffer, consuming complete events and leaving incomplete data.
///
/// SSE events are separated by newlines. This function finds complete `data:`
/// lines, parses them, and removes them from the buffer, leaving any
/// incomplete event data for the next chunk.
fn parse_sse_events_buffered(buffer: &mut String) -> Vec<Result<StreamEvent, Error>> {
    let mut events = Vec::new();

    loop {
        // Find the next complete line (ending with \n)
        let Some(newline_pos) = buffer.find('\n') else {
            // No complete line yet, wait for more data
            break;
        };

        let line = buffer[..newline_pos].trim_end_matches('\r');

        if let Some(json_str) = line.strip_prefix("data: ") {
            if json_str == "[DONE]" {
                events.push(Ok(StreamEvent::Done));
            } else if !json_str.is_empty() {
                // A newline-terminated data line is a complete SSE frame, so
                // unparseable JSON here is an error, not a partial read.
                match serde_json::from_str::<ApiStreamChunk>(json_str) {
                    Ok(chunk) => events.extend(convert_stream_chunk(chunk).into_iter().map(Ok)),
                    Err(e) => {
                        if let Ok(envelope) = serde_json::from_str::<ApiErrorEnvelope>(json_str) {
                            events.push(Ok(StreamEvent::Error {
                                message: envelope.error.message,
                            }));
                        } else {
                            events.push(Err(Error::Parse(format!("SSE parse error: {e}"))));
                        }
                    }
                }
            }
        }
        // Skip event: lines, empty lines, and other SSE metadata

        // Consume the processed line (including the newline)
        buffer.drain(..=newline_pos);
    }

    events
}

fn convert_stream_chunk(chunk: ApiStreamChunk) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                events.push(StreamEvent::TextDelta { text });
            }
        }
        if let Some(reason) = choice.finish_reason {
            events.push(StreamEvent::Finished {
                reason: FinishReason::parse(&reason),
            });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = TextGen::new("http://localhost:8080/v1/");
        assert_eq!(client.base_url, "http://localhost:8080/v1");
        assert_eq!(client.model, DEFAULT_MODEL);
        assert!(client.is_configured());
    }

    #[test]
    fn test_client_with_model() {
        let client = TextGen::new(DEFAULT_BASE_URL).with_model("mistral-nemo");
        assert_eq!(client.model(), "mistral-nemo");
    }

    #[test]
    fn test_request_builder() {
        let request = Request::new(vec![Message::user("Hello")])
            .with_system("You are a storyteller")
            .with_max_tokens(1000)
            .with_temperature(0.7);

        assert_eq!(request.max_tokens, Some(1000));
        assert!(request.system.is_some());
        assert_eq!(request.temperature, Some(0.7));
    }

    #[test]
    fn test_message_creation() {
        let user_msg = Message::user("Hello");
        assert!(matches!(user_msg.role, Role::User));

        let assistant_msg = Message::assistant("Hi there");
        assert!(matches!(assistant_msg.role, Role::Assistant));
    }

    #[test]
    fn test_system_prompt_becomes_first_message() {
        let client = TextGen::new(DEFAULT_BASE_URL);
        let request = Request::new(vec![Message::user("Hi")]).with_system("Narrate");
        let api = client.build_api_request(&request, false);
        assert_eq!(api.messages[0].role, "system");
        assert_eq!(api.messages[1].role, "user");
    }

    #[test]
    fn test_parse_complete_data_line() {
        let mut buffer =
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hello\"}}]}\n\n".to_string();
        let events = parse_sse_events_buffered(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(
            matches!(&events[0], Ok(StreamEvent::TextDelta { text }) if text == "Hello")
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_parse_waits_for_incomplete_json() {
        let mut buffer = "data: {\"choices\":[{\"delta\":{\"con".to_string();
        let events = parse_sse_events_buffered(&mut buffer);
        assert!(events.is_empty());
        assert!(!buffer.is_empty());

        buffer.push_str("tent\":\"Hi\"}}]}\n");
        let events = parse_sse_events_buffered(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Ok(StreamEvent::TextDelta { text }) if text == "Hi"));
    }

    #[test]
    fn test_parse_done_marker() {
        let mut buffer = "data: [DONE]\n".to_string();
        let events = parse_sse_events_buffered(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Ok(StreamEvent::Done)));
    }

    #[test]
    fn test_parse_finish_reason() {
        let mut buffer =
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}\n".to_string();
        let events = parse_sse_events_buffered(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Ok(StreamEvent::Finished {
                reason: FinishReason::Length
            })
        ));
    }

    #[test]
    fn test_parse_error_envelope() {
        let mut buffer = "data: {\"error\":{\"message\":\"model overloaded\"}}\n".to_string();
        let events = parse_sse_events_buffered(&mut buffer);
        assert_eq!(events.len(), 1);
        assert!(
            matches!(&events[0], Ok(StreamEvent::Error { message }) if message == "model overloaded")
        );
    }

    #[test]
    fn test_parse_skips_metadata_lines() {
        let mut buffer = ": keepalive\nevent: message\n\n".to_string();
        let events = parse_sse_events_buffered(&mut buffer);
        assert!(events.is_empty());
        assert!(buffer.is_empty());
    }
}
