use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::LlmError;
use crate::services::prompts;

/// Quality/latency selector for the text-generation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Fast,
    Premium,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub tier: Tier,
    pub system_prompt: Option<String>,
}

/// Receives each text fragment as soon as the backend produces it.
pub type FragmentSink<'a> = &'a (dyn Fn(&str) + Send + Sync);

/// Anything that can turn a prompt into text.
///
/// When `on_fragment` is given, the fragments handed to it concatenate to
/// exactly the returned text.
#[async_trait]
pub trait TextGenerationPort: Send + Sync {
    async fn generate(
        &self,
        request: GenerationRequest,
        on_fragment: Option<FragmentSink<'_>>,
    ) -> Result<String, LlmError>;

    fn provider_name(&self) -> &'static str;
}

/// Anthropic messages API client, streaming by default.
pub struct LLMClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    fast_model: String,
    premium_model: String,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    messages: Vec<Message<'a>>,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: Delta },
    Error { error: ApiErrorBody },
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiErrorBody,
}

impl LLMClient {
    pub fn new(config: &LlmConfig, api_key: String) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(LLMClient {
            client,
            api_url: config.api_url.clone(),
            api_key,
            fast_model: config.fast_model.clone(),
            premium_model: config.premium_model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    fn model_for(&self, tier: Tier) -> &str {
        match tier {
            Tier::Fast => &self.fast_model,
            Tier::Premium => &self.premium_model,
        }
    }
}

#[async_trait]
impl TextGenerationPort for LLMClient {
    async fn generate(
        &self,
        request: GenerationRequest,
        on_fragment: Option<FragmentSink<'_>>,
    ) -> Result<String, LlmError> {
        let model = self.model_for(request.tier);
        let body = MessagesRequest {
            model,
            max_tokens: self.max_tokens,
            system: request.system_prompt.as_deref(),
            messages: vec![Message {
                role: "user",
                content: &request.prompt,
            }],
            stream: true,
        };

        tracing::debug!(model, tier = ?request.tier, prompt_len = request.prompt.len(), "sending generation request");

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(e.to_string()))?;

        let status = response.status().as_u16();
        if status == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(LlmError::RateLimited {
                retry_after_secs: retry_after,
            });
        }

        if !response.status().is_success() {
            let body = response
                .text()
                .await
                .map_err(|e| LlmError::RequestFailed(e.to_string()))?;
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(LlmError::ApiError { status, message });
        }

        let mut decoder = SseDecoder::default();
        let mut text = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| LlmError::Stream(e.to_string()))?;
            for data in decoder.push(&chunk) {
                match parse_event(&data)? {
                    Some(StreamSignal::Fragment(fragment)) => {
                        if let Some(sink) = on_fragment {
                            sink(&fragment);
                        }
                        text.push_str(&fragment);
                    }
                    Some(StreamSignal::Stop) => return finish(text),
                    None => {}
                }
            }
        }

        finish(text)
    }

    fn provider_name(&self) -> &'static str {
        "anthropic"
    }
}

fn finish(text: String) -> Result<String, LlmError> {
    if text.is_empty() {
        return Err(LlmError::ParseError("no text content in response".to_string()));
    }
    Ok(text)
}

enum StreamSignal {
    Fragment(String),
    Stop,
}

fn parse_event(data: &str) -> Result<Option<StreamSignal>, LlmError> {
    let event: StreamEvent =
        serde_json::from_str(data).map_err(|e| LlmError::ParseError(e.to_string()))?;
    match event {
        StreamEvent::ContentBlockDelta {
            delta: Delta::TextDelta { text },
        } => Ok(Some(StreamSignal::Fragment(text))),
        StreamEvent::Error { error } => Err(LlmError::Stream(error.message)),
        StreamEvent::MessageStop => Ok(Some(StreamSignal::Stop)),
        _ => Ok(None),
    }
}

/// Splits a server-sent-events byte stream into `data:` payloads.
#[derive(Default)]
struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                let data = data.trim_start();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
        payloads
    }
}

/// Offline stand-in used when no API key is configured. Produces a
/// deterministic markdown chapter and streams it in small fragments.
pub struct SampleGenerator {
    fragment_len: usize,
    fragment_delay: Duration,
}

impl SampleGenerator {
    pub fn new(fragment_delay: Duration) -> Self {
        SampleGenerator {
            fragment_len: 50,
            fragment_delay,
        }
    }
}

#[async_trait]
impl TextGenerationPort for SampleGenerator {
    async fn generate(
        &self,
        request: GenerationRequest,
        on_fragment: Option<FragmentSink<'_>>,
    ) -> Result<String, LlmError> {
        let text = prompts::sample_chapter(&request.prompt);

        if let Some(sink) = on_fragment {
            let chars: Vec<char> = text.chars().collect();
            for piece in chars.chunks(self.fragment_len) {
                let fragment: String = piece.iter().collect();
                sink(&fragment);
                if !self.fragment_delay.is_zero() {
                    tokio::time::sleep(self.fragment_delay).await;
                }
            }
        }

        Ok(text)
    }

    fn provider_name(&self) -> &'static str {
        "sample"
    }
}
