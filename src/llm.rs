// LLM 适配:OpenAI 兼容的 Chat Completions 流式调用,产出片段流。
use crate::config::LlmConfig;
use anyhow::{anyhow, Result};
use futures::StreamExt;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Lazy, finite, non-restartable sequence of text fragments. Transport or
/// protocol failures surface as a single `Err` item and end the stream.
pub type FragmentStream = UnboundedReceiverStream<Result<String>>;

/// The shape the turn pipeline expects from the model backend: hand over a
/// message list, get a fragment stream back. The backend is opaque beyond
/// that; tests substitute scripted producers.
pub trait FragmentProducer: Send + Sync {
    fn chat_stream(&self, messages: Vec<ChatMessage>) -> FragmentStream;
}

impl FragmentProducer for LlmClient {
    fn chat_stream(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        LlmClient::chat_stream(self, messages)
    }
}

#[derive(Clone)]
pub struct LlmClient {
    http: Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(http: Client, config: LlmConfig) -> Self {
        Self { http, config }
    }

    /// Fires the streaming completion in a background task and hands back
    /// the fragment stream. The coalescer consumes it without any
    /// backpressure signal toward the model; keeping pace is its problem.
    pub fn chat_stream(&self, messages: Vec<ChatMessage>) -> FragmentStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.clone();
        tokio::spawn(async move {
            if let Err(err) = client.run_stream(&messages, &tx).await {
                let _ = tx.send(Err(err));
            }
        });
        UnboundedReceiverStream::new(rx)
    }

    async fn run_stream(
        &self,
        messages: &[ChatMessage],
        tx: &mpsc::UnboundedSender<Result<String>>,
    ) -> Result<()> {
        let response = self
            .http
            .post(self.endpoint())
            .headers(self.headers())
            .json(&self.build_payload(messages))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("LLM stream request failed: {status} {text}"));
        }
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(item) = stream.next().await {
            let bytes = item?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer = buffer[pos + 1..].to_string();
                if line.is_empty() || !line.starts_with("data:") {
                    continue;
                }
                let data = line.trim_start_matches("data:").trim();
                if data == "[DONE]" {
                    return Ok(());
                }
                if let Ok(payload) = serde_json::from_str::<Value>(data) {
                    let delta = payload
                        .get("choices")
                        .and_then(|value| value.get(0))
                        .and_then(|value| value.get("delta"))
                        .and_then(|value| value.get("content"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    if !delta.is_empty() && tx.send(Ok(delta.to_string())).is_err() {
                        // 消费端提前放弃,直接收流。
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn endpoint(&self) -> String {
        let base = self
            .config
            .base_url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com".to_string());
        if base.ends_with("/v1") {
            format!("{base}/chat/completions")
        } else {
            format!("{base}/v1/chat/completions")
        }
    }

    fn headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(api_key) = &self.config.api_key {
            if !api_key.is_empty() {
                let value = format!("Bearer {api_key}");
                if let Ok(header_value) = value.parse() {
                    headers.insert(reqwest::header::AUTHORIZATION, header_value);
                }
            }
        }
        headers
    }

    fn build_payload(&self, messages: &[ChatMessage]) -> Value {
        let temperature = self.config.temperature.unwrap_or(0.7);
        let mut payload = json!({
            "model": self.config.model.clone().unwrap_or_else(|| "gpt-4".to_string()),
            "messages": messages,
            "temperature": temperature,
            "stream": true,
        });
        if let Some(max_output) = self.config.max_output {
            if max_output > 0 {
                payload["max_tokens"] = json!(max_output);
            }
        }
        if let Some(stop) = &self.config.stop {
            if !stop.is_empty() {
                payload["stop"] = json!(stop);
            }
        }
        payload
    }
}

pub fn build_llm_client(config: &LlmConfig, http: Client) -> LlmClient {
    LlmClient::new(http, config.clone())
}

pub fn is_llm_configured(config: &LlmConfig) -> bool {
    config
        .base_url
        .as_ref()
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false)
        && config
            .model
            .as_ref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
}
