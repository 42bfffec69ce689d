//! OpenAI-compatible streaming chat client.

use crate::llm::{ChatMessage, ModelClient, TextStream};
use anyhow::{anyhow, bail, Context, Result};
use async_stream::try_stream;
use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl OpenAiClient {
    pub fn new(base_url: &str, model: &str, api_key: Option<SecretString>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
            temperature: None,
            max_tokens: None,
        })
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
        });
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(n) = self.max_tokens {
            body["max_tokens"] = json!(n);
        }
        body
    }
}

/// Text delta carried by one SSE payload, or the provider's error message
fn parse_payload(payload: &str) -> Result<Option<String>> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        bail!("provider error: {}", message);
    }
    let text = value
        .get("choices")
        .and_then(|c| c.as_array())
        .map(|choices| {
            choices
                .iter()
                .filter_map(|c| c.pointer("/delta/content").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .filter(|t| !t.is_empty());
    Ok(text)
}

#[async_trait]
impl ModelClient for OpenAiClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TextStream> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, messages = messages.len(), "opening model stream");

        let mut req = self.http.post(&url).json(&self.request_body(messages));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key.expose_secret());
        }

        let resp = req.send().await.with_context(|| format!("Request to {} failed", url))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!(
                "model request failed with status {}: {}",
                status,
                crate::error::preview(&text, 500)
            );
        }

        let mut events = resp.bytes_stream().eventsource();
        let stream = try_stream! {
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| anyhow!("stream error: {}", e))?;
                let payload = event.data.trim();
                if payload == "[DONE]" {
                    break;
                }
                if let Some(text) = parse_payload(payload)? {
                    yield text;
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload_delta() {
        let text = parse_payload(r#"{"choices":[{"delta":{"content":"<<<FILE"}}]}"#).unwrap();
        assert_eq!(text.as_deref(), Some("<<<FILE"));
    }

    #[test]
    fn test_parse_payload_without_content() {
        assert_eq!(
            parse_payload(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(),
            None
        );
        assert_eq!(parse_payload("keep-alive").unwrap(), None);
    }

    #[test]
    fn test_parse_payload_error() {
        let err = parse_payload(r#"{"error":{"message":"quota exceeded"}}"#).unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
    }

    #[test]
    fn test_request_body() {
        let client = OpenAiClient::new("http://localhost:8080/v1/", "m", None)
            .unwrap()
            .with_temperature(Some(0.2))
            .with_max_tokens(Some(1024));
        let body = client.request_body(&[ChatMessage::user("hi")]);
        assert_eq!(client.base_url, "http://localhost:8080/v1");
        assert_eq!(body["stream"], true);
        assert_eq!(body["max_tokens"], 1024);
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
