//! Text generation capability.
//!
//! The classifier and the generator treat the language model as an opaque
//! `(system, prompt) -> text` function. Three HTTP adapters are provided:
//!
//! | Provider | Endpoint |
//! |----------|----------|
//! | `openai` | `POST {url}/v1/chat/completions` |
//! | `gemini` | `POST {url}/v1beta/models/{model}:generateContent` |
//! | `ollama` | `POST {url}/api/chat` |
//!
//! All of them share the retry policy in [`crate::http`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::LlmConfig;
use crate::http::post_json_with_retry;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Provider and model, e.g. `"gemini:gemini-2.5-flash-lite"`.
    fn name(&self) -> &str;
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

fn http_client(config: &LlmConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?)
}

fn api_key(config: &LlmConfig) -> Result<String> {
    std::env::var(&config.api_key_env)
        .map_err(|_| anyhow::anyhow!("{} environment variable not set", config.api_key_env))
}

// ============ OpenAI ============

pub struct OpenAIChat {
    name: String,
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OpenAIChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            name: format!("openai:{}", config.model),
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            api_key: api_key(config)?,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/v1/chat/completions", self.url.trim_end_matches('/')),
            &[("Authorization", format!("Bearer {}", self.api_key))],
            &body,
            self.max_retries,
            "OpenAI",
        )
        .await?;

        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
    }
}

// ============ Gemini ============

pub struct GeminiChat {
    name: String,
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl GeminiChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            name: format!("gemini:{}", config.model),
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string()),
            api_key: api_key(config)?,
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl LanguageModel for GeminiChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "systemInstruction": {"parts": [{"text": system}]},
            "contents": [{"role": "user", "parts": [{"text": prompt}]}],
            "generationConfig": {"temperature": self.temperature},
        });
        let json = post_json_with_retry(
            &self.client,
            &format!(
                "{}/v1beta/models/{}:generateContent",
                self.url.trim_end_matches('/'),
                self.model
            ),
            &[("x-goog-api-key", self.api_key.clone())],
            &body,
            self.max_retries,
            "Gemini",
        )
        .await?;

        let parts = json
            .pointer("/candidates/0/content/parts")
            .and_then(|p| p.as_array())
            .ok_or_else(|| anyhow::anyhow!("Invalid Gemini response: missing candidate parts"))?;
        Ok(parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join(""))
    }
}

// ============ Ollama ============

pub struct OllamaChat {
    name: String,
    model: String,
    url: String,
    temperature: f32,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            name: format!("ollama:{}", config.model),
            model: config.model.clone(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            temperature: config.temperature,
            max_retries: config.max_retries,
            client: http_client(config)?,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaChat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "options": {"temperature": self.temperature},
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt},
            ],
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/api/chat", self.url.trim_end_matches('/')),
            &[],
            &body,
            self.max_retries,
            "Ollama",
        )
        .await?;

        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing message content"))
    }
}

/// Build the configured language model.
pub fn create_language_model(config: &LlmConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "openai" => Ok(Arc::new(OpenAIChat::new(config)?)),
        "gemini" => Ok(Arc::new(GeminiChat::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChat::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(provider: &str, url: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            model: "test-model".to_string(),
            url: Some(url.to_string()),
            api_key_env: "DOCSYNC_TEST_LLM_KEY".to_string(),
            temperature: 0.0,
            max_retries: 0,
            timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_ollama_chat_extracts_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": {"role": "assistant", "content": "hello"}
            })))
            .mount(&server)
            .await;

        let llm = OllamaChat::new(&config("ollama", &server.uri())).unwrap();
        assert_eq!(llm.name(), "ollama:test-model");
        assert_eq!(llm.complete("sys", "hi").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_openai_and_gemini_send_keys() {
        std::env::set_var("DOCSYNC_TEST_LLM_KEY", "sk-test");
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("Authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "from openai"}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/test-model:generateContent"))
            .and(header("x-goog-api-key", "sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "from "}, {"text": "gemini"}]}}]
            })))
            .mount(&server)
            .await;

        let openai = OpenAIChat::new(&config("openai", &server.uri())).unwrap();
        assert_eq!(openai.complete("s", "p").await.unwrap(), "from openai");
        let gemini = GeminiChat::new(&config("gemini", &server.uri())).unwrap();
        assert_eq!(gemini.complete("s", "p").await.unwrap(), "from gemini");
    }

    #[test]
    fn test_unknown_provider() {
        let err = create_language_model(&config("mystery", "http://localhost"))
            .err()
            .unwrap();
        assert!(err.to_string().contains("Unknown llm provider"));
    }
}
