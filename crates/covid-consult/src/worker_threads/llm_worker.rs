//! LLM worker
//!
//! Talks to any OpenAI-compatible `/chat/completions` endpoint (OpenRouter by
//! default) and serves as both the answer generator and the profile
//! extractor. Calls are bounded by a semaphore and a per-call timeout;
//! retries are left to the caller's retry policy.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::context_engine::prompts::{consultant_system_prompt, extraction_prompt};
use crate::context_engine::{AnswerGenerator, ProfileExtractor};
use crate::error::{ExtractionError, UpstreamError};
use crate::memory_db::ExtractedProfile;
use crate::vector_index::embeddings::has_version_suffix;

const SERVICE: &str = "llm";

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    content: String,
}

impl ChatMessage {
    fn new(role: &str, content: String) -> Self {
        Self { role: role.to_string(), content }
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessage>,
}

fn completions_endpoint(base_url: &str) -> String {
    let normalized = base_url.trim_end_matches('/');
    if normalized.ends_with("/chat/completions") {
        normalized.to_string()
    } else if has_version_suffix(normalized) {
        format!("{}/chat/completions", normalized)
    } else {
        format!("{}/v1/chat/completions", normalized)
    }
}

pub struct LLMWorker {
    http_client: reqwest::Client,
    completions_url: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl LLMWorker {
    pub fn new(
        base_url: &str,
        model: impl Into<String>,
        timeout: Duration,
        max_concurrent: usize,
    ) -> Result<Self, UpstreamError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| UpstreamError::permanent(SERVICE, format!("cannot build HTTP client: {}", e)))?;
        let completions_url = completions_endpoint(base_url);
        let model = model.into();
        info!("LLM worker initialized with backend: {} ({})", completions_url, model);
        Ok(Self {
            http_client,
            completions_url,
            model,
            api_key: None,
            temperature: 0.7,
            timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    async fn chat(&self, messages: Vec<ChatMessage>, temperature: f32) -> Result<String, UpstreamError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| UpstreamError::permanent(SERVICE, "LLM worker shut down"))?;

        match tokio::time::timeout(self.timeout, self.send(messages, temperature)).await {
            Ok(result) => result,
            Err(_) => Err(UpstreamError::Timeout {
                service: SERVICE.to_string(),
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    async fn send(&self, messages: Vec<ChatMessage>, temperature: f32) -> Result<String, UpstreamError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature,
            stream: false,
        };
        let mut builder = self.http_client.post(&self.completions_url).json(&request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamError::from_reqwest(SERVICE, e))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(SERVICE, status, &body));
        }
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::permanent(SERVICE, format!("Failed to parse LLM response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .map(|m| m.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| UpstreamError::permanent(SERVICE, "completion has no content"))
    }
}

#[async_trait]
impl AnswerGenerator for LLMWorker {
    async fn generate(&self, context: &str, question: &str) -> Result<String, UpstreamError> {
        debug!("LLM worker generating answer ({} context chars)", context.len());
        let messages = vec![
            ChatMessage::new("system", consultant_system_prompt(context)),
            ChatMessage::new("user", question.to_string()),
        ];
        let answer = self.chat(messages, self.temperature).await?;
        Ok(answer.trim().to_string())
    }
}

#[async_trait]
impl ProfileExtractor for LLMWorker {
    async fn extract(&self, message: &str) -> Result<ExtractedProfile, ExtractionError> {
        debug!("LLM worker extracting profile facts");
        let messages = vec![ChatMessage::new("user", extraction_prompt(message))];
        // Deterministic output parses more reliably.
        let raw = self.chat(messages, 0.0).await?;
        ExtractedProfile::from_llm_output(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Transient;
    use mockito::Matcher;

    fn completion(content: &str) -> String {
        serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": content}}]
        })
        .to_string()
    }

    fn worker(url: &str) -> LLMWorker {
        LLMWorker::new(url, "test-model", Duration::from_secs(5), 2).unwrap()
    }

    #[test]
    fn test_completions_endpoint_normalization() {
        assert_eq!(
            completions_endpoint("https://openrouter.ai/api/v1"),
            "https://openrouter.ai/api/v1/chat/completions"
        );
        assert_eq!(completions_endpoint("http://127.0.0.1:8001/"), "http://127.0.0.1:8001/v1/chat/completions");
        assert_eq!(
            completions_endpoint("http://h/v1/chat/completions"),
            "http://h/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn test_generate_sends_context_and_question() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::AllOf(vec![
                Matcher::Regex("fever and cough".to_string()),
                Matcher::Regex("Do I need a test\\?".to_string()),
                Matcher::PartialJson(serde_json::json!({"model": "test-model", "stream": false})),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion("  Get tested if symptoms persist.  "))
            .create_async()
            .await;

        let worker = worker(&server.url()).with_api_key(Some("sk-test".to_string()));
        let answer = worker.generate("fever and cough", "Do I need a test?").await.unwrap();

        mock.assert_async().await;
        assert_eq!(answer, "Get tested if symptoms persist.");
    }

    #[tokio::test]
    async fn test_rate_limit_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let err = worker(&server.url()).generate("", "hi").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_slow_backend_hits_configured_timeout() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body_from_request(|_| {
                std::thread::sleep(Duration::from_millis(600));
                completion("too late").into_bytes()
            })
            .create_async()
            .await;

        let worker = LLMWorker::new(&server.url(), "test-model", Duration::from_millis(100), 1).unwrap();
        let err = worker.generate("", "hi").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_unauthorized_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;

        let err = worker(&server.url()).generate("", "hi").await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_empty_completion_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let err = worker(&server.url()).generate("", "hi").await.unwrap_err();
        assert!(matches!(err, UpstreamError::Permanent { .. }));
    }

    #[tokio::test]
    async fn test_extract_parses_fenced_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .match_body(Matcher::PartialJson(serde_json::json!({"temperature": 0.0})))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion("```json\n{\"age\": 19, \"symptoms\": [\"sore throat\"]}\n```"))
            .create_async()
            .await;

        let profile = worker(&server.url()).extract("I'm 19 with a sore throat").await.unwrap();
        assert_eq!(profile.age, Some(19));
        assert_eq!(profile.symptoms, vec!["sore throat"]);
    }

    #[tokio::test]
    async fn test_extract_prose_is_format_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(completion("Sorry, I can't help with that."))
            .create_async()
            .await;

        let err = worker(&server.url()).extract("hello").await.unwrap_err();
        assert!(matches!(err, ExtractionError::Format(_)));
    }
}
