//! Generative model client abstraction
//!
//! Provides a unified interface over model providers:
//! - Gemini (`models/{model}:generateContent` REST API, file API for large PDFs)
//! - Mock (deterministic, schema-compliant cards for local runs)
//!
//! Clients make exactly one upstream call per invocation. Retries belong to the
//! orchestrator.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, instrument, warn};

use super::error::ProviderError;
use super::prompt::{ContentPart, PromptPayload};
use crate::config::GenerationConfig;
use crate::errors::{AppError, Result};
use crate::metrics;

/// Raw text returned by one model call, before any parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub text: String,
    pub model: String,
    pub finish_reason: Option<String>,
}

/// Trait for generative model providers
#[async_trait]
pub trait GenerativeClient: Send + Sync {
    /// Default model of this client
    fn model_name(&self) -> &str;

    /// One generation call
    async fn generate(&self, payload: &PromptPayload) -> std::result::Result<RawResponse, ProviderError>;

    /// Upload a document and return a URI the model can reference
    async fn upload_file(
        &self,
        data: &[u8],
        mime_type: &str,
        display_name: &str,
    ) -> std::result::Result<String, ProviderError>;
}

/// Gemini REST client
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    endpoint: String,
    upload_url: reqwest::Url,
    model: String,
    max_output_tokens: u32,
}

impl GeminiClient {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.attempt_timeout())
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let endpoint = config.endpoint.trim_end_matches('/').to_string();
        let upload_url = reqwest::Url::parse(&endpoint)
            .and_then(|base| base.join("/upload/v1beta/files"))
            .map_err(|e| AppError::Configuration {
                message: format!("Invalid generation endpoint {}: {}", endpoint, e),
            })?;

        Ok(Self {
            http,
            api_key,
            endpoint,
            upload_url,
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
        })
    }

    fn generate_url(&self, model: &str) -> String {
        let path = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };
        format!("{}/{}:generateContent", self.endpoint, path)
    }
}

#[async_trait]
impl GenerativeClient for GeminiClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, payload: &PromptPayload) -> std::result::Result<RawResponse, ProviderError> {
        let url = self.generate_url(&payload.model);
        let body = build_request_body(payload, self.max_output_tokens);

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable {
                message: format!("request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let summary = summarize_error_body(&text);
            error!(status = status.as_u16(), model = %payload.model, error_summary = %summary, "Gemini request failed");
            return Err(classify_status(status, summary));
        }

        let data: Value = response.json().await.map_err(|e| ProviderError::Unusable {
            message: format!("response was not JSON: {}", e),
        })?;
        let (text, finish_reason) = extract_candidate_text(&data)?;

        Ok(RawResponse {
            text,
            model: payload.model.clone(),
            finish_reason,
        })
    }

    async fn upload_file(
        &self,
        data: &[u8],
        mime_type: &str,
        display_name: &str,
    ) -> std::result::Result<String, ProviderError> {
        let start = self
            .http
            .post(self.upload_url.clone())
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", data.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable {
                message: format!("upload start failed: {}", e),
            })?;

        if !start.status().is_success() {
            let status = start.status();
            let summary = summarize_error_body(&start.text().await.unwrap_or_default());
            return Err(classify_status(status, summary));
        }

        let session_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::Unusable {
                message: "upload session URL missing".to_string(),
            })?;

        let finished = self
            .http
            .post(&session_url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", mime_type)
            .header("X-Goog-Upload-Offset", "0")
            .header("X-Goog-Upload-Command", "upload, finalize")
            .body(data.to_vec())
            .send()
            .await
            .map_err(|e| ProviderError::Unavailable {
                message: format!("upload failed: {}", e),
            })?;

        if !finished.status().is_success() {
            let status = finished.status();
            let summary = summarize_error_body(&finished.text().await.unwrap_or_default());
            return Err(classify_status(status, summary));
        }

        #[derive(Deserialize)]
        struct UploadedFile {
            uri: String,
        }

        #[derive(Deserialize)]
        struct UploadResponse {
            file: UploadedFile,
        }

        let uploaded: UploadResponse = finished.json().await.map_err(|e| ProviderError::Unusable {
            message: format!("upload response missing file URI: {}", e),
        })?;
        Ok(uploaded.file.uri)
    }
}

/// Gemini `generateContent` request body
pub fn build_request_body(payload: &PromptPayload, max_output_tokens: u32) -> Value {
    let parts: Vec<Value> = payload
        .parts
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({ "text": text }),
            ContentPart::InlineData { mime_type, data } => json!({
                "inlineData": { "mimeType": mime_type, "data": data }
            }),
            ContentPart::FileData { mime_type, file_uri } => json!({
                "fileData": { "mimeType": mime_type, "fileUri": file_uri }
            }),
        })
        .collect();

    json!({
        "system_instruction": { "parts": [{ "text": payload.system_instruction }] },
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "temperature": payload.temperature,
            "topP": 0.9,
            "topK": 32,
            "candidateCount": 1,
            "maxOutputTokens": max_output_tokens,
            "responseMimeType": "application/json",
        }
    })
}

/// Throttling and server errors are retryable; any other 4xx is final
pub fn classify_status(status: StatusCode, summary: String) -> ProviderError {
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        ProviderError::Unavailable {
            message: format!("{}: {}", status.as_u16(), summary),
        }
    } else {
        ProviderError::Rejected {
            status: status.as_u16(),
            message: summary,
        }
    }
}

/// Pull the candidate text out of a `generateContent` response
pub fn extract_candidate_text(
    data: &Value,
) -> std::result::Result<(String, Option<String>), ProviderError> {
    if let Some(reason) = data
        .pointer("/promptFeedback/blockReason")
        .and_then(Value::as_str)
    {
        return Err(ProviderError::Unusable {
            message: format!("prompt blocked: {}", reason),
        });
    }

    let candidate = data
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
        .ok_or_else(|| ProviderError::Unusable {
            message: "response did not contain any candidates".to_string(),
        })?;

    let finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .map(str::to_string);
    if let Some(reason) = finish_reason.as_deref() {
        if reason != "STOP" && reason != "FINISH" {
            return Err(ProviderError::Unusable {
                message: format!("generation did not finish (finishReason={})", reason),
            });
        }
    }

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(ProviderError::Unusable {
            message: "candidate carried no text".to_string(),
        });
    }
    Ok((text, finish_reason))
}

fn summarize_error_body(body: &str) -> String {
    let trimmed = body.trim();
    let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
        return if trimmed.is_empty() {
            "no response body".to_string()
        } else {
            trimmed.chars().take(500).collect()
        };
    };

    let status = value.pointer("/error/status").and_then(Value::as_str);
    let message = value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .and_then(Value::as_str);
    match (status, message) {
        (Some(s), Some(m)) => format!("{}: {}", s, m),
        (Some(s), None) => s.to_string(),
        (None, Some(m)) => m.to_string(),
        (None, None) => value.to_string(),
    }
}

/// Mock client for local runs and tests
#[derive(Default)]
pub struct MockGenerativeClient {
    issued: AtomicUsize,
    calls: AtomicUsize,
    uploads: AtomicUsize,
}

impl MockGenerativeClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerativeClient for MockGenerativeClient {
    fn model_name(&self) -> &str {
        "mock-generator"
    }

    async fn generate(&self, payload: &PromptPayload) -> std::result::Result<RawResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let count = payload.requested_count as usize;
        let first = self.issued.fetch_add(count, Ordering::SeqCst) + 1;

        let cards: Vec<Value> = (first..first + count)
            .map(|n| {
                json!({
                    "card_type": "mcq_single",
                    "difficulty": (n % 5) + 1,
                    "payload": {
                        "question": format!("Mock study card {}: which finding is most specific?", n),
                        "options": [
                            { "id": "A", "text": "The specific finding" },
                            { "id": "B", "text": "A common distractor" }
                        ],
                        "correct_answers": ["A"],
                        "rationale": {
                            "primary": "Deterministic mock rationale.",
                            "alternatives": { "B": "Too common to discriminate." }
                        }
                    }
                })
            })
            .collect();

        let text = json!({
            "cards": cards,
            "retention_aid": { "markdown": "# Mock retention aid\n- Review the specific findings." }
        })
        .to_string();

        Ok(RawResponse {
            text,
            model: payload.model.clone(),
            finish_reason: Some("STOP".to_string()),
        })
    }

    async fn upload_file(
        &self,
        _data: &[u8],
        _mime_type: &str,
        display_name: &str,
    ) -> std::result::Result<String, ProviderError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("mock://files/{}/{}", n, display_name))
    }
}

/// Create a generative client based on configuration
pub fn create_client(config: &GenerationConfig) -> Result<Arc<dyn GenerativeClient>> {
    match config.provider.as_str() {
        "gemini" => {
            let api_key = config
                .api_key
                .clone()
                .filter(|k| !k.trim().is_empty())
                .ok_or_else(|| AppError::Configuration {
                    message: "generation.api_key is required for the gemini provider".to_string(),
                })?;
            Ok(Arc::new(GeminiClient::new(config, api_key)?))
        }
        "mock" => {
            warn!("Using mock generative client");
            Ok(Arc::new(MockGenerativeClient::new()))
        }
        other => Err(AppError::Configuration {
            message: format!("Unknown generation provider: {}", other),
        }),
    }
}

/// Timeout-bounded front door to a provider
#[derive(Clone)]
pub struct GenerationClient {
    inner: Arc<dyn GenerativeClient>,
    timeout: Duration,
}

impl GenerationClient {
    pub fn new(inner: Arc<dyn GenerativeClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn provider(&self) -> &dyn GenerativeClient {
        self.inner.as_ref()
    }

    /// One model call; a timeout or transport failure is `Unavailable`
    #[instrument(skip(self, payload), fields(attempt = attempt_index, requested = payload.requested_count))]
    pub async fn invoke(
        &self,
        payload: &PromptPayload,
        attempt_index: u32,
    ) -> std::result::Result<RawResponse, ProviderError> {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.inner.generate(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Unavailable {
                message: format!("model call exceeded {}ms", self.timeout.as_millis()),
            }),
        };
        let elapsed = start.elapsed();
        metrics::record_model_call(elapsed, result.is_ok());

        match &result {
            Ok(raw) => debug!(
                elapsed_ms = elapsed.as_millis() as u64,
                response_chars = raw.text.len(),
                "Model call returned"
            ),
            Err(e) => warn!(elapsed_ms = elapsed.as_millis() as u64, error = %e, "Model call failed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::schema::validate_candidate;

    fn payload(requested: u32) -> PromptPayload {
        PromptPayload {
            system_instruction: "sys".into(),
            parts: vec![
                ContentPart::Text { text: "Generate".into() },
                ContentPart::FileData {
                    mime_type: "application/pdf".into(),
                    file_uri: "files/abc".into(),
                },
            ],
            requested_count: requested,
            model: "gemini-2.5-pro".into(),
            temperature: 0.35,
        }
    }

    struct SlowClient;

    #[async_trait]
    impl GenerativeClient for SlowClient {
        fn model_name(&self) -> &str {
            "slow"
        }

        async fn generate(&self, _payload: &PromptPayload) -> std::result::Result<RawResponse, ProviderError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Err(ProviderError::Unusable { message: "unreachable".into() })
        }

        async fn upload_file(&self, _: &[u8], _: &str, _: &str) -> std::result::Result<String, ProviderError> {
            Ok("slow://file".into())
        }
    }

    #[test]
    fn test_request_body_shape() {
        let body = build_request_body(&payload(3), 6000);
        assert_eq!(body["system_instruction"]["parts"][0]["text"], "sys");
        assert_eq!(body["contents"][0]["parts"][1]["fileData"]["fileUri"], "files/abc");
        assert_eq!(body["generationConfig"]["topK"], 32);
        assert_eq!(body["generationConfig"]["candidateCount"], 1);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 6000);
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down".into()),
            ProviderError::Unavailable { .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, "".into()),
            ProviderError::Unavailable { .. }
        ));
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, "bad key".into()),
            ProviderError::Rejected { status: 403, message: "bad key".into() }
        );
    }

    #[test]
    fn test_candidate_extraction() {
        let ok = json!({
            "candidates": [{
                "finishReason": "STOP",
                "content": { "parts": [{ "text": "{\"cards\":" }, { "text": "[]}" }] }
            }]
        });
        let (text, reason) = extract_candidate_text(&ok).unwrap();
        assert_eq!(text, "{\"cards\":[]}");
        assert_eq!(reason.as_deref(), Some("STOP"));

        let blocked = json!({ "promptFeedback": { "blockReason": "SAFETY" } });
        assert!(matches!(extract_candidate_text(&blocked), Err(ProviderError::Unusable { .. })));

        let truncated = json!({ "candidates": [{ "finishReason": "MAX_TOKENS", "content": { "parts": [{ "text": "{" }] } }] });
        assert!(matches!(extract_candidate_text(&truncated), Err(ProviderError::Unusable { .. })));

        assert!(extract_candidate_text(&json!({ "candidates": [] })).is_err());
    }

    #[test]
    fn test_error_body_summary() {
        let body = r#"{"error":{"code":400,"status":"INVALID_ARGUMENT","message":"bad field"}}"#;
        assert_eq!(summarize_error_body(body), "INVALID_ARGUMENT: bad field");
        assert_eq!(summarize_error_body(""), "no response body");
    }

    #[tokio::test]
    async fn test_mock_client_emits_valid_distinct_cards() {
        let client = MockGenerativeClient::new();
        let first = client.generate(&payload(2)).await.unwrap();
        let second = client.generate(&payload(1)).await.unwrap();

        let mut prompts = Vec::new();
        for raw in [first, second] {
            let doc: Value = serde_json::from_str(&raw.text).unwrap();
            for card in doc["cards"].as_array().unwrap() {
                prompts.push(validate_candidate(card, &[]).unwrap().normalized_prompt());
            }
        }
        prompts.dedup();
        assert_eq!(prompts.len(), 3);
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_invoke_times_out_as_unavailable() {
        let client = GenerationClient::new(Arc::new(SlowClient), Duration::from_millis(20));
        let err = client.invoke(&payload(1), 1).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable { .. }));
    }

    #[test]
    fn test_create_client_requires_key_for_gemini() {
        let config = GenerationConfig::default();
        assert!(create_client(&config).is_err());

        let mock = GenerationConfig {
            provider: "mock".into(),
            ..GenerationConfig::default()
        };
        assert_eq!(create_client(&mock).unwrap().model_name(), "mock-generator");

        let keyed = GenerationConfig {
            api_key: Some("k".into()),
            ..GenerationConfig::default()
        };
        assert_eq!(create_client(&keyed).unwrap().model_name(), "gemini-2.5-pro");
    }
}
