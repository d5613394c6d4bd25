//! Gemini (Google AI) model gateway
//!
//! Calls the `generateContent` endpoint with fixed generation parameters and
//! turns every failure mode of the response into a [`GatewayError`].

use super::{GatewayError, Invocation, ModelGateway};
use crate::config::GatewayConfig;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;

/// Default API host
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

const MODEL_NAMESPACE: &str = "models/";
const TUNED_NAMESPACE: &str = "tunedModels/";
const MODEL_FAMILY_MARKERS: &[&str] = &["gemini-", "embedding-"];

const TEMPERATURE: f64 = 0.7;
const TOP_P: f64 = 0.95;
const TOP_K: u32 = 64;
const MAX_OUTPUT_TOKENS: u32 = 8192;

/// Finish reasons that count as a successful generation
const ACCEPTED_FINISH_REASONS: &[&str] = &["STOP", "MAX_TOKENS"];

/// Gateway backed by the Gemini REST API
pub struct GeminiGateway {
    /// Base URL for the API
    base_url: String,

    /// Blocking HTTP agent (timeouts configured here)
    agent: ureq::Agent,

    /// Retries for transient failures
    max_retries: u32,

    /// First retry delay; doubles on each attempt
    retry_backoff: Duration,
}

impl GeminiGateway {
    /// Create a gateway with default settings
    pub fn new() -> Self {
        Self::from_config(&GatewayConfig::default())
    }

    /// Create a gateway from the `[gateway]` config section
    pub fn from_config(config: &GatewayConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(config.timeout))
            .build();

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            agent,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        }
    }

    /// Create with a specific base URL
    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    /// Build the request target for a normalized model path.
    ///
    /// The credential goes into the query string only after the rest of the
    /// URL has been validated, so it never appears in error messages.
    pub fn endpoint(&self, model_path: &str, credential: &str) -> Result<Url, GatewayError> {
        let raw = format!("{}/v1beta/{}:generateContent", self.base_url, model_path);
        let mut url = Url::parse(&raw).map_err(|e| GatewayError::InvalidEndpoint {
            url: raw.clone(),
            reason: e.to_string(),
        })?;
        if url.cannot_be_a_base() {
            return Err(GatewayError::InvalidEndpoint {
                url: raw,
                reason: "URL cannot be a base".to_string(),
            });
        }
        url.query_pairs_mut().append_pair("key", credential);
        Ok(url)
    }
}

impl Default for GeminiGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelGateway for GeminiGateway {
    async fn invoke(&self, invocation: Invocation) -> Result<String, GatewayError> {
        if invocation.credential.trim().is_empty() {
            return Err(GatewayError::MissingCredential);
        }
        if invocation.model.trim().is_empty() {
            return Err(GatewayError::MissingModel);
        }

        let model_path = normalize_model(&invocation.model);
        let url = self.endpoint(&model_path, &invocation.credential)?;
        let body = build_request_body(&invocation.user_text, invocation.system_text.as_deref());

        let mut attempt = 0;
        loop {
            tracing::debug!(model = %model_path, attempt, "invoking model");
            let agent = self.agent.clone();
            let target = url.to_string();
            let payload = body.clone();

            let result = tokio::task::spawn_blocking(move || send_request(&agent, &target, &payload))
                .await
                .unwrap_or_else(|e| Err(GatewayError::Network(format!("request task failed: {}", e))));

            match result {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
                    tracing::warn!(attempt = attempt + 1, error = %err, ?delay, "retrying model invocation");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Canonicalize a model identifier into an API model path.
///
/// Leading `models/` prefixes are stripped repeatedly; names from a known
/// model family are re-prefixed, anything else passes through as is.
pub fn normalize_model(model: &str) -> String {
    let mut name = model.trim();
    while let Some(rest) = name.strip_prefix(MODEL_NAMESPACE) {
        name = rest;
    }

    if MODEL_FAMILY_MARKERS.iter().any(|m| name.contains(m)) {
        format!("{}{}", MODEL_NAMESPACE, name)
    } else {
        if !name.starts_with(TUNED_NAMESPACE) {
            tracing::warn!(
                model,
                resolved = name,
                "model name does not follow \"models/...\" or \"tunedModels/...\" patterns; using it as is"
            );
        }
        name.to_string()
    }
}

/// Build the `generateContent` request body
pub fn build_request_body(user_text: &str, system_text: Option<&str>) -> Value {
    let mut body = json!({
        "contents": [{
            "role": "user",
            "parts": [{ "text": user_text }]
        }],
        "generationConfig": {
            "temperature": TEMPERATURE,
            "topP": TOP_P,
            "topK": TOP_K,
            "maxOutputTokens": MAX_OUTPUT_TOKENS
        }
    });

    if let Some(system) = system_text.filter(|s| !s.trim().is_empty()) {
        body["systemInstruction"] = json!({
            "parts": [{ "text": system }]
        });
    }

    body
}

/// Turn a response status and JSON body into generated text or an error
pub fn interpret_response(status: u16, status_text: &str, body: &Value) -> Result<String, GatewayError> {
    if !(200..300).contains(&status) {
        let mut message = status_text.to_string();
        if let Some(error) = body.get("error") {
            let detail = error
                .get("message")
                .and_then(Value::as_str)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| error.get("details").unwrap_or(error).to_string());
            message = if message.is_empty() {
                detail
            } else {
                format!("{} - {}", message, detail)
            };
        }
        return Err(GatewayError::Api { status, message });
    }

    let Some(candidate) = body.get("candidates").and_then(|c| c.get(0)) else {
        if let Some(reason) = body.pointer("/promptFeedback/blockReason") {
            return Err(GatewayError::BlockedPrompt {
                reason: value_text(reason),
                safety: body
                    .pointer("/promptFeedback/safetyRatings")
                    .map(Value::to_string),
            });
        }
        return Err(GatewayError::NoCandidates);
    };

    if let Some(reason) = candidate.get("finishReason").and_then(Value::as_str) {
        if !ACCEPTED_FINISH_REASONS.contains(&reason) {
            return Err(GatewayError::GenerationStopped {
                reason: reason.to_string(),
                safety: candidate.get("safetyRatings").map(Value::to_string),
            });
        }
    }

    candidate
        .pointer("/content/parts/0/text")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(GatewayError::MalformedResponse)
}

fn value_text(value: &Value) -> String {
    value
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| value.to_string())
}

/// Send one request on the blocking agent
fn send_request(agent: &ureq::Agent, url: &str, body: &Value) -> Result<String, GatewayError> {
    match agent
        .post(url)
        .set("Content-Type", "application/json")
        .send_json(body)
    {
        Ok(response) => {
            let status = response.status();
            let status_text = response.status_text().to_string();
            let json: Value = response
                .into_json()
                .map_err(|_| GatewayError::MalformedResponse)?;
            interpret_response(status, &status_text, &json)
        }
        Err(ureq::Error::Status(status, response)) => {
            let status_text = response.status_text().to_string();
            let json = response.into_json::<Value>().unwrap_or(Value::Null);
            interpret_response(status, &status_text, &json)
        }
        Err(ureq::Error::Transport(transport)) => Err(transport.into()),
    }
}
