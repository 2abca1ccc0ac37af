//! Annotation provider contract and the HTTP JSON provider.
//!
//! Providers never raise past this boundary: every network or response
//! condition maps into the `ProviderError` taxonomy, which callers fold
//! into `Annotation.error`.

use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::context::ContextPayload;

/// Version of the prompt template; part of the cache key so that prompt
/// changes invalidate cached annotations.
pub const PROMPT_TEMPLATE_VERSION: &str = "v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    Timeout,
    RateLimited,
    Auth,
    Transport(String),
    MalformedResponse(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Timeout => write!(f, "provider timeout"),
            ProviderError::RateLimited => write!(f, "provider rate limited"),
            ProviderError::Auth => write!(f, "provider authentication failed"),
            ProviderError::Transport(detail) => write!(f, "provider transport error: {detail}"),
            ProviderError::MalformedResponse(detail) => {
                write!(f, "malformed provider response: {detail}")
            }
        }
    }
}

/// Successful provider output before the context summary is attached.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProviderAnnotation {
    pub scenario: String,
    pub why_needed: String,
    #[serde(default)]
    pub key_assertions: Vec<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// The provider contract the cache consumes. Synchronous from the
/// cache's point of view; the per-call timeout lives in the transport.
pub trait AnnotationProvider: Send + Sync {
    fn identity(&self) -> &str;
    fn model(&self) -> &str;
    fn annotate(&self, payload: &ContextPayload) -> Result<ProviderAnnotation, ProviderError>;
}

/// Build the annotation prompt for a payload.
pub fn build_prompt(payload: &ContextPayload) -> String {
    format!(
        "You are annotating one automated test for an audit report.\n\
         Reply with a single JSON object only, no prose or code fences, \
         with keys: scenario (string), why_needed (string), \
         key_assertions (array of strings), confidence (number 0..1).\n\n\
         {}",
        payload.text
    )
}

/// Validate a raw provider reply against the expected annotation shape.
///
/// Tolerates code fences and leading prose around the JSON object; an
/// empty scenario or an out-of-range confidence is malformed.
pub fn parse_provider_response(raw: &str) -> Result<ProviderAnnotation, ProviderError> {
    let cleaned = strip_code_fences(raw);
    let parsed: ProviderAnnotation = match serde_json::from_str(&cleaned) {
        Ok(parsed) => parsed,
        Err(err) => extract_json_object(&cleaned)
            .ok_or_else(|| ProviderError::MalformedResponse(err.to_string()))?,
    };
    if parsed.scenario.trim().is_empty() {
        return Err(ProviderError::MalformedResponse(
            "scenario is empty".to_string(),
        ));
    }
    if let Some(confidence) = parsed.confidence {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(ProviderError::MalformedResponse(format!(
                "confidence {confidence} outside [0, 1]"
            )));
        }
    }
    Ok(parsed)
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines: Vec<&str> = trimmed.lines().collect();
    if let Some(first) = lines.first() {
        if first.trim_start().starts_with("```") {
            lines.remove(0);
        }
    }
    if let Some(last) = lines.last() {
        if last.trim_start().starts_with("```") {
            lines.pop();
        }
    }
    lines.join("\n").trim().to_string()
}

fn extract_json_object(raw: &str) -> Option<ProviderAnnotation> {
    for (idx, ch) in raw.char_indices() {
        if ch != '{' {
            continue;
        }
        let mut deserializer = serde_json::Deserializer::from_str(&raw[idx..]);
        if let Ok(parsed) = ProviderAnnotation::deserialize(&mut deserializer) {
            return Some(parsed);
        }
    }
    None
}

/// Ollama-style HTTP provider: POSTs the prompt to `{endpoint}/api/generate`
/// and expects a JSON envelope with a `response` string.
pub struct HttpProvider {
    identity: String,
    model: String,
    endpoint: String,
    agent: ureq::Agent,
}

#[derive(Deserialize)]
struct GenerateEnvelope {
    response: String,
}

impl HttpProvider {
    pub fn new(identity: &str, model: &str, endpoint: &str, timeout_seconds: u64) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_secs(timeout_seconds))
            .build();
        HttpProvider {
            identity: identity.to_string(),
            model: model.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn classify(err: ureq::Error) -> ProviderError {
        match err {
            ureq::Error::Status(429, _) => ProviderError::RateLimited,
            ureq::Error::Status(401 | 403, _) => ProviderError::Auth,
            ureq::Error::Status(code, _) => {
                ProviderError::Transport(format!("http status {code}"))
            }
            ureq::Error::Transport(transport) => {
                let detail = transport.to_string();
                if detail.contains("timed out") || detail.contains("timeout") {
                    ProviderError::Timeout
                } else {
                    ProviderError::Transport(detail)
                }
            }
        }
    }
}

impl AnnotationProvider for HttpProvider {
    fn identity(&self) -> &str {
        &self.identity
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn annotate(&self, payload: &ContextPayload) -> Result<ProviderAnnotation, ProviderError> {
        let url = format!("{}/api/generate", self.endpoint);
        let response = self
            .agent
            .post(&url)
            .send_json(serde_json::json!({
                "model": self.model,
                "prompt": build_prompt(payload),
                "stream": false,
                "format": "json",
            }))
            .map_err(Self::classify)?;
        let envelope: GenerateEnvelope = response
            .into_json()
            .map_err(|err| ProviderError::MalformedResponse(err.to_string()))?;
        parse_provider_response(&envelope.response)
    }
}
