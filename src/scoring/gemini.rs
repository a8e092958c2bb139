//! Primary backend: Gemini `generateContent`.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{verdict_from_text, ScoreError, ScoringStrategy};
use crate::config::BackendConfig;
use crate::models::{CandidateProfile, Project, ScoreSource, Verdict};
use crate::prompts;
use crate::response::MalformedResponseError;

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiStrategy {
    model: String,
    base_url: String,
    api_key: String,
    source: ScoreSource,
    client: reqwest::Client,
}

impl GeminiStrategy {
    pub fn new(
        config: &BackendConfig,
        api_key: String,
        source: ScoreSource,
        client: reqwest::Client,
    ) -> Self {
        Self {
            model: config.model.clone(),
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key,
            source,
            client,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        )
    }
}

#[async_trait]
impl ScoringStrategy for GeminiStrategy {
    fn name(&self) -> &str {
        "gemini"
    }

    fn source(&self) -> ScoreSource {
        self.source
    }

    async fn score(
        &self,
        candidate: &CandidateProfile,
        project: &Project,
    ) -> Result<Verdict, ScoreError> {
        let prompt = prompts::matching_prompt(candidate, project)
            .map_err(|e| ScoreError::Request(e.to_string()))?;

        let body = json!({
            "contents": [{"parts": [{"text": prompt}]}],
            "generationConfig": {
                "temperature": 0.2,
                "responseMimeType": "application/json"
            }
        });

        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ScoreError::from_status("Gemini", status, &text));
        }

        let envelope: Value = response.json().await?;
        let text = extract_text(&envelope)?;
        verdict_from_text(&text)
    }
}

/// Concatenates `candidates[0].content.parts[*].text`.
fn extract_text(envelope: &Value) -> Result<String, MalformedResponseError> {
    let parts = envelope
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| {
            let reason = envelope
                .pointer("/promptFeedback/blockReason")
                .and_then(|r| r.as_str())
                .map(|r| format!("no candidates (blocked: {})", r))
                .unwrap_or_else(|| "no candidate content".to_string());
            MalformedResponseError::new(reason, &envelope.to_string())
        })?;

    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();

    if text.trim().is_empty() {
        return Err(MalformedResponseError::new("empty candidate text", &envelope.to_string()));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_joins_parts() {
        let envelope = json!({
            "candidates": [{"content": {"parts": [
                {"text": "```json\n{\"overall_score\":"},
                {"text": " 77}\n```"}
            ]}}]
        });
        let text = extract_text(&envelope).unwrap();
        let verdict = verdict_from_text(&text).unwrap();
        assert_eq!(verdict.overall_score, Some(77));
    }

    #[test]
    fn test_blocked_prompt_is_malformed() {
        let envelope = json!({"promptFeedback": {"blockReason": "SAFETY"}});
        let err = extract_text(&envelope).unwrap_err();
        assert!(err.reason.contains("SAFETY"));
    }

    #[test]
    fn test_endpoint_uses_model() {
        let config = BackendConfig {
            provider: "gemini".to_string(),
            model: "gemini-flash-latest".to_string(),
            url: Some("http://localhost:9000/".to_string()),
            api_key_env: "X".to_string(),
        };
        let s = GeminiStrategy::new(&config, "k".into(), ScoreSource::Primary, reqwest::Client::new());
        assert_eq!(
            s.endpoint(),
            "http://localhost:9000/v1beta/models/gemini-flash-latest:generateContent"
        );
    }
}
