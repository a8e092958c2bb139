//! Secondary backend: any OpenAI-compatible chat completions endpoint
//! (Perplexity by default).

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use super::{verdict_from_text, ScoreError, ScoringStrategy};
use crate::config::BackendConfig;
use crate::models::{CandidateProfile, Project, ScoreSource, Verdict};
use crate::prompts;
use crate::response::MalformedResponseError;

pub struct ChatStrategy {
    model: String,
    url: String,
    api_key: String,
    source: ScoreSource,
    client: reqwest::Client,
}

impl ChatStrategy {
    pub fn new(
        config: &BackendConfig,
        api_key: String,
        source: ScoreSource,
        client: reqwest::Client,
    ) -> Result<Self> {
        let url = config
            .url
            .clone()
            .ok_or_else(|| anyhow::anyhow!("url required for chat scoring backend"))?;
        Ok(Self {
            model: config.model.clone(),
            url,
            api_key,
            source,
            client,
        })
    }
}

#[async_trait]
impl ScoringStrategy for ChatStrategy {
    fn name(&self) -> &str {
        "chat"
    }

    fn source(&self) -> ScoreSource {
        self.source
    }

    async fn score(
        &self,
        candidate: &CandidateProfile,
        project: &Project,
    ) -> Result<Verdict, ScoreError> {
        let user = prompts::fallback_user_prompt(candidate, project)
            .map_err(|e| ScoreError::Request(e.to_string()))?;

        let body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": prompts::fallback_system_prompt()},
                {"role": "user", "content": user}
            ],
            "temperature": 0.2
        });

        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ScoreError::from_status("Chat", status, &text));
        }

        let envelope: Value = response.json().await?;
        let content = envelope
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .ok_or_else(|| MalformedResponseError::new("missing choices[0].message.content", &envelope.to_string()))?;

        verdict_from_text(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_requires_url() {
        let config = BackendConfig {
            provider: "chat".to_string(),
            model: "sonar".to_string(),
            url: None,
            api_key_env: "X".to_string(),
        };
        assert!(ChatStrategy::new(&config, "k".into(), ScoreSource::Fallback, reqwest::Client::new()).is_err());
    }
}
