use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::dto::{ChatRequest, ChatResponse, ResponseFormat};
use super::prompt::{build_messages, parse_reply};
use super::{CorrectionOracle, OracleRequest, OracleVerdict};
use crate::config::OracleConfig;

const USER_AGENT: &str = concat!("mealmind-verifier/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("oracle transport error: {0}")]
    Transport(String),

    #[error("oracle timed out after {0:?}")]
    Timeout(Duration),

    #[error("oracle returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("oracle returned an empty completion")]
    EmptyCompletion,

    #[error("malformed oracle reply: {0}")]
    Malformed(String),
}

/// Correction oracle backed by an OpenAI-compatible chat completions API.
#[derive(Clone)]
pub struct ChatCompletionOracle {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
    timeout: Duration,
}

impl ChatCompletionOracle {
    pub fn new(config: &OracleConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .context("build oracle http client")?;

        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            timeout: config.timeout,
        })
    }

    async fn complete(&self, request: &OracleRequest<'_>) -> Result<String, OracleError> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: build_messages(request),
            response_format: ResponseFormat { kind: "json_object" },
        };

        let resp = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: ChatResponse = resp.json().await.map_err(|e| self.classify(e))?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or(OracleError::EmptyCompletion)
    }

    fn classify(&self, e: reqwest::Error) -> OracleError {
        if e.is_timeout() {
            OracleError::Timeout(self.timeout)
        } else if e.is_decode() {
            OracleError::Malformed(e.to_string())
        } else {
            OracleError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl CorrectionOracle for ChatCompletionOracle {
    #[instrument(skip(self, request), fields(record_id = %request.record.id, model = %self.model))]
    async fn propose(&self, request: OracleRequest<'_>) -> OracleVerdict {
        let result = match self.complete(&request).await {
            Ok(content) => parse_reply(&content),
            Err(e) => Err(e),
        };

        match result {
            Ok(verdict) => {
                debug!(kind = ?verdict.kind(), "oracle verdict");
                verdict
            }
            Err(e) => {
                warn!(error = %e, "oracle unavailable");
                OracleVerdict::unavailable(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod client_tests {
    use super::*;

    fn config(base_url: &str) -> OracleConfig {
        OracleConfig {
            base_url: base_url.into(),
            api_key: "test".into(),
            model: "test-model".into(),
            timeout: Duration::from_millis(500),
            temperature: 0.0,
        }
    }

    #[test]
    fn endpoint_joins_base_url() {
        let oracle = ChatCompletionOracle::new(&config("https://api.example.com/v1/")).unwrap();
        assert_eq!(oracle.endpoint, "https://api.example.com/v1/chat/completions");
    }

    #[tokio::test]
    async fn unreachable_endpoint_degrades_to_unavailable() {
        use crate::records::{Nutrients, NutritionRecord};

        // Port 9 (discard) on localhost is not expected to speak HTTP.
        let oracle = ChatCompletionOracle::new(&config("http://127.0.0.1:9/v1")).unwrap();
        let record = NutritionRecord::new("apple", Nutrients::default());
        let verdict = oracle
            .propose(OracleRequest { record: &record, issues: &[], category_bounds: &[] })
            .await;
        assert!(matches!(verdict, OracleVerdict::Unavailable { .. }));
    }
}
