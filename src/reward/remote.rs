//! Reward from a separate scoring model served over HTTP.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RewardConfig;
use crate::model::{Completion, Prompt, Turn};

use super::RewardModel;

#[derive(Debug, Serialize)]
struct ScoreRequest<'a> {
    messages: &'a [Turn],
    completion: &'a str,
    reference: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreResponse {
    pub reward: f64,
}

/// Calls `POST {api_base}/score` for every completion.
#[derive(Debug, Clone)]
pub struct RemoteReward {
    api_base: String,
    api_key: String,
    http: reqwest::Client,
}

impl RemoteReward {
    pub fn new(config: &RewardConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            http,
        })
    }
}

impl RewardModel for RemoteReward {
    async fn score(&self, prompt: &Prompt, completion: &Completion) -> Result<f64> {
        let url = format!("{}/score", self.api_base);
        let request = ScoreRequest {
            messages: &prompt.turns,
            completion: &completion.text,
            reference: prompt.reference.as_deref(),
        };

        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("failed to send score request")?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("reward model returned {status}: {text}");
        }

        let parsed: ScoreResponse = resp
            .json()
            .await
            .context("failed to parse score response")?;
        debug!(prompt = %prompt.id, reward = parsed.reward, "remote reward");
        Ok(parsed.reward)
    }
}
