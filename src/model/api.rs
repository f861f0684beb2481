//! HTTP client for a remote policy server.
//!
//! The server owns the model weights and the optimizer; this client drives it
//! through a small JSON API:
//!
//! | endpoint          | purpose                                          |
//! |-------------------|--------------------------------------------------|
//! | `POST /sample`    | sample `n` completions with token log-probs      |
//! | `POST /logprobs`  | score a completion under live or pinned weights  |
//! | `POST /backward`  | accumulate gradients from per-token weights      |
//! | `POST /step`      | apply the accumulated gradient                   |
//! | `POST /discard`   | drop the accumulated gradient                    |
//! | `POST /snapshot`  | pin the current weights, returning an id         |
//! | `POST /restore`   | make a pinned snapshot the live weights          |
//! | `POST /release`   | unpin a snapshot                                 |
//!
//! Snapshots are server-side; [`RemoteSnapshot`] only carries the id, so the
//! reference policy costs nothing to hold on the client. A checkpoint of a
//! remote policy is therefore just that id and is only as durable as the
//! server's pinned copy.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{DecodingConfig, ModelConfig};

use super::policy::{GradientTerm, PolicyModel, PolicyView};
use super::types::{Completion, FinishReason, Prompt, Turn};

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

/// A completion as returned by `/sample`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampledCompletion {
    pub text: String,
    pub token_ids: Vec<u32>,
    pub logprobs: Vec<f64>,
    /// `"stop"` or `"length"`.
    pub finish_reason: Option<String>,
}

impl SampledCompletion {
    fn into_completion(self) -> Completion {
        let finish_reason = match self.finish_reason.as_deref() {
            Some("length") => FinishReason::Length,
            _ => FinishReason::Stop,
        };
        Completion::new(self.text, self.token_ids, self.logprobs, finish_reason)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleResponse {
    pub completions: Vec<SampledCompletion>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogProbResponse {
    pub logprobs: Vec<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackwardResponse {
    pub grad_norm: f64,
}

/// A pinned set of weights on the policy server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteSnapshot {
    pub id: String,
}

#[derive(Debug, Serialize)]
struct BackwardTerm<'a> {
    messages: &'a [Turn],
    token_ids: &'a [u32],
    token_weights: &'a [f64],
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A [`PolicyModel`] backed by a policy server.
#[derive(Debug, Clone)]
pub struct RemotePolicy {
    /// The base URL for API requests (e.g. `"http://localhost:8000/v1"`).
    pub api_base: String,
    pub api_key: String,
    pub model_id: String,
    /// Learning rate sent with every optimizer step.
    pub learning_rate: f64,
    pub http: reqwest::Client,
}

impl RemotePolicy {
    pub fn new(config: &ModelConfig, learning_rate: f64) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            api_base: config.policy_api_base.trim_end_matches('/').to_string(),
            api_key: config.policy_api_key.clone(),
            model_id: config.policy_model_id.clone(),
            learning_rate,
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.api_base, path.trim_start_matches('/'))
    }

    /// POST a JSON body and parse a JSON response, failing on non-2xx status.
    async fn post<T: DeserializeOwned>(&self, path: &str, body: &serde_json::Value) -> Result<T> {
        let url = self.url(path);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .with_context(|| format!("failed to send request to {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("policy server {path} returned {status}: {text}");
        }

        resp.json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))
    }

    fn sample_body(
        &self,
        prompt: &Prompt,
        group_size: usize,
        decoding: &DecodingConfig,
    ) -> serde_json::Value {
        serde_json::json!({
            "model": self.model_id,
            "messages": prompt.turns,
            "n": group_size,
            "temperature": decoding.temperature,
            "top_p": decoding.top_p,
            "top_k": decoding.top_k,
            "repetition_penalty": decoding.repetition_penalty,
            "max_tokens": decoding.max_completion_length,
            "truncate_prompt_tokens": decoding.max_prompt_length,
            "logprobs": true,
        })
    }
}

impl PolicyModel for RemotePolicy {
    type Snapshot = RemoteSnapshot;

    async fn sample(
        &self,
        prompt: &Prompt,
        group_size: usize,
        decoding: &DecodingConfig,
    ) -> Result<Vec<Completion>> {
        let body = self.sample_body(prompt, group_size, decoding);
        let resp: SampleResponse = self
            .post("sample", &body)
            .await
            .with_context(|| format!("sampling failed for prompt {}", prompt.id))?;

        debug!(
            prompt = %prompt.id,
            returned = resp.completions.len(),
            "received sampled group"
        );
        Ok(resp
            .completions
            .into_iter()
            .map(SampledCompletion::into_completion)
            .collect())
    }

    async fn log_probabilities(
        &self,
        prompt: &Prompt,
        completion: &Completion,
        view: PolicyView<'_, RemoteSnapshot>,
    ) -> Result<Vec<f64>> {
        let snapshot = match view {
            PolicyView::Current => None,
            PolicyView::Frozen(s) => Some(s.id.as_str()),
        };
        let body = serde_json::json!({
            "model": self.model_id,
            "snapshot": snapshot,
            "messages": prompt.turns,
            "token_ids": completion.token_ids,
        });
        let resp: LogProbResponse = self.post("logprobs", &body).await?;
        if resp.logprobs.len() != completion.token_ids.len() {
            anyhow::bail!(
                "policy server returned {} log-probs for {} tokens",
                resp.logprobs.len(),
                completion.token_ids.len()
            );
        }
        Ok(resp.logprobs)
    }

    async fn backward(&mut self, terms: &[GradientTerm<'_>]) -> Result<f64> {
        let payload: Vec<BackwardTerm<'_>> = terms
            .iter()
            .map(|t| {
                let n = t.token_weights.len().min(t.completion.token_ids.len());
                BackwardTerm {
                    messages: &t.prompt.turns,
                    token_ids: &t.completion.token_ids[..n],
                    token_weights: &t.token_weights[..n],
                }
            })
            .collect();
        let body = serde_json::json!({
            "model": self.model_id,
            "terms": payload,
        });
        let resp: BackwardResponse = self.post("backward", &body).await?;
        Ok(resp.grad_norm)
    }

    async fn apply_gradient(&mut self) -> Result<()> {
        let body = serde_json::json!({
            "model": self.model_id,
            "learning_rate": self.learning_rate,
        });
        let _: IgnoredAny = self.post("step", &body).await?;
        info!(model = %self.model_id, "optimizer step applied on policy server");
        Ok(())
    }

    async fn discard_gradient(&mut self) -> Result<()> {
        let body = serde_json::json!({ "model": self.model_id });
        let _: IgnoredAny = self.post("discard", &body).await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<RemoteSnapshot> {
        let body = serde_json::json!({ "model": self.model_id });
        self.post("snapshot", &body).await
    }

    async fn restore(&mut self, snapshot: RemoteSnapshot) -> Result<()> {
        let body = serde_json::json!({
            "model": self.model_id,
            "id": snapshot.id,
        });
        let _: IgnoredAny = self.post("restore", &body).await?;
        Ok(())
    }

    async fn release(&mut self, snapshot: RemoteSnapshot) -> Result<()> {
        let body = serde_json::json!({
            "model": self.model_id,
            "id": snapshot.id,
        });
        let _: IgnoredAny = self.post("release", &body).await?;
        debug!(model = %self.model_id, id = %snapshot.id, "released snapshot on policy server");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> RemotePolicy {
        let config = ModelConfig {
            policy_api_base: "http://localhost:8000/v1/".into(),
            ..ModelConfig::default()
        };
        RemotePolicy::new(&config, 1e-6).unwrap()
    }

    #[test]
    fn test_url_joining() {
        let c = client();
        assert_eq!(c.api_base, "http://localhost:8000/v1");
        assert_eq!(c.url("sample"), "http://localhost:8000/v1/sample");
        assert_eq!(c.url("/logprobs"), "http://localhost:8000/v1/logprobs");
    }

    #[test]
    fn test_sample_body_carries_decoding() {
        let c = client();
        let prompt = Prompt::new("p", vec![Turn::user("hi")]);
        let decoding = DecodingConfig {
            temperature: 0.7,
            top_k: 50,
            max_completion_length: 256,
            ..DecodingConfig::default()
        };
        let body = c.sample_body(&prompt, 4, &decoding);
        assert_eq!(body["n"], 4);
        assert_eq!(body["top_k"], 50);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");
    }

    #[test]
    fn test_sample_response_parsing() {
        let json = r#"{
            "completions": [
                { "text": "4", "token_ids": [19, 2], "logprobs": [-0.1, -0.2], "finish_reason": "stop" },
                { "text": "four and", "token_ids": [7, 8], "logprobs": [-1.0, -2.0], "finish_reason": "length" }
            ]
        }"#;
        let resp: SampleResponse = serde_json::from_str(json).unwrap();
        let completions: Vec<Completion> = resp
            .completions
            .into_iter()
            .map(SampledCompletion::into_completion)
            .collect();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].finish_reason, FinishReason::Stop);
        assert_eq!(completions[1].finish_reason, FinishReason::Length);
        assert_eq!(completions[1].token_ids, vec![7, 8]);
        assert!(!completions[1].is_truncated());
    }
}
