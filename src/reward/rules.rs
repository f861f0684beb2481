//! Rule-based reward functions.
//!
//! Rules are configured as a weighted list and summed, e.g.
//!
//! ```json
//! "rules": [
//!   { "kind": "exact_match", "weight": 1.0 },
//!   { "kind": "contains", "keyword": "<answer>", "weight": 0.2 },
//!   { "kind": "length", "max_chars": 400, "weight": 0.5 }
//! ]
//! ```

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::model::{Completion, Prompt};

use super::RewardModel;

/// A single scoring rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleReward {
    /// 1.0 when the (extracted) answer equals the prompt's reference answer
    /// after normalization, 0.0 otherwise. Fails when the prompt has no
    /// reference.
    ExactMatch,
    /// 1.0 when the completion contains `keyword`, 0.0 otherwise.
    Contains {
        keyword: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// 0.0 up to `max_chars`, then minus the relative overshoot.
    Length { max_chars: usize },
}

impl RuleReward {
    pub fn contains(keyword: impl Into<String>) -> Self {
        Self::Contains {
            keyword: keyword.into(),
            case_sensitive: false,
        }
    }

    fn evaluate(&self, prompt: &Prompt, completion: &Completion) -> Result<f64> {
        match self {
            Self::ExactMatch => {
                let Some(reference) = prompt.reference.as_deref() else {
                    bail!("prompt {} has no reference answer", prompt.id);
                };
                let answer = extract_answer(&completion.text);
                Ok(if normalize(answer) == normalize(extract_answer(reference)) {
                    1.0
                } else {
                    0.0
                })
            }
            Self::Contains {
                keyword,
                case_sensitive,
            } => {
                let hit = if *case_sensitive {
                    completion.text.contains(keyword.as_str())
                } else {
                    completion
                        .text
                        .to_lowercase()
                        .contains(&keyword.to_lowercase())
                };
                Ok(if hit { 1.0 } else { 0.0 })
            }
            Self::Length { max_chars } => {
                if *max_chars == 0 {
                    bail!("length rule needs max_chars > 0");
                }
                let len = completion.text.chars().count();
                if len <= *max_chars {
                    Ok(0.0)
                } else {
                    Ok(-((len - max_chars) as f64 / *max_chars as f64))
                }
            }
        }
    }
}

impl RewardModel for RuleReward {
    async fn score(&self, prompt: &Prompt, completion: &Completion) -> Result<f64> {
        self.evaluate(prompt, completion)
    }
}

/// A rule with its weight in a [`WeightedSum`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedRule {
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(flatten)]
    pub rule: RuleReward,
}

fn default_weight() -> f64 {
    1.0
}

/// Sum of weighted rules. Any failing rule fails the whole score.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedSum {
    terms: Vec<WeightedRule>,
}

impl WeightedSum {
    pub fn new(terms: Vec<WeightedRule>) -> Self {
        Self { terms }
    }

    pub fn terms(&self) -> &[WeightedRule] {
        &self.terms
    }
}

impl RewardModel for WeightedSum {
    async fn score(&self, prompt: &Prompt, completion: &Completion) -> Result<f64> {
        let mut total = 0.0;
        for term in &self.terms {
            total += term.weight * term.rule.evaluate(prompt, completion)?;
        }
        Ok(total)
    }
}

/// The text inside `<answer>...</answer>` if present, else the whole text.
fn extract_answer(text: &str) -> &str {
    if let Some(start) = text.find("<answer>") {
        let rest = &text[start + "<answer>".len()..];
        if let Some(end) = rest.find("</answer>") {
            return &rest[..end];
        }
    }
    text
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches('.')
        .to_lowercase()
}
