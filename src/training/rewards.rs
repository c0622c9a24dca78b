//! Reward functions and aggregation.
//!
//! Two kinds of reward source share one scoring surface: rule-based scoring
//! functions over decoded text, and a learned reward model over the
//! concatenated prompt+response. Per-group scores form a
//! `[num_sources, num_generations]` matrix combined by a weight vector into
//! one scalar per response. A source that cannot score an item yields NaN so
//! the anomaly surfaces in group statistics instead of aborting the run.

use crate::model::reward_model::RewardModel;
use crate::tokenizer::ChatTokenizer;
use crate::utils::error::{GrpoError, Result};
use regex::Regex;
use std::sync::{Arc, OnceLock};

/// Rule-based scoring plugin: one optional score per response,
/// order-aligned with the inputs.
pub type ScoringFn = fn(&[String], &[String], &[Option<String>]) -> Vec<Option<f64>>;

static HARD_FORMAT_RE: OnceLock<Regex> = OnceLock::new();
static BOXED_RE: OnceLock<Regex> = OnceLock::new();

fn hard_format_re() -> &'static Regex {
    HARD_FORMAT_RE.get_or_init(|| {
        Regex::new(r"^<think>\n.*?\n</think>\n<answer>\n.*?\n</answer>\n$")
            .expect("static pattern")
    })
}

fn boxed_re() -> &'static Regex {
    BOXED_RE.get_or_init(|| Regex::new(r"\\boxed\{([^}]*)\}").expect("static pattern"))
}

/// Text between the final `<answer>` tag and the following `</answer>` tag,
/// trimmed. Falls back to the whole text when the tags are absent.
pub fn extract_answer(text: &str) -> &str {
    let tail = match text.rfind("<answer>") {
        Some(i) => &text[i + "<answer>".len()..],
        None => text,
    };
    let body = match tail.find("</answer>") {
        Some(i) => &tail[..i],
        None => tail,
    };
    body.trim()
}

fn count_occurrences(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

/// 2.0 when the extracted answer string-equals the ground truth, else 0.0.
/// Missing ground truth yields no score.
pub fn correctness_reward(
    _prompts: &[String],
    responses: &[String],
    answers: &[Option<String>],
) -> Vec<Option<f64>> {
    responses
        .iter()
        .zip(answers.iter())
        .map(|(response, answer)| {
            answer.as_ref().map(|ans| {
                if extract_answer(response) == ans.as_str() {
                    2.0
                } else {
                    0.0
                }
            })
        })
        .collect()
}

/// 0.5 when the extracted answer is purely digits. Softens the sparsity of
/// exact-match correctness on math prompts.
pub fn digit_reward(
    _prompts: &[String],
    responses: &[String],
    _answers: &[Option<String>],
) -> Vec<Option<f64>> {
    responses
        .iter()
        .map(|response| {
            let extracted = extract_answer(response);
            let is_digits = !extracted.is_empty() && extracted.chars().all(|c| c.is_ascii_digit());
            Some(if is_digits { 0.5 } else { 0.0 })
        })
        .collect()
}

/// 0.5 when the whole response matches the strict
/// `<think>\n...\n</think>\n<answer>\n...\n</answer>\n` structure.
pub fn hard_format_reward(
    _prompts: &[String],
    responses: &[String],
    _answers: &[Option<String>],
) -> Vec<Option<f64>> {
    responses
        .iter()
        .map(|response| Some(if hard_format_re().is_match(response) { 0.5 } else { 0.0 }))
        .collect()
}

/// 0.125 per tag-plus-newline occurring exactly once, max 0.5.
pub fn mark_reward(
    _prompts: &[String],
    responses: &[String],
    _answers: &[Option<String>],
) -> Vec<Option<f64>> {
    responses
        .iter()
        .map(|response| {
            let mut reward = 0.0;
            for tag in ["<think>\n", "</think>\n", "<answer>\n", "</answer>\n"] {
                if count_occurrences(response, tag) == 1 {
                    reward += 0.125;
                }
            }
            Some(reward)
        })
        .collect()
}

// Numeric in the loose sense: all digits after removing the first '.' and
// the first '-', wherever they appear.
fn is_loose_numeric(content: &str) -> bool {
    let mut s = content.to_string();
    if let Some(i) = s.find('.') {
        s.remove(i);
    }
    if let Some(i) = s.find('-') {
        s.remove(i);
    }
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// Graded `\boxed{}` compliance: 0.5 for a box, +0.3 for non-empty content,
/// +0.2 for numeric content, capped at 1.0.
pub fn boxed_format_reward(
    _prompts: &[String],
    responses: &[String],
    _answers: &[Option<String>],
) -> Vec<Option<f64>> {
    responses
        .iter()
        .map(|response| {
            let mut reward = 0.0;
            if let Some(caps) = boxed_re().captures(response) {
                reward += 0.5;
                let content = caps.get(1).map(|m| m.as_str().trim()).unwrap_or("");
                if !content.is_empty() {
                    reward += 0.3;
                    if is_loose_numeric(content) {
                        reward += 0.2;
                    }
                }
            }
            Some(reward)
        })
        .collect()
}

fn numeric_equivalent(lhs: &str, rhs: &str) -> bool {
    match (lhs.trim().parse::<f64>(), rhs.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => {
            let scale = a.abs().max(b.abs()).max(1.0);
            (a - b).abs() <= 1e-9 * scale
        }
        _ => lhs.trim() == rhs.trim(),
    }
}

/// 2.0 when the content of the last `\boxed{}` span is numerically (or,
/// failing a numeric parse, textually) equivalent to the ground truth.
pub fn boxed_correctness_reward(
    _prompts: &[String],
    responses: &[String],
    answers: &[Option<String>],
) -> Vec<Option<f64>> {
    responses
        .iter()
        .zip(answers.iter())
        .map(|(response, answer)| {
            answer.as_ref().map(|ans| {
                let boxed = boxed_re()
                    .captures_iter(response)
                    .last()
                    .and_then(|caps| caps.get(1))
                    .map(|m| m.as_str());
                match boxed {
                    Some(content) if numeric_equivalent(content, ans) => 2.0,
                    _ => 0.0,
                }
            })
        })
        .collect()
}

/// One reward source: a named rule-based function or a learned scoring model
/// paired with its own tokenizer.
pub enum RewardSource {
    Function {
        name: &'static str,
        f: ScoringFn,
    },
    Model {
        name: String,
        model: RewardModel,
        tokenizer: Arc<dyn ChatTokenizer>,
    },
}

impl RewardSource {
    pub fn function(name: &'static str, f: ScoringFn) -> Self {
        Self::Function { name, f }
    }

    pub fn model(
        name: impl Into<String>,
        model: RewardModel,
        tokenizer: Arc<dyn ChatTokenizer>,
    ) -> Self {
        Self::Model {
            name: name.into(),
            model,
            tokenizer,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Function { name, .. } => name,
            Self::Model { name, .. } => name,
        }
    }

    /// One score per response; unscorable items become NaN.
    pub fn score(
        &self,
        prompts: &[String],
        responses: &[String],
        answers: &[Option<String>],
    ) -> Result<Vec<f64>> {
        match self {
            Self::Function { f, .. } => Ok(f(prompts, responses, answers)
                .into_iter()
                .map(|r| r.unwrap_or(f64::NAN))
                .collect()),
            Self::Model {
                model, tokenizer, ..
            } => {
                let texts: Vec<String> = prompts
                    .iter()
                    .zip(responses.iter())
                    .map(|(p, r)| format!("{}{}", p, r))
                    .collect();
                model.score_texts(&texts, tokenizer.as_ref())
            }
        }
    }
}

/// Pair learned reward models with their tokenizers, failing fast on a
/// count mismatch.
pub fn paired_model_sources(
    models: Vec<(String, RewardModel)>,
    tokenizers: Vec<Arc<dyn ChatTokenizer>>,
) -> Result<Vec<RewardSource>> {
    if models.len() != tokenizers.len() {
        return Err(GrpoError::Config(format!(
            "Length of reward tokenizers ({}) must equal the number of reward models ({})",
            tokenizers.len(),
            models.len()
        )));
    }
    Ok(models
        .into_iter()
        .zip(tokenizers)
        .map(|((name, model), tokenizer)| RewardSource::model(name, model, tokenizer))
        .collect())
}

/// Raw and combined rewards for one group.
#[derive(Debug, Clone)]
pub struct GroupRewards {
    /// `[num_sources][num_generations]` raw scores
    pub per_source: Vec<Vec<f64>>,
    /// Weighted sum over sources, one scalar per response
    pub totals: Vec<f64>,
}

/// Combines a fixed set of reward sources with a weight vector.
pub struct RewardAggregator {
    sources: Vec<RewardSource>,
    weights: Vec<f64>,
}

impl RewardAggregator {
    /// Weights default to uniform 1.0; a supplied vector must match the
    /// source count or construction fails.
    pub fn new(sources: Vec<RewardSource>, weights: Option<Vec<f64>>) -> Result<Self> {
        if sources.is_empty() {
            return Err(GrpoError::Config("No reward sources configured".into()));
        }
        let weights = match weights {
            Some(w) => {
                if w.len() != sources.len() {
                    return Err(GrpoError::Config(format!(
                        "The number of reward weights ({}) must be equal to the number of reward sources ({})",
                        w.len(),
                        sources.len()
                    )));
                }
                w
            }
            None => vec![1.0; sources.len()],
        };
        Ok(Self { sources, weights })
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Score one group of responses sharing a prompt.
    pub fn score_group(
        &self,
        prompts: &[String],
        responses: &[String],
        answers: &[Option<String>],
    ) -> Result<GroupRewards> {
        if prompts.len() != responses.len() || responses.len() != answers.len() {
            return Err(GrpoError::Reward(format!(
                "Misaligned reward inputs: {} prompts, {} responses, {} answers",
                prompts.len(),
                responses.len(),
                answers.len()
            )));
        }

        let mut per_source = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            let scores = source.score(prompts, responses, answers)?;
            if scores.len() != responses.len() {
                return Err(GrpoError::Reward(format!(
                    "Reward source '{}' returned {} scores for {} responses",
                    source.name(),
                    scores.len(),
                    responses.len()
                )));
            }
            per_source.push(scores);
        }

        let totals = (0..responses.len())
            .map(|j| {
                per_source
                    .iter()
                    .zip(self.weights.iter())
                    .map(|(row, w)| w * row[j])
                    .sum()
            })
            .collect();

        Ok(GroupRewards { per_source, totals })
    }
}
