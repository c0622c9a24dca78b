//! Prompt dataset loading and batching.
//!
//! Records carry a prompt and an opaque optional ground-truth answer that is
//! passed through to reward functions untouched. Length pre-filtering runs
//! the same chat-template + tokenizer pipeline used at training time so that
//! nothing kept here gets truncated later.

use crate::tokenizer::ChatTokenizer;
use crate::utils::error::{GrpoError, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

/// One dataset item: a prompt and an optional ground-truth answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PromptRecord {
    #[serde(alias = "question")]
    pub prompt: String,
    #[serde(default, alias = "answer_only")]
    pub answer: Option<String>,
}

/// In-memory prompt dataset.
#[derive(Debug, Clone, Default)]
pub struct PromptDataset {
    records: Vec<PromptRecord>,
}

impl PromptDataset {
    pub fn from_records(records: Vec<PromptRecord>) -> Self {
        Self { records }
    }

    /// Load records from a JSONL file, one object per line.
    pub fn from_jsonl<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut records = Vec::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: PromptRecord = serde_json::from_str(&line).map_err(|e| {
                GrpoError::Dataset(format!(
                    "{}:{}: invalid record: {}",
                    path.display(),
                    line_no + 1,
                    e
                ))
            })?;
            records.push(record);
        }

        info!(path = %path.display(), records = records.len(), "Loaded dataset");
        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[PromptRecord] {
        &self.records
    }

    /// Keep only prompts whose chat-templated token length fits within
    /// `max_prompt_length`, using the exact encoding applied at training time.
    pub fn filter_by_prompt_length(
        self,
        tokenizer: &dyn ChatTokenizer,
        system_prompt: &str,
        max_prompt_length: usize,
    ) -> Self {
        let original = self.records.len();
        let records: Vec<PromptRecord> = self
            .records
            .into_iter()
            .filter(|r| {
                let templated = tokenizer.apply_chat_template(system_prompt, &r.prompt);
                tokenizer.encode(&templated).len() <= max_prompt_length
            })
            .collect();

        let kept = records.len();
        let retention = if original > 0 {
            kept as f64 / original as f64 * 100.0
        } else {
            100.0
        };
        info!(
            original,
            kept,
            filtered_out = original - kept,
            retention_pct = format!("{:.2}", retention).as_str(),
            "Filtered dataset by prompt length"
        );

        Self { records }
    }

    /// Shuffle and chunk into mini-batches for one epoch. The trailing
    /// partial batch is kept.
    pub fn shuffled_batches(&self, batch_size: usize, rng: &mut StdRng) -> Vec<Vec<PromptRecord>> {
        let mut shuffled = self.records.clone();
        shuffled.shuffle(rng);
        shuffled
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }
}
