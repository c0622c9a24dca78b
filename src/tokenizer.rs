//! Tokenizer collaborator interface.
//!
//! The trainer is generic over any tokenizer exposing encode/decode, a chat
//! template, and pad/eos ids. Padding side is left for prompts so generated
//! continuations stay aligned at a fixed column; that alignment is relied on
//! by the log-probability extraction in the experience builder.

use crate::utils::error::{GrpoError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Tokenizer surface required by the GRPO loop.
pub trait ChatTokenizer: Send + Sync {
    /// Encode text to token ids, no special tokens added.
    fn encode(&self, text: &str) -> Vec<u32>;

    /// Decode token ids back to text. With `skip_special`, pad/eos and any
    /// other special ids are dropped.
    fn decode(&self, ids: &[u32], skip_special: bool) -> String;

    /// Render a system+user exchange through the chat template, ending with
    /// the assistant generation prompt.
    fn apply_chat_template(&self, system: &str, user: &str) -> String;

    fn pad_token_id(&self) -> u32;

    fn eos_token_id(&self) -> u32;

    fn vocab_size(&self) -> usize;

    /// Serialize the vocabulary/config into `dir` (checkpoint layout).
    fn save(&self, dir: &Path) -> Result<()>;
}

/// Chat template with role markers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTemplate {
    pub system_token: String,
    pub user_token: String,
    pub assistant_token: String,
    pub end_token: String,
}

impl Default for ChatTemplate {
    fn default() -> Self {
        Self {
            system_token: "<|system|>".to_string(),
            user_token: "<|user|>".to_string(),
            assistant_token: "<|assistant|>".to_string(),
            end_token: "<|end|>".to_string(),
        }
    }
}

impl ChatTemplate {
    /// Format a single message
    pub fn format_message(&self, role: &str, content: &str) -> String {
        let token = match role {
            "system" => &self.system_token,
            "user" => &self.user_token,
            "assistant" => &self.assistant_token,
            _ => &self.user_token,
        };
        format!("{}\n{}\n{}\n", token, content, self.end_token)
    }

    /// Format a system+user exchange with the assistant generation prompt.
    pub fn format_for_generation(&self, system: &str, user: &str) -> String {
        let mut formatted = self.format_message("system", system);
        formatted.push_str(&self.format_message("user", user));
        formatted.push_str(&format!("{}\n", self.assistant_token));
        formatted
    }
}

/// Byte-level tokenizer: each byte is its own token, with pad and eos ids
/// appended past the byte range. Used by the demo binary and the test suite;
/// real runs plug in a pretrained tokenizer behind the same trait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByteTokenizer {
    pad_id: u32,
    eos_id: u32,
    template: ChatTemplate,
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self {
            pad_id: 256,
            eos_id: 257,
            template: ChatTemplate::default(),
        }
    }
}

impl ByteTokenizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&content)
            .map_err(|e| GrpoError::Config(format!("Failed to parse tokenizer: {}", e)))
    }
}

impl ChatTokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<u32> {
        text.bytes().map(|b| b as u32).collect()
    }

    fn decode(&self, ids: &[u32], skip_special: bool) -> String {
        let bytes: Vec<u8> = ids
            .iter()
            .filter_map(|&id| {
                if id < 256 {
                    Some(id as u8)
                } else if skip_special {
                    None
                } else {
                    // Unknown non-byte ids render as the replacement byte.
                    Some(b'?')
                }
            })
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn apply_chat_template(&self, system: &str, user: &str) -> String {
        self.template.format_for_generation(system, user)
    }

    fn pad_token_id(&self) -> u32 {
        self.pad_id
    }

    fn eos_token_id(&self) -> u32 {
        self.eos_id
    }

    fn vocab_size(&self) -> usize {
        258
    }

    fn save(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GrpoError::Config(format!("Failed to serialize tokenizer: {}", e)))?;
        fs::write(dir.join("tokenizer.json"), json)?;
        Ok(())
    }
}
