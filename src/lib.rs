//! GRPO (Group Relative Policy Optimization) from scratch, in Rust.
//!
//! A reinforcement-learning fine-tuning loop for causal language models that
//! replaces a learned value function with intra-group reward normalization:
//! for each prompt a group of responses is sampled, scored by pluggable
//! reward functions (or a learned reward model), and each response's
//! advantage is its group-standardized reward. Updates use a clipped
//! importance-sampling objective with an optional k3 KL penalty against a
//! frozen reference model.
//!
//! Built on candle; the model, tokenizer, and dataset are collaborators
//! behind small trait seams (`model::CausalLM`, `tokenizer::ChatTokenizer`,
//! `data::PromptDataset`).

pub mod data;
pub mod model;
pub mod tokenizer;
pub mod training;
pub mod utils;

pub use training::grpo::GrpoTrainer;
pub use utils::config::GrpoConfig;
pub use utils::error::{GrpoError, Result};
