use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use grpo_from_scratch_in_rust::data::{PromptDataset, PromptRecord};
use grpo_from_scratch_in_rust::model::policy::{num_parameters, TinyCausalLM, TinyCausalLMConfig};
use grpo_from_scratch_in_rust::tokenizer::{ByteTokenizer, ChatTokenizer};
use grpo_from_scratch_in_rust::training::rewards::{
    correctness_reward, digit_reward, hard_format_reward, mark_reward, RewardAggregator,
    RewardSource,
};
use grpo_from_scratch_in_rust::training::sampler::SYSTEM_PROMPT;
use grpo_from_scratch_in_rust::utils::logging;
use grpo_from_scratch_in_rust::{GrpoConfig, GrpoTrainer, Result};
use std::sync::Arc;
use tracing::info;

fn demo_dataset() -> PromptDataset {
    let items: &[(&str, &str)] = &[
        ("1+1=?", "2"),
        ("2+2=?", "4"),
        ("3+4=?", "7"),
        ("9-3=?", "6"),
        ("5+5=?", "10"),
        ("8-1=?", "7"),
        ("6+3=?", "9"),
        ("7-2=?", "5"),
    ];
    PromptDataset::from_records(
        items
            .iter()
            .map(|(prompt, answer)| PromptRecord {
                prompt: prompt.to_string(),
                answer: Some(answer.to_string()),
            })
            .collect(),
    )
}

/// End-to-end demo: a byte-level tokenizer and a tiny candle policy driven
/// through the full GRPO loop on CPU-sized settings. Environment variables
/// (`GRPO_*`) override the base options; the demo then pins the sizes small.
fn main() -> Result<()> {
    logging::init_logging_from_env();
    info!("Starting GRPO from scratch (Rust)");

    // The byte-level tokenizer spends ~130 tokens on the chat template plus
    // system prompt, so the prompt budget has to clear that.
    let config = GrpoConfig {
        epochs: 1,
        num_generations: 4,
        max_prompt_length: 192,
        max_generate_length: 16,
        gradient_accumulation_steps: 2,
        num_iterations: 2,
        batch_size: 1,
        save_steps: 4,
        seed: Some(42),
        ..GrpoConfig::from_env()
    };
    config.validate()?;
    let device = config.resolve_device()?;

    let tokenizer = ByteTokenizer::new();
    let dataset = demo_dataset().filter_by_prompt_length(
        &tokenizer,
        SYSTEM_PROMPT,
        config.max_prompt_length,
    );

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model_config = TinyCausalLMConfig {
        vocab_size: tokenizer.vocab_size(),
        d_model: 32,
        d_hidden: 64,
    };
    let policy = TinyCausalLM::new(model_config.clone(), vb)?;
    info!(parameters = num_parameters(&varmap), "Policy model created");

    let reference = if config.beta != 0.0 {
        info!("Taking frozen reference snapshot for KL penalty");
        Some(TinyCausalLM::frozen_snapshot(&model_config, &varmap, &device)?)
    } else {
        None
    };

    let aggregator = RewardAggregator::new(
        vec![
            RewardSource::function("correctness", correctness_reward),
            RewardSource::function("digit", digit_reward),
            RewardSource::function("hard_format", hard_format_reward),
            RewardSource::function("mark", mark_reward),
        ],
        config.reward_weights.clone(),
    )?;

    let mut trainer = GrpoTrainer::new(
        config,
        device,
        policy,
        varmap,
        reference,
        Arc::new(tokenizer),
        aggregator,
    )?;

    trainer.train(&dataset)?;
    trainer.save_model()?;

    info!(updates = trainer.update_steps(), "Training run complete");
    Ok(())
}
