//! End-to-end tests for the GRPO training loop on CPU-sized settings.

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use grpo_from_scratch_in_rust::data::{PromptDataset, PromptRecord};
use grpo_from_scratch_in_rust::model::policy::{CausalLM, TinyCausalLM, TinyCausalLMConfig};
use grpo_from_scratch_in_rust::tokenizer::{ByteTokenizer, ChatTokenizer};
use grpo_from_scratch_in_rust::training::rewards::{
    boxed_correctness_reward, boxed_format_reward, correctness_reward, digit_reward,
    hard_format_reward, mark_reward, RewardAggregator, RewardSource,
};
use grpo_from_scratch_in_rust::training::sampler::{SampleGenerator, SamplingParams};
use grpo_from_scratch_in_rust::utils::checkpoint::load_model_checkpoint;
use grpo_from_scratch_in_rust::{GrpoConfig, GrpoError, GrpoTrainer};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tempfile::tempdir;

/// Policy wrapper that makes eos and pad unreachable during sampling,
/// keeping every generated row at the full response width. Gradients still
/// flow through the wrapped model.
struct EosSuppressed {
    inner: TinyCausalLM,
    penalty: Tensor,
}

impl EosSuppressed {
    fn new(inner: TinyCausalLM, tokenizer: &ByteTokenizer, device: &Device) -> Self {
        let vocab = inner.vocab_size();
        let mut bias = vec![0f32; vocab];
        bias[tokenizer.eos_token_id() as usize] = -1.0e4;
        bias[tokenizer.pad_token_id() as usize] = -1.0e4;
        let penalty = Tensor::from_vec(bias, (vocab,), device).unwrap();
        Self { inner, penalty }
    }
}

impl CausalLM for EosSuppressed {
    fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> grpo_from_scratch_in_rust::Result<Tensor> {
        let logits = self.inner.forward(input_ids, attention_mask)?;
        Ok(logits.broadcast_add(&self.penalty)?)
    }

    fn vocab_size(&self) -> usize {
        self.inner.vocab_size()
    }
}

fn arithmetic_dataset() -> PromptDataset {
    PromptDataset::from_records(
        [("1+1=?", "2"), ("2+2=?", "4"), ("3+4=?", "7"), ("9-3=?", "6")]
            .iter()
            .map(|(p, a)| PromptRecord {
                prompt: p.to_string(),
                answer: Some(a.to_string()),
            })
            .collect(),
    )
}

fn build_trainer(output_dir: &str, beta: f64, num_iterations: usize) -> GrpoTrainer<EosSuppressed> {
    let device = Device::Cpu;
    let tokenizer = ByteTokenizer::new();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model_config = TinyCausalLMConfig {
        vocab_size: tokenizer.vocab_size(),
        d_model: 16,
        d_hidden: 32,
    };
    let policy = EosSuppressed::new(
        TinyCausalLM::new(model_config.clone(), vb).unwrap(),
        &tokenizer,
        &device,
    );
    let reference = if beta != 0.0 {
        Some(EosSuppressed::new(
            TinyCausalLM::frozen_snapshot(&model_config, &varmap, &device).unwrap(),
            &tokenizer,
            &device,
        ))
    } else {
        None
    };

    let config = GrpoConfig {
        output_dir: output_dir.to_string(),
        epochs: 1,
        num_generations: 2,
        max_prompt_length: 24,
        max_generate_length: 4,
        gradient_accumulation_steps: 2,
        num_iterations,
        batch_size: 1,
        save_steps: 1,
        beta,
        seed: Some(7),
        ..Default::default()
    };

    let aggregator = RewardAggregator::new(
        vec![
            RewardSource::function("correctness", correctness_reward),
            RewardSource::function("digit", digit_reward),
            RewardSource::function("hard_format", hard_format_reward),
            RewardSource::function("mark", mark_reward),
        ],
        None,
    )
    .unwrap();

    GrpoTrainer::new(
        config,
        device,
        policy,
        varmap,
        reference,
        Arc::new(tokenizer),
        aggregator,
    )
    .unwrap()
}

#[test]
fn test_full_training_run_with_kl_and_buffer_replay() {
    let dir = tempdir().unwrap();
    let out = dir.path().to_string_lossy().into_owned();

    // 4 prompts, batch 1, window 2 -> two full windows; each replayed twice.
    let mut trainer = build_trainer(&out, 0.01, 2);
    trainer.train(&arithmetic_dataset()).unwrap();
    assert_eq!(trainer.update_steps(), 4);

    // save_steps = 1: one checkpoint directory per completed update,
    // each holding verified weights plus the tokenizer artifact.
    for step in 1..=4 {
        let ckpt = dir.path().join(format!("checkpoint_{}", step));
        assert!(ckpt.join("model.safetensors").exists(), "missing {:?}", ckpt);
        assert!(ckpt.join("checkpoint.meta.json").exists());
        assert!(ckpt.join("tokenizer.json").exists());

        let (tensors, meta) = load_model_checkpoint(&ckpt, &Device::Cpu).unwrap();
        assert!(!tensors.is_empty());
        assert_eq!(meta.unwrap().update_steps, Some(step as u64));
    }

    // Final artifact lands in the output directory itself.
    trainer.save_model().unwrap();
    assert!(dir.path().join("model.safetensors").exists());
    assert!(dir.path().join("tokenizer.json").exists());
}

#[test]
fn test_training_run_without_reference_model() {
    let dir = tempdir().unwrap();
    let out = dir.path().to_string_lossy().into_owned();

    // beta = 0: no reference model, no KL term, single pass per window.
    let mut trainer = build_trainer(&out, 0.0, 1);
    trainer.train(&arithmetic_dataset()).unwrap();
    assert_eq!(trainer.update_steps(), 2);
}

#[test]
fn test_reward_weight_mismatch_is_fatal_at_setup() {
    let device = Device::Cpu;
    let tokenizer = ByteTokenizer::new();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let model_config = TinyCausalLMConfig {
        vocab_size: tokenizer.vocab_size(),
        d_model: 8,
        d_hidden: 16,
    };
    let policy = EosSuppressed::new(
        TinyCausalLM::new(model_config, vb).unwrap(),
        &tokenizer,
        &device,
    );

    let config = GrpoConfig {
        beta: 0.0,
        reward_weights: Some(vec![1.0, 0.5, 0.25]),
        ..Default::default()
    };
    let aggregator = RewardAggregator::new(
        vec![RewardSource::function("digit", digit_reward)],
        None,
    )
    .unwrap();

    let err = GrpoTrainer::new(
        config,
        device,
        policy,
        varmap,
        None,
        Arc::new(tokenizer),
        aggregator,
    )
    .err();
    assert!(matches!(err, Some(GrpoError::Config(_))));
}

#[test]
fn test_well_formed_response_scores_three_point_five() {
    let aggregator = RewardAggregator::new(
        vec![
            RewardSource::function("correctness", correctness_reward),
            RewardSource::function("digit", digit_reward),
            RewardSource::function("hard_format", hard_format_reward),
            RewardSource::function("mark", mark_reward),
        ],
        None,
    )
    .unwrap();

    let prompts = vec!["2+2=?".to_string()];
    let responses =
        vec!["<think>\ntwo plus two is four\n</think>\n<answer>\n4\n</answer>\n".to_string()];
    let answers = vec![Some("4".to_string())];

    let rewards = aggregator.score_group(&prompts, &responses, &answers).unwrap();
    // correctness 2.0 + digit 0.5 + hard_format 0.5 + mark 0.5
    assert!((rewards.totals[0] - 3.5).abs() < 1e-9);
    assert_eq!(rewards.per_source[0][0], 2.0);
    assert_eq!(rewards.per_source[1][0], 0.5);
    assert_eq!(rewards.per_source[2][0], 0.5);
    assert_eq!(rewards.per_source[3][0], 0.5);
}

#[test]
fn test_boxed_response_scores() {
    let aggregator = RewardAggregator::new(
        vec![
            RewardSource::function("boxed_correctness", boxed_correctness_reward),
            RewardSource::function("boxed_format", boxed_format_reward),
        ],
        None,
    )
    .unwrap();

    let prompts = vec!["2+2=?".to_string()];
    let responses = vec![r"the sum is \boxed{4}".to_string()];
    let answers = vec![Some("4".to_string())];

    let rewards = aggregator.score_group(&prompts, &responses, &answers).unwrap();
    assert!(rewards.per_source[0][0] > 0.0, "correctness must be positive");
    assert!((rewards.per_source[1][0] - 1.0).abs() < 1e-9, "numeric boxed content maxes format");
}

#[test]
fn test_generation_round_trip_masks_and_lengths() {
    let device = Device::Cpu;
    let tokenizer = ByteTokenizer::new();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let policy = EosSuppressed::new(
        TinyCausalLM::new(
            TinyCausalLMConfig {
                vocab_size: tokenizer.vocab_size(),
                d_model: 8,
                d_hidden: 16,
            },
            vb,
        )
        .unwrap(),
        &tokenizer,
        &device,
    );

    let mut generator = SampleGenerator::new(
        3,
        32,
        5,
        SamplingParams::default(),
        device,
        StdRng::seed_from_u64(11),
    );
    let group = generator
        .generate_group(&policy, &tokenizer, "2+2=?", Some("4"))
        .unwrap();

    // With eos unreachable, every response token is credited.
    assert_eq!(group.response_lengths, vec![5, 5, 5]);

    let rows = group.response_ids.to_vec2::<u32>().unwrap();
    for row in rows {
        let text = tokenizer.decode(&row, true);
        // The decoded continuation excludes the prompt and the template;
        // multi-byte sequences can merge, so chars bound from above.
        assert!(!text.contains("2+2=?"));
        assert!(!text.contains("<|assistant|>"));
        assert!(!text.is_empty() && text.chars().count() <= 5);
    }
}
