//! Experience building: from a mini-batch of prompts to the tensors the
//! loss consumes.
//!
//! For every prompt the sample generator produces a group; this module adds
//! the generation-time ("old") per-token log-probabilities, the reference
//! model's log-probabilities when a reference exists, and the group-relative
//! advantages, then concatenates everything along the batch dimension.
//!
//! The log-probability extraction must use the same tokenization and
//! attention-mask alignment as generation, or the importance ratios in the
//! loss are invalid: logits are teacher-forced over the full padded
//! prompt+response row and only the trailing `num_actions` positions are
//! kept.

use crate::data::PromptRecord;
use crate::model::policy::CausalLM;
use crate::tokenizer::ChatTokenizer;
use crate::training::rewards::RewardAggregator;
use crate::training::sampler::SampleGenerator;
use crate::utils::error::{GrpoError, Result};
use crate::utils::metrics;
use candle_core::{DType, Tensor, D};
use candle_nn::ops;
use tracing::debug;

/// Additive epsilon in the advantage denominator; keeps zero-variance groups
/// finite instead of dividing by exact zero.
pub const ADVANTAGE_EPS: f64 = 1e-8;

/// One buffered mini-batch of experience, already flattened over groups.
#[derive(Debug, Clone)]
pub struct ExperienceBatch {
    /// `[B, P+R]` u32, B = prompts * num_generations
    pub prompt_response_ids: Tensor,
    /// `[B, P+R]` f32
    pub attention_mask: Tensor,
    /// `[B, R]` f32
    pub action_mask: Tensor,
    /// `[B, R]` f32 generation-time policy log-probs, detached
    pub old_action_log_probs: Tensor,
    /// `[B, R]` f32 reference-model log-probs; absent when beta == 0
    pub ref_action_log_probs: Option<Tensor>,
    /// `[B]` f32 group-standardized rewards
    pub advantages: Tensor,
    /// Response-span width shared by every row
    pub num_actions: usize,
}

/// Per-token log-probabilities of the actually-taken tokens, restricted to
/// the trailing `num_actions` response positions.
///
/// Shift-by-one teacher forcing: position `t`'s logits predict token `t+1`.
pub fn action_log_probs<M: CausalLM + ?Sized>(
    model: &M,
    input_ids: &Tensor,
    attention_mask: &Tensor,
    num_actions: usize,
) -> Result<Tensor> {
    let logits = model.forward(input_ids, attention_mask)?;
    let (_batch, seq_len, _vocab) = logits.dims3()?;
    if num_actions >= seq_len {
        return Err(GrpoError::Training(format!(
            "num_actions ({}) must be smaller than the sequence length ({})",
            num_actions, seq_len
        )));
    }

    let pred_logits = logits.narrow(1, 0, seq_len - 1)?;
    let log_probs = ops::log_softmax(&pred_logits, D::Minus1)?;

    let targets = input_ids.narrow(1, 1, seq_len - 1)?.contiguous()?;
    let token_log_probs = log_probs
        .gather(&targets.unsqueeze(D::Minus1)?, D::Minus1)?
        .squeeze(D::Minus1)?;

    Ok(token_log_probs
        .narrow(1, seq_len - 1 - num_actions, num_actions)?
        .contiguous()?)
}

/// Group-relative advantages: `(r - mean) / (std + eps)` with the group's
/// own statistics. Sample std (n-1 denominator); NaN rewards propagate.
pub fn group_advantages(rewards: &[f64]) -> Vec<f64> {
    let n = rewards.len();
    if n == 0 {
        return Vec::new();
    }
    let mean = rewards.iter().sum::<f64>() / n as f64;
    let std = if n > 1 {
        (rewards.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1) as f64).sqrt()
    } else {
        0.0
    };
    rewards
        .iter()
        .map(|r| (r - mean) / (std + ADVANTAGE_EPS))
        .collect()
}

/// Build one experience batch from a mini-batch of prompt records.
///
/// Advantage normalization never crosses group boundaries: each prompt's
/// responses are standardized against that prompt's own reward statistics.
#[allow(clippy::too_many_arguments)]
pub fn build_experience<M: CausalLM>(
    policy: &M,
    reference: Option<&M>,
    generator: &mut SampleGenerator,
    tokenizer: &dyn ChatTokenizer,
    aggregator: &RewardAggregator,
    records: &[PromptRecord],
    telemetry: bool,
) -> Result<ExperienceBatch> {
    if records.is_empty() {
        return Err(GrpoError::Training("empty mini-batch".into()));
    }

    let mut all_ids = Vec::with_capacity(records.len());
    let mut all_attention = Vec::with_capacity(records.len());
    let mut all_action = Vec::with_capacity(records.len());
    let mut all_old = Vec::with_capacity(records.len());
    let mut all_ref = Vec::with_capacity(records.len());
    let mut all_advantages: Vec<f64> = Vec::new();
    let mut num_actions = 0;

    for record in records {
        let group = generator.generate_group(
            policy,
            tokenizer,
            &record.prompt,
            record.answer.as_deref(),
        )?;
        num_actions = group.num_actions;

        let old_log_probs = action_log_probs(
            policy,
            &group.prompt_response_ids,
            &group.attention_mask,
            group.num_actions,
        )?
        .detach();

        let ref_log_probs = match reference {
            Some(reference) => Some(
                action_log_probs(
                    reference,
                    &group.prompt_response_ids,
                    &group.attention_mask,
                    group.num_actions,
                )?
                .detach(),
            ),
            None => None,
        };

        let response_rows = group.response_ids.to_vec2::<u32>()?;
        let responses: Vec<String> = response_rows
            .iter()
            .map(|row| tokenizer.decode(row, true))
            .collect();
        let prompts = vec![record.prompt.clone(); responses.len()];
        let answers = vec![record.answer.clone(); responses.len()];

        let rewards = aggregator.score_group(&prompts, &responses, &answers)?;
        let advantages = group_advantages(&rewards.totals);

        let (reward_mean, reward_std, _, _) = metrics::summary_stats(&rewards.totals);
        debug!(
            prompt = %record.prompt,
            rewards = ?rewards.totals,
            reward_mean,
            reward_std,
            "Scored sample group"
        );
        if telemetry {
            metrics::record_group_rewards(
                &aggregator.source_names(),
                &rewards.per_source,
                &rewards.totals,
            );
            metrics::record_response_lengths(&group.response_lengths);
        }

        all_ids.push(group.prompt_response_ids);
        all_attention.push(group.attention_mask);
        all_action.push(group.action_mask);
        all_old.push(old_log_probs);
        if let Some(r) = ref_log_probs {
            all_ref.push(r);
        }
        all_advantages.extend(advantages);
    }

    let prompt_response_ids = Tensor::cat(&all_ids, 0)?;
    let device = prompt_response_ids.device().clone();
    let advantages = Tensor::from_vec(
        all_advantages.iter().map(|&a| a as f32).collect::<Vec<_>>(),
        (all_advantages.len(),),
        &device,
    )?
    .to_dtype(DType::F32)?;

    Ok(ExperienceBatch {
        prompt_response_ids,
        attention_mask: Tensor::cat(&all_attention, 0)?,
        action_mask: Tensor::cat(&all_action, 0)?,
        old_action_log_probs: Tensor::cat(&all_old, 0)?,
        ref_action_log_probs: if reference.is_some() {
            Some(Tensor::cat(&all_ref, 0)?)
        } else {
            None
        },
        advantages,
        num_actions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::policy::{TinyCausalLM, TinyCausalLMConfig};
    use crate::tokenizer::{ByteTokenizer, ChatTokenizer};
    use crate::training::rewards::{correctness_reward, digit_reward, RewardAggregator, RewardSource};
    use crate::training::sampler::SamplingParams;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny_model(vocab: usize) -> TinyCausalLM {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        TinyCausalLM::new(
            TinyCausalLMConfig {
                vocab_size: vocab,
                d_model: 8,
                d_hidden: 16,
            },
            vb,
        )
        .unwrap()
    }

    #[test]
    fn test_group_advantages_zero_variance() {
        let advantages = group_advantages(&[1.5, 1.5, 1.5, 1.5]);
        for a in advantages {
            assert!(a.is_finite());
            assert!(a.abs() < 1e-6);
        }
    }

    #[test]
    fn test_group_advantages_mean_centered() {
        let advantages = group_advantages(&[1.0, 2.0, 3.0, 4.0]);
        let sum: f64 = advantages.iter().sum();
        assert!(sum.abs() < 1e-9);
        // Above-mean rewards get positive advantage
        assert!(advantages[3] > 0.0 && advantages[0] < 0.0);
    }

    #[test]
    fn test_group_advantages_nan_propagates() {
        let advantages = group_advantages(&[1.0, f64::NAN, 2.0, 3.0]);
        assert!(advantages.iter().all(|a| a.is_nan()));
    }

    #[test]
    fn test_action_log_probs_alignment() {
        // Hand-check the shift-by-one gather on a tiny input.
        let tok = ByteTokenizer::new();
        let model = tiny_model(tok.vocab_size());
        let device = Device::Cpu;

        let ids = Tensor::from_vec(vec![10u32, 11, 12, 13, 14, 15], (1, 6), &device).unwrap();
        let mask = Tensor::ones((1, 6), DType::F32, &device).unwrap();

        let lp = action_log_probs(&model, &ids, &mask, 2).unwrap();
        assert_eq!(lp.dims(), &[1, 2]);

        // Compare against a manual log_softmax + gather over the full row.
        let logits = model.forward(&ids, &mask).unwrap();
        let full = ops::log_softmax(&logits.narrow(1, 0, 5).unwrap(), D::Minus1).unwrap();
        let row = full.to_vec3::<f32>().unwrap();
        // positions 3 and 4 predict tokens ids[4]=14 and ids[5]=15
        let expected = [row[0][3][14], row[0][4][15]];
        let got = lp.to_vec2::<f32>().unwrap();
        assert!((got[0][0] - expected[0]).abs() < 1e-5);
        assert!((got[0][1] - expected[1]).abs() < 1e-5);
    }

    #[test]
    fn test_action_log_probs_rejects_oversized_span() {
        let tok = ByteTokenizer::new();
        let model = tiny_model(tok.vocab_size());
        let device = Device::Cpu;
        let ids = Tensor::zeros((1, 4), DType::U32, &device).unwrap();
        let mask = Tensor::ones((1, 4), DType::F32, &device).unwrap();

        assert!(action_log_probs(&model, &ids, &mask, 4).is_err());
    }

    #[test]
    fn test_build_experience_shapes() {
        let tok = ByteTokenizer::new();
        let policy = tiny_model(tok.vocab_size());
        let reference = tiny_model(tok.vocab_size());
        let mut generator = SampleGenerator::new(
            3,
            16,
            5,
            SamplingParams::default(),
            Device::Cpu,
            StdRng::seed_from_u64(0),
        );
        let aggregator = RewardAggregator::new(
            vec![
                RewardSource::function("correctness", correctness_reward),
                RewardSource::function("digit", digit_reward),
            ],
            None,
        )
        .unwrap();

        let records = vec![
            PromptRecord {
                prompt: "2+2=?".into(),
                answer: Some("4".into()),
            },
            PromptRecord {
                prompt: "3+3=?".into(),
                answer: Some("6".into()),
            },
        ];

        let batch = build_experience(
            &policy,
            Some(&reference),
            &mut generator,
            &tok,
            &aggregator,
            &records,
            false,
        )
        .unwrap();

        // 2 prompts x 3 generations
        assert_eq!(batch.prompt_response_ids.dims(), &[6, 21]);
        assert_eq!(batch.attention_mask.dims(), &[6, 21]);
        assert_eq!(batch.action_mask.dims(), &[6, 5]);
        assert_eq!(batch.old_action_log_probs.dims(), &[6, 5]);
        assert_eq!(
            batch.ref_action_log_probs.as_ref().unwrap().dims(),
            &[6, 5]
        );
        assert_eq!(batch.advantages.dims(), &[6]);
        assert_eq!(batch.num_actions, 5);

        // Per-group normalization: each group of 3 sums to ~0
        let adv = batch.advantages.to_vec1::<f32>().unwrap();
        let g1: f32 = adv[..3].iter().sum();
        let g2: f32 = adv[3..].iter().sum();
        assert!(g1.abs() < 1e-4);
        assert!(g2.abs() < 1e-4);
    }

    #[test]
    fn test_build_experience_without_reference() {
        let tok = ByteTokenizer::new();
        let policy = tiny_model(tok.vocab_size());
        let mut generator = SampleGenerator::new(
            2,
            12,
            4,
            SamplingParams::default(),
            Device::Cpu,
            StdRng::seed_from_u64(1),
        );
        let aggregator = RewardAggregator::new(
            vec![RewardSource::function("digit", digit_reward)],
            None,
        )
        .unwrap();

        let records = vec![PromptRecord {
            prompt: "hi".into(),
            answer: None,
        }];

        let batch = build_experience(
            &policy,
            None,
            &mut generator,
            &tok,
            &aggregator,
            &records,
            false,
        )
        .unwrap();

        assert!(batch.ref_action_log_probs.is_none());
    }
}
