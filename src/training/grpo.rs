//! GRPO trainer: clipped surrogate loss with KL regularization, gradient
//! accumulation, and the buffered replay loop.
//!
//! The loss per token is
//!
//! ```text
//! -min(r * A, clip(r, 1 - eps, 1 + eps) * A) + beta * (exp(d) - 1 - d)
//! ```
//!
//! with `r = exp(current - old)` the importance ratio, `A` the response's
//! group-relative advantage broadcast over its tokens, and
//! `d = ref - current` the k3 KL estimate against the frozen reference.
//! `old` is the stored generation-time log-probability when the buffer is
//! replayed more than once; on a single pass it is the current
//! log-probability detached, making the ratio exactly 1.
//!
//! The experience buffer is a fixed arena of `gradient_accumulation_steps`
//! slots overwritten by batch position. Once full it is replayed
//! `num_iterations` times; generation never interleaves with the updates of
//! its own window, so the old-log-prob basis cannot drift mid-window.

use crate::data::{PromptDataset, PromptRecord};
use crate::model::policy::CausalLM;
use crate::tokenizer::ChatTokenizer;
use crate::training::experience::{action_log_probs, build_experience, ExperienceBatch};
use crate::training::rewards::RewardAggregator;
use crate::training::sampler::SampleGenerator;
use crate::utils::checkpoint;
use crate::utils::config::GrpoConfig;
use crate::utils::error::{GrpoError, Result};
use crate::utils::metrics;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Per-token clipped surrogate with optional k3 KL penalty, aggregated to a
/// scalar: masked mean over each sequence's credited tokens, then mean over
/// the batch.
///
/// All tensors are `[B, R]` except `advantages` (`[B]`). `old` must already
/// be detached from the gradient graph.
pub fn grpo_token_loss(
    current: &Tensor,
    old: &Tensor,
    ref_log_probs: Option<&Tensor>,
    advantages: &Tensor,
    action_mask: &Tensor,
    beta: f64,
    clip_eps: f64,
) -> Result<Tensor> {
    let ratio = (current - old)?.exp()?;
    let clipped = ratio.clamp(1.0 - clip_eps, 1.0 + clip_eps)?;

    let advantages = advantages.unsqueeze(1)?;
    let unclipped_term = ratio.broadcast_mul(&advantages)?;
    let clipped_term = clipped.broadcast_mul(&advantages)?;
    let mut per_token = (unclipped_term.minimum(&clipped_term)?.neg()? * action_mask)?;

    if beta != 0.0 {
        let ref_log_probs = ref_log_probs.ok_or_else(|| {
            GrpoError::Training("KL penalty requested without reference log-probs".into())
        })?;
        let log_ratio = ((ref_log_probs - current)? * action_mask)?;
        let k3 = ((log_ratio.exp()? - 1.0)? - &log_ratio)?;
        per_token = (&per_token + &(k3 * beta)?)?;
    }

    let per_sequence = (&per_token.sum(1)? / &action_mask.sum(1)?)?;
    Ok(per_sequence.mean_all()?)
}

/// GRPO trainer owning the policy, the optional frozen reference, and the
/// experience buffer.
pub struct GrpoTrainer<M: CausalLM> {
    config: GrpoConfig,
    device: Device,
    policy: M,
    varmap: VarMap,
    reference: Option<M>,
    tokenizer: Arc<dyn ChatTokenizer>,
    aggregator: RewardAggregator,
    generator: SampleGenerator,
    optimizer: AdamW,
    input_buffer: Vec<Option<ExperienceBatch>>,
    accum_grads: Option<GradStore>,
    update_steps: usize,
    shuffle_rng: StdRng,
}

impl<M: CausalLM> GrpoTrainer<M> {
    /// Construct a trainer. `reference` must be a frozen snapshot of the
    /// policy exactly when `beta != 0`; with `beta == 0` no reference may
    /// exist at all.
    pub fn new(
        config: GrpoConfig,
        device: Device,
        policy: M,
        varmap: VarMap,
        reference: Option<M>,
        tokenizer: Arc<dyn ChatTokenizer>,
        aggregator: RewardAggregator,
    ) -> Result<Self> {
        config.validate()?;
        if config.beta != 0.0 && reference.is_none() {
            return Err(GrpoError::Config(
                "beta != 0 requires a frozen reference model snapshot".into(),
            ));
        }
        if config.beta == 0.0 && reference.is_some() {
            return Err(GrpoError::Config(
                "beta == 0 disables the KL term; no reference model may be instantiated".into(),
            ));
        }

        // Fail fast on a weight vector that doesn't match the sources; the
        // aggregator re-checks, but the trainer surface owns the config.
        if let Some(weights) = &config.reward_weights {
            if weights.len() != aggregator.num_sources() {
                return Err(GrpoError::Config(format!(
                    "The number of reward weights ({}) must be equal to the number of reward sources ({})",
                    weights.len(),
                    aggregator.num_sources()
                )));
            }
        }

        let optimizer = AdamW::new(
            varmap.all_vars(),
            ParamsAdamW {
                lr: config.learning_rate,
                ..Default::default()
            },
        )?;

        let (sample_rng, shuffle_rng) = match config.seed {
            Some(seed) => (
                StdRng::seed_from_u64(seed),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            ),
            None => (StdRng::from_entropy(), StdRng::from_entropy()),
        };
        let generator = SampleGenerator::from_config(&config, device.clone(), sample_rng);

        let input_buffer = (0..config.gradient_accumulation_steps).map(|_| None).collect();

        if config.enable_telemetry {
            metrics::log_run_metadata(
                &config.telemetry_project,
                config.telemetry_run_name.as_deref(),
            );
        }

        Ok(Self {
            config,
            device,
            policy,
            varmap,
            reference,
            tokenizer,
            aggregator,
            generator,
            optimizer,
            input_buffer,
            accum_grads: None,
            update_steps: 0,
            shuffle_rng,
        })
    }

    pub fn config(&self) -> &GrpoConfig {
        &self.config
    }

    pub fn policy(&self) -> &M {
        &self.policy
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Completed optimizer updates.
    pub fn update_steps(&self) -> usize {
        self.update_steps
    }

    /// Generate one experience batch from a mini-batch of prompt records.
    pub fn generate_experiences(&mut self, records: &[PromptRecord]) -> Result<ExperienceBatch> {
        build_experience(
            &self.policy,
            self.reference.as_ref(),
            &mut self.generator,
            self.tokenizer.as_ref(),
            &self.aggregator,
            records,
            self.config.enable_telemetry,
        )
    }

    /// GRPO loss for one buffered batch under the current policy.
    pub fn compute_loss(&self, batch: &ExperienceBatch) -> Result<Tensor> {
        let action_mask = batch.action_mask.to_dtype(DType::F32)?;
        let current = action_log_probs(
            &self.policy,
            &batch.prompt_response_ids,
            &batch.attention_mask,
            batch.num_actions,
        )?;

        // With a single pass over the buffer the stored basis equals the
        // live policy, so the ratio is pinned at 1 by detaching.
        let old = if self.config.num_iterations > 1 {
            batch.old_action_log_probs.clone()
        } else {
            current.detach()
        };

        grpo_token_loss(
            &current,
            &old,
            batch.ref_action_log_probs.as_ref(),
            &batch.advantages,
            &action_mask,
            self.config.beta,
            self.config.clip_eps,
        )
    }

    fn accumulate_grads(&mut self, new_grads: GradStore) -> Result<()> {
        match self.accum_grads.as_mut() {
            None => {
                self.accum_grads = Some(new_grads);
            }
            Some(acc) => {
                for var in self.varmap.all_vars() {
                    let tensor = var.as_tensor();
                    if let Some(grad) = new_grads.get(tensor) {
                        let merged = match acc.get(tensor) {
                            Some(existing) => (existing + grad)?,
                            None => grad.clone(),
                        };
                        acc.insert(tensor, merged);
                    }
                }
            }
        }
        Ok(())
    }

    /// One micro-step: loss scaled by the accumulation window, gradients
    /// accumulated; the optimizer steps only on the window's final
    /// micro-step. Returns the unscaled loss value.
    pub fn train_step(&mut self, batch: &ExperienceBatch, micro_step: usize) -> Result<f32> {
        let window = self.config.gradient_accumulation_steps;
        let loss = self.compute_loss(batch)?;
        let scaled = (loss / window as f64)?;
        let loss_value = scaled.to_dtype(DType::F32)?.to_scalar::<f32>()? * window as f32;

        let grads = scaled.backward()?;
        self.accumulate_grads(grads)?;

        if (micro_step + 1) % window == 0 {
            if let Some(grads) = self.accum_grads.take() {
                self.optimizer.step(&grads)?;
            }
        }

        Ok(loss_value)
    }

    /// Run the full training loop over the dataset.
    ///
    /// Per epoch, per mini-batch: generate experience into the buffer slot
    /// `idx % window`; when the window fills, replay the whole buffer
    /// `num_iterations` times, advance the update counter per pass, and
    /// checkpoint every `save_steps` updates.
    pub fn train(&mut self, dataset: &PromptDataset) -> Result<()> {
        if dataset.is_empty() {
            return Err(GrpoError::Training("training dataset is empty".into()));
        }

        let window = self.config.gradient_accumulation_steps;
        let global_steps = self.config.num_iterations * self.config.epochs * dataset.len()
            / (self.config.batch_size * window);
        info!(
            global_steps,
            epochs = self.config.epochs,
            window,
            num_iterations = self.config.num_iterations,
            "Starting GRPO training"
        );

        for epoch in 0..self.config.epochs {
            let batches = dataset.shuffled_batches(self.config.batch_size, &mut self.shuffle_rng);
            for (idx, records) in batches.iter().enumerate() {
                let experience = self.generate_experiences(records)?;
                self.input_buffer[idx % window] = Some(experience);

                if (idx + 1) % window == 0 {
                    for _ in 0..self.config.num_iterations {
                        let mut window_loss = 0.0f32;
                        for step in 0..window {
                            let batch = self.input_buffer[step].clone().ok_or_else(|| {
                                GrpoError::Training("experience buffer slot empty".into())
                            })?;
                            window_loss = self.train_step(&batch, step)?;
                        }

                        self.update_steps += 1;
                        info!(
                            step = self.update_steps,
                            total = global_steps,
                            loss = format!("{:.8}", window_loss).as_str(),
                            "grpo update"
                        );
                        if self.config.enable_telemetry {
                            metrics::record_update(
                                window_loss as f64,
                                self.config.learning_rate,
                            );
                        }

                        if self.update_steps % self.config.save_steps == 0 {
                            self.save_checkpoint()?;
                        }
                    }
                }
            }
            info!(epoch = epoch + 1, "Epoch complete");
        }

        Ok(())
    }

    /// Write a per-milestone checkpoint directory with weights + tokenizer.
    pub fn save_checkpoint(&self) -> Result<()> {
        let dir = Path::new(&self.config.output_dir)
            .join(format!("checkpoint_{}", self.update_steps));
        checkpoint::save_model_checkpoint(&self.varmap, &dir, Some(self.update_steps as u64))?;
        self.tokenizer.save(&dir)?;
        Ok(())
    }

    /// Write the end-of-training artifact into the output directory itself.
    pub fn save_model(&self) -> Result<()> {
        let dir = Path::new(&self.config.output_dir);
        checkpoint::save_model_checkpoint(&self.varmap, dir, Some(self.update_steps as u64))?;
        self.tokenizer.save(dir)?;
        info!(dir = %dir.display(), "Saved final model");
        Ok(())
    }
}
