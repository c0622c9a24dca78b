//! Trainer configuration with JSON file support and environment variable overrides.
//!
//! Pattern: `GRPO_*` environment variables override config file values.
//! Example: `GRPO_NUM_GENERATIONS=8` overrides `num_generations` in config.
//!
//! The config is immutable once handed to the trainer; every component
//! receives it by reference at construction.

use crate::utils::error::{GrpoError, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

/// GRPO training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrpoConfig {
    /// Directory for checkpoints and the final model artifact
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Device selector: "auto", "cpu", "cuda" or "metal"
    #[serde(default = "default_device")]
    pub device: String,

    /// Learning rate
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Checkpoint interval in completed optimizer updates
    #[serde(default = "default_save_steps")]
    pub save_steps: usize,

    /// Number of dataset epochs
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Group size: responses sampled per prompt
    #[serde(default = "default_num_generations")]
    pub num_generations: usize,

    /// Maximum prompt length in tokens (left-padded/truncated)
    #[serde(default = "default_max_prompt_length")]
    pub max_prompt_length: usize,

    /// Maximum generated length in tokens (right-padded/truncated)
    #[serde(default = "default_max_generate_length")]
    pub max_generate_length: usize,

    /// Per-reward-source weights; uniform 1.0 when absent
    #[serde(default)]
    pub reward_weights: Option<Vec<f64>>,

    /// KL penalty coefficient; 0.0 disables the reference model entirely
    #[serde(default = "default_beta")]
    pub beta: f64,

    /// Clip epsilon for the importance ratio
    #[serde(default = "default_clip_eps")]
    pub clip_eps: f64,

    /// Micro-batches per optimizer step; also the experience buffer size
    #[serde(default = "default_grad_accum")]
    pub gradient_accumulation_steps: usize,

    /// Optimization passes over the buffered experience per window
    #[serde(default = "default_num_iterations")]
    pub num_iterations: usize,

    /// Prompts per mini-batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Sampling temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Nucleus sampling threshold (1.0 disables)
    #[serde(default = "default_top_p")]
    pub top_p: f64,

    /// Top-k sampling cutoff (0 disables)
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// RNG seed for sampling and batch shuffling
    #[serde(default)]
    pub seed: Option<u64>,

    /// Whether to export training metrics to the telemetry registry
    #[serde(default)]
    pub enable_telemetry: bool,

    /// Telemetry project name
    #[serde(default = "default_telemetry_project")]
    pub telemetry_project: String,

    /// Telemetry run name; auto-generated when absent
    #[serde(default)]
    pub telemetry_run_name: Option<String>,
}

fn default_output_dir() -> String { "./output".to_string() }
fn default_device() -> String { "auto".to_string() }
fn default_lr() -> f64 { 1e-6 }
fn default_save_steps() -> usize { 100 }
fn default_epochs() -> usize { 3 }
fn default_num_generations() -> usize { 4 }
fn default_max_prompt_length() -> usize { 512 }
fn default_max_generate_length() -> usize { 1024 }
fn default_beta() -> f64 { 1e-2 }
fn default_clip_eps() -> f64 { 0.2 }
fn default_grad_accum() -> usize { 2 }
fn default_num_iterations() -> usize { 1 }
fn default_batch_size() -> usize { 1 }
fn default_temperature() -> f64 { 0.9 }
fn default_top_p() -> f64 { 1.0 }
fn default_top_k() -> usize { 50 }
fn default_telemetry_project() -> String { "grpo-training".to_string() }

impl Default for GrpoConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            device: default_device(),
            learning_rate: default_lr(),
            save_steps: default_save_steps(),
            epochs: default_epochs(),
            num_generations: default_num_generations(),
            max_prompt_length: default_max_prompt_length(),
            max_generate_length: default_max_generate_length(),
            reward_weights: None,
            beta: default_beta(),
            clip_eps: default_clip_eps(),
            gradient_accumulation_steps: default_grad_accum(),
            num_iterations: default_num_iterations(),
            batch_size: default_batch_size(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: default_top_k(),
            seed: None,
            enable_telemetry: false,
            telemetry_project: default_telemetry_project(),
            telemetry_run_name: None,
        }
    }
}

impl GrpoConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| GrpoError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Environment variables are prefixed with `GRPO_` and use uppercase,
    /// e.g. `GRPO_LEARNING_RATE=1e-5`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        for (key, value) in env::vars() {
            if !key.starts_with("GRPO_") {
                continue;
            }

            let field = key[5..].to_lowercase();
            match field.as_str() {
                "output_dir" => self.output_dir = value,
                "device" => self.device = value,
                "learning_rate" | "lr" => if let Ok(v) = value.parse() { self.learning_rate = v; }
                "save_steps" => if let Ok(v) = value.parse() { self.save_steps = v; }
                "epochs" | "epoch" => if let Ok(v) = value.parse() { self.epochs = v; }
                "num_generations" => if let Ok(v) = value.parse() { self.num_generations = v; }
                "max_prompt_length" => if let Ok(v) = value.parse() { self.max_prompt_length = v; }
                "max_generate_length" => if let Ok(v) = value.parse() { self.max_generate_length = v; }
                "beta" => if let Ok(v) = value.parse() { self.beta = v; }
                "clip_eps" => if let Ok(v) = value.parse() { self.clip_eps = v; }
                "gradient_accumulation_steps" | "grad_accum" => {
                    if let Ok(v) = value.parse() { self.gradient_accumulation_steps = v; }
                }
                "num_iterations" => if let Ok(v) = value.parse() { self.num_iterations = v; }
                "batch_size" => if let Ok(v) = value.parse() { self.batch_size = v; }
                "temperature" => if let Ok(v) = value.parse() { self.temperature = v; }
                "top_p" => if let Ok(v) = value.parse() { self.top_p = v; }
                "top_k" => if let Ok(v) = value.parse() { self.top_k = v; }
                "seed" => if let Ok(v) = value.parse() { self.seed = Some(v); }
                "enable_telemetry" => {
                    self.enable_telemetry = value.to_lowercase() == "true" || value == "1";
                }
                "telemetry_project" => self.telemetry_project = value,
                "telemetry_run_name" => self.telemetry_run_name = Some(value),
                _ => {
                    debug!(key = %key, "Unknown config key");
                }
            }
        }
    }

    /// Validate configuration consistency. Fatal at setup, never coerced.
    pub fn validate(&self) -> Result<()> {
        if self.num_generations < 2 {
            return Err(GrpoError::Config(format!(
                "num_generations ({}) must be at least 2 for group statistics",
                self.num_generations
            )));
        }
        if self.learning_rate <= 0.0 {
            return Err(GrpoError::Config("learning_rate must be positive".into()));
        }
        if self.temperature <= 0.0 {
            return Err(GrpoError::Config(
                "temperature must be positive: deterministic decoding collapses intra-group variance".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.top_p) || self.top_p == 0.0 {
            return Err(GrpoError::Config(format!(
                "top_p ({}) must be in (0, 1]",
                self.top_p
            )));
        }
        if self.beta < 0.0 {
            return Err(GrpoError::Config("beta must be non-negative".into()));
        }
        if self.clip_eps <= 0.0 || self.clip_eps >= 1.0 {
            return Err(GrpoError::Config(format!(
                "clip_eps ({}) must be in (0, 1)",
                self.clip_eps
            )));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(GrpoError::Config(
                "gradient_accumulation_steps must be at least 1".into(),
            ));
        }
        if self.num_iterations == 0 {
            return Err(GrpoError::Config("num_iterations must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(GrpoError::Config("batch_size must be at least 1".into()));
        }
        if self.max_prompt_length == 0 || self.max_generate_length == 0 {
            return Err(GrpoError::Config(
                "max_prompt_length and max_generate_length must be positive".into(),
            ));
        }
        if self.save_steps == 0 {
            return Err(GrpoError::Config("save_steps must be at least 1".into()));
        }
        Ok(())
    }

    /// Resolve the configured device selector to a candle device.
    ///
    /// "auto" picks CUDA, then Metal, then CPU.
    pub fn resolve_device(&self) -> Result<Device> {
        let device = match self.device.as_str() {
            "cpu" => Device::Cpu,
            "cuda" => Device::new_cuda(0).map_err(GrpoError::Candle)?,
            "metal" => Device::new_metal(0).map_err(GrpoError::Candle)?,
            "auto" => {
                if candle_core::utils::cuda_is_available() {
                    info!("Using CUDA GPU");
                    Device::new_cuda(0).map_err(GrpoError::Candle)?
                } else if candle_core::utils::metal_is_available() {
                    info!("Using Metal GPU");
                    Device::new_metal(0).map_err(GrpoError::Candle)?
                } else {
                    info!("Using CPU");
                    Device::Cpu
                }
            }
            other => {
                return Err(GrpoError::Config(format!(
                    "Unknown device selector: {}",
                    other
                )))
            }
        };
        Ok(device)
    }

    /// Total sequence length of one padded prompt+response row.
    pub fn max_total_length(&self) -> usize {
        self.max_prompt_length + self.max_generate_length
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| GrpoError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = GrpoConfig::default();
        assert_eq!(config.num_generations, 4);
        assert_eq!(config.gradient_accumulation_steps, 2);
        assert_eq!(config.num_iterations, 1);
        assert!((config.beta - 1e-2).abs() < 1e-12);
        assert!((config.clip_eps - 0.2).abs() < 1e-12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() -> Result<()> {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let config = GrpoConfig::default();
        config.save(&path)?;

        let loaded = GrpoConfig::from_file(&path)?;
        assert_eq!(loaded.num_generations, config.num_generations);
        assert_eq!(loaded.output_dir, config.output_dir);

        Ok(())
    }

    #[test]
    fn test_env_override() {
        env::set_var("GRPO_NUM_GENERATIONS", "8");
        env::set_var("GRPO_LEARNING_RATE", "0.001");

        let config = GrpoConfig::from_env();
        assert_eq!(config.num_generations, 8);
        assert!((config.learning_rate - 0.001).abs() < 1e-12);

        env::remove_var("GRPO_NUM_GENERATIONS");
        env::remove_var("GRPO_LEARNING_RATE");
    }

    #[test]
    fn test_validation_rejects_degenerate_groups() {
        let config = GrpoConfig {
            num_generations: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GrpoConfig {
            temperature: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GrpoConfig {
            clip_eps: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
