//! Checkpoint persistence with SHA-256 checksum validation.
//!
//! Each checkpoint is a directory holding the policy weights as safetensors
//! plus a metadata file with a content checksum, so corruption is detected
//! on load. The tokenizer serializes its own artifact into the same
//! directory via `ChatTokenizer::save`.

use crate::utils::error::{GrpoError, Result};
use candle_core::{safetensors, DType, Device, Tensor};
use candle_nn::VarMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{error, info, warn};

const WEIGHTS_FILE: &str = "model.safetensors";
const META_FILE: &str = "checkpoint.meta.json";

/// Metadata stored alongside checkpoint weights.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointMetadata {
    /// SHA-256 checksum over tensor metadata and sampled tensor data
    pub checksum: String,
    /// Completed optimizer updates at save time
    pub update_steps: Option<u64>,
    /// Additional user-provided metadata
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

/// Snapshot the varmap's current tensors by name.
pub fn varmap_tensors(varmap: &VarMap) -> HashMap<String, Tensor> {
    varmap
        .data()
        .lock()
        .unwrap()
        .iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect()
}

/// Compute a SHA-256 checksum of tensor data.
///
/// Hashes each tensor's name/dtype/shape plus the first and last 1024 bytes
/// of its data (or all of it when smaller), in sorted name order.
pub fn compute_tensor_checksum(tensors: &HashMap<String, Tensor>) -> Result<String> {
    let mut hasher = Sha256::new();

    let mut names: Vec<&String> = tensors.keys().collect();
    names.sort();

    for name in names {
        let tensor = &tensors[name];
        let meta = format!("{}:{:?}:{:?}", name, tensor.dtype(), tensor.dims());
        hasher.update(meta.as_bytes());

        let data = tensor
            .flatten_all()?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()?;
        let bytes: Vec<u8> = data.iter().flat_map(|f| f.to_le_bytes()).collect();

        if bytes.len() > 2048 {
            hasher.update(&bytes[..1024]);
            hasher.update(&bytes[bytes.len() - 1024..]);
        } else {
            hasher.update(&bytes);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Save the policy weights into `dir` with checksum metadata.
pub fn save_model_checkpoint(
    varmap: &VarMap,
    dir: &Path,
    update_steps: Option<u64>,
) -> Result<()> {
    fs::create_dir_all(dir)?;

    let tensors = varmap_tensors(varmap);
    let checksum = compute_tensor_checksum(&tensors)?;

    let weights_path = dir.join(WEIGHTS_FILE);
    safetensors::save(&tensors, &weights_path)?;

    let metadata = CheckpointMetadata {
        checksum: checksum.clone(),
        update_steps,
        extra: HashMap::new(),
    };
    let meta_json = serde_json::to_string_pretty(&metadata)
        .map_err(|e| GrpoError::Checkpoint(format!("Failed to serialize metadata: {}", e)))?;
    fs::write(dir.join(META_FILE), meta_json)?;

    info!(
        checkpoint = %dir.display(),
        checksum = %checksum,
        update_steps = ?update_steps,
        "Checkpoint saved"
    );

    Ok(())
}

/// Load checkpoint weights from `dir`, verifying the stored checksum when
/// metadata is present. A checksum mismatch is fatal.
pub fn load_model_checkpoint(
    dir: &Path,
    device: &Device,
) -> Result<(HashMap<String, Tensor>, Option<CheckpointMetadata>)> {
    let weights_path = dir.join(WEIGHTS_FILE);
    if !weights_path.exists() {
        return Err(GrpoError::Checkpoint(format!(
            "Checkpoint not found: {}",
            weights_path.display()
        )));
    }

    let tensors = safetensors::load(&weights_path, device)?;

    let meta_path = dir.join(META_FILE);
    let metadata = if meta_path.exists() {
        let meta_json = fs::read_to_string(&meta_path)?;
        let meta: CheckpointMetadata = serde_json::from_str(&meta_json)
            .map_err(|e| GrpoError::Checkpoint(format!("Failed to parse metadata: {}", e)))?;

        let current = compute_tensor_checksum(&tensors)?;
        if current != meta.checksum {
            error!(
                expected = %meta.checksum,
                actual = %current,
                "Checkpoint checksum mismatch"
            );
            return Err(GrpoError::Checkpoint(format!(
                "Checkpoint corruption detected: checksum mismatch (expected {}, got {})",
                meta.checksum, current
            )));
        }

        info!(checkpoint = %dir.display(), "Checkpoint loaded and verified");
        Some(meta)
    } else {
        warn!(
            checkpoint = %dir.display(),
            "No metadata file found - skipping checksum verification"
        );
        None
    };

    Ok((tensors, metadata))
}

/// Restore a varmap's variables in place from a checkpoint directory.
pub fn restore_varmap(varmap: &mut VarMap, dir: &Path, device: &Device) -> Result<()> {
    let (tensors, _) = load_model_checkpoint(dir, device)?;
    let data = varmap.data().lock().unwrap();
    for (name, var) in data.iter() {
        let tensor = tensors.get(name).ok_or_else(|| {
            GrpoError::Checkpoint(format!("parameter {} missing from checkpoint", name))
        })?;
        var.set(tensor)?;
    }
    Ok(())
}
