//! Model collaborator
//!
//! The engine never looks inside a model. It only needs a handle per cache
//! sequence and three forward entry points (prefill, single-token decode and
//! multi-token verification), each returning one probability row per
//! requested position.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};

use crate::engine::kv_cache::KVCacheConfig;
use crate::error::{EngineError, Result};

/// A loaded model with its own paged KV cache
pub trait Model: Send {
    /// Allocate the KV cache; called once before any sequence is added
    fn create_kv_cache(&mut self, config: &KVCacheConfig) -> Result<()>;

    /// Largest sequence length the model can attend over
    fn max_window_size(&self) -> usize;

    fn vocab_size(&self) -> usize;

    /// Device the model's outputs live on
    fn device(&self) -> &Device;

    /// Register a new, empty cache sequence
    fn add_new_sequence(&mut self, seq_id: i64) -> Result<()>;

    /// Drop a cache sequence and free its pages
    fn remove_sequence(&mut self, seq_id: i64) -> Result<()>;

    /// Remove the last `n` tokens from a cache sequence
    fn pop_n(&mut self, seq_id: i64, n: usize) -> Result<()>;

    /// Append `token_ids` to the sequence's cache; returns the distribution
    /// after the last token, shape `[1, vocab]`
    fn prefill(&mut self, seq_id: i64, token_ids: &[u32]) -> Result<Tensor>;

    /// Append one token per sequence; returns shape `[seq_ids.len(), vocab]`
    fn decode(&mut self, seq_ids: &[i64], token_ids: &[u32]) -> Result<Tensor>;

    /// Append several tokens per sequence; returns one row per appended
    /// token, sequences concatenated in order, shape `[sum(len), vocab]`
    fn batch_verify(&mut self, seq_ids: &[i64], token_ids: &[Vec<u32>]) -> Result<Tensor>;

    /// Drop every cache sequence
    fn reset(&mut self) -> Result<()>;
}

/// Factory that loads a [`Model`] from disk onto a device
pub trait ModelLib: Send + Sync {
    fn load(&self, model_path: &Path, device: Device) -> Result<Box<dyn Model>>;
}

/// Releases device memory held outside any model
///
/// Hosts call [`crate::Engine::clear_global_memory_manager`] at a
/// reinitialisation boundary, e.g. between unloading and reloading models.
pub trait MemoryManager {
    fn clear(&self) -> Result<()>;
}

/// Kind of device a model runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Cpu,
    Cuda,
    Metal,
}

/// Device a model is placed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceSpec {
    pub device_type: DeviceType,
    #[serde(default)]
    pub device_id: usize,
}

impl DeviceSpec {
    pub fn cpu() -> Self {
        Self::default()
    }

    pub fn cuda(device_id: usize) -> Self {
        Self { device_type: DeviceType::Cuda, device_id }
    }

    pub fn metal(device_id: usize) -> Self {
        Self { device_type: DeviceType::Metal, device_id }
    }

    /// Open the candle device
    pub fn to_device(&self) -> Result<Device> {
        let device = match self.device_type {
            DeviceType::Cpu => Device::Cpu,
            DeviceType::Cuda => Device::new_cuda(self.device_id).map_err(|e| {
                EngineError::config(format!("cannot open cuda:{}: {}", self.device_id, e))
            })?,
            DeviceType::Metal => Device::new_metal(self.device_id).map_err(|e| {
                EngineError::config(format!("cannot open metal:{}: {}", self.device_id, e))
            })?,
        };
        Ok(device)
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device_type {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Cuda => write!(f, "cuda:{}", self.device_id),
            DeviceType::Metal => write!(f, "metal:{}", self.device_id),
        }
    }
}

/// Everything needed to load one model: the library, its weights and a device
#[derive(Clone)]
pub struct ModelInfo {
    pub lib: Arc<dyn ModelLib>,
    pub model_path: PathBuf,
    pub device: DeviceSpec,
}

impl ModelInfo {
    pub fn new(lib: Arc<dyn ModelLib>, model_path: impl Into<PathBuf>, device: DeviceSpec) -> Self {
        Self {
            lib,
            model_path: model_path.into(),
            device,
        }
    }

    /// Open the device and load the model onto it
    pub fn load(&self) -> Result<Box<dyn Model>> {
        let device = self.device.to_device()?;
        tracing::info!("Loading model {:?} on {}", self.model_path, self.device);
        self.lib.load(&self.model_path, device)
    }
}

impl fmt::Debug for ModelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelInfo")
            .field("model_path", &self.model_path)
            .field("device", &self.device)
            .finish()
    }
}

/// Models shared by every engine action; index 0 is the primary model
pub type ModelSet = Arc<parking_lot::Mutex<Vec<Box<dyn Model>>>>;
