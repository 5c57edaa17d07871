use std::path::Path;

use serde::{Deserialize, Serialize};

use super::modulation::ModulationInventory;
use crate::{Error, Result};

// FluxDeCLIP defaults: the FLUX.1 trunk with a distilled guidance layer.
const DEFAULT_IN_CHANNELS: usize = 16;
const DEFAULT_VEC_IN_DIM: usize = 768;
const DEFAULT_CONTEXT_IN_DIM: usize = 4096;
const DEFAULT_HIDDEN_SIZE: usize = 3072;
const DEFAULT_MLP_RATIO: f64 = 4.;
const DEFAULT_NUM_HEADS: usize = 24;
const DEFAULT_DEPTH: usize = 19;
const DEFAULT_DEPTH_SINGLE_BLOCKS: usize = 38;
const DEFAULT_AXES_DIM: &[usize] = &[16, 56, 56];
const DEFAULT_THETA: usize = 10000;
const DEFAULT_APPROXIMATOR_IN_DIM: usize = 64;
const DEFAULT_APPROXIMATOR_HIDDEN_DIM: usize = 5120;
const DEFAULT_APPROXIMATOR_LAYERS: usize = 5;

/// Number of modulation rows produced for the default 19 double / 38 single block trunk.
pub const MOD_INDEX_LENGTH: usize = 344;

/// Width of each sinusoidal timestep and guidance embedding fed to the approximator.
pub const DISTILL_TIMESTEP_DIM: usize = 16;
/// Width of the sinusoidal embedding of a modulation row index.
pub const DISTILL_INDEX_DIM: usize = 32;

/// Latent patch size used by the patchify wrapper and the final projection.
pub const PATCH_SIZE: usize = 2;

fn default_in_channels() -> usize {
    DEFAULT_IN_CHANNELS
}

fn default_vec_in_dim() -> usize {
    DEFAULT_VEC_IN_DIM
}

fn default_context_in_dim() -> usize {
    DEFAULT_CONTEXT_IN_DIM
}

fn default_hidden_size() -> usize {
    DEFAULT_HIDDEN_SIZE
}

fn default_mlp_ratio() -> f64 {
    DEFAULT_MLP_RATIO
}

fn default_num_heads() -> usize {
    DEFAULT_NUM_HEADS
}

fn default_depth() -> usize {
    DEFAULT_DEPTH
}

fn default_depth_single_blocks() -> usize {
    DEFAULT_DEPTH_SINGLE_BLOCKS
}

fn default_axes_dim() -> Vec<usize> {
    DEFAULT_AXES_DIM.to_vec()
}

fn default_theta() -> usize {
    DEFAULT_THETA
}

fn default_qkv_bias() -> bool {
    true
}

fn default_approximator_in_dim() -> usize {
    DEFAULT_APPROXIMATOR_IN_DIM
}

fn default_approximator_hidden_dim() -> usize {
    DEFAULT_APPROXIMATOR_HIDDEN_DIM
}

fn default_approximator_layers() -> usize {
    DEFAULT_APPROXIMATOR_LAYERS
}

fn default_mod_index_length() -> usize {
    MOD_INDEX_LENGTH
}

/// Architecture of a FluxDeCLIP checkpoint.
///
/// These must match the checkpoint exactly, otherwise weight loading fails.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct FluxParams {
    /// Latent channels before patching. The transformer sees `in_channels * 4`.
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    /// Pooled conditioning width. The distilled model does not project it.
    #[serde(default = "default_vec_in_dim")]
    pub vec_in_dim: usize,
    #[serde(default = "default_context_in_dim")]
    pub context_in_dim: usize,
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    #[serde(default = "default_num_heads")]
    pub num_heads: usize,
    /// Number of double stream blocks.
    #[serde(default = "default_depth")]
    pub depth: usize,
    #[serde(default = "default_depth_single_blocks")]
    pub depth_single_blocks: usize,
    /// Rope axis dimensions, must sum to the head dimension.
    #[serde(default = "default_axes_dim")]
    pub axes_dim: Vec<usize>,
    #[serde(default = "default_theta")]
    pub theta: usize,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,
    #[serde(default)]
    pub guidance_embed: bool,
    /// Input width of the distilled guidance layer (timestep + guidance + index embeddings).
    #[serde(default = "default_approximator_in_dim")]
    pub approximator_in_dim: usize,
    #[serde(default = "default_approximator_hidden_dim")]
    pub approximator_hidden_dim: usize,
    #[serde(default = "default_approximator_layers")]
    pub approximator_layers: usize,
    /// Number of modulation rows the distilled guidance layer was trained to emit.
    #[serde(default = "default_mod_index_length")]
    pub mod_index_length: usize,
}

impl Default for FluxParams {
    fn default() -> Self {
        Self {
            in_channels: DEFAULT_IN_CHANNELS,
            vec_in_dim: DEFAULT_VEC_IN_DIM,
            context_in_dim: DEFAULT_CONTEXT_IN_DIM,
            hidden_size: DEFAULT_HIDDEN_SIZE,
            mlp_ratio: DEFAULT_MLP_RATIO,
            num_heads: DEFAULT_NUM_HEADS,
            depth: DEFAULT_DEPTH,
            depth_single_blocks: DEFAULT_DEPTH_SINGLE_BLOCKS,
            axes_dim: DEFAULT_AXES_DIM.to_vec(),
            theta: DEFAULT_THETA,
            qkv_bias: true,
            guidance_embed: false,
            approximator_in_dim: DEFAULT_APPROXIMATOR_IN_DIM,
            approximator_hidden_dim: DEFAULT_APPROXIMATOR_HIDDEN_DIM,
            approximator_layers: DEFAULT_APPROXIMATOR_LAYERS,
            mod_index_length: MOD_INDEX_LENGTH,
        }
    }
}

impl FluxParams {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Channels of a patched token: `in_channels * patch²`.
    pub fn patched_channels(&self) -> usize {
        self.in_channels * PATCH_SIZE * PATCH_SIZE
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_heads
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn mlp_hidden_dim(&self) -> usize {
        (self.hidden_size as f64 * self.mlp_ratio) as usize
    }

    pub fn inventory(&self) -> ModulationInventory {
        ModulationInventory::new(self.depth, self.depth_single_blocks)
    }

    /// Construction-time checks. Nothing here is deferred to the forward pass.
    pub fn validate(&self) -> Result<()> {
        if self.num_heads == 0 || self.hidden_size % self.num_heads != 0 {
            return Err(Error::Configuration(format!(
                "Hidden size {} must be divisible by num_heads {}",
                self.hidden_size, self.num_heads
            )));
        }
        let pe_dim = self.head_dim();
        let axes_sum: usize = self.axes_dim.iter().sum();
        if axes_sum != pe_dim {
            return Err(Error::Configuration(format!(
                "Got axes_dim {:?} but expected positional dim {pe_dim}",
                self.axes_dim
            )));
        }
        if let Some(dim) = self.axes_dim.iter().find(|d| *d % 2 == 1) {
            return Err(Error::Configuration(format!(
                "Rope axis dim {dim} in {:?} is odd",
                self.axes_dim
            )));
        }
        let expected_in = 2 * DISTILL_TIMESTEP_DIM + DISTILL_INDEX_DIM;
        if self.approximator_in_dim != expected_in {
            return Err(Error::Configuration(format!(
                "approximator_in_dim {} does not match the {expected_in} wide distillation input",
                self.approximator_in_dim
            )));
        }
        let rows = self.inventory().total_rows();
        if rows != self.mod_index_length {
            return Err(Error::Configuration(format!(
                "mod_index_length {} does not match the {rows} modulation rows consumed by {} double and {} single blocks",
                self.mod_index_length, self.depth, self.depth_single_blocks
            )));
        }
        Ok(())
    }
}
