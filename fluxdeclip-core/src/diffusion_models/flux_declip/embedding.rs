#![allow(clippy::cast_possible_truncation)]

use candle_core::{DType, Device, Result, Tensor};

use super::common::TimestepFreqs;
use super::config::{DISTILL_INDEX_DIM, DISTILL_TIMESTEP_DIM};

/// Builds the `(batch, mod_index_length, 64)` input of the distilled guidance layer.
///
/// Each row is `[timestep(16), guidance(16), index(32)]`: the same timestep/guidance embedding is
/// repeated for every modulation row and paired with the sinusoidal embedding of the row index.
#[derive(Debug, Clone)]
pub struct DistillationInputEmbedder {
    timestep_freqs: TimestepFreqs,
    index_freqs: TimestepFreqs,
    mod_index_length: usize,
    device: Device,
}

impl DistillationInputEmbedder {
    pub fn new(mod_index_length: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            timestep_freqs: TimestepFreqs::new(DISTILL_TIMESTEP_DIM, device)?,
            index_freqs: TimestepFreqs::new(DISTILL_INDEX_DIM, device)?,
            mod_index_length,
            device: device.clone(),
        })
    }

    pub fn mod_index_length(&self) -> usize {
        self.mod_index_length
    }

    pub fn out_dim(&self) -> usize {
        2 * DISTILL_TIMESTEP_DIM + DISTILL_INDEX_DIM
    }

    /// `timesteps` and `guidance` are either scalars or rank-1 tensors of length `b_sz`.
    pub fn forward(
        &self,
        timesteps: &Tensor,
        guidance: &Tensor,
        b_sz: usize,
        dtype: DType,
    ) -> Result<Tensor> {
        let timesteps = per_batch(timesteps, b_sz, "timesteps")?;
        let guidance = per_batch(guidance, b_sz, "guidance")?;

        let distill_timestep = self.timestep_freqs.embed(&timesteps, dtype)?;
        let distill_guidance = self.guidance_embedding(&guidance, dtype)?;
        let timestep_guidance = Tensor::cat(&[distill_timestep, distill_guidance], 1)?
            .unsqueeze(1)?
            .repeat((1, self.mod_index_length, 1))?;

        let modulation_index = Tensor::arange(0u32, self.mod_index_length as u32, &self.device)?;
        let modulation_index = self
            .index_freqs
            .embed(&modulation_index, dtype)?
            .unsqueeze(0)?
            .repeat((b_sz, 1, 1))?;

        Tensor::cat(&[timestep_guidance, modulation_index], 2)
    }

    fn guidance_embedding(&self, guidance: &Tensor, dtype: DType) -> Result<Tensor> {
        // Same sinusoid as the timestep, only the input differs.
        self.timestep_freqs.embed(guidance, dtype)
    }
}

fn per_batch(t: &Tensor, b_sz: usize, name: &str) -> Result<Tensor> {
    match t.rank() {
        0 => t.reshape(1)?.repeat(b_sz),
        1 if t.dim(0)? == b_sz => Ok(t.clone()),
        1 if t.dim(0)? == 1 => t.repeat(b_sz),
        _ => candle_core::bail!(
            "expected scalar or {b_sz} {name} values, got shape {:?}",
            t.shape()
        ),
    }
}
