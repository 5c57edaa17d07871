use std::fmt::Debug;

use candle_core::{Module, Result, Tensor};
use candle_nn::{Linear, RmsNorm, VarBuilder};

use super::blocks::MlpEmbedder;
use crate::layers;

/// Maps `(batch, rows, in_dim)` distillation inputs to `(batch, rows, out_dim)` modulation vectors.
///
/// Implementations must act row-wise: routing relies on row position only.
pub trait ModulationApproximator: Debug + Send + Sync {
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;
    fn in_dim(&self) -> usize;
    fn out_dim(&self) -> usize;
}

/// The distilled guidance layer: an input projection, residual RMS-normed MLPs and an output
/// projection to the transformer width.
#[derive(Debug, Clone)]
pub struct Approximator {
    in_proj: Linear,
    layers: Vec<MlpEmbedder>,
    norms: Vec<RmsNorm>,
    out_proj: Linear,
    in_dim: usize,
    out_dim: usize,
}

impl Approximator {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        hidden_dim: usize,
        n_layers: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let in_proj = layers::linear(in_dim, hidden_dim, vb.pp("in_proj"))?;
        let mut mlps = Vec::with_capacity(n_layers);
        let mut norms = Vec::with_capacity(n_layers);
        for idx in 0..n_layers {
            mlps.push(MlpEmbedder::new(
                hidden_dim,
                hidden_dim,
                vb.pp("layers").pp(idx),
            )?);
            norms.push(layers::rms_norm_scale(
                hidden_dim,
                1e-6,
                vb.pp("norms").pp(idx),
            )?);
        }
        let out_proj = layers::linear(hidden_dim, out_dim, vb.pp("out_proj"))?;
        Ok(Self {
            in_proj,
            layers: mlps,
            norms,
            out_proj,
            in_dim,
            out_dim,
        })
    }
}

impl ModulationApproximator for Approximator {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.apply(&self.in_proj)?;
        for (layer, norm) in self.layers.iter().zip(&self.norms) {
            xs = (&xs + layer.forward(&xs.apply(norm)?)?)?;
        }
        xs.apply(&self.out_proj)
    }

    fn in_dim(&self) -> usize {
        self.in_dim
    }

    fn out_dim(&self) -> usize {
        self.out_dim
    }
}
