#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{DType, Device, Result, Tensor, D};

/// Precompute the inv_freq tensor for a given RoPE dimension and theta.
///
/// Called once at model construction; the result is reused by every forward call.
pub(super) fn precompute_inv_freq(dim: usize, theta: usize, device: &Device) -> Result<Tensor> {
    if dim % 2 == 1 {
        candle_core::bail!("dim {dim} is odd")
    }
    let theta = theta as f64;
    let inv_freq: Vec<_> = (0..dim)
        .step_by(2)
        .map(|i| 1f32 / theta.powf(i as f64 / dim as f64) as f32)
        .collect();
    let inv_freq_len = inv_freq.len();
    Tensor::from_vec(inv_freq, (1, 1, inv_freq_len), device)
}

/// Compute rotary position embeddings using a precomputed inv_freq tensor.
pub(super) fn rope_with_inv_freq(pos: &Tensor, inv_freq: &Tensor) -> Result<Tensor> {
    let inv_freq = inv_freq.to_dtype(pos.dtype())?;
    let freqs = pos.unsqueeze(2)?.broadcast_mul(&inv_freq)?;
    let cos = freqs.cos()?;
    let sin = freqs.sin()?;
    let out = Tensor::stack(&[&cos, &sin.neg()?, &sin, &cos], 3)?;
    let (b, n, d, _ij) = out.dims4()?;
    out.reshape((b, n, d, 2, 2))
}

pub(super) fn apply_rope(x: &Tensor, freq_cis: &Tensor) -> Result<Tensor> {
    let dims = x.dims();
    let (b_sz, n_head, seq_len, n_embd) = x.dims4()?;
    let x = x
        .contiguous()?
        .reshape((b_sz, n_head, seq_len, n_embd / 2, 2))?;
    let x0 = x.narrow(D::Minus1, 0, 1)?;
    let x1 = x.narrow(D::Minus1, 1, 1)?;
    let fr0 = freq_cis.get_on_dim(D::Minus1, 0)?;
    let fr1 = freq_cis.get_on_dim(D::Minus1, 1)?;
    (fr0.broadcast_mul(&x0)? + fr1.broadcast_mul(&x1)?)?.reshape(dims.to_vec())
}

fn scaled_dot_product_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let dim = q.dim(D::Minus1)?;
    let scale_factor = 1.0 / (dim as f64).sqrt();
    let mut batch_dims = q.dims().to_vec();
    batch_dims.pop();
    batch_dims.pop();
    let q = q.flatten_to(batch_dims.len() - 1)?;
    let k = k.flatten_to(batch_dims.len() - 1)?;
    let v = v.flatten_to(batch_dims.len() - 1)?;
    let attn_weights = (q.matmul(&k.t()?)? * scale_factor)?;
    let attn_scores = candle_nn::ops::softmax_last_dim(&attn_weights)?.matmul(&v)?;
    batch_dims.push(attn_scores.dim(D::Minus2)?);
    batch_dims.push(attn_scores.dim(D::Minus1)?);
    attn_scores.reshape(batch_dims)
}

/// Rope-rotated joint attention over `(b, heads, seq, head_dim)` inputs, returned as `(b, seq, hidden)`.
pub(super) fn attention(q: &Tensor, k: &Tensor, v: &Tensor, pe: &Tensor) -> Result<Tensor> {
    let q = apply_rope(q, pe)?.contiguous()?;
    let k = apply_rope(k, pe)?.contiguous()?;
    let v = v.contiguous()?;
    let x = scaled_dot_product_attention(&q, &k, &v)?;
    x.transpose(1, 2)?.flatten_from(2)
}

/// Precomputed frequency tensor for sinusoidal timestep embeddings.
#[derive(Debug, Clone)]
pub(super) struct TimestepFreqs {
    freqs: Tensor,
}

impl TimestepFreqs {
    pub fn new(dim: usize, device: &Device) -> Result<Self> {
        const MAX_PERIOD: f64 = 10000.;
        if dim % 2 == 1 {
            candle_core::bail!("{dim} is odd")
        }
        let half = dim / 2;
        let arange = Tensor::arange(0, half as u32, device)?.to_dtype(DType::F32)?;
        let freqs = (arange * (-MAX_PERIOD.ln() / half as f64))?.exp()?;
        let freqs = freqs.unsqueeze(0)?;
        Ok(Self { freqs })
    }

    /// Embed a rank-1 tensor of `n` values into `(n, dim)` as `[cos, sin]`.
    pub fn embed(&self, t: &Tensor, dtype: DType) -> Result<Tensor> {
        const TIME_FACTOR: f64 = 1000.;
        let t = (t.to_dtype(DType::F32)? * TIME_FACTOR)?;
        let args = t.unsqueeze(1)?.broadcast_mul(&self.freqs)?;
        Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)?.to_dtype(dtype)
    }
}
