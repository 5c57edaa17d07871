use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{LayerNorm, Linear, RmsNorm, VarBuilder};

pub fn linear(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get((out_dim, in_dim), "weight")?;
    let bs = vb.get(out_dim, "bias")?;
    Ok(Linear::new(ws, Some(bs)))
}

pub fn linear_no_bias(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Linear> {
    let ws = vb.get((out_dim, in_dim), "weight")?;
    Ok(Linear::new(ws, None))
}

pub fn linear_b(in_dim: usize, out_dim: usize, bias: bool, vb: VarBuilder) -> Result<Linear> {
    if bias {
        linear(in_dim, out_dim, vb)
    } else {
        linear_no_bias(in_dim, out_dim, vb)
    }
}

/// Creates a LayerNorm without learnable parameters (elementwise_affine=False).
pub fn layer_norm_no_affine(dim: usize, dtype: DType, device: &Device) -> Result<LayerNorm> {
    let ws = Tensor::ones(dim, dtype, device)?;
    Ok(LayerNorm::new_no_bias(ws, 1e-6))
}

/// RMS norm whose weight is stored under `scale`, as in the BFL checkpoints.
pub fn rms_norm_scale(dim: usize, eps: f64, vb: VarBuilder) -> Result<RmsNorm> {
    let scale = vb.get(dim, "scale")?;
    Ok(RmsNorm::new(scale, eps))
}
