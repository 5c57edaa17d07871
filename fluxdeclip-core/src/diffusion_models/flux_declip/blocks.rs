#![allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use candle_core::{Device, IndexOp, Module, Result, Tensor, D};
use candle_nn::{LayerNorm, Linear, RmsNorm, VarBuilder};

use super::common;
use super::config::FluxParams;
use super::modulation::{DoubleBlockModulation, FinalModulation, ModulationOut};
use crate::layers;

/// N-axis rotary embedding of `(b, seq, n_axes)` position ids.
#[derive(Debug, Clone)]
pub struct EmbedNd {
    inv_freqs: Vec<Tensor>,
}

impl EmbedNd {
    pub fn new(theta: usize, axes_dim: &[usize], device: &Device) -> Result<Self> {
        let inv_freqs = axes_dim
            .iter()
            .map(|&dim| common::precompute_inv_freq(dim, theta, device))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { inv_freqs })
    }
}

impl Module for EmbedNd {
    fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        let n_axes = ids.dim(D::Minus1)?;
        if n_axes != self.inv_freqs.len() {
            candle_core::bail!(
                "got {n_axes} position axes, expected {}",
                self.inv_freqs.len()
            )
        }
        let mut emb = Vec::with_capacity(n_axes);
        for (idx, inv_freq) in self.inv_freqs.iter().enumerate() {
            emb.push(common::rope_with_inv_freq(
                &ids.get_on_dim(D::Minus1, idx)?,
                inv_freq,
            )?);
        }
        let emb = Tensor::cat(&emb, 2)?;
        emb.unsqueeze(1)
    }
}

#[derive(Debug, Clone)]
pub struct MlpEmbedder {
    in_layer: Linear,
    out_layer: Linear,
}

impl MlpEmbedder {
    pub fn new(in_sz: usize, h_sz: usize, vb: VarBuilder) -> Result<Self> {
        let in_layer = layers::linear(in_sz, h_sz, vb.pp("in_layer"))?;
        let out_layer = layers::linear(h_sz, h_sz, vb.pp("out_layer"))?;
        Ok(Self {
            in_layer,
            out_layer,
        })
    }
}

impl Module for MlpEmbedder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.in_layer)?.silu()?.apply(&self.out_layer)
    }
}

#[derive(Debug, Clone)]
struct QkNorm {
    query_norm: RmsNorm,
    key_norm: RmsNorm,
}

impl QkNorm {
    fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        let query_norm = layers::rms_norm_scale(dim, 1e-6, vb.pp("query_norm"))?;
        let key_norm = layers::rms_norm_scale(dim, 1e-6, vb.pp("key_norm"))?;
        Ok(Self {
            query_norm,
            key_norm,
        })
    }
}

#[derive(Debug, Clone)]
struct SelfAttention {
    qkv: Linear,
    norm: QkNorm,
    proj: Linear,
    num_attention_heads: usize,
}

impl SelfAttention {
    fn new(dim: usize, num_attention_heads: usize, qkv_bias: bool, vb: VarBuilder) -> Result<Self> {
        let head_dim = dim / num_attention_heads;
        let qkv = layers::linear_b(dim, dim * 3, qkv_bias, vb.pp("qkv"))?;
        let norm = QkNorm::new(head_dim, vb.pp("norm"))?;
        let proj = layers::linear(dim, dim, vb.pp("proj"))?;
        Ok(Self {
            qkv,
            norm,
            proj,
            num_attention_heads,
        })
    }

    fn qkv(&self, xs: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let qkv = xs.apply(&self.qkv)?;
        let (b, l, _khd) = qkv.dims3()?;
        let qkv = qkv.reshape((b, l, 3, self.num_attention_heads, ()))?;
        let q = qkv.i((.., .., 0))?.transpose(1, 2)?;
        let k = qkv.i((.., .., 1))?.transpose(1, 2)?;
        let v = qkv.i((.., .., 2))?.transpose(1, 2)?;
        let q = q.contiguous()?.apply(&self.norm.query_norm)?;
        let k = k.contiguous()?.apply(&self.norm.key_norm)?;
        Ok((q, k, v))
    }
}

#[derive(Debug, Clone)]
struct Mlp {
    lin1: Linear,
    lin2: Linear,
}

impl Mlp {
    fn new(in_sz: usize, mlp_sz: usize, vb: VarBuilder) -> Result<Self> {
        let lin1 = layers::linear(in_sz, mlp_sz, vb.pp("0"))?;
        let lin2 = layers::linear(mlp_sz, in_sz, vb.pp("2"))?;
        Ok(Self { lin1, lin2 })
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.apply(&self.lin1)?.gelu()?.apply(&self.lin2)
    }
}

/// Separate image and text paths that attend jointly.
///
/// Carries no modulation weights: the shift/scale/gate triples come from the distilled guidance
/// layer through [`DoubleBlockModulation`].
#[derive(Debug, Clone)]
pub struct DoubleStreamBlock {
    img_norm1: LayerNorm,
    img_attn: SelfAttention,
    img_norm2: LayerNorm,
    img_mlp: Mlp,
    txt_norm1: LayerNorm,
    txt_attn: SelfAttention,
    txt_norm2: LayerNorm,
    txt_mlp: Mlp,
}

impl DoubleStreamBlock {
    pub fn new(cfg: &FluxParams, vb: VarBuilder) -> Result<Self> {
        let h_sz = cfg.hidden_size;
        let mlp_sz = cfg.mlp_hidden_dim();
        let (dtype, dev) = (vb.dtype(), vb.device().clone());
        Ok(Self {
            img_norm1: layers::layer_norm_no_affine(h_sz, dtype, &dev)?,
            img_attn: SelfAttention::new(h_sz, cfg.num_heads, cfg.qkv_bias, vb.pp("img_attn"))?,
            img_norm2: layers::layer_norm_no_affine(h_sz, dtype, &dev)?,
            img_mlp: Mlp::new(h_sz, mlp_sz, vb.pp("img_mlp"))?,
            txt_norm1: layers::layer_norm_no_affine(h_sz, dtype, &dev)?,
            txt_attn: SelfAttention::new(h_sz, cfg.num_heads, cfg.qkv_bias, vb.pp("txt_attn"))?,
            txt_norm2: layers::layer_norm_no_affine(h_sz, dtype, &dev)?,
            txt_mlp: Mlp::new(h_sz, mlp_sz, vb.pp("txt_mlp"))?,
        })
    }

    pub fn forward(
        &self,
        img: &Tensor,
        txt: &Tensor,
        pe: &Tensor,
        modulation: DoubleBlockModulation<'_>,
    ) -> Result<(Tensor, Tensor)> {
        let [img_mod1, img_mod2] = modulation.img;
        let [txt_mod1, txt_mod2] = modulation.txt;

        let img_modulated = img_mod1.scale_shift(&img.apply(&self.img_norm1)?)?;
        let (img_q, img_k, img_v) = self.img_attn.qkv(&img_modulated)?;

        let txt_modulated = txt_mod1.scale_shift(&txt.apply(&self.txt_norm1)?)?;
        let (txt_q, txt_k, txt_v) = self.txt_attn.qkv(&txt_modulated)?;

        let q = Tensor::cat(&[txt_q, img_q], 2)?;
        let k = Tensor::cat(&[txt_k, img_k], 2)?;
        let v = Tensor::cat(&[txt_v, img_v], 2)?;

        let attn = common::attention(&q, &k, &v, pe)?;
        let txt_len = txt.dim(1)?;
        let txt_attn = attn.narrow(1, 0, txt_len)?;
        let img_attn = attn.narrow(1, txt_len, attn.dim(1)? - txt_len)?;

        let img = (img + img_mod1.gate(&img_attn.apply(&self.img_attn.proj)?))?;
        let img = (&img
            + img_mod2.gate(
                &img_mod2
                    .scale_shift(&img.apply(&self.img_norm2)?)?
                    .apply(&self.img_mlp)?,
            )?)?;

        let txt = (txt + txt_mod1.gate(&txt_attn.apply(&self.txt_attn.proj)?))?;
        let txt = (&txt
            + txt_mod2.gate(
                &txt_mod2
                    .scale_shift(&txt.apply(&self.txt_norm2)?)?
                    .apply(&self.txt_mlp)?,
            )?)?;

        Ok((img, txt))
    }
}

/// Parallel attention + MLP over the concatenated `[txt, img]` sequence.
#[derive(Debug, Clone)]
pub struct SingleStreamBlock {
    linear1: Linear,
    linear2: Linear,
    norm: QkNorm,
    pre_norm: LayerNorm,
    h_sz: usize,
    mlp_sz: usize,
    num_attention_heads: usize,
}

impl SingleStreamBlock {
    pub fn new(cfg: &FluxParams, vb: VarBuilder) -> Result<Self> {
        let h_sz = cfg.hidden_size;
        let mlp_sz = cfg.mlp_hidden_dim();
        let linear1 = layers::linear(h_sz, h_sz * 3 + mlp_sz, vb.pp("linear1"))?;
        let linear2 = layers::linear(h_sz + mlp_sz, h_sz, vb.pp("linear2"))?;
        let norm = QkNorm::new(cfg.head_dim(), vb.pp("norm"))?;
        let pre_norm = layers::layer_norm_no_affine(h_sz, vb.dtype(), vb.device())?;
        Ok(Self {
            linear1,
            linear2,
            norm,
            pre_norm,
            h_sz,
            mlp_sz,
            num_attention_heads: cfg.num_heads,
        })
    }

    pub fn forward(&self, xs: &Tensor, pe: &Tensor, modulation: &ModulationOut) -> Result<Tensor> {
        let x_mod = modulation.scale_shift(&xs.apply(&self.pre_norm)?)?;
        let x_mod = x_mod.apply(&self.linear1)?;
        let qkv = x_mod.narrow(D::Minus1, 0, 3 * self.h_sz)?;
        let (b, l, _khd) = qkv.dims3()?;
        let qkv = qkv.reshape((b, l, 3, self.num_attention_heads, ()))?;
        let q = qkv.i((.., .., 0))?.transpose(1, 2)?;
        let k = qkv.i((.., .., 1))?.transpose(1, 2)?;
        let v = qkv.i((.., .., 2))?.transpose(1, 2)?;
        let mlp = x_mod.narrow(D::Minus1, 3 * self.h_sz, self.mlp_sz)?;
        let q = q.contiguous()?.apply(&self.norm.query_norm)?;
        let k = k.contiguous()?.apply(&self.norm.key_norm)?;
        let attn = common::attention(&q, &k, &v, pe)?;
        let output = Tensor::cat(&[attn, mlp.gelu()?], 2)?.apply(&self.linear2)?;
        xs + modulation.gate(&output)?
    }
}

#[derive(Debug, Clone)]
pub struct LastLayer {
    norm_final: LayerNorm,
    linear: Linear,
}

impl LastLayer {
    pub fn new(h_sz: usize, p_sz: usize, out_c: usize, vb: VarBuilder) -> Result<Self> {
        let norm_final = layers::layer_norm_no_affine(h_sz, vb.dtype(), vb.device())?;
        let linear = layers::linear(h_sz, p_sz * p_sz * out_c, vb.pp("linear"))?;
        Ok(Self { norm_final, linear })
    }

    pub fn forward(&self, xs: &Tensor, modulation: &FinalModulation) -> Result<Tensor> {
        modulation
            .scale_shift(&xs.apply(&self.norm_final)?)?
            .apply(&self.linear)
    }
}
