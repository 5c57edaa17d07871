//! Conversion between spatial latents and patch token sequences.

#![allow(clippy::cast_possible_truncation)]

use candle_core::{DType, Device, Result, Tensor};

/// Circularly pad the last two dims of `(b, c, h, w)` up to a multiple of `patch_size`.
///
/// Padded rows and columns repeat the leading ones.
pub fn pad_to_patch_size(xs: &Tensor, patch_size: usize) -> Result<Tensor> {
    let mut xs = xs.clone();
    for dim in [2, 3] {
        let len = xs.dim(dim)?;
        let pad = (patch_size - len % patch_size) % patch_size;
        if pad > 0 {
            if pad > len {
                candle_core::bail!("cannot circularly pad {len} elements by {pad}")
            }
            xs = Tensor::cat(&[&xs, &xs.narrow(dim, 0, pad)?], dim)?;
        }
    }
    Ok(xs)
}

/// A spatial latent flattened into patch tokens, with the geometry needed to undo it.
#[derive(Debug, Clone)]
pub struct PatchedLatent {
    /// `(b, h_len * w_len, c * patch²)`
    pub img: Tensor,
    /// `(b, h_len * w_len, 3)` position ids: `[0, row, col]`.
    pub img_ids: Tensor,
    pub h_len: usize,
    pub w_len: usize,
    height: usize,
    width: usize,
    patch_size: usize,
}

impl PatchedLatent {
    pub fn new(xs: &Tensor, patch_size: usize) -> Result<Self> {
        let (bs, _c, height, width) = xs.dims4()?;
        let xs = pad_to_patch_size(xs, patch_size)?;
        let (_, c, h, w) = xs.dims4()?;
        let (h_len, w_len) = (h / patch_size, w / patch_size);

        let img = xs
            .reshape((bs, c, h_len, patch_size, w_len, patch_size))? // (b, c, h, ph, w, pw)
            .permute((0, 2, 4, 1, 3, 5))? // (b, h, w, c, ph, pw)
            .reshape((bs, h_len * w_len, c * patch_size * patch_size))?;

        let img_ids = img_ids(bs, h_len, w_len, xs.dtype(), xs.device())?;
        Ok(Self {
            img,
            img_ids,
            h_len,
            w_len,
            height,
            width,
            patch_size,
        })
    }

    pub fn num_tokens(&self) -> usize {
        self.h_len * self.w_len
    }

    /// Fold `(b, h_len * w_len, c * patch²)` tokens back into `(b, c, height, width)`,
    /// dropping any padding.
    pub fn unpatchify(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, n_tokens, c_ph_pw) = xs.dims3()?;
        let p = self.patch_size;
        if n_tokens != self.num_tokens() || c_ph_pw % (p * p) != 0 {
            candle_core::bail!(
                "cannot unpatchify {:?} into a {}x{} grid of {p}x{p} patches",
                xs.shape(),
                self.h_len,
                self.w_len
            )
        }
        let c = c_ph_pw / (p * p);
        xs.reshape((b, self.h_len, self.w_len, c, p, p))? // (b, h, w, c, ph, pw)
            .permute((0, 3, 1, 4, 2, 5))? // (b, c, h, ph, w, pw)
            .reshape((b, c, self.h_len * p, self.w_len * p))?
            .narrow(2, 0, self.height)?
            .narrow(3, 0, self.width)
    }
}

/// Position ids of a `h_len x w_len` patch grid. The first axis is reserved for frame indices.
pub fn img_ids(
    bs: usize,
    h_len: usize,
    w_len: usize,
    dtype: DType,
    dev: &Device,
) -> Result<Tensor> {
    let t_ids = Tensor::zeros((h_len, w_len), DType::U32, dev)?;
    let h_ids = Tensor::arange(0u32, h_len as u32, dev)?
        .reshape(((), 1))?
        .broadcast_as((h_len, w_len))?;
    let w_ids = Tensor::arange(0u32, w_len as u32, dev)?
        .reshape((1, ()))?
        .broadcast_as((h_len, w_len))?;
    Tensor::stack(&[t_ids, h_ids, w_ids], 2)?
        .to_dtype(dtype)?
        .reshape((1, h_len * w_len, 3))?
        .repeat((bs, 1, 1))
}

/// Text tokens carry no spatial position.
pub fn txt_ids(bs: usize, txt_len: usize, dtype: DType, dev: &Device) -> Result<Tensor> {
    Tensor::zeros((bs, txt_len, 3), dtype, dev)
}
