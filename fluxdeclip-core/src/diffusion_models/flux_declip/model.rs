#![allow(clippy::too_many_arguments)]

use std::sync::{atomic::Ordering, Arc};

use candle_core::{DType, Device, Tensor};
use candle_nn::{Linear, VarBuilder};
use tracing::{debug, trace};

use super::approximator::{Approximator, ModulationApproximator};
use super::blocks::{DoubleStreamBlock, EmbedNd, LastLayer, SingleStreamBlock};
use super::config::{FluxParams, PATCH_SIZE};
use super::embedding::DistillationInputEmbedder;
use super::modulation::{ModulationInventory, ModulationTable};
use super::patches::{
    Control, DoubleBlockArgs, DoubleBlockOutput, SingleBlockArgs, TransformerOptions,
};
use super::sampling::{txt_ids, PatchedLatent};
use crate::{layers, Error, Result, DEBUG};

/// FLUX transformer whose blocks carry no modulation weights. Every shift/scale/gate comes from
/// one distilled guidance layer evaluated on `(timestep, guidance, row index)` embeddings.
///
/// Forward evaluation borrows the model immutably, so one instance can serve concurrent calls.
#[derive(Debug, Clone)]
pub struct FluxDeclip {
    img_in: Linear,
    txt_in: Linear,
    pe_embedder: EmbedNd,
    distill_embedder: DistillationInputEmbedder,
    distilled_guidance_layer: Arc<dyn ModulationApproximator>,
    inventory: ModulationInventory,
    double_blocks: Vec<DoubleStreamBlock>,
    single_blocks: Vec<SingleStreamBlock>,
    final_layer: LastLayer,
    params: FluxParams,
    device: Device,
}

impl FluxDeclip {
    pub fn new(cfg: &FluxParams, vb: VarBuilder) -> Result<Self> {
        cfg.validate()?;
        let approximator = Approximator::new(
            cfg.approximator_in_dim,
            cfg.hidden_size,
            cfg.approximator_hidden_dim,
            cfg.approximator_layers,
            vb.pp("distilled_guidance_layer"),
        )?;
        Self::with_approximator(cfg, vb, Arc::new(approximator))
    }

    /// Build the transformer around an externally constructed distillation network.
    pub fn with_approximator(
        cfg: &FluxParams,
        vb: VarBuilder,
        approximator: Arc<dyn ModulationApproximator>,
    ) -> Result<Self> {
        cfg.validate()?;
        if approximator.in_dim() != cfg.approximator_in_dim {
            return Err(Error::Configuration(format!(
                "distillation network takes {} wide rows, expected {}",
                approximator.in_dim(),
                cfg.approximator_in_dim
            )));
        }
        if approximator.out_dim() != cfg.hidden_size {
            return Err(Error::Configuration(format!(
                "distillation network emits {} wide rows, expected hidden size {}",
                approximator.out_dim(),
                cfg.hidden_size
            )));
        }

        let device = vb.device().clone();
        let img_in = layers::linear(cfg.patched_channels(), cfg.hidden_size, vb.pp("img_in"))?;
        let txt_in = layers::linear(cfg.context_in_dim, cfg.hidden_size, vb.pp("txt_in"))?;

        let mut double_blocks = Vec::with_capacity(cfg.depth);
        let vb_d = vb.pp("double_blocks");
        for idx in 0..cfg.depth {
            double_blocks.push(DoubleStreamBlock::new(cfg, vb_d.pp(idx))?);
        }
        let mut single_blocks = Vec::with_capacity(cfg.depth_single_blocks);
        let vb_s = vb.pp("single_blocks");
        for idx in 0..cfg.depth_single_blocks {
            single_blocks.push(SingleStreamBlock::new(cfg, vb_s.pp(idx))?);
        }
        let final_layer = LastLayer::new(
            cfg.hidden_size,
            1,
            cfg.patched_channels(),
            vb.pp("final_layer"),
        )?;

        let pe_embedder = EmbedNd::new(cfg.theta, &cfg.axes_dim, &device)?;
        let distill_embedder = DistillationInputEmbedder::new(cfg.mod_index_length, &device)?;
        let inventory = cfg.inventory();
        debug!(
            "FluxDeCLIP: {} double blocks, {} single blocks, {} modulation rows",
            cfg.depth,
            cfg.depth_single_blocks,
            inventory.total_rows()
        );

        Ok(Self {
            img_in,
            txt_in,
            pe_embedder,
            distill_embedder,
            distilled_guidance_layer: approximator,
            inventory,
            double_blocks,
            single_blocks,
            final_layer,
            params: cfg.clone(),
            device,
        })
    }

    pub fn params(&self) -> &FluxParams {
        &self.params
    }

    pub fn inventory(&self) -> &ModulationInventory {
        &self.inventory
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Run the distilled guidance layer and route its rows to every block.
    pub fn modulation(
        &self,
        timesteps: &Tensor,
        guidance: Option<&Tensor>,
        b_sz: usize,
        dtype: DType,
    ) -> Result<ModulationTable> {
        let guidance = match guidance {
            Some(guidance) => guidance.clone(),
            None => Tensor::zeros(b_sz, DType::F32, &self.device)?,
        };
        let input = self
            .distill_embedder
            .forward(timesteps, &guidance, b_sz, dtype)?;
        let mod_vectors = self.distilled_guidance_layer.forward(&input)?;
        trace!("modulation vectors {:?}", mod_vectors.shape());
        self.inventory.distribute(&mod_vectors)
    }

    /// Evaluate the transformer on patch tokens.
    ///
    /// `img` is `(b, img_tokens, in_channels * 4)`, `txt` is `(b, txt_tokens, context_in_dim)`,
    /// the id tensors are `(b, tokens, 3)`. Returns `(b, img_tokens, in_channels * 4)`.
    pub fn forward_orig(
        &self,
        img: &Tensor,
        img_ids: &Tensor,
        txt: &Tensor,
        txt_ids: &Tensor,
        timesteps: &Tensor,
        guidance: Option<&Tensor>,
        control: Option<&Control>,
        options: &TransformerOptions,
    ) -> Result<Tensor> {
        if img.rank() != 3 {
            return Err(Error::shape("img", img.shape()));
        }
        if txt.rank() != 3 {
            return Err(Error::shape("txt", txt.shape()));
        }
        if img_ids.rank() != 3 {
            return Err(Error::shape("img_ids", img_ids.shape()));
        }
        if txt_ids.rank() != 3 {
            return Err(Error::shape("txt_ids", txt_ids.shape()));
        }
        let dtype = img.dtype();
        let b_sz = img.dim(0)?;
        let txt_len = txt.dim(1)?;
        debug!(
            "forward: batch {b_sz}, {} image tokens, {txt_len} text tokens",
            img.dim(1)?
        );

        if !options.is_empty() {
            debug!("block replacements: {options:?}");
        }

        let mut img = img.apply(&self.img_in)?;
        let mut txt = txt.apply(&self.txt_in)?;

        let modulation = self.modulation(timesteps, guidance, b_sz, dtype)?;

        let pe = {
            let ids = Tensor::cat(&[txt_ids, img_ids], 1)?;
            ids.apply(&self.pe_embedder)?
        };

        for (idx, block) in self.double_blocks.iter().enumerate() {
            let args = DoubleBlockArgs {
                img: &img,
                txt: &txt,
                pe: &pe,
                modulation: modulation.double(idx)?,
            };
            let out = match options.double_block_patch(idx) {
                Some(patch) => {
                    trace!("double block {idx} replaced");
                    patch.forward(args, &|args: DoubleBlockArgs<'_>| run_double(block, args))?
                }
                None => run_double(block, args)?,
            };
            img = out.img;
            txt = out.txt;
            if DEBUG.load(Ordering::Relaxed) {
                log_activation("double block", idx, &img)?;
            }

            if let Some(control) = control.and_then(|c| c.input(idx)) {
                img = img.broadcast_add(control)?;
            }
        }

        let mut img = Tensor::cat(&[&txt, &img], 1)?;
        for (idx, block) in self.single_blocks.iter().enumerate() {
            let args = SingleBlockArgs {
                img: &img,
                pe: &pe,
                modulation: modulation.single(idx)?,
            };
            let out = match options.single_block_patch(idx) {
                Some(patch) => {
                    trace!("single block {idx} replaced");
                    patch.forward(args, &|args: SingleBlockArgs<'_>| -> Result<Tensor> {
                        Ok(block.forward(args.img, args.pe, args.modulation)?)
                    })?
                }
                None => block.forward(args.img, args.pe, args.modulation)?,
            };
            img = out;
            if DEBUG.load(Ordering::Relaxed) {
                log_activation("single block", idx, &img)?;
            }

            if let Some(control) = control.and_then(|c| c.output(idx)) {
                let seq_len = img.dim(1)?;
                let txt_part = img.narrow(1, 0, txt_len)?;
                let img_part = img
                    .narrow(1, txt_len, seq_len - txt_len)?
                    .broadcast_add(control)?;
                img = Tensor::cat(&[&txt_part, &img_part], 1)?;
            }
        }

        let seq_len = img.dim(1)?;
        let img = img.narrow(1, txt_len, seq_len - txt_len)?;
        Ok(self.final_layer.forward(&img, modulation.final_layer()?)?)
    }

    /// Evaluate the transformer on a spatial latent `(b, in_channels, h, w)`.
    ///
    /// `h` and `w` need not be multiples of the patch size; the output is cropped back to the
    /// input shape. `y` is the pooled conditioning vector, which the distilled model ignores
    /// beyond a batch check.
    pub fn forward(
        &self,
        x: &Tensor,
        timestep: &Tensor,
        context: &Tensor,
        y: Option<&Tensor>,
        guidance: Option<&Tensor>,
        control: Option<&Control>,
        options: &TransformerOptions,
    ) -> Result<Tensor> {
        if x.rank() != 4 {
            return Err(Error::shape("x", x.shape()));
        }
        if context.rank() != 3 {
            return Err(Error::shape("context", context.shape()));
        }
        let bs = x.dim(0)?;
        if let Some(y) = y {
            if y.rank() == 0 || y.dim(0)? != bs {
                return Err(Error::shape("y", y.shape()));
            }
        }

        let patched = PatchedLatent::new(x, PATCH_SIZE)?;
        let txt_ids = txt_ids(bs, context.dim(1)?, x.dtype(), x.device())?;
        let out = self.forward_orig(
            &patched.img,
            &patched.img_ids,
            context,
            &txt_ids,
            timestep,
            guidance,
            control,
            options,
        )?;
        Ok(patched.unpatchify(&out)?)
    }
}

fn run_double(block: &DoubleStreamBlock, args: DoubleBlockArgs<'_>) -> Result<DoubleBlockOutput> {
    let (img, txt) = block.forward(args.img, args.txt, args.pe, args.modulation)?;
    Ok(DoubleBlockOutput { img, txt })
}

/// Mean absolute activation, only computed when `FLUXDECLIP_DEBUG` is set since it syncs the device.
fn log_activation(kind: &str, idx: usize, xs: &Tensor) -> Result<()> {
    let mean_abs = xs
        .abs()?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?;
    debug!("{kind} {idx}: mean |x| = {mean_abs}");
    Ok(())
}
