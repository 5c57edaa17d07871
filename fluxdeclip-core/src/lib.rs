#![deny(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::atomic::AtomicBool;

mod diffusion_models;
mod error;
mod layers;
mod utils;

pub use diffusion_models::flux_declip::{
    img_ids, load_fluxdeclip, pad_to_patch_size, txt_ids, Approximator, Control,
    DistillationInputEmbedder, DoubleBlockArgs, DoubleBlockModulation, DoubleBlockOutput,
    DoubleBlockPatch, FinalModulation, FluxDeclip, FluxParams, LoadConfig, ModulationApproximator,
    ModulationConsumer, ModulationInventory, ModulationOut, ModulationSlot, ModulationTable,
    PatchedLatent, SingleBlockArgs, SingleBlockPatch, TransformerOptions, MOD_INDEX_LENGTH,
    PATCH_SIZE,
};
pub use error::{Error, Result};
pub use utils::debug::initialize_logging;
pub use utils::dtype::{ModelDType, TryIntoDType};

/// `true` if `FLUXDECLIP_DEBUG` is set.
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);
