//! FluxDeCLIP: a FLUX transformer driven by a distilled guidance layer.

mod approximator;
mod blocks;
mod common;
mod config;
mod embedding;
mod loader;
mod model;
mod modulation;
mod patches;
mod sampling;

pub use approximator::{Approximator, ModulationApproximator};
pub use config::{FluxParams, MOD_INDEX_LENGTH, PATCH_SIZE};
pub use embedding::DistillationInputEmbedder;
pub use loader::{load_fluxdeclip, LoadConfig};
pub use model::FluxDeclip;
pub use modulation::{
    DoubleBlockModulation, FinalModulation, ModulationConsumer, ModulationInventory,
    ModulationOut, ModulationSlot, ModulationTable,
};
pub use patches::{
    Control, DoubleBlockArgs, DoubleBlockOutput, DoubleBlockPatch, SingleBlockArgs,
    SingleBlockPatch, TransformerOptions,
};
pub use sampling::{img_ids, pad_to_patch_size, txt_ids, PatchedLatent};
