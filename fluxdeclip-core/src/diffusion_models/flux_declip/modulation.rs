//! Routing of the distilled modulation vectors to their consumers.
//!
//! The distilled guidance layer emits one row per modulation slot. Which row belongs to which
//! block is fixed by the order the layer was trained with:
//!
//! 1. single blocks, ascending, 3 rows each (shift, scale, gate)
//! 2. double block image paths, ascending, 6 rows each (two shift/scale/gate triples)
//! 3. double block text paths, ascending, 6 rows each
//! 4. the final layer, 2 rows (shift, scale)
//!
//! Nothing in the weights encodes this order, so a layer trained with a different layout is
//! routed without error into shape-correct but meaningless modulation.

use std::fmt;

use candle_core::{Result as CandleResult, Tensor};
use indexmap::IndexMap;

use crate::{Error, Result};

/// Rows taken by one shift/scale/gate triple.
const TRIPLE_ROWS: usize = 3;
/// Rows taken by the final layer's shift/scale pair.
const FINAL_ROWS: usize = 2;

#[derive(Debug, Clone)]
pub struct ModulationOut {
    pub shift: Tensor,
    pub scale: Tensor,
    pub gate: Tensor,
}

impl ModulationOut {
    pub fn scale_shift(&self, xs: &Tensor) -> CandleResult<Tensor> {
        xs.broadcast_mul(&(&self.scale + 1.)?)?
            .broadcast_add(&self.shift)
    }

    pub fn gate(&self, xs: &Tensor) -> CandleResult<Tensor> {
        self.gate.broadcast_mul(xs)
    }
}

/// The final layer only normalizes and projects, so it has no residual gate.
#[derive(Debug, Clone)]
pub struct FinalModulation {
    pub shift: Tensor,
    pub scale: Tensor,
}

impl FinalModulation {
    pub fn scale_shift(&self, xs: &Tensor) -> CandleResult<Tensor> {
        xs.broadcast_mul(&(&self.scale + 1.)?)?
            .broadcast_add(&self.shift)
    }
}

/// A block that reads its modulation from the distilled guidance layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModulationConsumer {
    SingleBlock(usize),
    DoubleBlockImg(usize),
    DoubleBlockTxt(usize),
    FinalLayer,
}

impl ModulationConsumer {
    /// Number of modulation rows this consumer takes.
    pub fn rows(&self) -> usize {
        match self {
            Self::SingleBlock(_) => TRIPLE_ROWS,
            Self::DoubleBlockImg(_) | Self::DoubleBlockTxt(_) => 2 * TRIPLE_ROWS,
            Self::FinalLayer => FINAL_ROWS,
        }
    }
}

impl fmt::Display for ModulationConsumer {
    // Named after the modulation layers these rows replace.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SingleBlock(i) => write!(f, "single_blocks.{i}.modulation.lin"),
            Self::DoubleBlockImg(i) => write!(f, "double_blocks.{i}.img_mod.lin"),
            Self::DoubleBlockTxt(i) => write!(f, "double_blocks.{i}.txt_mod.lin"),
            Self::FinalLayer => write!(f, "final_layer.adaLN_modulation.1"),
        }
    }
}

/// Ordered list of modulation consumers, built once when the model is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModulationInventory {
    entries: Vec<(ModulationConsumer, usize)>,
    total_rows: usize,
}

impl ModulationInventory {
    pub fn new(depth: usize, depth_single_blocks: usize) -> Self {
        let consumers = (0..depth_single_blocks)
            .map(ModulationConsumer::SingleBlock)
            .chain((0..depth).map(ModulationConsumer::DoubleBlockImg))
            .chain((0..depth).map(ModulationConsumer::DoubleBlockTxt))
            .chain(std::iter::once(ModulationConsumer::FinalLayer));

        let mut entries = Vec::with_capacity(depth_single_blocks + 2 * depth + 1);
        let mut cursor = 0;
        for consumer in consumers {
            entries.push((consumer, cursor));
            cursor += consumer.rows();
        }
        Self {
            entries,
            total_rows: cursor,
        }
    }

    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumers in routing order with the first row each one reads.
    pub fn iter(&self) -> impl Iterator<Item = (ModulationConsumer, usize)> + '_ {
        self.entries.iter().copied()
    }

    /// Slice `(batch, rows, hidden)` modulation vectors into per-consumer records.
    pub fn distribute(&self, mod_vectors: &Tensor) -> Result<ModulationTable> {
        let (_b, rows, _h) = mod_vectors
            .dims3()
            .map_err(|_| Error::shape("mod_vectors", mod_vectors.shape()))?;
        if rows != self.total_rows {
            return Err(Error::ModulationLayout {
                expected: self.total_rows,
                got: rows,
            });
        }

        let row = |idx: usize| mod_vectors.narrow(1, idx, 1);
        let triple = |idx: usize| -> CandleResult<ModulationOut> {
            Ok(ModulationOut {
                shift: row(idx)?,
                scale: row(idx + 1)?,
                gate: row(idx + 2)?,
            })
        };

        let mut slots = IndexMap::with_capacity(self.entries.len());
        for &(consumer, start) in &self.entries {
            let slot = match consumer {
                ModulationConsumer::SingleBlock(_) => ModulationSlot::Single(triple(start)?),
                ModulationConsumer::DoubleBlockImg(_) | ModulationConsumer::DoubleBlockTxt(_) => {
                    ModulationSlot::Double([triple(start)?, triple(start + TRIPLE_ROWS)?])
                }
                ModulationConsumer::FinalLayer => ModulationSlot::Final(FinalModulation {
                    shift: row(start)?,
                    scale: row(start + 1)?,
                }),
            };
            slots.insert(consumer, slot);
        }
        Ok(ModulationTable { slots })
    }
}

#[derive(Debug, Clone)]
pub enum ModulationSlot {
    Single(ModulationOut),
    /// Attention and MLP stage of one stream of a double block.
    Double([ModulationOut; 2]),
    Final(FinalModulation),
}

/// Image and text modulation of one double stream block.
#[derive(Debug, Clone, Copy)]
pub struct DoubleBlockModulation<'a> {
    pub img: &'a [ModulationOut; 2],
    pub txt: &'a [ModulationOut; 2],
}

/// Read-only routing table produced once per forward call.
#[derive(Debug, Clone)]
pub struct ModulationTable {
    slots: IndexMap<ModulationConsumer, ModulationSlot>,
}

impl ModulationTable {
    pub fn get(&self, consumer: ModulationConsumer) -> Option<&ModulationSlot> {
        self.slots.get(&consumer)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn single(&self, idx: usize) -> CandleResult<&ModulationOut> {
        match self.get(ModulationConsumer::SingleBlock(idx)) {
            Some(ModulationSlot::Single(m)) => Ok(m),
            _ => candle_core::bail!("no modulation routed to single block {idx}"),
        }
    }

    pub fn double(&self, idx: usize) -> CandleResult<DoubleBlockModulation<'_>> {
        let img = match self.get(ModulationConsumer::DoubleBlockImg(idx)) {
            Some(ModulationSlot::Double(m)) => m,
            _ => candle_core::bail!("no image modulation routed to double block {idx}"),
        };
        let txt = match self.get(ModulationConsumer::DoubleBlockTxt(idx)) {
            Some(ModulationSlot::Double(m)) => m,
            _ => candle_core::bail!("no text modulation routed to double block {idx}"),
        };
        Ok(DoubleBlockModulation { img, txt })
    }

    pub fn final_layer(&self) -> CandleResult<&FinalModulation> {
        match self.get(ModulationConsumer::FinalLayer) {
            Some(ModulationSlot::Final(m)) => Ok(m),
            _ => candle_core::bail!("no modulation routed to the final layer"),
        }
    }
}
