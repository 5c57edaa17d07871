//! Per-block replacement hooks and additive control signals.

use std::{collections::HashMap, fmt, sync::Arc};

use candle_core::Tensor;

use super::modulation::{DoubleBlockModulation, ModulationOut};
use crate::Result;

/// Arguments of one double stream block call.
#[derive(Debug, Clone, Copy)]
pub struct DoubleBlockArgs<'a> {
    pub img: &'a Tensor,
    pub txt: &'a Tensor,
    pub pe: &'a Tensor,
    pub modulation: DoubleBlockModulation<'a>,
}

#[derive(Debug, Clone)]
pub struct DoubleBlockOutput {
    pub img: Tensor,
    pub txt: Tensor,
}

/// Arguments of one single stream block call. `img` is the concatenated `[txt, img]` sequence.
#[derive(Debug, Clone, Copy)]
pub struct SingleBlockArgs<'a> {
    pub img: &'a Tensor,
    pub pe: &'a Tensor,
    pub modulation: &'a ModulationOut,
}

/// Replaces the computation of one double stream block.
///
/// `original` runs the block as it would without the patch.
pub trait DoubleBlockPatch: Send + Sync {
    fn forward(
        &self,
        args: DoubleBlockArgs<'_>,
        original: &dyn Fn(DoubleBlockArgs<'_>) -> Result<DoubleBlockOutput>,
    ) -> Result<DoubleBlockOutput>;
}

/// Replaces the computation of one single stream block.
///
/// The returned sequence is what the next block receives.
pub trait SingleBlockPatch: Send + Sync {
    fn forward(
        &self,
        args: SingleBlockArgs<'_>,
        original: &dyn Fn(SingleBlockArgs<'_>) -> Result<Tensor>,
    ) -> Result<Tensor>;
}

/// Per-call options: block replacements keyed by block index.
#[derive(Clone, Default)]
pub struct TransformerOptions {
    double_blocks: HashMap<usize, Arc<dyn DoubleBlockPatch>>,
    single_blocks: HashMap<usize, Arc<dyn SingleBlockPatch>>,
}

impl TransformerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_double_block_patch(mut self, idx: usize, patch: Arc<dyn DoubleBlockPatch>) -> Self {
        self.double_blocks.insert(idx, patch);
        self
    }

    pub fn with_single_block_patch(mut self, idx: usize, patch: Arc<dyn SingleBlockPatch>) -> Self {
        self.single_blocks.insert(idx, patch);
        self
    }

    pub fn double_block_patch(&self, idx: usize) -> Option<&Arc<dyn DoubleBlockPatch>> {
        self.double_blocks.get(&idx)
    }

    pub fn single_block_patch(&self, idx: usize) -> Option<&Arc<dyn SingleBlockPatch>> {
        self.single_blocks.get(&idx)
    }

    pub fn is_empty(&self) -> bool {
        self.double_blocks.is_empty() && self.single_blocks.is_empty()
    }
}

impl fmt::Debug for TransformerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut double: Vec<_> = self.double_blocks.keys().collect();
        let mut single: Vec<_> = self.single_blocks.keys().collect();
        double.sort();
        single.sort();
        f.debug_struct("TransformerOptions")
            .field("double_blocks", &double)
            .field("single_blocks", &single)
            .finish()
    }
}

/// ControlNet style residuals.
///
/// `input[i]` is added to the image stream after double block `i`; `output[i]` is added to the
/// image part of the joint sequence after single block `i`. Missing or `None` entries are skipped.
/// Residuals broadcast against the stream, so a batch of one applies to every batch element.
#[derive(Debug, Clone, Default)]
pub struct Control {
    pub input: Vec<Option<Tensor>>,
    pub output: Vec<Option<Tensor>>,
}

impl Control {
    pub fn input(&self, idx: usize) -> Option<&Tensor> {
        self.input.get(idx).and_then(Option::as_ref)
    }

    pub fn output(&self, idx: usize) -> Option<&Tensor> {
        self.output.get(idx).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Identity;

    impl SingleBlockPatch for Identity {
        fn forward(
            &self,
            args: SingleBlockArgs<'_>,
            original: &dyn Fn(SingleBlockArgs<'_>) -> Result<Tensor>,
        ) -> Result<Tensor> {
            original(args)
        }
    }

    #[test]
    fn options_register_patches_by_index() {
        let options = TransformerOptions::new();
        assert!(options.is_empty());
        let options = options.with_single_block_patch(4, Arc::new(Identity));
        assert!(!options.is_empty());
        assert!(options.single_block_patch(4).is_some());
        assert!(options.single_block_patch(3).is_none());
        assert!(options.double_block_patch(4).is_none());
        assert_eq!(
            format!("{options:?}"),
            "TransformerOptions { double_blocks: [], single_blocks: [4] }"
        );
    }
}
