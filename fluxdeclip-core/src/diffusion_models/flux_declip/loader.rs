//! Checkpoint loading: the only construction path used by hosts.

use std::{collections::HashMap, path::Path};

use candle_core::{safetensors::MmapedSafetensors, DType, Device, Tensor};
use candle_nn::VarBuilder;
use regex::Regex;
use tracing::{debug, info, warn};

use super::config::FluxParams;
use super::model::FluxDeclip;
use crate::{utils::dtype::TryIntoDType, Error, ModelDType, Result};

/// Key prefixes under which full pipeline checkpoints nest the transformer.
const NESTED_PREFIXES: &[&str] = &["model.diffusion_model.", "model."];

/// Target placement of the loaded weights. Fixed for the lifetime of the model.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub dtype: ModelDType,
    pub device: Device,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            dtype: ModelDType::Auto,
            device: Device::Cpu,
        }
    }
}

/// Load a FluxDeCLIP transformer from a safetensors checkpoint.
///
/// `adapter_path` optionally points at a separate file holding the `distilled_guidance_layer.*`
/// weights. Every key must belong to the module structure described by `params`.
pub fn load_fluxdeclip(
    model_path: impl AsRef<Path>,
    adapter_path: Option<&Path>,
    params: &FluxParams,
    cfg: &LoadConfig,
) -> Result<FluxDeclip> {
    params.validate()?;
    let model_path = model_path.as_ref();
    let dtype = cfg.dtype.try_into_dtype(&cfg.device)?;
    info!(
        "Loading FluxDeCLIP from `{}` with dtype {dtype:?} on {:?}",
        model_path.display(),
        cfg.device.location()
    );

    let mut tensors = load_state(model_path, dtype, &cfg.device)?;
    if let Some(adapter_path) = adapter_path {
        info!("Loading distilled guidance layer from `{}`", adapter_path.display());
        for (name, tensor) in load_state(adapter_path, dtype, &cfg.device)? {
            if tensors.insert(name.clone(), tensor).is_some() {
                warn!("Adapter key `{name}` overrides the checkpoint");
            }
        }
    }

    let checker = KeyChecker::new(params)?;
    if let Some(name) = tensors.keys().find(|name| !checker.is_expected(name)) {
        return Err(Error::state_load(
            model_path,
            candle_core::Error::Msg(format!("unexpected key `{name}`")),
        ));
    }
    debug!("{} tensors passed the key check", tensors.len());

    let vb = VarBuilder::from_tensors(tensors, dtype, &cfg.device);
    FluxDeclip::new(params, vb).map_err(|err| match err {
        Error::Candle(source) => Error::state_load(model_path, source),
        err => err,
    })
}

/// Read every tensor of one file, stripping a nested checkpoint prefix if present.
fn load_state(path: &Path, dtype: DType, device: &Device) -> Result<HashMap<String, Tensor>> {
    let st = unsafe { MmapedSafetensors::new(path) }
        .map_err(|err| Error::state_load(path, err))?;
    let names: Vec<String> = st.tensors().into_iter().map(|(name, _)| name).collect();
    let prefix = detect_prefix(&names);
    if let Some(prefix) = prefix {
        info!("Stripping `{prefix}` from checkpoint keys");
    }

    let mut accum = HashMap::with_capacity(names.len());
    let mut skipped = 0usize;
    for name in names {
        let new_name = match prefix {
            Some(prefix) => match name.strip_prefix(prefix) {
                Some(stripped) => stripped.to_string(),
                None => {
                    skipped += 1;
                    continue;
                }
            },
            None => name.clone(),
        };
        let tensor = st
            .load(&name, device)
            .and_then(|t| t.to_dtype(dtype))
            .map_err(|err| Error::state_load(path, err))?;
        accum.insert(new_name, tensor);
    }
    if skipped > 0 {
        debug!("Skipped {skipped} tensors outside the transformer in `{}`", path.display());
    }
    Ok(accum)
}

fn detect_prefix(names: &[String]) -> Option<&'static str> {
    NESTED_PREFIXES
        .iter()
        .copied()
        .find(|prefix| names.iter().any(|name| name.starts_with(prefix)))
}

/// Matches checkpoint keys against the module structure of a given configuration.
struct KeyChecker {
    fixed: Vec<Regex>,
    /// Patterns whose first capture is a module index, with the number of such modules.
    indexed: Vec<(Regex, usize)>,
}

impl KeyChecker {
    fn new(params: &FluxParams) -> Result<Self> {
        let regex = |re: &str| Regex::new(re).map_err(|e| Error::Configuration(e.to_string()));
        let qkv = if params.qkv_bias {
            r"qkv\.(weight|bias)"
        } else {
            r"qkv\.weight"
        };
        Ok(Self {
            fixed: vec![
                regex(r"^(img_in|txt_in)\.(weight|bias)$")?,
                regex(r"^final_layer\.linear\.(weight|bias)$")?,
                regex(r"^distilled_guidance_layer\.(in_proj|out_proj)\.(weight|bias)$")?,
            ],
            indexed: vec![
                (
                    regex(&format!(
                        r"^double_blocks\.(\d+)\.(img|txt)_(attn\.{qkv}|attn\.proj\.(weight|bias)|attn\.norm\.(query|key)_norm\.scale|mlp\.(0|2)\.(weight|bias))$"
                    ))?,
                    params.depth,
                ),
                (
                    regex(
                        r"^single_blocks\.(\d+)\.(linear1\.(weight|bias)|linear2\.(weight|bias)|norm\.(query|key)_norm\.scale)$",
                    )?,
                    params.depth_single_blocks,
                ),
                (
                    regex(
                        r"^distilled_guidance_layer\.layers\.(\d+)\.(in_layer|out_layer)\.(weight|bias)$",
                    )?,
                    params.approximator_layers,
                ),
                (
                    regex(r"^distilled_guidance_layer\.norms\.(\d+)\.scale$")?,
                    params.approximator_layers,
                ),
            ],
        })
    }

    fn is_expected(&self, name: &str) -> bool {
        for (re, count) in &self.indexed {
            if let Some(caps) = re.captures(name) {
                return caps
                    .get(1)
                    .and_then(|idx| idx.as_str().parse::<usize>().ok())
                    .is_some_and(|idx| idx < *count);
            }
        }
        self.fixed.iter().any(|re| re.is_match(name))
    }
}
