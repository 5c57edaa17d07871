use std::{fmt::Display, str::FromStr};

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{Error, Result};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq, Deserialize, Serialize)]
/// DType to load the transformer weights as.
///
/// ## `Auto` rules
/// - CUDA device: BF16
/// - Otherwise: F32
pub enum ModelDType {
    #[default]
    #[serde(rename = "auto")]
    Auto,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "f32")]
    F32,
}

impl Display for ModelDType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::BF16 => write!(f, "bf16"),
            Self::F16 => write!(f, "f16"),
            Self::F32 => write!(f, "f32"),
        }
    }
}

impl FromStr for ModelDType {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "bf16" => Ok(Self::BF16),
            "f16" => Ok(Self::F16),
            "f32" => Ok(Self::F32),
            other => Err(format!("Model DType `{other}` is not supported.")),
        }
    }
}

/// Type which can be converted to a DType
pub trait TryIntoDType {
    fn try_into_dtype(&self, device: &Device) -> Result<DType>;
}

impl TryIntoDType for DType {
    fn try_into_dtype(&self, device: &Device) -> Result<DType> {
        if !matches!(self, DType::BF16 | DType::F32 | DType::F64 | DType::F16) {
            return Err(Error::Configuration(format!(
                "DType must be one of BF16, F16, F32, F64, got {self:?}"
            )));
        }
        let dtype = manual_cast(*self, device);
        info!("DType selected is {dtype:?}.");
        Ok(dtype)
    }
}

impl TryIntoDType for ModelDType {
    fn try_into_dtype(&self, device: &Device) -> Result<DType> {
        let dtype = match self {
            Self::Auto => {
                if device.is_cuda() {
                    DType::BF16
                } else {
                    DType::F32
                }
            }
            Self::BF16 => DType::BF16,
            Self::F16 => DType::F16,
            Self::F32 => DType::F32,
        };
        dtype.try_into_dtype(device)
    }
}

/// Half precision weights are upcast to F32 on the CPU.
fn manual_cast(dtype: DType, device: &Device) -> DType {
    if device.is_cpu() && matches!(dtype, DType::BF16 | DType::F16) {
        warn!("FluxDeCLIP: {dtype:?} is not used on the CPU, falling back to F32");
        DType::F32
    } else {
        dtype
    }
}
