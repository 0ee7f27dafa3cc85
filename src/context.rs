//! Execution context
//!
//! Device and dtype selection is an explicit value handed to every
//! constructor, so two models on different devices can coexist in one
//! process and tests always run on the CPU.

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};

/// Where tensors live and which float type parameters use
#[derive(Debug, Clone)]
pub struct ExecContext {
    device: Device,
    dtype: DType,
}

impl ExecContext {
    pub fn new(device: Device, dtype: DType) -> Self {
        Self { device, dtype }
    }

    /// CPU with f32 parameters
    pub fn cpu() -> Self {
        Self::new(Device::Cpu, DType::F32)
    }

    /// First accelerator compiled in and present, otherwise the CPU
    pub fn best_available() -> Self {
        #[cfg(feature = "cuda")]
        {
            if let Ok(device) = Device::new_cuda(0) {
                log::info!("Using CUDA device 0");
                return Self::new(device, DType::F32);
            }
        }
        #[cfg(feature = "metal")]
        {
            if let Ok(device) = Device::new_metal(0) {
                log::info!("Using Metal device 0");
                return Self::new(device, DType::F32);
            }
        }
        log::info!("Using CPU device");
        Self::cpu()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Variable builder whose parameters are registered in `varmap`
    pub fn var_builder<'a>(&self, varmap: &'a VarMap) -> VarBuilder<'a> {
        VarBuilder::from_varmap(varmap, self.dtype, &self.device)
    }
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::cpu()
    }
}
