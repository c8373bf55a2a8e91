use crate::collectors::{GpuDevices, ProcessUtilization};
use crate::utils::errors::CarbonError;
use log::debug;
use nvml_wrapper::Nvml;
use nvml_wrapper::error::NvmlError;

/// NVIDIA devices accessed through NVML. Owns the NVML session for its
/// lifetime; `shutdown` ends it.
pub struct NvidiaGpu {
    nvml: Nvml,
}

impl NvidiaGpu {
    /// Loads the NVML library and initializes a session. Fails with
    /// `GpuUnavailable` on machines without an NVIDIA driver.
    pub fn init() -> Result<Self, CarbonError> {
        let nvml = Nvml::init()
            .map_err(|e| CarbonError::GpuUnavailable(format!("Unable to initialize NVML: {}", e)))?;
        debug!("NVML initialized");
        Ok(Self { nvml })
    }

    fn device(&self, index: u32) -> Result<nvml_wrapper::Device<'_>, CarbonError> {
        self.nvml
            .device_by_index(index)
            .map_err(|e| CarbonError::Gpu(format!("get device at index {}: {}", index, e)))
    }
}

impl GpuDevices for NvidiaGpu {
    fn device_count(&self) -> Result<u32, CarbonError> {
        self.nvml
            .device_count()
            .map_err(|e| CarbonError::Gpu(format!("get device count: {}", e)))
    }

    fn device_name(&self, index: u32) -> Result<String, CarbonError> {
        self.device(index)?
            .name()
            .map_err(|e| CarbonError::Gpu(format!("get name of device {}: {}", index, e)))
    }

    fn process_utilization(
        &self,
        index: u32,
        since: u64,
    ) -> Result<Option<Vec<ProcessUtilization>>, CarbonError> {
        match self.device(index)?.process_utilization_stats(since) {
            Ok(samples) => Ok(Some(
                samples
                    .into_iter()
                    .map(|sample| ProcessUtilization {
                        pid: sample.pid,
                        timestamp: sample.timestamp,
                        sm_util: sample.sm_util,
                        mem_util: sample.mem_util,
                        dec_util: sample.dec_util,
                        enc_util: sample.enc_util,
                    })
                    .collect(),
            )),
            Err(NvmlError::NotFound) => Ok(None),
            Err(e) => Err(CarbonError::Gpu(format!(
                "get process utilization at index {}: {}",
                index, e
            ))),
        }
    }

    fn power_draw_mw(&self, index: u32) -> Result<u32, CarbonError> {
        self.device(index)?
            .power_usage()
            .map_err(|e| CarbonError::Gpu(format!("get power usage of device {}: {}", index, e)))
    }

    fn shutdown(self) -> Result<(), CarbonError> {
        self.nvml
            .shutdown()
            .map_err(|e| CarbonError::Gpu(format!("shutdown NVML: {}", e)))
    }
}
