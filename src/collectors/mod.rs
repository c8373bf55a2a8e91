pub mod nvidia_gpu;

pub use nvidia_gpu::NvidiaGpu;

use crate::utils::errors::CarbonError;

/// One process sample from a device's utilization accounting (percentages).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessUtilization {
    pub pid: u32,
    /// CPU timestamp of the sample, in microseconds since the epoch
    pub timestamp: u64,
    pub sm_util: u32,
    pub mem_util: u32,
    pub dec_util: u32,
    pub enc_util: u32,
}

impl ProcessUtilization {
    /// Combined load across the compute, memory, decode and encode engines
    pub fn combined(&self) -> u32 {
        self.sm_util + self.mem_util + self.dec_util + self.enc_util
    }
}

/// GPU management layer the energy poller samples from.
pub trait GpuDevices: Send + Sync + 'static {
    fn device_count(&self) -> Result<u32, CarbonError>;

    fn device_name(&self, index: u32) -> Result<String, CarbonError>;

    /// Per-process samples newer than `since` (microseconds). `None` when the
    /// device has no samples to report.
    fn process_utilization(
        &self,
        index: u32,
        since: u64,
    ) -> Result<Option<Vec<ProcessUtilization>>, CarbonError>;

    /// Instantaneous board power draw in milliwatts
    fn power_draw_mw(&self, index: u32) -> Result<u32, CarbonError>;

    /// Releases the underlying management handle.
    fn shutdown(self) -> Result<(), CarbonError>
    where
        Self: Sized;
}
