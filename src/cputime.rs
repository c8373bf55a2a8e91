use crate::utils::errors::CarbonError;
use nix::sys::resource::{UsageWho, getrusage};
use nix::sys::time::TimeVal;
use std::time::Duration;

/// Accumulated CPU time of all reaped children of this process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTime {
    pub user: Duration,
    pub system: Duration,
}

impl CpuTime {
    /// Reads the OS child accounting. Only children that have exited and been
    /// waited for are included.
    pub fn sample() -> Result<Self, CarbonError> {
        let usage = getrusage(UsageWho::RUSAGE_CHILDREN).map_err(CarbonError::CpuTime)?;
        Ok(Self {
            user: timeval_to_duration(usage.user_time()),
            system: timeval_to_duration(usage.system_time()),
        })
    }

    /// Time accumulated since `baseline`. Accounting never regresses, so the
    /// subtraction saturates rather than going negative.
    pub fn since(&self, baseline: &CpuTime) -> CpuTime {
        CpuTime {
            user: self.user.saturating_sub(baseline.user),
            system: self.system.saturating_sub(baseline.system),
        }
    }

    pub fn user_seconds(&self) -> f64 {
        self.user.as_secs_f64()
    }

    pub fn system_seconds(&self) -> f64 {
        self.system.as_secs_f64()
    }
}

fn timeval_to_duration(tv: TimeVal) -> Duration {
    let secs = u64::try_from(tv.tv_sec()).unwrap_or(0);
    let micros = u64::try_from(tv.tv_usec()).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}
