use crate::collectors::{GpuDevices, NvidiaGpu};
use crate::config::Config;
use crate::cputime::CpuTime;
use crate::energy_poller::{EnergyPoller, GpuUsage};
use crate::log_store::{GpuLogRecord, LogRecord, LogStore};
use crate::supervisor::Supervisor;
use crate::utils::errors::CarbonError;
use crate::utils::psutils::{cpu_brand_string, resolve_tag};
use log::{debug, error, info, warn};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// What a supervised run left behind.
#[derive(Debug)]
pub struct RunOutcome {
    pub status: ExitStatus,
    pub tag: String,
    /// `None` when the CPU row could not be written
    pub cpu_record: Option<LogRecord>,
    /// `None` when GPU tracking was off, measured nothing or was voided
    pub gpu_record: Option<GpuLogRecord>,
}

impl RunOutcome {
    /// Exit code to hand back to the shell: the child's own code, or
    /// 128 + signal number when it was killed.
    pub fn exit_code(&self) -> i32 {
        self.status
            .code()
            .unwrap_or_else(|| 128 + self.status.signal().unwrap_or(0))
    }
}

/// Runs `cmdline` under supervision with NVIDIA GPU tracking when available.
pub async fn run(
    config: &Config,
    cmdline: &[String],
    tag: Option<&str>,
) -> Result<RunOutcome, CarbonError> {
    run_with_gpu(config, cmdline, tag, NvidiaGpu::init).await
}

/// Runs `cmdline` under supervision, tracking GPU energy through whatever
/// `gpu_init` returns.
///
/// A spawn failure is returned and nothing is logged. Once the child has
/// started, its exit (successful or not) always produces a CPU row, and a
/// GPU row when the poller measured energy. Failures while tracking or
/// writing logs are reported through `log` and never change the outcome.
pub async fn run_with_gpu<G, F>(
    config: &Config,
    cmdline: &[String],
    tag: Option<&str>,
    gpu_init: F,
) -> Result<RunOutcome, CarbonError>
where
    G: GpuDevices,
    F: FnOnce() -> Result<G, CarbonError>,
{
    let tag = resolve_tag(tag, cmdline);
    let baseline = CpuTime::sample().unwrap_or_else(|e| {
        warn!("{}; CPU time will include earlier children", e);
        CpuTime::default()
    });

    let supervisor = Supervisor::start(cmdline, config.kill_grace)?;
    let pid = supervisor.pid();

    let mut poller = match gpu_init()
        .and_then(|gpu| EnergyPoller::create(gpu, config.poll_interval, pid))
    {
        Ok(poller) => Some(poller),
        Err(e) => {
            debug!("GPU tracking disabled: {}", e);
            None
        }
    };

    let waited = supervisor.wait().await;

    // Stop ticking before anything is read, so the totals are final
    let usage = match poller.as_mut() {
        Some(poller) => finish_poller(poller).await,
        None => None,
    };

    let status = match waited {
        Ok(status) => status,
        Err(CarbonError::ChildExecution { status }) => status,
        Err(e) => return Err(e),
    };
    info!("`{}` exited with {}", tag, status);

    let store = LogStore::from_config(config);
    let cpu_record = record_cpu_time(config, &store, &tag, &baseline);
    let gpu_record = usage.and_then(|usage| record_gpu_usage(&store, &tag, usage));

    Ok(RunOutcome {
        status,
        tag,
        cpu_record,
        gpu_record,
    })
}

/// Stops the poller and returns its totals, unless an attribution violation
/// voided them.
async fn finish_poller<G: GpuDevices>(
    poller: &mut EnergyPoller<G>,
) -> Option<GpuUsage> {
    if let Err(e) = poller.stop().await {
        warn!("Failed to stop GPU energy poller: {}", e);
    }
    if let Some(violation) = poller.violation() {
        error!(
            "PID {} used GPU {} during the run; not logging GPU energy",
            violation.pid, violation.device
        );
        return None;
    }
    Some(poller.usage())
}

fn record_cpu_time(
    config: &Config,
    store: &LogStore,
    tag: &str,
    baseline: &CpuTime,
) -> Option<LogRecord> {
    let written = CpuTime::sample().and_then(|after| {
        config.ensure_state_dir()?;
        let record = LogRecord::new(cpu_brand_string(), tag, &after.since(baseline));
        store.append_cpu(&record)?;
        Ok(record)
    });
    match written {
        Ok(record) => Some(record),
        Err(e) => {
            error!("Failed to write CPU log: {}", e);
            None
        }
    }
}

fn record_gpu_usage(
    store: &LogStore,
    tag: &str,
    usage: GpuUsage,
) -> Option<GpuLogRecord> {
    if usage.total_energy <= 0.0 {
        debug!("No GPU energy measured for `{}`", tag);
        return None;
    }
    let record = GpuLogRecord::new(tag, usage);
    match store.append_gpu(&record) {
        Ok(()) => Some(record),
        Err(e) => {
            error!("Failed to write GPU log: {}", e);
            None
        }
    }
}
