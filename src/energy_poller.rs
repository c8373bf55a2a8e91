use crate::collectors::GpuDevices;
use crate::utils::errors::CarbonError;
use crate::utils::psutils::{Lineage, ProcessTree};
use log::{debug, error, warn};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Combined sm/mem/dec/enc utilization below which a process sample is noise
pub const ACTIVE_UTILIZATION_THRESHOLD: u32 = 2;

/// A foreign process found using a monitored device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributionViolation {
    pub pid: u32,
    pub device: u32,
}

/// Consistent view of the poller totals, taken under one read lock.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuUsage {
    pub device_name: String,
    pub used_devices: Vec<u32>,
    /// kWh
    pub total_energy: f64,
}

#[derive(Debug)]
struct PollerState {
    device_count: u32,
    device_name: String,
    used_devices: BTreeSet<u32>,
    /// Per-device timestamp of the newest utilization sample already seen
    last_seen: Vec<u64>,
    /// kWh
    total_energy: f64,
    violation: Option<AttributionViolation>,
}

/// Samples GPU power draw for the lifetime of one supervised run and
/// integrates it into kWh.
///
/// # Type Parameters
/// * `G` - The GPU management layer, e.g. `NvidiaGpu`
pub struct EnergyPoller<G: GpuDevices> {
    state: Arc<RwLock<PollerState>>,
    /// Taken by the first `stop`, which makes later calls no-ops
    gpu: Option<Arc<G>>,
    is_running: Arc<AtomicBool>,
    stop_sender: Option<oneshot::Sender<()>>,
    task_handle: Option<JoinHandle<()>>,
}

impl<G: GpuDevices> EnergyPoller<G> {
    /// Enumerates the devices, checks they are all the same model and starts
    /// ticking every `interval` on behalf of `pid`.
    ///
    /// Must be called from within a tokio runtime. On failure the GPU handle
    /// is released before returning.
    pub fn create(gpu: G, interval: Duration, pid: u32) -> Result<Self, CarbonError> {
        let (device_count, device_name) = match enumerate(&gpu) {
            Ok(found) => found,
            Err(e) => {
                if let Err(shutdown_err) = gpu.shutdown() {
                    warn!("Failed to release GPU handle: {}", shutdown_err);
                }
                return Err(e);
            }
        };
        debug!(
            "Tracking {} x {} for PID {} every {:?}",
            device_count, device_name, pid, interval
        );

        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let state = Arc::new(RwLock::new(PollerState {
            device_count,
            device_name,
            used_devices: BTreeSet::new(),
            last_seen: vec![started_at; device_count as usize],
            total_energy: 0.0,
            violation: None,
        }));

        let gpu = Arc::new(gpu);
        let is_running = Arc::new(AtomicBool::new(true));
        let (stop_sender, stop_receiver) = oneshot::channel();

        let handle = tokio::spawn(Self::run_polling_loop(
            Arc::clone(&gpu),
            Arc::clone(&state),
            Arc::clone(&is_running),
            stop_receiver,
            pid,
            interval,
        ));

        Ok(Self {
            state,
            gpu: Some(gpu),
            is_running,
            stop_sender: Some(stop_sender),
            task_handle: Some(handle),
        })
    }

    /// Background task: one `poll_once` per tick until stopped or until an
    /// attribution violation is found.
    async fn run_polling_loop(
        gpu: Arc<G>,
        state: Arc<RwLock<PollerState>>,
        is_running: Arc<AtomicBool>,
        mut stop_receiver: oneshot::Receiver<()>,
        pid: u32,
        interval: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tree = ProcessTree::new(pid);
        let mut iteration: u64 = 0;

        loop {
            tokio::select! {
                _ = &mut stop_receiver => break,
                _ = ticker.tick() => {
                    iteration += 1;
                    match poll_once(gpu.as_ref(), &state, interval, &mut tree) {
                        Ok(()) => {}
                        Err(e @ CarbonError::AttributionViolation { .. }) => {
                            error!("{}; GPU energy will not be attributed to this run", e);
                            break;
                        }
                        Err(e) => warn!("GPU energy poll failed: {}", e),
                    }
                }
            }
        }

        is_running.store(false, Ordering::Relaxed);
        debug!("GPU energy poller stopped after {} ticks", iteration);
    }

    /// Halts ticking, waits for an in-flight tick, then releases the GPU
    /// handle. Calling it again is a no-op.
    pub async fn stop(&mut self) -> Result<(), CarbonError> {
        let Some(gpu) = self.gpu.take() else {
            return Ok(());
        };

        if let Some(sender) = self.stop_sender.take() {
            // The task may already have ended on its own
            let _ = sender.send(());
        }
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                warn!("GPU energy poller task failed: {}", e);
            }
        }

        match Arc::try_unwrap(gpu) {
            Ok(gpu) => gpu.shutdown(),
            Err(_) => Err(CarbonError::Other(
                "GPU handle still shared after the poller task ended".to_string(),
            )),
        }
    }

    /// Check if the background task is still ticking
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Relaxed)
    }

    pub fn device_name(&self) -> String {
        self.read_state().device_name.clone()
    }

    pub fn used_devices(&self) -> Vec<u32> {
        self.read_state().used_devices.iter().copied().collect()
    }

    /// Energy integrated so far, in kWh
    pub fn total_energy(&self) -> f64 {
        self.read_state().total_energy
    }

    pub fn violation(&self) -> Option<AttributionViolation> {
        self.read_state().violation
    }

    pub fn usage(&self) -> GpuUsage {
        let state = self.read_state();
        GpuUsage {
            device_name: state.device_name.clone(),
            used_devices: state.used_devices.iter().copied().collect(),
            total_energy: state.total_energy,
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, PollerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Device count and the shared model name of all devices.
fn enumerate<G: GpuDevices>(gpu: &G) -> Result<(u32, String), CarbonError> {
    let device_count = gpu.device_count()?;
    if device_count == 0 {
        return Err(CarbonError::GpuUnavailable("no GPU devices found".to_string()));
    }

    let first = gpu.device_name(0)?;
    for index in 1..device_count {
        let name = gpu.device_name(index)?;
        if name != first {
            return Err(CarbonError::DeviceHeterogeneity { first, other: name });
        }
    }
    Ok((device_count, first))
}

/// One tick: attribute devices to the root of `tree` and integrate every
/// device's power draw over `interval`, all under the state's write lock.
///
/// The process table is rescanned first so that short-lived children are
/// known before their samples show up. A PID that exited before any scan saw
/// it cannot be traced and is skipped with a warning.
///
/// Power is integrated whether or not the tick attributed usage; attribution
/// only decides which devices are reported as used.
fn poll_once<G: GpuDevices + ?Sized>(
    gpu: &G,
    state: &RwLock<PollerState>,
    interval: Duration,
    tree: &mut ProcessTree,
) -> Result<(), CarbonError> {
    tree.refresh();
    let mut state = state.write().unwrap_or_else(PoisonError::into_inner);
    let interval_hours = interval.as_secs_f64() / 3600.0;

    for index in 0..state.device_count {
        let slot = index as usize;
        let since = state.last_seen.get(slot).copied().unwrap_or(0);

        if let Some(samples) = gpu.process_utilization(index, since)? {
            for sample in samples {
                if let Some(seen) = state.last_seen.get_mut(slot) {
                    *seen = (*seen).max(sample.timestamp);
                }
                if sample.combined() < ACTIVE_UTILIZATION_THRESHOLD {
                    continue;
                }
                match tree.lineage(sample.pid) {
                    Lineage::Tracked => {
                        state.used_devices.insert(index);
                    }
                    Lineage::Unknown => warn!(
                        "PID {} on GPU {} exited before its parent could be traced, skipping it",
                        sample.pid, index
                    ),
                    Lineage::Foreign => {
                        let violation = AttributionViolation {
                            pid: sample.pid,
                            device: index,
                        };
                        state.violation = Some(violation);
                        return Err(CarbonError::AttributionViolation {
                            pid: violation.pid,
                            device: violation.device,
                        });
                    }
                }
            }
        }

        let power_kw = f64::from(gpu.power_draw_mw(index)?) * 1e-6;
        state.total_energy += power_kw * interval_hours;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::ProcessUtilization;
    use std::process::Command;
    use std::sync::atomic::AtomicUsize;

    const TARGET_PID: u32 = 4242;

    /// A live process outside the tree rooted at this test process
    fn foreign_pid() -> u32 {
        std::os::unix::process::parent_id()
    }

    struct FakeGpu {
        names: Vec<String>,
        power_mw: u32,
        samples: Vec<(u32, ProcessUtilization)>,
        shutdowns: Arc<AtomicUsize>,
    }

    impl FakeGpu {
        fn new(count: usize, power_mw: u32) -> Self {
            Self {
                names: vec!["Fake A100".to_string(); count],
                power_mw,
                samples: Vec::new(),
                shutdowns: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn with_sample(mut self, device: u32, pid: u32, sm_util: u32) -> Self {
            self.samples.push((
                device,
                ProcessUtilization {
                    pid,
                    timestamp: u64::MAX,
                    sm_util,
                    mem_util: 0,
                    dec_util: 0,
                    enc_util: 0,
                },
            ));
            self
        }
    }

    impl GpuDevices for FakeGpu {
        fn device_count(&self) -> Result<u32, CarbonError> {
            Ok(self.names.len() as u32)
        }

        fn device_name(&self, index: u32) -> Result<String, CarbonError> {
            Ok(self.names[index as usize].clone())
        }

        fn process_utilization(
            &self,
            index: u32,
            _since: u64,
        ) -> Result<Option<Vec<ProcessUtilization>>, CarbonError> {
            let samples: Vec<_> = self
                .samples
                .iter()
                .filter(|(device, _)| *device == index)
                .map(|(_, sample)| *sample)
                .collect();
            Ok(if samples.is_empty() { None } else { Some(samples) })
        }

        fn power_draw_mw(&self, _index: u32) -> Result<u32, CarbonError> {
            Ok(self.power_mw)
        }

        fn shutdown(self) -> Result<(), CarbonError> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_state(device_count: u32) -> RwLock<PollerState> {
        RwLock::new(PollerState {
            device_count,
            device_name: "Fake A100".to_string(),
            used_devices: BTreeSet::new(),
            last_seen: vec![0; device_count as usize],
            total_energy: 0.0,
            violation: None,
        })
    }

    #[test]
    fn test_poll_once_integrates_power_of_every_device() {
        // 100 W over 36 s is 0.001 kWh per device
        let gpu = FakeGpu::new(2, 100_000);
        let state = test_state(2);
        let mut tree = ProcessTree::new(TARGET_PID);
        poll_once(&gpu, &state, Duration::from_secs(36), &mut tree).unwrap();
        let total = state.read().unwrap().total_energy;
        assert!((total - 0.002).abs() < 1e-12);
    }

    #[test]
    fn test_poll_once_ignores_low_utilization() {
        let gpu = FakeGpu::new(1, 1_000).with_sample(0, TARGET_PID, 1);
        let state = test_state(1);
        let mut tree = ProcessTree::new(TARGET_PID);
        poll_once(&gpu, &state, Duration::from_secs(1), &mut tree).unwrap();
        assert!(state.read().unwrap().used_devices.is_empty());
    }

    #[test]
    fn test_poll_once_flags_foreign_pid() {
        let foreign = foreign_pid();
        let gpu = FakeGpu::new(1, 1_000).with_sample(0, foreign, 50);
        let state = test_state(1);
        let mut tree = ProcessTree::new(std::process::id());
        let result = poll_once(&gpu, &state, Duration::from_secs(1), &mut tree);
        assert!(matches!(
            result,
            Err(CarbonError::AttributionViolation { pid, device: 0 }) if pid == foreign
        ));
        assert_eq!(
            state.read().unwrap().violation,
            Some(AttributionViolation { pid: foreign, device: 0 })
        );
    }

    #[test]
    fn test_poll_once_skips_child_that_exited_unseen() {
        let mut child = Command::new("true").spawn().unwrap();
        let child_pid = child.id();
        child.wait().unwrap();

        let gpu = FakeGpu::new(1, 1_000).with_sample(0, child_pid, 50);
        let state = test_state(1);
        let mut tree = ProcessTree::new(std::process::id());
        poll_once(&gpu, &state, Duration::from_secs(1), &mut tree).unwrap();

        let state = state.read().unwrap();
        assert!(state.violation.is_none());
        assert!(state.used_devices.is_empty());
        assert!(state.total_energy > 0.0);
    }

    #[test]
    fn test_poll_once_attributes_child_seen_on_an_earlier_tick() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let child_pid = child.id();
        let state = test_state(1);
        let mut tree = ProcessTree::new(std::process::id());
        poll_once(&FakeGpu::new(1, 1_000), &state, Duration::from_secs(1), &mut tree).unwrap();

        child.kill().unwrap();
        child.wait().unwrap();
        let gpu = FakeGpu::new(1, 1_000).with_sample(0, child_pid, 50);
        poll_once(&gpu, &state, Duration::from_secs(1), &mut tree).unwrap();

        let state = state.read().unwrap();
        assert!(state.violation.is_none());
        assert_eq!(state.used_devices.iter().copied().collect::<Vec<_>>(), vec![0]);
    }

    #[tokio::test]
    async fn test_idle_gpu_accumulates_energy_without_used_devices() {
        let gpu = FakeGpu::new(2, 60_000);
        let mut poller = EnergyPoller::create(gpu, Duration::from_millis(10), TARGET_PID).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        poller.stop().await.unwrap();

        assert!(poller.total_energy() > 0.0);
        assert!(poller.used_devices().is_empty());
        assert_eq!(poller.device_name(), "Fake A100");
    }

    #[tokio::test]
    async fn test_target_pid_marks_device_used() {
        let gpu = FakeGpu::new(3, 60_000).with_sample(1, TARGET_PID, 40);
        let mut poller = EnergyPoller::create(gpu, Duration::from_millis(10), TARGET_PID).unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        poller.stop().await.unwrap();

        let usage = poller.usage();
        assert_eq!(usage.used_devices, vec![1]);
        assert!(poller.violation().is_none());
    }

    #[tokio::test]
    async fn test_energy_is_monotonic_while_polling() {
        let gpu = FakeGpu::new(1, 250_000);
        let mut poller = EnergyPoller::create(gpu, Duration::from_millis(5), TARGET_PID).unwrap();
        let mut previous = 0.0;
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_millis(7)).await;
            let current = poller.total_energy();
            assert!(current >= previous);
            previous = current;
        }
        poller.stop().await.unwrap();
        assert!(poller.total_energy() >= previous);
    }

    #[tokio::test]
    async fn test_foreign_pid_stops_ticking() {
        let foreign = foreign_pid();
        let gpu = FakeGpu::new(1, 60_000).with_sample(0, foreign, 30);
        let mut poller =
            EnergyPoller::create(gpu, Duration::from_millis(5), std::process::id()).unwrap();
        // The ancestry check scans the process table, give it room
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(!poller.is_running());
        assert_eq!(
            poller.violation(),
            Some(AttributionViolation { pid: foreign, device: 0 })
        );
        let frozen = poller.total_energy();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(poller.total_energy(), frozen);
        poller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_releases_once() {
        let gpu = FakeGpu::new(1, 10_000);
        let shutdowns = Arc::clone(&gpu.shutdowns);
        let mut poller = EnergyPoller::create(gpu, Duration::from_millis(10), TARGET_PID).unwrap();
        poller.stop().await.unwrap();
        let energy = poller.total_energy();
        poller.stop().await.unwrap();

        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(poller.total_energy(), energy);
        assert!(!poller.is_running());
    }

    #[tokio::test]
    async fn test_mixed_models_are_rejected() {
        let mut gpu = FakeGpu::new(2, 10_000);
        gpu.names[1] = "Fake V100".to_string();
        let shutdowns = Arc::clone(&gpu.shutdowns);

        let result = EnergyPoller::create(gpu, Duration::from_millis(10), TARGET_PID);
        match result {
            Err(e @ CarbonError::DeviceHeterogeneity { .. }) => {
                assert!(e.to_string().contains("devices do not have the same names"));
            }
            Err(e) => panic!("Expected DeviceHeterogeneity, got {:?}", e),
            Ok(_) => panic!("Expected DeviceHeterogeneity"),
        }
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_devices_is_unavailable() {
        let gpu = FakeGpu::new(0, 0);
        let result = EnergyPoller::create(gpu, Duration::from_millis(10), TARGET_PID);
        assert!(matches!(result, Err(CarbonError::GpuUnavailable(_))));
    }
}
