use crate::utils::errors::CarbonError;
use itertools::Itertools;
use log::{debug, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::signal::unix::{self, SignalKind};

/// Outcome of one step of the wait loop
enum Event {
    Exited(std::io::Result<ExitStatus>),
    Signalled(Signal),
}

/// Runs exactly one child with inherited stdio and forwards SIGINT/SIGTERM
/// received by this process to it.
///
/// The signal listeners are registered before the child is spawned and are
/// only polled while the child has not been reaped, so a forwarded signal or a
/// force kill can never reach a recycled PID.
pub struct Supervisor {
    child: Child,
    pid: u32,
    kill_grace: Duration,
    sigint: unix::Signal,
    sigterm: unix::Signal,
}

impl Supervisor {
    /// Starts `cmdline[0]` with the remaining items as arguments.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// Registering the listeners replaces the default SIGINT/SIGTERM
    /// disposition for the rest of the process. Once `wait` has returned, a
    /// further SIGINT or SIGTERM is absorbed: the run still writes its log
    /// rows and exits with the child's status instead of dying half-way
    /// through an append.
    pub fn start(cmdline: &[String], kill_grace: Duration) -> Result<Self, CarbonError> {
        let command_line = cmdline.iter().join(" ");
        let spawn_error = |source| CarbonError::Spawn {
            command: command_line.clone(),
            source,
        };

        let (program, args) = cmdline.split_first().ok_or_else(|| {
            spawn_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "empty command line",
            ))
        })?;

        let sigint = unix::signal(SignalKind::interrupt()).map_err(spawn_error)?;
        let sigterm = unix::signal(SignalKind::terminate()).map_err(spawn_error)?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let pid = child.id().ok_or_else(|| {
            spawn_error(std::io::Error::other("child exited before its PID was read"))
        })?;
        debug!("Started `{}` as PID {}", command_line, pid);

        Ok(Self {
            child,
            pid,
            kill_grace,
            sigint,
            sigterm,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Blocks until the child terminates. A non-zero exit or death by signal
    /// is reported as `CarbonError::ChildExecution`.
    pub async fn wait(mut self) -> Result<ExitStatus, CarbonError> {
        let event = tokio::select! {
            status = self.child.wait() => Event::Exited(status),
            Some(()) = self.sigint.recv() => Event::Signalled(Signal::SIGINT),
            Some(()) = self.sigterm.recv() => Event::Signalled(Signal::SIGTERM),
        };

        let status = match event {
            Event::Exited(status) => status.map_err(CarbonError::Wait)?,
            Event::Signalled(signal) => self.forward_and_reap(signal).await?,
        };

        if status.success() {
            Ok(status)
        } else {
            Err(CarbonError::ChildExecution { status })
        }
    }

    /// Sends `signal` to the child, gives it `kill_grace` to exit, then kills it.
    async fn forward_and_reap(&mut self, signal: Signal) -> Result<ExitStatus, CarbonError> {
        warn!("Forwarding {} to PID {}", signal, self.pid);
        match i32::try_from(self.pid) {
            Ok(raw) => {
                if let Err(errno) = kill(Pid::from_raw(raw), signal) {
                    warn!("Failed to forward {} to PID {}: {}", signal, self.pid, errno);
                }
            }
            Err(_) => warn!("PID {} out of range, not forwarding {}", self.pid, signal),
        }

        match tokio::time::timeout(self.kill_grace, self.child.wait()).await {
            Ok(status) => status.map_err(CarbonError::Wait),
            Err(_) => {
                warn!(
                    "PID {} still running {:?} after {}, killing it",
                    self.pid, self.kill_grace, signal
                );
                self.child.kill().await.map_err(CarbonError::Wait)?;
                self.child.wait().await.map_err(CarbonError::Wait)
            }
        }
    }
}
