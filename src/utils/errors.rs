use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

use crate::tdp::repair::RepairError;

#[derive(Error, Debug)]
pub enum CarbonError {
    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Command exited unsuccessfully: {status}")]
    ChildExecution { status: ExitStatus },
    #[error("Failed to wait for the child process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("GPU tracking unavailable: {0}")]
    GpuUnavailable(String),
    #[error("devices do not have the same names ({first} vs {other})")]
    DeviceHeterogeneity { first: String, other: String },
    #[error("GPU query failed: {0}")]
    Gpu(String),
    #[error("PID {pid} is using GPU {device} alongside the tracked process")]
    AttributionViolation { pid: u32, device: u32 },
    #[error("Unknown CPU vendor for `{0}`")]
    UnknownVendor(String),
    #[error("Failed to resolve the spec page for `{cpu}`: {reason}")]
    VendorResolution { cpu: String, reason: String },
    #[error("Failed to fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("TDP not found on {url}")]
    TdpNotFound { url: String },
    #[error("Failed to decode embedded specs on {url}: {source}")]
    EmbeddedSpecs {
        url: String,
        #[source]
        source: RepairError,
    },
    #[error("Invalid TDP cache {}: {reason}", path.display())]
    Cache { path: PathBuf, reason: String },
    #[error("Malformed row {line} in {}: expected at least 5 fields, found {fields}", path.display())]
    MalformedLogRow {
        path: PathBuf,
        line: u64,
        fields: usize,
    },
    #[error("Invalid value `{value}` for {field} in {}: {reason}", path.display())]
    InvalidLogField {
        path: PathBuf,
        field: &'static str,
        value: String,
        reason: String,
    },
    #[error("Unknown region `{0}`")]
    UnknownRegion(String),
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("CSV error in {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("Failed to read CPU time: {0}")]
    CpuTime(#[source] nix::Error),
    #[error("Other error: {0}")]
    Other(String),
}

impl CarbonError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CarbonError::Io {
            path: path.into(),
            source,
        }
    }
}
