use crate::config::Config;
use crate::cputime::CpuTime;
use crate::energy_poller::GpuUsage;
use crate::utils::errors::CarbonError;
use crate::utils::filelock::{append_line, quoted};
use chrono::Local;
use csv::{ReaderBuilder, Trim};
use itertools::Itertools;
use std::fs::File;
use std::path::{Path, PathBuf};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Fields a CPU log row must have
pub const CPU_LOG_FIELDS: usize = 5;

/// Second-precision local wall-clock time.
pub fn now_timestamp() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// One supervised run in the CPU log.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: String,
    pub cpu: String,
    pub tag: String,
    pub user_seconds: f64,
    pub system_seconds: f64,
}

impl LogRecord {
    pub fn new(cpu: impl Into<String>, tag: impl Into<String>, cpu_time: &CpuTime) -> Self {
        Self {
            timestamp: now_timestamp(),
            cpu: cpu.into(),
            tag: tag.into(),
            user_seconds: cpu_time.user_seconds(),
            system_seconds: cpu_time.system_seconds(),
        }
    }

    /// `timestamp,"cpu",tag,user,system`
    pub fn to_row(&self) -> String {
        format!(
            "{},{},{},{:.2},{:.2}",
            self.timestamp,
            quoted(&self.cpu),
            plain_field(&self.tag),
            self.user_seconds,
            self.system_seconds
        )
    }

    /// User plus system time, in hours
    pub fn cpu_hours(&self) -> f64 {
        (self.user_seconds + self.system_seconds) / 3600.0
    }
}

/// GPU energy of one supervised run.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuLogRecord {
    pub timestamp: String,
    pub tag: String,
    pub device_name: String,
    pub used_devices: Vec<u32>,
    /// kWh
    pub total_energy: f64,
}

impl GpuLogRecord {
    pub fn new(tag: impl Into<String>, usage: GpuUsage) -> Self {
        Self {
            timestamp: now_timestamp(),
            tag: tag.into(),
            device_name: usage.device_name,
            used_devices: usage.used_devices,
            total_energy: usage.total_energy,
        }
    }

    /// `timestamp,tag,"device","0,1",energy`
    pub fn to_row(&self) -> String {
        format!(
            "{},{},{},{},{}",
            self.timestamp,
            plain_field(&self.tag),
            quoted(&self.device_name),
            quoted(&self.used_devices.iter().join(",")),
            scientific(self.total_energy)
        )
    }
}

/// Leaves a field bare unless it would break the row.
fn plain_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        quoted(field)
    } else {
        field.to_string()
    }
}

/// `%e` formatting: six-digit mantissa, signed exponent of at least two
/// digits (`1.234560e-04`).
pub fn scientific(value: f64) -> String {
    let formatted = format!("{:.6e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => match exponent.parse::<i32>() {
            Ok(exp) => {
                let sign = if exp < 0 { '-' } else { '+' };
                format!("{}e{}{:02}", mantissa, sign, exp.abs())
            }
            Err(_) => formatted,
        },
        // inf and NaN have no exponent
        None => formatted,
    }
}

/// Append-only CPU and GPU logs. Each append holds an exclusive file lock
/// for that single row.
#[derive(Debug, Clone)]
pub struct LogStore {
    cpu_log: PathBuf,
    gpu_log: PathBuf,
}

impl LogStore {
    pub fn new(cpu_log: impl Into<PathBuf>, gpu_log: impl Into<PathBuf>) -> Self {
        Self {
            cpu_log: cpu_log.into(),
            gpu_log: gpu_log.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cpu_log_path(), config.gpu_log_path())
    }

    pub fn cpu_log(&self) -> &Path {
        &self.cpu_log
    }

    pub fn gpu_log(&self) -> &Path {
        &self.gpu_log
    }

    pub fn append_cpu(&self, record: &LogRecord) -> Result<(), CarbonError> {
        append_line(&self.cpu_log, &record.to_row())
    }

    pub fn append_gpu(&self, record: &GpuLogRecord) -> Result<(), CarbonError> {
        append_line(&self.gpu_log, &record.to_row())
    }
}

/// Reads every row of a CPU log. Any row with fewer than five fields, or
/// with unparsable times, fails the whole read.
pub fn read_cpu_log(path: &Path) -> Result<Vec<LogRecord>, CarbonError> {
    let file = File::open(path).map_err(|e| CarbonError::io(path, e))?;
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(file);

    let mut records = Vec::new();
    for (index, row) in reader.records().enumerate() {
        let row = row.map_err(|source| CarbonError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let line = row
            .position()
            .map(|p| p.line())
            .unwrap_or(index as u64 + 1);
        if row.len() < CPU_LOG_FIELDS {
            return Err(CarbonError::MalformedLogRow {
                path: path.to_path_buf(),
                line,
                fields: row.len(),
            });
        }

        let seconds = |field: &'static str, value: &str| {
            value
                .parse::<f64>()
                .map_err(|e| CarbonError::InvalidLogField {
                    path: path.to_path_buf(),
                    field,
                    value: value.to_string(),
                    reason: format!("line {}: {}", line, e),
                })
        };
        records.push(LogRecord {
            timestamp: row[0].to_string(),
            cpu: row[1].to_string(),
            tag: row[2].to_string(),
            user_seconds: seconds("user seconds", &row[3])?,
            system_seconds: seconds("system seconds", &row[4])?,
        });
    }
    Ok(records)
}
