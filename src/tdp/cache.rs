use crate::tdp::TdpInfo;
use crate::utils::errors::CarbonError;
use crate::utils::filelock::{open_locked, quoted};
use csv::{ReaderBuilder, Trim};
use log::{debug, info};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// Persistent `cpu -> watts per core` memo, one `"cpu",watts,url` row per
/// CPU string. Rows are never rewritten; the first row for a key wins.
#[derive(Debug, Clone)]
pub struct TdpCache {
    path: PathBuf,
}

impl TdpCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every entry. A missing cache file is an empty cache.
    pub fn load(&self) -> Result<HashMap<String, TdpInfo>, CarbonError> {
        match std::fs::File::open(&self.path) {
            Ok(file) => parse_entries(&self.path, file),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(CarbonError::io(&self.path, e)),
        }
    }

    pub fn lookup(&self, cpu: &str) -> Result<Option<TdpInfo>, CarbonError> {
        let found = self.load()?.remove(cpu);
        if found.is_some() {
            debug!("TDP cache hit for `{}`", cpu);
        }
        Ok(found)
    }

    /// Stores `info` unless an entry for its CPU already exists, and returns
    /// the stored entry. The check and the append happen under one exclusive
    /// lock so concurrent resolvers never write the same key twice.
    pub fn insert(&self, info: &TdpInfo) -> Result<TdpInfo, CarbonError> {
        let mut locked = open_locked(&self.path)?;
        let mut existing = parse_entries(&self.path, &*locked)?;
        if let Some(entry) = existing.remove(&info.cpu) {
            debug!("`{}` was cached concurrently, keeping the first entry", info.cpu);
            return Ok(entry);
        }

        let stored = TdpInfo {
            cpu: info.cpu.clone(),
            watts_per_core: round_to_cache_precision(info.watts_per_core),
            source: info.source.clone(),
        };
        let source = if stored.source.contains([',', '"']) {
            quoted(&stored.source)
        } else {
            stored.source.clone()
        };
        let row = format!(
            "{},{:.4},{}\n",
            quoted(&stored.cpu),
            stored.watts_per_core,
            source
        );
        locked
            .write_all(row.as_bytes())
            .map_err(|e| CarbonError::io(&self.path, e))?;
        locked.flush().map_err(|e| CarbonError::io(&self.path, e))?;
        info!(
            "Cached {:.4} W/core for `{}` from {}",
            stored.watts_per_core, stored.cpu, stored.source
        );
        Ok(stored)
    }
}

/// Values are persisted with four decimals; returning the rounded value keeps
/// a fresh resolution identical to later cache hits.
fn round_to_cache_precision(watts: f64) -> f64 {
    (watts * 1e4).round() / 1e4
}

fn parse_entries<R: Read>(path: &Path, reader: R) -> Result<HashMap<String, TdpInfo>, CarbonError> {
    let mut csv_reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut entries = HashMap::new();
    for record in csv_reader.records() {
        let record = record.map_err(|source| CarbonError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        if record.len() != 3 {
            return Err(CarbonError::Cache {
                path: path.to_path_buf(),
                reason: format!("expected 3 fields, found {}", record.len()),
            });
        }
        let watts_per_core = record[1].parse::<f64>().map_err(|e| CarbonError::Cache {
            path: path.to_path_buf(),
            reason: format!("invalid watts `{}`: {}", &record[1], e),
        })?;
        entries.entry(record[0].to_string()).or_insert_with(|| TdpInfo {
            cpu: record[0].to_string(),
            watts_per_core,
            source: record[2].to_string(),
        });
    }
    Ok(entries)
}
