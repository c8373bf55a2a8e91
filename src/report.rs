use crate::log_store::{LogRecord, now_timestamp, read_cpu_log};
use crate::regions::{CarbonIntensity, RegionTable, resolve_region};
use crate::tdp::{TdpInfo, TdpLookup};
use crate::utils::errors::CarbonError;
use itertools::Itertools;
use log::debug;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

pub const SOFTWARE: &str = "carbonrun";

/// Totals of one tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Consumption {
    /// h
    #[serde(rename = "CPUTime")]
    pub cpu_time: f64,
    /// kWh
    #[serde(rename = "Energy")]
    pub energy: f64,
    /// kg, only when a region was given
    #[serde(rename = "CO2e", skip_serializing_if = "Option::is_none")]
    pub co2e: Option<f64>,
}

impl Consumption {
    pub fn merge(&mut self, other: &Consumption) {
        self.cpu_time += other.cpu_time;
        self.energy += other.energy;
        self.co2e = match (self.co2e, other.co2e) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConsumptionReport {
    pub timestamp: String,
    pub software: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carbon_intensity_year: Option<i32>,
    pub units: BTreeMap<String, String>,
    pub tags: BTreeMap<String, Consumption>,
}

impl ConsumptionReport {
    /// Empty report stamped with the current time.
    pub fn new(region: Option<(&str, CarbonIntensity)>) -> Self {
        let units = [("CPUTime", "h"), ("Energy", "kWh"), ("CO2e", "kg")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            timestamp: now_timestamp(),
            software: SOFTWARE.to_string(),
            region: region.map(|(code, _)| code.to_string()),
            carbon_intensity_year: region.map(|(_, intensity)| intensity.year),
            units,
            tags: BTreeMap::new(),
        }
    }

    /// Folds `tags` into this report, tag by tag.
    pub fn merge_tags(&mut self, tags: &BTreeMap<String, Consumption>) {
        for (tag, consumption) in tags {
            self.tags.entry(tag.clone()).or_default().merge(consumption);
        }
    }

    pub fn merge(&mut self, other: &ConsumptionReport) {
        self.merge_tags(&other.tags);
    }

    pub fn to_json(&self) -> Result<String, CarbonError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| CarbonError::Other(format!("serialize report: {}", e)))
    }
}

/// Per-tag totals of `records`.
///
/// CPU time is summed per (tag, CPU) first and energy is derived from the
/// sums: `hours * watts_per_core / 1000 * node_factor`, then
/// `energy * intensity / 1000` kg when an intensity is given. Every CPU string
/// in `records` must be present in `tdp`.
pub fn aggregate(
    records: &[LogRecord],
    tdp: &HashMap<String, TdpInfo>,
    intensity: Option<CarbonIntensity>,
    node_factor: f64,
) -> Result<BTreeMap<String, Consumption>, CarbonError> {
    let mut hours: BTreeMap<(&str, &str), f64> = BTreeMap::new();
    for record in records {
        *hours
            .entry((record.tag.as_str(), record.cpu.as_str()))
            .or_default() += record.cpu_hours();
    }

    let mut tags: BTreeMap<String, Consumption> = BTreeMap::new();
    for ((tag, cpu), cpu_time) in hours {
        let info = tdp
            .get(cpu)
            .ok_or_else(|| CarbonError::Other(format!("no TDP resolved for `{}`", cpu)))?;
        let energy = cpu_time * (info.watts_per_core * 1e-3) * node_factor;
        let part = Consumption {
            cpu_time,
            energy,
            co2e: intensity.map(|ci| energy * (ci.value * 1e-3)),
        };
        tags.entry(tag.to_string()).or_default().merge(&part);
    }
    Ok(tags)
}

/// Builds a report over every row of the CPU log at `log_path`.
///
/// Each distinct CPU string is resolved once through `tdp`; any resolution
/// failure or malformed row fails the whole report.
pub async fn make_report(
    log_path: &Path,
    region: &str,
    node_factor: f64,
    tdp: &dyn TdpLookup,
    regions: &dyn RegionTable,
) -> Result<ConsumptionReport, CarbonError> {
    let intensity = resolve_region(regions, region)?;
    let records = read_cpu_log(log_path)?;
    debug!("Read {} rows from {}", records.len(), log_path.display());

    let mut resolved = HashMap::new();
    for cpu in records.iter().map(|r| r.cpu.as_str()).unique() {
        let info = tdp.lookup(cpu).await?;
        resolved.insert(cpu.to_string(), info);
    }

    let mut report = ConsumptionReport::new(intensity.map(|ci| (region, ci)));
    report.merge_tags(&aggregate(&records, &resolved, intensity, node_factor)?);
    Ok(report)
}
