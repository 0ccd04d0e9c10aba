//! Exact JSON export of engine state.
//!
//! Decimals serialize as strings and every map is ordered, so two engines
//! fed the same events in the same per-customer order export identical
//! bytes.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::error::Result;
use crate::ledger::{DailyBucket, FeatureSnapshot, LedgerState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineExport {
    /// Size of the seen set at export time.
    pub seen_events: usize,
    pub customers: BTreeMap<String, CustomerExport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerExport {
    pub snapshot: FeatureSnapshot,
    pub version: u64,
    /// Retained buckets keyed by `YYYY-MM-DD`.
    pub buckets: BTreeMap<String, DailyBucket>,
}

impl EngineExport {
    pub fn from_states(seen_events: usize, states: BTreeMap<String, LedgerState>) -> Self {
        let customers = states
            .into_iter()
            .map(|(customer_id, state)| {
                let buckets = state
                    .buckets
                    .into_iter()
                    .map(|(day, bucket)| (format_date(day), bucket))
                    .collect();
                let export = CustomerExport {
                    snapshot: state.snapshot,
                    version: state.version,
                    buckets,
                };
                (customer_id, export)
            })
            .collect();
        Self {
            seen_events,
            customers,
        }
    }

    pub fn snapshots(&self) -> BTreeMap<String, FeatureSnapshot> {
        self.customers
            .iter()
            .map(|(id, customer)| (id.clone(), customer.snapshot.clone()))
            .collect()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Write `export` to `path` atomically (temp file, fsync, rename).
pub fn write_json(path: &Path, export: &EngineExport) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(export)?;
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)?;
    file.write_all(&data)?;
    file.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

pub fn read_json(path: &Path) -> Result<EngineExport> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

fn format_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        date.month() as u8,
        date.day()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use time::macros::date;

    #[test]
    fn buckets_keyed_by_iso_date() {
        let mut buckets = BTreeMap::new();
        buckets.insert(
            date!(2026-02-03),
            DailyBucket {
                amount_sum: Decimal::from(7),
                count: 2,
            },
        );
        let state = LedgerState {
            snapshot: FeatureSnapshot::zero("C1"),
            buckets,
            version: 2,
        };
        let export = EngineExport::from_states(2, BTreeMap::from([("C1".to_string(), state)]));
        let customer = &export.customers["C1"];
        assert_eq!(customer.buckets["2026-02-03"].count, 2);
        assert_eq!(customer.version, 2);
    }

    #[test]
    fn format_date_pads() {
        assert_eq!(format_date(date!(2026-03-07)), "2026-03-07");
    }
}
