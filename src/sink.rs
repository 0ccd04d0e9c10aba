//! Outbound feature stream.

use std::collections::BTreeMap;
use std::io::Write;

use crate::error::Result;
use crate::ledger::FeatureSnapshot;

/// Receives the snapshot produced by every applied event.
pub trait SnapshotSink {
    fn publish(&mut self, snapshot: &FeatureSnapshot) -> Result<()>;

    /// Flush any buffered output.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl SnapshotSink for Vec<FeatureSnapshot> {
    fn publish(&mut self, snapshot: &FeatureSnapshot) -> Result<()> {
        self.push(snapshot.clone());
        Ok(())
    }
}

/// Keeps only the newest snapshot per customer.
#[derive(Debug, Clone, Default)]
pub struct LatestSnapshots {
    latest: BTreeMap<String, FeatureSnapshot>,
}

impl LatestSnapshots {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, customer_id: &str) -> Option<&FeatureSnapshot> {
        self.latest.get(customer_id)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, FeatureSnapshot> {
        self.latest
    }

    /// Fold another sink's snapshots into this one. Customers are disjoint
    /// across shards, so no entry is overwritten.
    pub fn merge(&mut self, other: LatestSnapshots) {
        self.latest.extend(other.latest);
    }
}

impl SnapshotSink for LatestSnapshots {
    fn publish(&mut self, snapshot: &FeatureSnapshot) -> Result<()> {
        self.latest
            .insert(snapshot.customer_id.clone(), snapshot.clone());
        Ok(())
    }
}

/// Writes one JSON object per snapshot.
pub struct JsonLinesSink<W: Write> {
    out: W,
    written: u64,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out, written: 0 }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> SnapshotSink for JsonLinesSink<W> {
    fn publish(&mut self, snapshot: &FeatureSnapshot) -> Result<()> {
        serde_json::to_writer(&mut self.out, snapshot)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn snap(customer: &str, total: i64) -> FeatureSnapshot {
        FeatureSnapshot {
            total_txn_30d: 1,
            total_amount_30d: Decimal::from(total),
            avg_amount_30d: Decimal::from(total),
            ..FeatureSnapshot::zero(customer)
        }
    }

    #[test]
    fn latest_keeps_newest() {
        let mut sink = LatestSnapshots::new();
        sink.publish(&snap("C1", 10)).unwrap();
        sink.publish(&snap("C1", 20)).unwrap();
        sink.publish(&snap("C2", 5)).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.get("C1").unwrap().total_amount_30d, Decimal::from(20));
    }

    #[test]
    fn json_lines_one_object_per_line() {
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.publish(&snap("C1", 10)).unwrap();
        sink.publish(&snap("C2", 3)).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.written(), 2);
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: FeatureSnapshot = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.customer_id, "C1");
    }
}
