//! Single entry point of the aggregation core.
//!
//! The engine owns the process-wide [`SeenSet`] and the [`AggregateStore`].
//! For every event it checks the type, claims the event id, and applies the
//! amount to the customer's ledger:
//!
//! | event                         | outcome                       | state change        |
//! |-------------------------------|-------------------------------|---------------------|
//! | malformed raw event           | `IngestError::Malformed`      | none                |
//! | not a transaction             | `Skipped::NonTransactional`   | none                |
//! | id already applied            | `Skipped::Duplicate`          | none                |
//! | sums would overflow           | `IngestError::Malformed`      | none                |
//! | otherwise                     | `Ok(FeatureSnapshot)`         | id marked, applied  |
//!
//! All methods take `&self`; an engine can be shared across threads behind
//! an `Arc`.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::dedup::SeenSet;
use crate::error::{Error, Result};
use crate::event::{Event, RawEvent};
use crate::export::EngineExport;
use crate::ledger::{AggregateStore, FeatureSnapshot, LedgerState, RetentionWindow};
use crate::sink::SnapshotSink;

/// Expected, non-error reasons an event was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Skipped {
    Duplicate,
    NonTransactional,
}

impl fmt::Display for Skipped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Skipped::Duplicate => write!(f, "duplicate"),
            Skipped::NonTransactional => write!(f, "non_transactional"),
        }
    }
}

/// Outcome of ingesting an unvalidated event.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error(transparent)]
    Malformed(#[from] Error),
    #[error("skipped: {0}")]
    Skipped(Skipped),
}

impl IngestError {
    /// The skip reason, if the event was skipped rather than rejected.
    pub fn skipped(&self) -> Option<Skipped> {
        match self {
            IngestError::Skipped(skipped) => Some(*skipped),
            IngestError::Malformed(_) => None,
        }
    }
}

impl From<Skipped> for IngestError {
    fn from(value: Skipped) -> Self {
        IngestError::Skipped(value)
    }
}

/// Outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub applied: u64,
    pub duplicates: u64,
    pub non_transactional: u64,
    pub malformed: u64,
}

impl IngestStats {
    pub fn total(&self) -> u64 {
        self.applied + self.duplicates + self.non_transactional + self.malformed
    }

    pub(crate) fn record(&mut self, outcome: &std::result::Result<FeatureSnapshot, IngestError>) {
        match outcome {
            Ok(_) => self.applied += 1,
            Err(IngestError::Skipped(Skipped::Duplicate)) => self.duplicates += 1,
            Err(IngestError::Skipped(Skipped::NonTransactional)) => self.non_transactional += 1,
            Err(IngestError::Malformed(_)) => self.malformed += 1,
        }
    }
}

impl AddAssign for IngestStats {
    fn add_assign(&mut self, rhs: Self) {
        self.applied += rhs.applied;
        self.duplicates += rhs.duplicates;
        self.non_transactional += rhs.non_transactional;
        self.malformed += rhs.malformed;
    }
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    duplicates: AtomicU64,
    non_transactional: AtomicU64,
    malformed: AtomicU64,
}

impl Counters {
    fn load(&self) -> IngestStats {
        IngestStats {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            non_transactional: self.non_transactional.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }
}

/// Idempotent, time-aware rolling aggregator.
#[derive(Debug)]
pub struct AggregationEngine {
    config: EngineConfig,
    seen: SeenSet,
    store: AggregateStore,
    counters: Counters,
}

impl Default for AggregationEngine {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            seen: SeenSet::new(),
            store: AggregateStore::new(RetentionWindow::utc(30)),
            counters: Counters::default(),
        }
    }
}

impl AggregationEngine {
    /// Create an engine.
    ///
    /// # Errors
    ///
    /// - `Error::Config`: the configuration failed validation
    pub fn new(config: EngineConfig) -> Result<Self> {
        let window = RetentionWindow::from_config(&config)?;
        Ok(Self {
            config,
            seen: SeenSet::new(),
            store: AggregateStore::new(window),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn seen(&self) -> &SeenSet {
        &self.seen
    }

    pub fn store(&self) -> &AggregateStore {
        &self.store
    }

    /// Apply a validated event.
    ///
    /// The id is claimed under the customer's lock, after the amount is
    /// known to fit, so a rejected event never consumes its id.
    pub fn ingest(&self, event: &Event) -> std::result::Result<FeatureSnapshot, IngestError> {
        let Some(amount) = event.transaction_amount() else {
            self.counters.non_transactional.fetch_add(1, Ordering::Relaxed);
            log::debug!(
                "ignoring {} event {} for {}",
                event.event_type(),
                event.event_id(),
                event.customer_id()
            );
            return Err(Skipped::NonTransactional.into());
        };

        if self.seen.has_seen(event.event_id()) {
            return Err(self.duplicate(event).into());
        }

        let applied = self.store.apply_claimed(
            event.customer_id(),
            event.event_time(),
            amount,
            || self.seen.mark_if_unseen(event.event_id()),
        );
        let snapshot = match applied {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Err(self.duplicate(event).into()),
            Err(reason) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                let err = Error::malformed(Some(event.event_id()), reason);
                log::warn!("skipping event for {}: {err}", event.customer_id());
                return Err(IngestError::Malformed(err));
            }
        };

        self.counters.applied.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "applied {} to {}: txn_30d={} amount_30d={}",
            event.event_id(),
            snapshot.customer_id,
            snapshot.total_txn_30d,
            snapshot.total_amount_30d
        );
        Ok(snapshot)
    }

    fn duplicate(&self, event: &Event) -> Skipped {
        self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
        log::warn!("skipping duplicate event {}", event.event_id());
        Skipped::Duplicate
    }

    /// Validate and apply a raw event. A malformed event changes nothing,
    /// not even the seen set.
    pub fn ingest_raw(&self, raw: RawEvent) -> std::result::Result<FeatureSnapshot, IngestError> {
        let event = match raw.into_event(&self.config) {
            Ok(event) => event,
            Err(err) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("skipping event: {err}");
                return Err(IngestError::Malformed(err));
            }
        };
        self.ingest(&event)
    }

    /// Decode one JSON object and apply it.
    pub fn ingest_json(&self, line: &str) -> std::result::Result<FeatureSnapshot, IngestError> {
        match RawEvent::from_json(line) {
            Ok(raw) => self.ingest_raw(raw),
            Err(err) => {
                self.counters.malformed.fetch_add(1, Ordering::Relaxed);
                log::warn!("skipping event: {err}");
                Err(IngestError::Malformed(err))
            }
        }
    }

    /// Drive a sequence of raw events on the calling thread, publishing every
    /// applied snapshot to `sink`.
    ///
    /// # Errors
    ///
    /// Only sink failures are returned; per-event rejections are counted.
    pub fn run<I>(&self, events: I, sink: &mut dyn SnapshotSink) -> Result<IngestStats>
    where
        I: IntoIterator<Item = RawEvent>,
    {
        let mut stats = IngestStats::default();
        for raw in events {
            let outcome = self.ingest_raw(raw);
            if let Ok(snapshot) = &outcome {
                sink.publish(snapshot)?;
            }
            stats.record(&outcome);
        }
        sink.flush()?;
        Ok(stats)
    }

    pub fn snapshot(&self, customer_id: &str) -> FeatureSnapshot {
        self.store.snapshot(customer_id)
    }

    pub fn snapshots(&self) -> BTreeMap<String, FeatureSnapshot> {
        self.store.snapshots()
    }

    pub fn ledger_state(&self, customer_id: &str) -> Option<LedgerState> {
        self.store.ledger_state(customer_id)
    }

    /// Lifetime outcome counts.
    pub fn stats(&self) -> IngestStats {
        self.counters.load()
    }

    /// Exact copy of all ledger state.
    pub fn export(&self) -> EngineExport {
        EngineExport::from_states(self.seen.len(), self.store.ledger_states())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MalformedReason;
    use rust_decimal::Decimal;
    use time::macros::datetime;
    use time::OffsetDateTime;

    fn txn(id: &str, customer: &str, at: OffsetDateTime, amount: i64) -> Event {
        Event::transaction(id, customer, at, Decimal::from(amount)).unwrap()
    }

    #[test]
    fn duplicate_is_skipped_and_leaves_snapshot() {
        let engine = AggregationEngine::default();
        let event = txn("e1", "C1", datetime!(2026-01-01 10:00 UTC), 100);
        let first = engine.ingest(&event).unwrap();
        assert_eq!(engine.ingest(&event).unwrap_err().skipped(), Some(Skipped::Duplicate));
        assert_eq!(engine.snapshot("C1"), first);
        assert_eq!(engine.ledger_state("C1").unwrap().version, 1);
    }

    #[test]
    fn non_transaction_is_not_marked_seen() {
        let engine = AggregationEngine::default();
        let event = Event::other("e1", "C1", datetime!(2026-01-01 10:00 UTC), "login").unwrap();
        assert_eq!(
            engine.ingest(&event).unwrap_err().skipped(),
            Some(Skipped::NonTransactional)
        );
        assert!(!engine.seen().has_seen("e1"));
        assert_eq!(engine.store().customer_count(), 0);
    }

    #[test]
    fn malformed_does_not_burn_id() {
        let engine = AggregationEngine::default();
        let bad = RawEvent {
            event_id: Some("e1".into()),
            customer_id: Some("C1".into()),
            event_time: Some("yesterday".into()),
            event_type: Some("transaction".into()),
            amount: Some(serde_json::json!(5)),
        };
        assert!(matches!(engine.ingest_raw(bad), Err(IngestError::Malformed(_))));
        assert!(!engine.seen().has_seen("e1"));

        let good = engine
            .ingest_json(r#"{"event_id":"e1","customer_id":"C1","event_time":"2026-01-01T00:00:00Z","event_type":"transaction","amount":5}"#)
            .unwrap();
        assert_eq!(good.total_txn_30d, 1);
        assert_eq!(engine.stats().malformed, 1);
        assert_eq!(engine.stats().applied, 1);
    }

    #[test]
    fn run_counts_outcomes_and_publishes_applied() {
        let engine = AggregationEngine::default();
        let lines = [
            r#"{"event_id":"a","customer_id":"C1","event_time":"2026-01-01T00:00:00Z","event_type":"transaction","amount":"1.50"}"#,
            r#"{"event_id":"a","customer_id":"C1","event_time":"2026-01-01T00:00:00Z","event_type":"transaction","amount":"1.50"}"#,
            r#"{"event_id":"b","customer_id":"C1","event_time":"2026-01-01T00:00:00Z","event_type":"page_view"}"#,
            r#"{"event_id":"c","customer_id":"C1","event_type":"transaction","amount":1}"#,
        ];
        let events = lines.iter().map(|line| RawEvent::from_json(line).unwrap());
        let mut published: Vec<FeatureSnapshot> = Vec::new();
        let stats = engine.run(events, &mut published).unwrap();
        assert_eq!(
            stats,
            IngestStats {
                applied: 1,
                duplicates: 1,
                non_transactional: 1,
                malformed: 1,
            }
        );
        assert_eq!(stats.total(), 4);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].total_amount_30d, "1.50".parse::<Decimal>().unwrap());
    }

    #[test]
    fn new_rejects_invalid_config() {
        let mut config = EngineConfig::default();
        config.window_days = 0;
        assert!(matches!(AggregationEngine::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn overflowing_apply_is_rejected_and_keeps_id() {
        let engine = AggregationEngine::default();
        let at = datetime!(2026-01-01 10:00 UTC);
        engine.ingest(&txn("c0", "C0", at, 3)).unwrap();
        // Fill C1 to the edge of `Decimal` directly; events cannot carry it.
        engine.store().apply("C1", at, Decimal::MAX).unwrap();

        let err = engine.ingest(&txn("b", "C1", at, 1)).unwrap_err();
        match &err {
            IngestError::Malformed(inner) => {
                assert_eq!(inner.malformed_reason(), Some(&MalformedReason::AmountTooLarge));
            }
            other => panic!("expected malformed, got {other:?}"),
        }
        assert!(!engine.seen().has_seen("b"));
        assert_eq!(engine.stats().malformed, 1);

        // Reads of every customer keep working.
        assert_eq!(engine.snapshot("C1").total_amount_30d, Decimal::MAX);
        assert_eq!(engine.export().customers.len(), 2);

        // The same id still applies to a customer with room.
        let snap = engine.ingest(&txn("b", "C0", at, 1)).unwrap();
        assert_eq!(snap.total_amount_30d, Decimal::from(4));
    }

    #[test]
    fn duplicate_for_other_customer_creates_no_ledger() {
        let engine = AggregationEngine::default();
        let at = datetime!(2026-01-01 10:00 UTC);
        engine.ingest(&txn("e1", "C1", at, 5)).unwrap();
        let err = engine.ingest(&txn("e1", "C2", at, 5)).unwrap_err();
        assert_eq!(err.skipped(), Some(Skipped::Duplicate));
        assert_eq!(engine.store().customer_count(), 1);
        assert!(engine.ledger_state("C2").is_none());
    }
}
