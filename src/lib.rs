//! Idempotent rolling spend features per customer.
//!
//! Transaction events arrive possibly duplicated and out of order. The
//! [`AggregationEngine`] drops repeats, buckets spend by calendar day per
//! customer, and keeps a trailing 30-day window anchored at each customer's
//! latest event time. Every applied event yields a [`FeatureSnapshot`] for a
//! downstream scorer.
//!
//! ```
//! use spendroll::AggregationEngine;
//!
//! let engine = AggregationEngine::default();
//! let line = r#"{"event_id":"e1","customer_id":"C1","event_time":"2026-01-01T10:00:00Z","event_type":"transaction","amount":100}"#;
//! let snap = engine.ingest_json(line).unwrap();
//! assert_eq!(snap.total_txn_30d, 1);
//! assert!(engine.ingest_json(line).is_err());
//! assert_eq!(engine.stats().duplicates, 1);
//! ```

pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod event;
pub mod export;
pub mod ledger;
pub mod shard;
pub mod sink;

pub use config::{CustomerIdFormat, EngineConfig};
pub use dedup::SeenSet;
pub use engine::{AggregationEngine, IngestError, IngestStats, Skipped};
pub use error::{Error, MalformedReason, Result};
pub use event::{Event, EventType, RawEvent};
pub use export::{CustomerExport, EngineExport};
pub use ledger::{AggregateStore, CustomerLedger, DailyBucket, FeatureSnapshot, RetentionWindow};
pub use shard::{ShardReport, ShardedIngest, WorkerStats};
pub use sink::{JsonLinesSink, LatestSnapshots, SnapshotSink};
