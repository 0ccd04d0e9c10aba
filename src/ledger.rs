//! Per-customer rolling spend ledgers.
//!
//! Each customer owns a [`CustomerLedger`]: a map of calendar day to
//! [`DailyBucket`] plus the watermark (largest `event_time` applied so far).
//! Every apply adds to the event's day, drops buckets that fell out of the
//! trailing window anchored at the watermark's day, and recomputes the
//! [`FeatureSnapshot`] from what is left.
//!
//! Retention is relative to each customer's own watermark, never to
//! wall-clock time. The watermark only moves forward, so a bucket evicted
//! once can never come back into the window. A late event for a day that is
//! already out of the window lands in its bucket and is evicted in the same
//! apply, leaving the features untouched.
//!
//! ```
//! use rust_decimal::Decimal;
//! use spendroll::ledger::{AggregateStore, RetentionWindow};
//! use time::macros::datetime;
//!
//! let store = AggregateStore::new(RetentionWindow::utc(30));
//! store.apply("C1", datetime!(2026-01-01 09:00 UTC), Decimal::from(100)).unwrap();
//! let snap = store.apply("C1", datetime!(2026-01-31 09:00 UTC), Decimal::from(50)).unwrap();
//! assert_eq!(snap.total_txn_30d, 1);
//! assert_eq!(snap.total_amount_30d, Decimal::from(50));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use time::{Date, Duration, OffsetDateTime, UtcOffset};

use crate::config::EngineConfig;
use crate::error::{MalformedReason, Result};

/// Decimal places kept in `avg_amount_30d`.
pub const AVG_SCALE: u32 = 2;

/// Spend accumulated on one calendar day for one customer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyBucket {
    pub amount_sum: Decimal,
    pub count: u64,
}

/// Derived features over the retained buckets of one customer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub customer_id: String,
    pub total_txn_30d: u64,
    pub total_amount_30d: Decimal,
    pub avg_amount_30d: Decimal,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_time: Option<OffsetDateTime>,
}

impl FeatureSnapshot {
    /// Snapshot of a customer with no retained spend.
    pub fn zero(customer_id: impl Into<String>) -> Self {
        Self {
            customer_id: customer_id.into(),
            total_txn_30d: 0,
            total_amount_30d: Decimal::ZERO,
            avg_amount_30d: Decimal::ZERO,
            last_event_time: None,
        }
    }
}

/// Trailing window of calendar days, anchored at a watermark.
///
/// The window is the `days` calendar days ending on the watermark's day,
/// inclusive: with 30 days, a bucket 30 days older than the watermark's day
/// is already evicted, and at most 30 buckets are retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    days: u32,
    offset: UtcOffset,
}

impl RetentionWindow {
    pub fn new(days: u32, offset: UtcOffset) -> Self {
        assert!(days > 0, "retention window must cover at least one day");
        Self { days, offset }
    }

    /// A window measuring days in UTC.
    pub fn utc(days: u32) -> Self {
        Self::new(days, UtcOffset::UTC)
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.window_days, config.reference_offset()?))
    }

    pub fn days(&self) -> u32 {
        self.days
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// Calendar day of `time` in the reference offset.
    pub fn day_of(&self, time: OffsetDateTime) -> Date {
        time.to_offset(self.offset).date()
    }

    /// Oldest day still retained when the watermark falls on `watermark_day`.
    pub fn first_retained_day(&self, watermark_day: Date) -> Date {
        watermark_day
            .checked_sub(Duration::days(i64::from(self.days) - 1))
            .unwrap_or(Date::MIN)
    }

    pub fn retains(&self, watermark_day: Date, day: Date) -> bool {
        day >= self.first_retained_day(watermark_day)
    }
}

/// The rolling state of a single customer.
#[derive(Debug, Clone)]
pub struct CustomerLedger {
    customer_id: String,
    buckets: BTreeMap<Date, DailyBucket>,
    last_event_time: Option<OffsetDateTime>,
    snapshot: FeatureSnapshot,
    version: u64,
}

impl CustomerLedger {
    pub fn new(customer_id: impl Into<String>) -> Self {
        let customer_id = customer_id.into();
        Self {
            snapshot: FeatureSnapshot::zero(customer_id.clone()),
            customer_id,
            buckets: BTreeMap::new(),
            last_event_time: None,
            version: 0,
        }
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn buckets(&self) -> &BTreeMap<Date, DailyBucket> {
        &self.buckets
    }

    pub fn last_event_time(&self) -> Option<OffsetDateTime> {
        self.last_event_time
    }

    pub fn snapshot(&self) -> &FeatureSnapshot {
        &self.snapshot
    }

    /// Number of applies this ledger has seen.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Add one transaction, evict, recompute.
    ///
    /// # Errors
    ///
    /// - `MalformedReason::AmountTooLarge`: the day's sum or the window total
    ///   would overflow `Decimal`. The ledger is left untouched.
    pub fn apply(
        &mut self,
        window: &RetentionWindow,
        event_time: OffsetDateTime,
        amount: Decimal,
    ) -> std::result::Result<FeatureSnapshot, MalformedReason> {
        assert!(
            !amount.is_sign_negative() || amount.is_zero(),
            "negative amount reached ledger for {}",
            self.customer_id
        );
        self.check_capacity(window, event_time, amount)?;

        let watermark = match self.last_event_time {
            Some(current) => current.max(event_time),
            None => event_time,
        };
        self.last_event_time = Some(watermark);

        let bucket = self.buckets.entry(window.day_of(event_time)).or_default();
        bucket.amount_sum += amount;
        bucket.count += 1;

        let evicted = self.evict(window, watermark);
        if evicted > 0 {
            log::debug!(
                "customer {} evicted {} bucket(s), {} retained",
                self.customer_id,
                evicted,
                self.buckets.len()
            );
        }

        self.recompute();
        self.version += 1;
        Ok(self.snapshot.clone())
    }

    /// Whether `amount` can be added without overflowing any sum.
    ///
    /// Buckets are non-negative and the retained set after an apply is a
    /// subset of the current buckets plus the event's day, so the new window
    /// total is at most the current total plus `amount`.
    pub fn check_capacity(
        &self,
        window: &RetentionWindow,
        event_time: OffsetDateTime,
        amount: Decimal,
    ) -> std::result::Result<(), MalformedReason> {
        let day_sum = self
            .buckets
            .get(&window.day_of(event_time))
            .map_or(Decimal::ZERO, |bucket| bucket.amount_sum);
        day_sum
            .checked_add(amount)
            .and_then(|_| self.snapshot.total_amount_30d.checked_add(amount))
            .map(|_| ())
            .ok_or(MalformedReason::AmountTooLarge)
    }

    fn evict(&mut self, window: &RetentionWindow, watermark: OffsetDateTime) -> usize {
        let cutoff = window.first_retained_day(window.day_of(watermark));
        let retained = self.buckets.split_off(&cutoff);
        let expired = std::mem::replace(&mut self.buckets, retained);
        expired.len()
    }

    fn recompute(&mut self) {
        let mut total_txn: u64 = 0;
        let mut total_amount = Decimal::ZERO;
        for (day, bucket) in &self.buckets {
            assert!(
                bucket.count > 0,
                "empty bucket {} retained for {}",
                day,
                self.customer_id
            );
            assert!(
                !bucket.amount_sum.is_sign_negative() || bucket.amount_sum.is_zero(),
                "negative bucket sum {} on {} for {}",
                bucket.amount_sum,
                day,
                self.customer_id
            );
            total_txn += bucket.count;
            total_amount += bucket.amount_sum;
        }

        let avg_amount = if total_txn > 0 {
            (total_amount / Decimal::from(total_txn))
                .round_dp_with_strategy(AVG_SCALE, RoundingStrategy::MidpointAwayFromZero)
        } else {
            Decimal::ZERO
        };

        self.snapshot = FeatureSnapshot {
            customer_id: self.customer_id.clone(),
            total_txn_30d: total_txn,
            total_amount_30d: total_amount,
            avg_amount_30d: avg_amount,
            last_event_time: self.last_event_time,
        };
    }

    pub fn state(&self) -> LedgerState {
        LedgerState {
            snapshot: self.snapshot.clone(),
            buckets: self.buckets.clone(),
            version: self.version,
        }
    }
}

/// A point-in-time copy of a ledger, for inspection and export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerState {
    pub snapshot: FeatureSnapshot,
    pub buckets: BTreeMap<Date, DailyBucket>,
    pub version: u64,
}

type SharedLedger = Arc<Mutex<CustomerLedger>>;

/// Keyed store of customer ledgers.
///
/// Ledgers are created on first apply and live as long as the store. The
/// outer map is write-locked only to insert a new customer; each apply then
/// holds only that customer's lock, so applies for one customer are
/// linearized while different customers proceed independently.
#[derive(Debug)]
pub struct AggregateStore {
    window: RetentionWindow,
    ledgers: RwLock<HashMap<String, SharedLedger>>,
}

impl AggregateStore {
    pub fn new(window: RetentionWindow) -> Self {
        Self {
            window,
            ledgers: RwLock::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> &RetentionWindow {
        &self.window
    }

    /// Apply one transaction to `customer_id` and return its new snapshot.
    ///
    /// # Errors
    ///
    /// - `MalformedReason::AmountTooLarge`: the ledger's sums would overflow
    pub fn apply(
        &self,
        customer_id: &str,
        event_time: OffsetDateTime,
        amount: Decimal,
    ) -> std::result::Result<FeatureSnapshot, MalformedReason> {
        let ledger = self.ledger_or_insert(customer_id);
        let mut ledger = lock_ledger(&ledger);
        ledger.apply(&self.window, event_time, amount)
    }

    /// Apply one transaction if `claim` agrees.
    ///
    /// The capacity check runs first and `claim` is called only when the
    /// apply cannot fail, both under the customer's lock. `Ok(None)` means
    /// `claim` refused and nothing changed.
    ///
    /// # Errors
    ///
    /// - `MalformedReason::AmountTooLarge`: the ledger's sums would overflow;
    ///   `claim` is not called
    pub fn apply_claimed<F>(
        &self,
        customer_id: &str,
        event_time: OffsetDateTime,
        amount: Decimal,
        claim: F,
    ) -> std::result::Result<Option<FeatureSnapshot>, MalformedReason>
    where
        F: FnOnce() -> bool,
    {
        let ledger = self.ledger_or_insert(customer_id);
        let mut ledger = lock_ledger(&ledger);
        ledger.check_capacity(&self.window, event_time, amount)?;
        if !claim() {
            return Ok(None);
        }
        ledger.apply(&self.window, event_time, amount).map(Some)
    }

    /// Current snapshot; the zero snapshot for an unknown customer.
    pub fn snapshot(&self, customer_id: &str) -> FeatureSnapshot {
        match self.ledger(customer_id) {
            Some(ledger) => lock_ledger(&ledger).snapshot().clone(),
            None => FeatureSnapshot::zero(customer_id),
        }
    }

    /// Snapshots of every customer with at least one apply, ordered by
    /// customer id.
    pub fn snapshots(&self) -> BTreeMap<String, FeatureSnapshot> {
        self.all_ledgers()
            .into_iter()
            .filter_map(|(id, ledger)| {
                let ledger = lock_ledger(&ledger);
                (ledger.version() > 0).then(|| (id, ledger.snapshot().clone()))
            })
            .collect()
    }

    pub fn ledger_state(&self, customer_id: &str) -> Option<LedgerState> {
        self.ledger(customer_id).and_then(|ledger| {
            let ledger = lock_ledger(&ledger);
            (ledger.version() > 0).then(|| ledger.state())
        })
    }

    /// States of every customer with at least one apply, ordered by
    /// customer id.
    pub fn ledger_states(&self) -> BTreeMap<String, LedgerState> {
        self.all_ledgers()
            .into_iter()
            .filter_map(|(id, ledger)| {
                let ledger = lock_ledger(&ledger);
                (ledger.version() > 0).then(|| (id, ledger.state()))
            })
            .collect()
    }

    /// Customers with at least one apply. A ledger created for an event that
    /// was then refused is not counted.
    pub fn customer_count(&self) -> usize {
        self.all_ledgers()
            .iter()
            .filter(|(_, ledger)| lock_ledger(ledger).version() > 0)
            .count()
    }

    fn ledger(&self, customer_id: &str) -> Option<SharedLedger> {
        self.read_map().get(customer_id).cloned()
    }

    fn ledger_or_insert(&self, customer_id: &str) -> SharedLedger {
        if let Some(ledger) = self.ledger(customer_id) {
            return ledger;
        }
        let mut map = self
            .ledgers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            map.entry(customer_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(CustomerLedger::new(customer_id)))),
        )
    }

    // Clone the handles out so no ledger lock is taken under the map lock.
    fn all_ledgers(&self) -> Vec<(String, SharedLedger)> {
        self.read_map()
            .iter()
            .map(|(id, ledger)| (id.clone(), Arc::clone(ledger)))
            .collect()
    }

    fn read_map(&self) -> RwLockReadGuard<'_, HashMap<String, SharedLedger>> {
        self.ledgers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock_ledger(ledger: &SharedLedger) -> MutexGuard<'_, CustomerLedger> {
    match ledger.lock() {
        Ok(guard) => guard,
        // Only an invariant panic inside `apply` poisons a ledger.
        Err(poisoned) => panic!(
            "ledger {} is corrupt: an earlier apply panicked",
            poisoned.get_ref().customer_id()
        ),
    }
}
