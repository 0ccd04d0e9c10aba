//! Transaction events.
//!
//! [`RawEvent`] is the loosely-typed shape events arrive in (one JSON object
//! per event). [`RawEvent::into_event`] validates it into an immutable
//! [`Event`], which is the only type the aggregation core accepts.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::{amount_ceiling, EngineConfig};
use crate::error::{Error, MalformedReason, Result};

const TRANSACTION: &str = "transaction";

/// Event kind. Only transactions touch the aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventType {
    Transaction,
    Other(String),
}

impl EventType {
    pub fn is_transaction(&self) -> bool {
        matches!(self, EventType::Transaction)
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::Transaction => TRANSACTION,
            EventType::Other(kind) => kind,
        }
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        if value == TRANSACTION {
            EventType::Transaction
        } else {
            EventType::Other(value)
        }
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        EventType::from(value.to_string())
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        match value {
            EventType::Transaction => TRANSACTION.to_string(),
            EventType::Other(kind) => kind,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated, immutable event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    event_id: String,
    customer_id: String,
    event_time: OffsetDateTime,
    event_type: EventType,
    amount: Option<Decimal>,
}

impl Event {
    /// Build a transaction event.
    ///
    /// # Errors
    ///
    /// - `Error::MalformedEvent`: empty ids, a negative amount, or an amount
    ///   above [`AMOUNT_CEILING`](crate::config::AMOUNT_CEILING)
    pub fn transaction(
        event_id: impl Into<String>,
        customer_id: impl Into<String>,
        event_time: OffsetDateTime,
        amount: Decimal,
    ) -> Result<Self> {
        let event_id = event_id.into();
        let customer_id = customer_id.into();
        check_ids(&event_id, &customer_id)?;
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(Error::malformed(Some(&event_id), MalformedReason::NegativeAmount));
        }
        if amount > amount_ceiling() {
            return Err(Error::malformed(Some(&event_id), MalformedReason::AmountTooLarge));
        }
        Ok(Self {
            event_id,
            customer_id,
            event_time,
            event_type: EventType::Transaction,
            amount: Some(amount),
        })
    }

    /// Build a non-transaction event. It is accepted by the engine but never
    /// aggregated. A `kind` of `"transaction"` is rejected; use
    /// [`Event::transaction`].
    pub fn other(
        event_id: impl Into<String>,
        customer_id: impl Into<String>,
        event_time: OffsetDateTime,
        kind: impl Into<String>,
    ) -> Result<Self> {
        let event_id = event_id.into();
        let customer_id = customer_id.into();
        check_ids(&event_id, &customer_id)?;
        let event_type = EventType::from(kind.into());
        if event_type.is_transaction() {
            return Err(Error::malformed(Some(&event_id), MalformedReason::MissingField("amount")));
        }
        Ok(Self {
            event_id,
            customer_id,
            event_time,
            event_type,
            amount: None,
        })
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn customer_id(&self) -> &str {
        &self.customer_id
    }

    pub fn event_time(&self) -> OffsetDateTime {
        self.event_time
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn amount(&self) -> Option<Decimal> {
        self.amount
    }

    /// The amount to aggregate, or `None` for non-transaction events.
    pub fn transaction_amount(&self) -> Option<Decimal> {
        if self.event_type.is_transaction() {
            self.amount
        } else {
            None
        }
    }
}

fn check_ids(event_id: &str, customer_id: &str) -> Result<()> {
    if event_id.is_empty() {
        return Err(Error::malformed(None, MalformedReason::MissingField("event_id")));
    }
    if customer_id.is_empty() {
        return Err(Error::malformed(
            Some(event_id),
            MalformedReason::InvalidCustomerId(customer_id.to_string()),
        ));
    }
    Ok(())
}

/// An event as delivered by a feed, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub event_time: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    /// JSON number or decimal string.
    #[serde(default)]
    pub amount: Option<serde_json::Value>,
}

impl RawEvent {
    /// Decode one JSON object.
    pub fn from_json(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(|err| {
            Error::malformed(None, MalformedReason::Undecodable(err.to_string()))
        })
    }

    /// Validate into an [`Event`].
    ///
    /// # Errors
    ///
    /// - `Error::MalformedEvent`: a required field is missing, the customer id
    ///   does not match `config.customer_id_format`, the event time is not
    ///   RFC 3339, or a transaction amount is not a finite decimal in
    ///   `0..=config.max_amount`
    pub fn into_event(self, config: &EngineConfig) -> Result<Event> {
        let event_id = match self.event_id {
            Some(id) if !id.is_empty() => id,
            _ => return Err(Error::malformed(None, MalformedReason::MissingField("event_id"))),
        };
        let id = Some(event_id.as_str());

        let customer_id = self
            .customer_id
            .ok_or_else(|| Error::malformed(id, MalformedReason::MissingField("customer_id")))?;
        if !config.customer_id_format.matches(&customer_id) {
            return Err(Error::malformed(id, MalformedReason::InvalidCustomerId(customer_id)));
        }

        let raw_time = self
            .event_time
            .ok_or_else(|| Error::malformed(id, MalformedReason::MissingField("event_time")))?;
        let event_time = parse_event_time(&raw_time)
            .map_err(|reason| Error::malformed(id, reason))?;

        let event_type = self
            .event_type
            .map(EventType::from)
            .ok_or_else(|| Error::malformed(id, MalformedReason::MissingField("event_type")))?;

        let amount = match (&event_type, self.amount) {
            (EventType::Transaction, None) => {
                return Err(Error::malformed(id, MalformedReason::MissingField("amount")));
            }
            (EventType::Transaction, Some(value)) => {
                let amount = parse_amount(&value).map_err(|reason| Error::malformed(id, reason))?;
                if amount > config.max_amount || amount > amount_ceiling() {
                    return Err(Error::malformed(id, MalformedReason::AmountTooLarge));
                }
                Some(amount)
            }
            // Ignored by the aggregator; kept only when it is well formed.
            (EventType::Other(_), value) => value.and_then(|value| parse_amount(&value).ok()),
        };

        Ok(Event {
            event_id,
            customer_id,
            event_time,
            event_type,
            amount,
        })
    }
}

/// Parse an RFC 3339 timestamp. An explicit offset (`Z` or `±hh:mm`) is
/// required.
pub fn parse_event_time(raw: &str) -> std::result::Result<OffsetDateTime, MalformedReason> {
    OffsetDateTime::parse(raw.trim(), &Rfc3339)
        .map_err(|err| MalformedReason::InvalidEventTime(format!("{raw:?}: {err}")))
}

fn parse_amount(value: &serde_json::Value) -> std::result::Result<Decimal, MalformedReason> {
    let text = match value {
        serde_json::Value::Number(number) => number.to_string(),
        serde_json::Value::String(text) => text.trim().to_string(),
        other => return Err(MalformedReason::InvalidAmount(other.to_string())),
    };
    let amount = Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| MalformedReason::InvalidAmount(text.clone()))?;
    if amount.is_sign_negative() && !amount.is_zero() {
        return Err(MalformedReason::NegativeAmount);
    }
    Ok(amount)
}
