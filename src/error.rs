/// Why a raw event was rejected before it reached the aggregator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedReason {
    #[error("undecodable: {0}")]
    Undecodable(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid customer_id {0:?}")]
    InvalidCustomerId(String),
    #[error("invalid event_time: {0}")]
    InvalidEventTime(String),
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("negative amount")]
    NegativeAmount,
    #[error("amount exceeds configured maximum or would overflow the window total")]
    AmountTooLarge,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed event {}: {reason}", .event_id.as_deref().unwrap_or("<unknown>"))]
    MalformedEvent {
        event_id: Option<String>,
        reason: MalformedReason,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn malformed(event_id: Option<&str>, reason: MalformedReason) -> Self {
        Error::MalformedEvent {
            event_id: event_id.map(str::to_string),
            reason,
        }
    }

    /// The rejection reason, if this is a malformed-event error.
    pub fn malformed_reason(&self) -> Option<&MalformedReason> {
        match self {
            Error::MalformedEvent { reason, .. } => Some(reason),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
