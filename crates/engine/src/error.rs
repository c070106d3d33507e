//! Error types for the simulation and live execution sides

use thiserror::Error;

/// Errors from backtests, walk-forward validation and sweeps.
///
/// These are synchronous computations: bad input fails loudly instead of degrading.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BacktestError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Errors reported by an exchange client
#[derive(Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("exchange returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("exchange transport error: {0}")]
    Transport(String),

    #[error("asset {0} is not listed on the exchange")]
    AssetNotListed(String),

    #[error("order rejected: {0}")]
    Rejected(String),
}

impl ExchangeError {
    /// 4xx responses will not succeed on retry
    pub fn is_client_error(&self) -> bool {
        matches!(self, ExchangeError::Http { status, .. } if (400..500).contains(status))
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => ExchangeError::Http {
                status: status.as_u16(),
                body: e.to_string(),
            },
            None => ExchangeError::Transport(e.to_string()),
        }
    }
}

/// Errors from one live purchase attempt
#[derive(Error, Debug)]
pub enum DcaError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("store error: {0}")]
    Store(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// The order reached the exchange but its result could not be stored
    #[error("order {order_id:?} placed but not persisted: {reason}")]
    PostOrderPersist {
        order_id: Option<String>,
        reason: String,
    },

    #[error("operation cancelled")]
    Cancelled,
}

impl From<persistence::DbError> for DcaError {
    fn from(e: persistence::DbError) -> Self {
        DcaError::Store(e.to_string())
    }
}

/// How the scheduler should react to a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying cannot help (4xx, misconfiguration)
    Permanent,
    /// Network trouble, 5xx, storage hiccups: retry with backoff
    Transient,
    /// Stop quietly (shutdown in progress)
    Skip,
}

/// Classify a failed attempt independently of where the error came from
pub fn classify(error: &DcaError) -> ErrorClass {
    match error {
        DcaError::Exchange(e) if e.is_client_error() => ErrorClass::Permanent,
        DcaError::Exchange(ExchangeError::AssetNotListed(_) | ExchangeError::Rejected(_)) => {
            ErrorClass::Permanent
        }
        DcaError::Config(_) | DcaError::PostOrderPersist { .. } => ErrorClass::Permanent,
        DcaError::Cancelled => ErrorClass::Skip,
        DcaError::Exchange(_) | DcaError::Store(_) | DcaError::Lock(_) => ErrorClass::Transient,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_status() {
        let bad_request = DcaError::Exchange(ExchangeError::Http {
            status: 400,
            body: "bad size".into(),
        });
        let unavailable = DcaError::Exchange(ExchangeError::Http {
            status: 503,
            body: "maintenance".into(),
        });
        assert_eq!(classify(&bad_request), ErrorClass::Permanent);
        assert_eq!(classify(&unavailable), ErrorClass::Transient);
    }

    #[test]
    fn test_classify_other_variants() {
        assert_eq!(
            classify(&DcaError::Exchange(ExchangeError::AssetNotListed("XYZ".into()))),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify(&DcaError::Exchange(ExchangeError::Transport("reset".into()))),
            ErrorClass::Transient
        );
        assert_eq!(classify(&DcaError::Store("busy".into())), ErrorClass::Transient);
        assert_eq!(classify(&DcaError::Config("tiers".into())), ErrorClass::Permanent);
        assert_eq!(classify(&DcaError::Cancelled), ErrorClass::Skip);
        assert_eq!(
            classify(&DcaError::PostOrderPersist {
                order_id: Some("1".into()),
                reason: "database is locked".into(),
            }),
            ErrorClass::Permanent
        );
    }
}
