//! Processing error model and retry backoff policy helpers.

use std::time::Duration;

use rand::Rng;

use harvester_state::StateError;
use harvester_types::error::{BackoffClass, ConnectorError, ErrorCategory};

use crate::bins::BinError;
use crate::channel::ChannelError;
use crate::pool::PoolError;
use crate::throttle::ThrottleError;

const BACKOFF_FAST_BASE_MS: u64 = 100;
const BACKOFF_NORMAL_BASE_MS: u64 = 1_000;
const BACKOFF_SLOW_BASE_MS: u64 = 5_000;
const BACKOFF_MAX_MS: u64 = 60_000;
/// Jitter spread as a percentage of the nominal delay, applied both ways.
const BACKOFF_JITTER_PCT: u64 = 25;

// ---------------------------------------------------------------------------
// FailureClass: how the engine reacts to a connector error
// ---------------------------------------------------------------------------

/// Classification of a connector error at the pipeline boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureClass {
    /// Reschedule after a backoff; bounded retries.
    Transient,
    /// Mark the document Error and continue the job.
    PermanentDocument,
    /// Abort the owning job (or the process, in a background coordinator).
    Configuration,
    /// Clean stop; never logged as a failure.
    Cancelled,
}

impl FailureClass {
    #[must_use]
    pub fn of(err: &ConnectorError) -> Self {
        match err.category {
            ErrorCategory::RateLimit
            | ErrorCategory::TransientNetwork
            | ErrorCategory::TransientService => Self::Transient,
            ErrorCategory::Config
            | ErrorCategory::Auth
            | ErrorCategory::Permission
            | ErrorCategory::Setup => Self::Configuration,
            ErrorCategory::Interrupted => Self::Cancelled,
            _ => Self::PermanentDocument,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::PermanentDocument => "document",
            Self::Configuration => "configuration",
            Self::Cancelled => "cancelled",
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessError: classified errors for per-document and coordinator decisions
// ---------------------------------------------------------------------------

/// Classified processing error.
///
/// Connector errors are sorted into a [`FailureClass`] on conversion. Store
/// failures and other host-side problems land in `Infrastructure`; a worker
/// retries those with backoff like a transient interruption, up to
/// `max_retries`, before marking the document `Error`.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("transient interruption: {0}")]
    Transient(ConnectorError),
    #[error("document error: {0}")]
    Document(ConnectorError),
    #[error("configuration error: {0}")]
    Configuration(ConnectorError),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl From<ConnectorError> for ProcessError {
    fn from(err: ConnectorError) -> Self {
        match FailureClass::of(&err) {
            FailureClass::Transient => Self::Transient(err),
            FailureClass::PermanentDocument => Self::Document(err),
            FailureClass::Configuration => Self::Configuration(err),
            FailureClass::Cancelled => Self::Cancelled,
        }
    }
}

impl From<StateError> for ProcessError {
    fn from(err: StateError) -> Self {
        Self::Infrastructure(err.into())
    }
}

impl From<PoolError> for ProcessError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Cancelled | PoolError::PoolClosed => Self::Cancelled,
            PoolError::Connect { source, .. } => source.into(),
            PoolError::ConnectorNotInstalled { .. } => {
                Self::Configuration(ConnectorError::setup("CONNECTOR_NOT_INSTALLED", err.to_string()))
            }
            PoolError::ConnectionNotValid(_) => {
                Self::Configuration(ConnectorError::config("CONNECTION_NOT_VALID", err.to_string()))
            }
            other => Self::Infrastructure(other.into()),
        }
    }
}

impl From<ThrottleError> for ProcessError {
    fn from(err: ThrottleError) -> Self {
        match err {
            ThrottleError::Cancelled => Self::Cancelled,
            ThrottleError::InvalidPattern { .. } => {
                Self::Configuration(ConnectorError::config("INVALID_THROTTLE", err.to_string()))
            }
            other => Self::Infrastructure(other.into()),
        }
    }
}

impl From<ChannelError> for ProcessError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Abandoned => Self::Cancelled,
            other => Self::Infrastructure(other.into()),
        }
    }
}

impl From<BinError> for ProcessError {
    fn from(err: BinError) -> Self {
        match err {
            BinError::Cancelled => Self::Cancelled,
            other => Self::Infrastructure(other.into()),
        }
    }
}

impl ProcessError {
    #[must_use]
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            Self::Transient(_) => Some(FailureClass::Transient),
            Self::Document(_) => Some(FailureClass::PermanentDocument),
            Self::Configuration(_) => Some(FailureClass::Configuration),
            Self::Cancelled => Some(FailureClass::Cancelled),
            Self::Infrastructure(_) => None,
        }
    }

    /// The typed connector error, when this came from a connector.
    #[must_use]
    pub fn as_connector_error(&self) -> Option<&ConnectorError> {
        match self {
            Self::Transient(e) | Self::Document(e) | Self::Configuration(e) => Some(e),
            Self::Cancelled | Self::Infrastructure(_) => None,
        }
    }

    /// Short result code for activity records.
    #[must_use]
    pub fn result_code(&self) -> String {
        match self {
            Self::Transient(e) | Self::Document(e) | Self::Configuration(e) => e.code.clone(),
            Self::Cancelled => "CANCELLED".to_string(),
            Self::Infrastructure(_) => "INTERNAL".to_string(),
        }
    }

    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_))
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Nominal retry delay from error hints and attempt number (starting at 1).
#[must_use]
pub fn nominal_backoff(err: &ConnectorError, attempt: u32) -> Duration {
    if let Some(ms) = err.retry_after_ms {
        return Duration::from_millis(ms);
    }

    let base_ms: u64 = match err.backoff_class {
        BackoffClass::Fast => BACKOFF_FAST_BASE_MS,
        BackoffClass::Normal => BACKOFF_NORMAL_BASE_MS,
        BackoffClass::Slow => BACKOFF_SLOW_BASE_MS,
    };

    let exp = attempt.saturating_sub(1).min(32);
    let delay_ms = base_ms.saturating_mul(2u64.saturating_pow(exp));
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}

/// Retry delay with ±25% jitter. A connector-supplied `retry_after_ms` is
/// honored exactly.
pub fn compute_backoff(err: &ConnectorError, attempt: u32, rng: &mut impl Rng) -> Duration {
    let nominal = nominal_backoff(err, attempt);
    if err.retry_after_ms.is_some() {
        return nominal;
    }
    let nominal_ms = u64::try_from(nominal.as_millis()).unwrap_or(u64::MAX);
    let spread = nominal_ms.saturating_mul(BACKOFF_JITTER_PCT) / 100;
    if spread == 0 {
        return nominal;
    }
    let lower = nominal_ms.saturating_sub(spread);
    let upper = nominal_ms.saturating_add(spread);
    Duration::from_millis(rng.random_range(lower..=upper))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // -----------------------------------------------------------------------
    // Classification
    // -----------------------------------------------------------------------

    #[test]
    fn transient_categories_reschedule() {
        for err in [
            ConnectorError::rate_limit("SLOW", "x", None),
            ConnectorError::transient_network("RESET", "x"),
            ConnectorError::service_interruption("503", "x", Some(10)),
        ] {
            assert_eq!(FailureClass::of(&err), FailureClass::Transient);
            assert!(matches!(ProcessError::from(err), ProcessError::Transient(_)));
        }
    }

    #[test]
    fn setup_categories_are_configuration() {
        for err in [
            ConnectorError::config("A", "x"),
            ConnectorError::auth("B", "x"),
            ConnectorError::permission("C", "x"),
            ConnectorError::setup("D", "x"),
        ] {
            let pe = ProcessError::from(err);
            assert!(pe.is_fatal(), "{pe}");
        }
    }

    #[test]
    fn internal_error_only_fails_the_document() {
        let pe = ProcessError::from(ConnectorError::internal("BUG", "oops"));
        assert_eq!(pe.class(), Some(FailureClass::PermanentDocument));
        assert!(!pe.is_fatal());
    }

    #[test]
    fn interrupted_is_cancelled() {
        let pe = ProcessError::from(ConnectorError::interrupted("stop"));
        assert!(matches!(pe, ProcessError::Cancelled));
        assert_eq!(pe.result_code(), "CANCELLED");
    }

    #[test]
    fn pool_errors_classify() {
        assert!(matches!(
            ProcessError::from(PoolError::PoolClosed),
            ProcessError::Cancelled
        ));
        assert!(ProcessError::from(PoolError::ConnectorNotInstalled {
            kind: "ftp".into()
        })
        .is_fatal());
        let pe = ProcessError::from(PoolError::Connect {
            connection: "files".into(),
            source: ConnectorError::transient_network("DOWN", "unreachable"),
        });
        assert_eq!(pe.class(), Some(FailureClass::Transient));
    }

    #[test]
    fn infrastructure_has_no_class() {
        let pe: ProcessError = anyhow::anyhow!("disk full").into();
        assert_eq!(pe.class(), None);
        assert_eq!(pe.result_code(), "INTERNAL");
        assert!(pe.to_string().contains("disk full"));
    }

    // -----------------------------------------------------------------------
    // Backoff
    // -----------------------------------------------------------------------

    #[test]
    fn nominal_backoff_per_class() {
        let fast = ConnectorError::transient_network("X", "y").with_backoff(BackoffClass::Fast);
        assert_eq!(nominal_backoff(&fast, 1), Duration::from_millis(100));
        assert_eq!(nominal_backoff(&fast, 3), Duration::from_millis(400));

        let normal = ConnectorError::transient_network("X", "y");
        assert_eq!(nominal_backoff(&normal, 2), Duration::from_millis(2000));

        let slow = ConnectorError::rate_limit("X", "y", None);
        assert_eq!(nominal_backoff(&slow, 2), Duration::from_millis(10_000));
    }

    #[test]
    fn backoff_capped_at_60s() {
        let err = ConnectorError::transient_network("X", "y");
        assert_eq!(nominal_backoff(&err, 40), Duration::from_millis(60_000));
    }

    #[test]
    fn retry_after_is_exact() {
        let err = ConnectorError::rate_limit("X", "y", Some(7500));
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(compute_backoff(&err, 1, &mut rng), Duration::from_millis(7500));
        assert_eq!(compute_backoff(&err, 5, &mut rng), Duration::from_millis(7500));
    }

    #[test]
    fn jitter_stays_within_quarter() {
        let err = ConnectorError::transient_network("X", "y");
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let d = compute_backoff(&err, 1, &mut rng);
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250), "{d:?}");
        }
    }
}
