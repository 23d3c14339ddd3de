use crate::domain::signal::{InstrumentKey, SignalFamily};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Ingestion-time failures. Always recoverable: the offending event is
/// dropped and reported, the stream continues.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    #[error("Malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },

    #[error("Unknown instrument: {key}")]
    UnknownInstrument { key: String },

    #[error("Clock skew: observed_at {observed_at} is {skew_ms}ms ahead of received_at {received_at}")]
    ClockSkew {
        observed_at: DateTime<Utc>,
        received_at: DateTime<Utc>,
        skew_ms: i64,
    },
}

impl NormalizationError {
    pub fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            kind,
            reason: reason.into(),
        }
    }

    /// Short label used for metrics.
    pub fn reason_label(&self) -> &'static str {
        match self {
            Self::MalformedPayload { .. } => "malformed_payload",
            Self::UnknownInstrument { .. } => "unknown_instrument",
            Self::ClockSkew { .. } => "clock_skew",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CacheError {
    #[error("Feature cache unavailable for {instrument}/{family} after {attempts} attempts")]
    CacheUnavailable {
        instrument: InstrumentKey,
        family: SignalFamily,
        attempts: u32,
    },

    #[error("Rejected non-finite payload for {instrument}/{family}")]
    NonFinitePayload {
        instrument: InstrumentKey,
        family: SignalFamily,
    },
}

/// Assembly-time failures surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FusionError {
    #[error("Insufficient signal for {instrument}: required features unavailable: {}", features.join(", "))]
    InsufficientSignal {
        instrument: InstrumentKey,
        features: Vec<String>,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("Request cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnsembleError {
    #[error("No scoring models registered")]
    NoModels,

    #[error("Model {model} failed to score: {reason}")]
    Scoring { model: String, reason: String },
}

/// Explanation-time failures. `StaleReference` signals a caller-side bug.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExplainError {
    #[error("Stale reference: {reason}")]
    StaleReference { reason: String },

    #[error(transparent)]
    Ensemble(#[from] EnsembleError),
}
