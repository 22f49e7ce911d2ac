use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub type AnalysisResult<T> = Result<T, AnalysisError>;

/// Why an analysis stopped before producing a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller's cancellation token fired.
    Caller,
    /// The configured analysis deadline elapsed.
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Caller => write!(f, "cancelled by caller"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Invalid funnel definition: {0}")]
    InvalidFunnelDefinition(String),

    #[error("Unknown segment dimension: {0}")]
    UnknownSegmentDimension(String),

    #[error("Analysis cancelled: {0}")]
    AnalysisCancelled(CancelReason),

    #[error("Funnel not found: {0}")]
    FunnelNotFound(Uuid),

    #[error("Invalid period: start {start} is after end {end}")]
    InvalidPeriod { start: String, end: String },

    #[error("Event source error: {0}")]
    EventSource(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Coarse error classification exposed to callers alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidFunnelDefinition,
    UnknownSegmentDimension,
    AnalysisCancelled,
    FunnelNotFound,
    InvalidPeriod,
    EventSource,
    Config,
    Internal,
}

/// Structured error handed to callers: a kind plus a human-readable message.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl AnalysisError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AnalysisError::InvalidFunnelDefinition(_) => ErrorKind::InvalidFunnelDefinition,
            AnalysisError::UnknownSegmentDimension(_) => ErrorKind::UnknownSegmentDimension,
            AnalysisError::AnalysisCancelled(_) => ErrorKind::AnalysisCancelled,
            AnalysisError::FunnelNotFound(_) => ErrorKind::FunnelNotFound,
            AnalysisError::InvalidPeriod { .. } => ErrorKind::InvalidPeriod,
            AnalysisError::EventSource(_) => ErrorKind::EventSource,
            AnalysisError::Config(_) => ErrorKind::Config,
            AnalysisError::Serialization(_) | AnalysisError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True for caller cancellation and deadline expiry, false for genuine failures.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, AnalysisError::AnalysisCancelled(_))
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<config::ConfigError> for AnalysisError {
    fn from(e: config::ConfigError) -> Self {
        AnalysisError::Config(e.to_string())
    }
}
