use closure_core::fs_atomic::FsAtomicError;
use closure_core::{BindingError, ConfigError, DriftReport, FaultCause, FsmEvent, FsmState};
use closure_trace::TraceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("voltage probe unavailable: {0}")]
    Probe(String),
    #[error("output driver refused: {0}")]
    Output(String),
}

/// Why a transition did not happen, or why it ended in FAULT.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("illegal transition: {event} from {from}")]
    IllegalTransition { from: FsmState, event: FsmEvent },
    #[error("predicate failed: {0}")]
    PredicateFailed(String),
    #[error("arming window expired after {elapsed_ms} ms (window {window_ms} ms)")]
    ArmingWindowExpired { elapsed_ms: u64, window_ms: u64 },
    #[error("configuration drift: {0}")]
    ConfigDrift(DriftReport),
    #[error("session faulted: {0}")]
    Faulted(FaultCause),
    #[error("trace write failed, transition not committed: {0}")]
    TraceWriteFailure(#[from] TraceError),
    #[error("configuration may only be edited in SAFE (current state {0})")]
    ConfigLocked(FsmState),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("session is shut down")]
    Closed,
}

impl TransitionError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            TransitionError::IllegalTransition { .. } => "illegal_transition",
            TransitionError::PredicateFailed(_) => "predicate_failed",
            TransitionError::ArmingWindowExpired { .. } => "arming_window_expired",
            TransitionError::ConfigDrift(_) => "config_drift",
            TransitionError::Faulted(_) => "faulted",
            TransitionError::TraceWriteFailure(_) => "trace_write_failure",
            TransitionError::ConfigLocked(_) => "config_locked",
            TransitionError::Config(_) => "config",
            TransitionError::Closed => "closed",
        }
    }
}

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("bundle I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("atomic write failed: {0}")]
    Atomic(#[from] FsAtomicError),
    #[error("bundle serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("root hash failed: {0}")]
    Trace(#[from] TraceError),
    #[error("hashing failed: {0}")]
    Binding(#[from] BindingError),
}

impl BundleError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("trace error: {0}")]
    Trace(#[from] TraceError),
    #[error("bundle error: {0}")]
    Bundle(#[from] BundleError),
    #[error("session already shut down")]
    Closed,
}

impl SessionError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
