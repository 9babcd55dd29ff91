use crate::reader::ChainIssue;
use closure_core::BindingError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace I/O error during {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("trace serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("payload canonicalization failed: {0}")]
    Binding(#[from] BindingError),
    #[error("existing trace is corrupt at line {line}: {detail}")]
    Corrupt { line: usize, detail: String },
}

impl TraceError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Post-hoc verification failure. Carries every issue found, never just the
/// first.
#[derive(Debug, Error)]
#[error("trace chain integrity violated: {} issue(s), first at seq {}", issues.len(), issues.first().map(|i| i.seq).unwrap_or(0))]
pub struct ChainIntegrityError {
    pub issues: Vec<ChainIssue>,
}
