use thiserror::Error;

/// Raised when a bounded range is constructed with inconsistent bounds.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvelopeError {
    #[error("envelope bounds inverted: min={min} > max={max}")]
    Inverted { min: f64, max: f64 },
    #[error("envelope bound is not finite: {0}")]
    NotFinite(&'static str),
    #[error("confidence {0} outside [0, 1]")]
    Confidence(f64),
    #[error("no samples supplied to build a measurement envelope")]
    NoSamples,
    #[error("{what} {value} exceeds limit {limit}")]
    Exceeds {
        what: &'static str,
        value: f64,
        limit: f64,
    },
}

/// Errors from loading, parsing or validating device configuration and
/// calibration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported configuration format: {0}")]
    UnsupportedFormat(String),
    #[error("configuration invalid: {0}")]
    Invalid(String),
    #[error("configuration store unavailable: {0}")]
    Unavailable(String),
}

impl ConfigError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum BindingError {
    #[error("canonicalization failed: {0}")]
    Canonicalize(#[from] serde_json::Error),
}
