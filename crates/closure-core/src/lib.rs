pub mod binding;
pub mod clock;
pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod fs_atomic;
pub mod health;
pub mod predicates;
pub mod state;
#[cfg(test)]
mod tests;

pub use binding::{bind, check_drift, detect_drift, BoundHashes, DriftReport, GENESIS_HASH};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    Calibration, ConfigSource, DeviceConfig, FileConfigSource, MemoryConfigSource, RuntimeSettings,
};
pub use context::SessionContext;
pub use envelope::{BudgetEnvelope, Bounded, EmitEnvelope, MeasurementEnvelope};
pub use error::{BindingError, ConfigError, EnvelopeError};
pub use health::{HealthCheck, HealthSnapshot, HealthStatus};
pub use predicates::{Decision, FaultCause, Verdict};
pub use state::{FsmEvent, FsmState};
