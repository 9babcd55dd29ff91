pub mod bundle;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod health;
pub mod pattern;
pub mod poller;
pub mod session;
mod supervisor;
mod watchdog;

pub use bundle::{verify_bundle, BundleReport, FileEntry, SessionManifest, SessionMetadata};
pub use engine::{Engine, EventInput, Outcome, SessionSignals, TransitionObserver};
pub use error::{BundleError, HardwareError, SessionError, TransitionError};
pub use hardware::{Hardware, SimulatedHardware};
pub use pattern::{EmitRequest, GeometricShape, PatternSpec, PatternTiming};
pub use poller::PollerBinding;
pub use session::{Session, SessionOptions, StatusEnvelope};
