pub mod error;
pub mod reader;
pub mod record;
pub mod writer;

pub use error::{ChainIntegrityError, TraceError};
pub use reader::{
    parse_trace, read_trace, verify_chain, verify_file, verify_lines, ChainIssue, ChainIssueKind,
    ChainVerification, TraceLine,
};
pub use record::{compute_record_hash, root_hash, EventType, TraceRecord};
pub use writer::{FileStore, MemoryStore, TraceStore, TraceWriter};
