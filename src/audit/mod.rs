//! Append-only, redacted audit trail with daily rotation.

pub mod logger;
pub mod redact;

pub use logger::AuditLogger;
pub use redact::{RedactionFilter, RedactionOutcome};
