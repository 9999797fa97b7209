//! This module is the consensus-specific commit log that wraps the generic commit log with term
//! metadata, commit/applied bookkeeping, and snapshot base tracking.

mod log;
mod log_entry;

pub use log_entry::WriteAheadLogEntry;

pub(super) use log::WriteAheadLog;
