//! Crate-wide error taxonomy.
//!
//! Spec errors are detected before any worker spawns; dispatch and transport
//! errors abort a running ensemble after the history has been dumped.
//! Worker-reported calculation failures are *not* errors at this level: they
//! are recorded in the history and the run continues.

use crate::comms::CommError;
use crate::schema::SchemaError;
use std::fmt::{self, Display, Formatter};
use std::io;

#[derive(Debug)]
pub enum EnsembleError {
    /// Malformed run specification: conflicting field declarations, an
    /// incompatible seed history, an empty exit criterion, and the like.
    Spec(String),
    /// Field or dtype mismatch while assembling or mutating row sets.
    Schema(SchemaError),
    /// The allocator produced a work unit the manager cannot honor.
    Dispatch(String),
    /// A channel failed in a way the recovery protocol could not absorb.
    Comm(CommError),
    /// The allocator callback itself failed.
    Alloc(anyhow::Error),
    Io(io::Error),
    Json(serde_json::Error),
}

impl Display for EnsembleError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spec(msg) => write!(f, "invalid run specification: {}", msg),
            Self::Schema(err) => write!(f, "schema error: {}", err),
            Self::Dispatch(msg) => write!(f, "dispatch error: {}", msg),
            Self::Comm(err) => write!(f, "communication error: {}", err),
            Self::Alloc(err) => write!(f, "allocator failed: {}", err),
            Self::Io(err) => write!(f, "i/o error: {}", err),
            Self::Json(err) => write!(f, "serialization error: {}", err),
        }
    }
}

impl std::error::Error for EnsembleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Schema(err) => Some(err),
            Self::Comm(err) => Some(err),
            Self::Alloc(err) => Some(AsRef::<dyn std::error::Error + 'static>::as_ref(err)),
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            _ => None,
        }
    }
}

impl From<SchemaError> for EnsembleError {
    fn from(err: SchemaError) -> Self {
        Self::Schema(err)
    }
}

impl From<CommError> for EnsembleError {
    fn from(err: CommError) -> Self {
        Self::Comm(err)
    }
}

impl From<io::Error> for EnsembleError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<serde_json::Error> for EnsembleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err)
    }
}
