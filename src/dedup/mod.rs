//! The dedup pipeline: safe-locking, comparison, cloning, orchestration.

pub mod compare;
pub mod locker;
pub mod orchestrator;

/// Categorical per-file results of one pass. These are data the orchestrator
/// counts, not errors; only store and kernel-feature failures abort a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Extents were cloned onto the reference.
    Cloned,
    /// Byte-equal and already sharing every extent; clone skipped.
    AlreadyShared,
    /// Byte comparison differed; the candidate left the class.
    Mismatch,
    /// Another process held the file writable during locking.
    Busy,
    /// Size or mtime moved between indexing and locking.
    Changed,
    /// The file disappeared before it could be locked.
    Vanished,
    /// The immutable attribute could not be taken (or was already set).
    Locked,
    /// Read or clone failure; the class was abandoned.
    IoError,
}

impl Outcome {
    /// Stable lowercase label used in summaries and JSON output.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Cloned => "cloned",
            Self::AlreadyShared => "already-shared",
            Self::Mismatch => "mismatch",
            Self::Busy => "busy",
            Self::Changed => "changed",
            Self::Vanished => "vanished",
            Self::Locked => "locked",
            Self::IoError => "io-error",
        }
    }
}
