//! BDH-prefixed error types with structured error codes.
//!
//! Fatal errors live here. Recoverable per-file results (busy, changed,
//! mismatch, ...) are not errors at all; the orchestrator counts them as
//! [`crate::dedup::Outcome`] values.

#![allow(missing_docs)]

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Shared `Result` alias for the project.
pub type Result<T> = std::result::Result<T, BdhError>;

/// Top-level error type for btrfs-dedup-helper.
#[derive(Debug, Error)]
pub enum BdhError {
    #[error("[BDH-1001] invalid configuration: {details}")]
    InvalidConfig { details: String },

    #[error("[BDH-1002] configuration parse failure in {context}: {details}")]
    ConfigParse {
        context: &'static str,
        details: String,
    },

    #[error("[BDH-1101] kernel does not support {feature}: {details}")]
    UnsupportedKernel {
        feature: &'static str,
        details: String,
    },

    #[error("[BDH-2001] mount table parse failure: {details}")]
    MountParse { details: String },

    #[error("[BDH-2002] not a btrfs filesystem: {path}")]
    NotBtrfs { path: PathBuf },

    #[error("[BDH-2003] cannot resolve volume reference {reference:?}: {details}")]
    VolumeResolve { reference: String, details: String },

    #[error("[BDH-2101] SQL failure in {context}: {details}")]
    Sql {
        context: &'static str,
        details: String,
    },

    #[error("[BDH-2102] serialization failure in {context}: {details}")]
    Serialization {
        context: &'static str,
        details: String,
    },

    #[error("[BDH-3001] permission denied for {path}")]
    PermissionDenied { path: PathBuf },

    #[error("[BDH-3002] IO failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("[BDH-3003] ioctl {op} failed: {source}")]
    Ioctl {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("[BDH-3004] file vanished: {path}")]
    Vanished { path: PathBuf },

    #[error("[BDH-3900] runtime failure: {details}")]
    Runtime { details: String },
}

impl BdhError {
    /// Stable machine-parseable error code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::InvalidConfig { .. } => "BDH-1001",
            Self::ConfigParse { .. } => "BDH-1002",
            Self::UnsupportedKernel { .. } => "BDH-1101",
            Self::MountParse { .. } => "BDH-2001",
            Self::NotBtrfs { .. } => "BDH-2002",
            Self::VolumeResolve { .. } => "BDH-2003",
            Self::Sql { .. } => "BDH-2101",
            Self::Serialization { .. } => "BDH-2102",
            Self::PermissionDenied { .. } => "BDH-3001",
            Self::Io { .. } => "BDH-3002",
            Self::Ioctl { .. } => "BDH-3003",
            Self::Vanished { .. } => "BDH-3004",
            Self::Runtime { .. } => "BDH-3900",
        }
    }

    /// Whether retrying might resolve the failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Io { .. }
                | Self::Ioctl { .. }
                | Self::Sql { .. }
                | Self::Vanished { .. }
                | Self::Runtime { .. }
        )
    }

    /// Convenience constructor for IO errors with a known path.
    #[must_use]
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Classify an errno from one of the btrfs/attr ioctls.
    ///
    /// EPERM/EACCES, ENOENT, and ENOTTY/EOPNOTSUPP have dedicated kinds the
    /// orchestrator keys its abort policy on; everything else is plain IO.
    #[must_use]
    pub fn from_ioctl_errno(op: &'static str, path: &Path, errno: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match errno.raw_os_error() {
            Some(libc::EPERM) | Some(libc::EACCES) => Self::PermissionDenied {
                path: path.to_path_buf(),
            },
            Some(libc::ENOENT) => Self::Vanished {
                path: path.to_path_buf(),
            },
            Some(libc::ENOTTY) | Some(libc::EOPNOTSUPP) => Self::UnsupportedKernel {
                feature: op,
                details: errno.to_string(),
            },
            _ if errno.kind() == ErrorKind::NotFound => Self::Vanished {
                path: path.to_path_buf(),
            },
            _ => Self::Ioctl { op, source: errno },
        }
    }
}

impl From<rusqlite::Error> for BdhError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sql {
            context: "rusqlite",
            details: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for BdhError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            context: "serde_json",
            details: value.to_string(),
        }
    }
}

impl From<toml::de::Error> for BdhError {
    fn from(value: toml::de::Error) -> Self {
        Self::ConfigParse {
            context: "toml",
            details: value.to_string(),
        }
    }
}
