//! Error types for launcher operations.

use std::io;

/// Alias for `Result<T, nsbox::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by launcher operations.
///
/// None of these are retried: every variant ends the invocation with
/// status 1 and a fresh invocation starts over from scratch.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Missing privilege, unusable prefix, or ownership mismatch.
    #[error("{0}")]
    Config(String),

    /// A namespace, process-creation, or pipe syscall failed.
    #[error("{context}")]
    Kernel {
        /// What the launcher was doing.
        context: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Connecting to or talking with the spawn daemon failed.
    #[error("{context}")]
    Transport {
        /// What the launcher was doing.
        context: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Any other I/O error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Wraps a kernel-level failure with context.
    pub(crate) fn kernel(context: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::Kernel {
            context: context.into(),
            source: source.into(),
        }
    }

    /// Wraps a daemon transport failure with context.
    pub(crate) fn transport(context: impl Into<String>, source: impl Into<io::Error>) -> Self {
        Self::Transport {
            context: context.into(),
            source: source.into(),
        }
    }
}
