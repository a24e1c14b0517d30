//! Error handling for sluice.
//!
//! Provides a unified error handling system for the pipeline and its
//! collaborators, with mapping from various underlying errors to the
//! failure classes this domain actually produces.
//!
//! # Error Categories
//!
//! * Missing resources (a track file or URI that does not exist)
//! * Malformed arguments (unparseable URIs, invalid format parameters)
//! * Formats outside the sink's limits (the sample-rate validator's
//!   rejection path)
//! * Unsupported operations (seeking an unseekable source, a codec
//!   feature gap)
//! * Corrupt or truncated stream data
//! * Internal faults that indicate an implementation bug
//!
//! Pipeline control flow never travels as an `Error`: recoverable stream
//! events are halts, flushes and [`CodecSignal`](crate::codec::CodecSignal)
//! values, and observers see ordered state transitions, never error
//! objects.
//!
//! # Example
//!
//! ```rust
//! use sluice::error::{Error, ErrorKind, Result};
//!
//! fn do_something() -> Result<()> {
//!     // Create typed errors
//!     if condition {
//!         return Err(Error::not_found("resource doesn't exist"));
//!     }
//!
//!     // Convert from standard errors
//!     let file = std::fs::File::open("file.txt")?;
//!
//!     Ok(())
//! }
//! ```

#![allow(clippy::enum_glob_use)]

use std::fmt;
use thiserror::Error;

/// Main error type combining error kind and details.
///
/// Provides:
/// * Categorized error types ([`ErrorKind`])
/// * Underlying error details
/// * Conversion from common error types
#[derive(Debug)]
pub struct Error {
    /// Classification of the error
    pub kind: ErrorKind,

    /// Details of the underlying error
    pub error: Box<dyn std::error::Error + Send + Sync>,
}

impl Error {
    /// Attempts to downcast the underlying error to a concrete type.
    ///
    /// # Returns
    /// * `Some(&E)` - If the underlying error is of type `E`
    /// * `None` - If the underlying error is not of type `E`
    #[must_use]
    pub fn downcast<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        self.error.downcast_ref::<E>()
    }
}

/// Standard result type for sluice operations.
///
/// Wraps the standard `Result` type with our custom [`struct@Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// The failure classes the pipeline produces.
///
/// Each variant:
/// * Represents a distinct failure category
/// * Carries a standard error message
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// A track, file or stream that does not exist.
    #[error("Not found")]
    NotFound,

    /// An argument that fails validation: a malformed URI, an impossible
    /// format parameter.
    #[error("Invalid argument specified")]
    InvalidArgument,

    /// A value outside the configured limits, e.g. a sample rate the sink
    /// cannot animate.
    #[error("Out of range")]
    OutOfRange,

    /// An operation this build or the underlying source cannot perform.
    #[error("Not supported")]
    Unsupported,

    /// Unrecoverable data corruption, e.g. a stream that ends mid-frame.
    #[error("Unrecoverable data loss or corruption")]
    DataLoss,

    /// An inconsistency that should not occur during normal operation;
    /// indicates an implementation bug.
    #[error("Internal error")]
    Internal,

    /// An error that fits no other category.
    #[error("Unknown error")]
    Unknown,
}

macro_rules! error_constructor {
    ($(#[$meta:meta])* $name:ident, $kind:ident) => {
        $(#[$meta])*
        pub fn $name<E>(error: E) -> Self
        where
            E: Into<Box<dyn std::error::Error + Send + Sync>>,
        {
            Self {
                kind: ErrorKind::$kind,
                error: error.into(),
            }
        }
    };
}

impl Error {
    /// Creates a new error with specified kind and details.
    pub fn new<E>(kind: ErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: error.into(),
        }
    }

    error_constructor!(
        /// Creates an error for missing resources.
        not_found,
        NotFound
    );

    error_constructor!(
        /// Creates an error for invalid arguments.
        invalid_argument,
        InvalidArgument
    );

    error_constructor!(
        /// Creates an error for values outside configured limits.
        ///
        /// Use when a value exceeds its allowed bounds, e.g. a sample rate
        /// or channel count the sink cannot animate.
        out_of_range,
        OutOfRange
    );

    error_constructor!(
        /// Creates an error for unsupported operations.
        unsupported,
        Unsupported
    );

    error_constructor!(
        /// Creates an error for data corruption or loss.
        ///
        /// Use when data has been corrupted or lost in an unrecoverable
        /// way, e.g. a stream that ends mid-frame.
        data_loss,
        DataLoss
    );

    error_constructor!(
        /// Creates an error for unexpected internal faults.
        internal,
        Internal
    );

    error_constructor!(
        /// Creates an error for errors that fit no other category.
        unknown,
        Unknown
    );
}

impl std::error::Error for Error {
    /// Returns the underlying error source.
    ///
    /// This allows error chains to be examined for root causes.
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.error.source()
    }
}

impl fmt::Display for Error {
    /// Formats the error for display, showing both kind and details.
    ///
    /// Format: "{kind}: {details}"
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}: ", self.kind)?;
        self.error.fmt(fmt)
    }
}

impl From<std::io::Error> for Error {
    /// Converts IO errors into appropriate error kinds.
    ///
    /// Maps the IO errors file streaming actually raises to their logical
    /// equivalents:
    /// * `NotFound` -> `NotFound`
    /// * `UnexpectedEof`, `InvalidData` -> `DataLoss`
    /// * `InvalidInput` -> `InvalidArgument`
    /// * `Unsupported` -> `Unsupported`
    /// * everything else -> `Unknown`
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            UnexpectedEof | InvalidData => Self::data_loss(err),
            InvalidInput => Self::invalid_argument(err),
            Unsupported => Self::unsupported(err),
            _ => Self::unknown(err),
        }
    }
}

impl From<url::ParseError> for Error {
    /// Converts URL parsing errors to `InvalidArgument`.
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<std::fmt::Error> for Error {
    /// Converts formatting errors to `Unknown`.
    fn from(e: std::fmt::Error) -> Self {
        Self::unknown(e.to_string())
    }
}

impl From<std::num::ParseIntError> for Error {
    /// Converts integer parsing errors to `InvalidArgument`.
    fn from(e: std::num::ParseIntError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<std::sync::MutexGuard<'_, T>>> for Error {
    /// Converts mutex poisoning errors to `Internal`.
    fn from(e: std::sync::PoisonError<std::sync::MutexGuard<'_, T>>) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<symphonia::core::errors::Error> for Error {
    /// Converts decoder errors into appropriate error kinds.
    ///
    /// Maps decoder errors:
    /// * `IoError` -> via the IO error mapping
    /// * `DecodeError`, `LimitError` -> `DataLoss`
    /// * `SeekError`, `Unsupported` -> `Unsupported`
    /// * `ResetRequired` -> `Internal`
    fn from(e: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error::*;
        match e {
            IoError(e) => e.into(),
            DecodeError(e) => Self::data_loss(e),
            SeekError(_) => Self::unsupported(e.to_string()),
            Unsupported(e) => Self::unsupported(e),
            LimitError(e) => Self::data_loss(e),
            ResetRequired => Self::internal(e.to_string()),
        }
    }
}

#[cfg(feature = "binary")]
impl From<hound::Error> for Error {
    /// Converts WAV writer errors into appropriate error kinds.
    fn from(e: hound::Error) -> Self {
        use hound::Error::*;
        match e {
            IoError(e) => e.into(),
            TooWide | UnfinishedSample => Self::invalid_argument(e.to_string()),
            FormatError(e) => Self::data_loss(e),
            Unsupported => Self::unsupported("wav format not supported"),
            _ => Self::unknown(e.to_string()),
        }
    }
}
