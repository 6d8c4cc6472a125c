//! Error handling for kinema.
//!
//! Provides a unified error handling system based on gRPC status codes,
//! with mapping from various underlying errors to appropriate categories.
//!
//! # Error Categories
//!
//! Errors are categorized into standard types that map to HTTP status codes:
//! * Resource state (404, 409)
//! * Client errors (400, 429)
//! * Server errors (500, 501, 503)
//! * Timeouts and cancellation (499, 504)
//!
//! # Example
//!
//! ```rust
//! use kinema::error::{Error, ErrorKind, Result};
//!
//! fn do_something() -> Result<()> {
//!     // Create typed errors
//!     if condition {
//!         return Err(Error::not_found("track doesn't exist"));
//!     }
//!
//!     // Convert from standard errors
//!     let file = std::fs::File::open("movie.mkv")?;
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
    /// Allows accessing the original error when its concrete type is known.
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

/// Standard result type for kinema operations.
///
/// Wraps the standard `Result` type with our custom [`struct@Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories based on gRPC status codes.
///
/// Each variant:
/// * Maps to a specific HTTP status code
/// * Represents a distinct failure category
/// * Carries a standard error message
///
/// See [gRPC status codes](https://github.com/googleapis/googleapis/blob/master/google/rpc/code.proto)
/// for the original definitions.
#[expect(clippy::module_name_repetitions)]
#[derive(Clone, Copy, Debug, Eq, Error, Hash, Ord, PartialEq, PartialOrd)]
pub enum ErrorKind {
    /// HTTP Mapping: 499 Client Closed Request
    #[error("Operation was cancelled")]
    Cancelled = 1,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("Unknown error")]
    Unknown = 2,

    /// HTTP Mapping: 400 Bad Request
    #[error("Invalid argument specified")]
    InvalidArgument = 3,

    /// HTTP Mapping: 504 Gateway Timeout
    #[error("Operation timed out")]
    DeadlineExceeded = 4,

    /// HTTP Mapping: 404 Not Found
    #[error("Not found")]
    NotFound = 5,

    /// HTTP Mapping: 409 Conflict
    #[error("Attempt to create what already exists")]
    AlreadyExists = 6,

    /// HTTP Mapping: 403 Forbidden
    #[error("Permission denied")]
    PermissionDenied = 7,

    /// HTTP Mapping: 429 Too Many Requests
    #[error("Resource has been exhausted")]
    ResourceExhausted = 8,

    /// HTTP Mapping: 400 Bad Request
    #[error("Invalid state")]
    FailedPrecondition = 9,

    /// HTTP Mapping: 409 Conflict
    #[error("Operation aborted")]
    Aborted = 10,

    /// HTTP Mapping: 400 Bad Request
    #[error("Out of range")]
    OutOfRange = 11,

    /// HTTP Mapping: 501 Not Implemented
    #[error("Not implemented")]
    Unimplemented = 12,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("Internal error")]
    Internal = 13,

    /// HTTP Mapping: 503 Service Unavailable
    #[error("Service unavailable")]
    Unavailable = 14,

    /// HTTP Mapping: 500 Internal Server Error
    #[error("Unrecoverable data loss or corruption")]
    DataLoss = 15,
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
        /// Creates an error for operations that were interrupted mid-execution.
        ///
        /// Maps to HTTP 409 Conflict. Use when an operation couldn't complete
        /// due to conflicting changes or state, e.g. a demux read preempted
        /// by a newer seek.
        aborted,
        Aborted
    );

    error_constructor!(
        /// Creates an error for duplicate resource creation attempts.
        ///
        /// Maps to HTTP 409 Conflict.
        already_exists,
        AlreadyExists
    );

    error_constructor!(
        /// Creates an error for cancelled operations.
        ///
        /// Maps to HTTP 499 Client Closed Request. Use when an operation
        /// was cancelled before completion, e.g. a source read discarded
        /// during `close()`.
        cancelled,
        Cancelled
    );

    error_constructor!(
        /// Creates an error for data corruption or loss.
        ///
        /// Maps to HTTP 500 Internal Server Error. Use when bitstream data
        /// has been corrupted or lost in an unrecoverable way.
        data_loss,
        DataLoss
    );

    error_constructor!(
        /// Creates an error for operations that exceeded their deadline.
        ///
        /// Maps to HTTP 504 Gateway Timeout. Use when an operation took
        /// longer than its allowed time, e.g. a stuck in-flight parser call.
        deadline_exceeded,
        DeadlineExceeded
    );

    error_constructor!(
        /// Creates an error for operations that failed due to current state.
        ///
        /// Maps to HTTP 400 Bad Request. Use when an operation cannot proceed
        /// due to the current session state, e.g. `play()` before `load()`.
        failed_precondition,
        FailedPrecondition
    );

    error_constructor!(
        /// Creates an error for internal errors.
        ///
        /// Maps to HTTP 500 Internal Server Error. Use for unexpected
        /// internal errors that shouldn't occur during normal operation.
        internal,
        Internal
    );

    error_constructor!(
        /// Creates an error for invalid arguments.
        ///
        /// Maps to HTTP 400 Bad Request. Use when provided arguments
        /// don't meet validation requirements, e.g. a malformed codec
        /// configuration record.
        invalid_argument,
        InvalidArgument
    );

    error_constructor!(
        /// Creates an error for missing resources.
        ///
        /// Maps to HTTP 404 Not Found. Use when a requested resource
        /// doesn't exist, e.g. selecting an unknown track id.
        not_found,
        NotFound
    );

    error_constructor!(
        /// Creates an error for values outside valid range.
        ///
        /// Maps to HTTP 400 Bad Request.
        out_of_range,
        OutOfRange
    );

    error_constructor!(
        /// Creates an error for permission denied conditions.
        ///
        /// Maps to HTTP 403 Forbidden. Use for CORS-style rejections and
        /// fatal 4xx responses from the media server.
        permission_denied,
        PermissionDenied
    );

    error_constructor!(
        /// Creates an error for exhausted resources.
        ///
        /// Maps to HTTP 429 Too Many Requests. Use when a resource limit
        /// has been reached, e.g. a second preview request while one is
        /// still in flight.
        resource_exhausted,
        ResourceExhausted
    );

    error_constructor!(
        /// Creates an error for unavailable services.
        ///
        /// Maps to HTTP 503 Service Unavailable. Use when the service is
        /// temporarily unavailable, e.g. the network is offline.
        unavailable,
        Unavailable
    );

    error_constructor!(
        /// Creates an error for unimplemented features.
        ///
        /// Maps to HTTP 501 Not Implemented.
        unimplemented,
        Unimplemented
    );

    error_constructor!(
        /// Creates an error for unknown errors.
        ///
        /// Maps to HTTP 500 Internal Server Error. Use when the error
        /// doesn't fit any other category.
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
    /// Maps standard IO errors to their logical equivalents:
    /// * `NotFound` -> `NotFound`
    /// * `PermissionDenied` -> `PermissionDenied`
    /// * `ConnectionReset` -> `Aborted`
    /// * etc.
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match err.kind() {
            NotFound => Self::not_found(err),
            PermissionDenied => Self::permission_denied(err),
            AddrInUse | AlreadyExists => Self::already_exists(err),
            AddrNotAvailable | ConnectionRefused | NotConnected => Self::unavailable(err),
            BrokenPipe | ConnectionReset | ConnectionAborted => Self::aborted(err),
            Interrupted | WouldBlock => Self::cancelled(err),
            UnexpectedEof => Self::data_loss(err),
            TimedOut => Self::deadline_exceeded(err),
            InvalidInput | InvalidData => Self::invalid_argument(err),
            WriteZero => Self::resource_exhausted(err),
            _ => Self::unknown(err),
        }
    }
}

impl From<reqwest::Error> for Error {
    /// Converts HTTP client errors into appropriate error kinds.
    ///
    /// Maps HTTP errors based on their nature:
    /// * Body errors -> `DataLoss`
    /// * Decode errors -> `InvalidArgument`
    /// * Connect errors -> `Unavailable`
    /// * Timeout errors -> `DeadlineExceeded`
    /// * etc.
    fn from(err: reqwest::Error) -> Self {
        if err.is_body() {
            return Self::data_loss(err);
        }

        if err.is_decode() {
            return Self::invalid_argument(err);
        }

        if err.is_builder() {
            return Self::internal(err);
        }

        if err.is_connect() || err.is_redirect() {
            return Self::unavailable(err);
        }

        if err.is_status() {
            return Self::failed_precondition(err);
        }

        if err.is_timeout() {
            return Self::deadline_exceeded(err);
        }

        Self::unknown(err)
    }
}

impl From<serde_json::Error> for Error {
    /// Converts JSON errors through IO error mapping.
    ///
    /// JSON errors are first converted to IO errors, then mapped
    /// using the IO error conversion rules.
    fn from(err: serde_json::Error) -> Self {
        std::io::Error::from(err).into()
    }
}

impl From<url::ParseError> for Error {
    /// Converts URL parsing errors to `InvalidArgument`.
    fn from(e: url::ParseError) -> Self {
        Self::invalid_argument(e.to_string())
    }
}

impl From<http::header::InvalidHeaderValue> for Error {
    /// Converts invalid header errors to `Internal`.
    fn from(e: http::header::InvalidHeaderValue) -> Self {
        Self::internal(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    /// Converts timeout errors to `DeadlineExceeded`.
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Self::deadline_exceeded(e.to_string())
    }
}

impl From<symphonia::core::errors::Error> for Error {
    /// Converts decoder errors into appropriate error kinds.
    ///
    /// Maps Symphonia errors:
    /// * `IoError` -> via the IO mapping
    /// * `DecodeError` -> `DataLoss`
    /// * `SeekError` -> `OutOfRange`
    /// * `Unsupported` -> `Unimplemented`
    /// * `LimitError` -> `ResourceExhausted`
    /// * `ResetRequired` -> `Internal`
    fn from(e: symphonia::core::errors::Error) -> Self {
        use symphonia::core::errors::Error::*;
        match e {
            IoError(e) => e.into(),
            DecodeError(e) => Self::data_loss(e),
            SeekError(_) => Self::out_of_range(e.to_string()),
            Unsupported(e) => Self::unimplemented(e),
            LimitError(e) => Self::resource_exhausted(e),
            ResetRequired => Self::internal(e.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for Error {
    /// Converts output stream construction errors to `Unavailable`.
    fn from(e: cpal::BuildStreamError) -> Self {
        Self::unavailable(e.to_string())
    }
}

impl From<cpal::PlayStreamError> for Error {
    /// Converts output stream start errors to `Unavailable`.
    fn from(e: cpal::PlayStreamError) -> Self {
        Self::unavailable(e.to_string())
    }
}

impl From<cpal::PauseStreamError> for Error {
    /// Converts output stream suspend errors to `Unavailable`.
    fn from(e: cpal::PauseStreamError) -> Self {
        Self::unavailable(e.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for Error {
    /// Converts missing default output configuration to `NotFound`.
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        Self::not_found(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_kinds_map_to_logical_equivalents() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.kind, ErrorKind::NotFound);

        let err: Error = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(err.kind, ErrorKind::DataLoss);

        let err: Error = std::io::Error::new(std::io::ErrorKind::TimedOut, "slow").into();
        assert_eq!(err.kind, ErrorKind::DeadlineExceeded);
    }

    #[test]
    fn display_includes_kind_and_detail() {
        let err = Error::not_found("track 7 not in session");
        assert_eq!(err.to_string(), "Not found: track 7 not in session");
    }

    #[test]
    fn downcast_recovers_concrete_type() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err: Error = io.into();
        assert!(err.downcast::<std::io::Error>().is_some());
        assert!(err.downcast::<std::fmt::Error>().is_none());
    }
}
