//! Error taxonomy for route compilation and reconciliation
//!
//! Compile, duplicate-alias and start/stop errors are always attributed to a
//! subject (label key, alias, container or provider name) and collected rather
//! than aborting a whole batch. `ErrorList` is the aggregate handed back to
//! callers alongside best-effort results.

use std::fmt;
use thiserror::Error;

/// A single attributed error from compilation or reconciliation
#[derive(Debug, Error)]
pub enum RouteError {
    /// Malformed label key (missing segments, empty alias, ...)
    #[error("invalid label `{label}`: {reason}")]
    InvalidLabel { label: String, reason: String },

    /// Attribute name not in the decoder table
    #[error("unknown attribute `{attribute}` in label `{label}`")]
    UnknownAttribute { label: String, attribute: String },

    /// Attribute value failed to decode into the expected shape
    #[error("invalid value for `{label}`: {reason}")]
    InvalidValue { label: String, reason: String },

    /// `#N` / `$N` target whose reference is not an integer at all
    #[error("alias reference `{reference}` in `{label}` is not a number")]
    AliasRefNotInteger { label: String, reference: String },

    /// `#N` / `$N` target outside [1, alias count]
    #[error("alias reference `{reference}` in `{label}` out of range (container declares {alias_count} aliases)")]
    AliasRefOutOfRange {
        label: String,
        reference: String,
        alias_count: usize,
    },

    /// The same alias declared by more than one source in a single pass
    #[error("duplicated alias `{alias}` (from `{first}` and `{second}`)")]
    DuplicateAlias {
        alias: String,
        first: String,
        second: String,
    },

    /// Container runtime or agent unreachable
    #[error("connection to `{host}` failed: {reason}")]
    Connection { host: String, reason: String },

    /// A route failed to start or shut down cleanly
    #[error("route `{alias}` failed to {action}: {reason}")]
    RouteLifecycle {
        alias: String,
        action: &'static str,
        reason: String,
    },

    /// Declarative document failed to parse or validate
    #[error("invalid route document `{path}`: {reason}")]
    InvalidDocument { path: String, reason: String },

    /// Recovered panic in a flush handler or task callback
    #[error("recovered panic in `{task}`: {message}")]
    Panic { task: String, message: String },
}

impl RouteError {
    pub fn connection(host: impl Into<String>, err: impl fmt::Display) -> Self {
        RouteError::Connection {
            host: host.into(),
            reason: err.to_string(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, RouteError::Connection { .. })
    }
}

/// An aggregate of attributed errors with a context line.
///
/// Empty lists are the success case; callers check `is_empty` and decide
/// whether "some valid routes + some errors" is acceptable (hot reload) or
/// fatal (initial startup).
#[derive(Debug, Default)]
pub struct ErrorList {
    context: String,
    errors: Vec<RouteError>,
}

impl ErrorList {
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            errors: Vec::new(),
        }
    }

    pub fn push(&mut self, err: RouteError) {
        self.errors.push(err);
    }

    pub fn extend(&mut self, other: ErrorList) {
        self.errors.extend(other.errors);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteError> {
        self.errors.iter()
    }

    /// True when every collected error is a connection error, meaning the
    /// source was unreachable but no definition was actually invalid.
    pub fn all_connection(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(RouteError::is_connection)
    }

    /// Consume into `Err` when non-empty, for call sites that treat any
    /// collected error as fatal.
    pub fn into_result(self) -> Result<(), ErrorList> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "{} error(s)", self.errors.len())?;
        } else {
            write!(f, "{}: {} error(s)", self.context, self.errors.len())?;
        }
        for err in &self.errors {
            write!(f, "\n  - {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}
