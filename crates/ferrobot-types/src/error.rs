//! [`RobotError`] – the single error type shared by every ferrobot crate.
//!
//! Resource-local failures (validation, build, timeout) are parked on the
//! graph node and surfaced lazily through [`RobotError::NotAvailable`].
//! Structural failures (cycles, teardown errors) are aggregated with
//! [`RobotError::combine`] and returned from `reconfigure` / `close`.

use std::fmt;

use thiserror::Error;

use crate::name::ResourceName;

/// Global error type spanning graph, federation and resource failures.
///
/// Every variant is `Clone` so that a failure recorded on a graph node can
/// be handed to each caller that later asks for the resource.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RobotError {
    #[error("validation failed for {name}: {reason}")]
    Validation { name: String, reason: String },

    #[error("failed to build {name}: {reason}")]
    Build { name: String, reason: String },

    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("resource {0} not found")]
    NotFound(String),

    #[error("more than one remote resources with name {name} exists: {}", .candidates.join(", "))]
    AmbiguousName {
        name: String,
        candidates: Vec<String>,
    },

    #[error("remote {remote} is disconnected")]
    Disconnected { remote: String },

    #[error("resource {0} must be rebuilt")]
    MustRebuild(String),

    #[error("resource {name} is not available: {source}")]
    NotAvailable {
        name: String,
        source: Box<RobotError>,
    },

    #[error("resource {name} is waiting on dependencies: {}", .missing.join(", "))]
    Pending { name: String, missing: Vec<String> },

    #[error("cannot resolve dependencies of {name}: {reason}")]
    DependencyResolution { name: String, reason: String },

    #[error("no registration for api {api} with model {model}")]
    UnknownModel { api: String, model: String },

    #[error("resource {0} is closed")]
    Closed(String),

    #[error("operation {0} was cancelled")]
    Cancelled(String),

    #[error("{name} timed out after {after_ms}ms")]
    Timeout { name: String, after_ms: u64 },

    #[error("{0} is not implemented")]
    Unimplemented(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("process {id}: {reason}")]
    Process { id: String, reason: String },

    #[error("remote {remote}: {reason}")]
    Remote { remote: String, reason: String },

    #[error("{0}")]
    Multiple(MultiError),
}

impl RobotError {
    pub fn not_found(name: &ResourceName) -> Self {
        Self::NotFound(name.to_string())
    }

    pub fn must_rebuild(name: &ResourceName) -> Self {
        Self::MustRebuild(name.to_string())
    }

    pub fn closed(name: &ResourceName) -> Self {
        Self::Closed(name.to_string())
    }

    pub fn build(name: &ResourceName, reason: impl fmt::Display) -> Self {
        Self::Build {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn validation(name: &ResourceName, reason: impl fmt::Display) -> Self {
        Self::Validation {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn disconnected(remote: impl Into<String>) -> Self {
        Self::Disconnected {
            remote: remote.into(),
        }
    }

    /// Wrap a failure parked on `name` so callers see both the resource and
    /// the original cause.
    pub fn not_available(name: &ResourceName, source: RobotError) -> Self {
        Self::NotAvailable {
            name: name.to_string(),
            source: Box::new(source),
        }
    }

    pub fn is_must_rebuild(&self) -> bool {
        matches!(self, Self::MustRebuild(_))
    }

    pub fn is_disconnected(&self) -> bool {
        match self {
            Self::Disconnected { .. } => true,
            Self::NotAvailable { source, .. } => source.is_disconnected(),
            _ => false,
        }
    }

    /// Fold any number of errors into at most one.
    ///
    /// Nested [`RobotError::Multiple`] values are flattened so the result is
    /// never more than one level deep.
    pub fn combine(errors: impl IntoIterator<Item = RobotError>) -> Option<RobotError> {
        let mut multi = MultiError::default();
        for err in errors {
            multi.push(err);
        }
        multi.into_error()
    }
}

/// Aggregate of independent failures, e.g. several close errors during
/// teardown.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiError {
    pub errors: Vec<RobotError>,
}

impl MultiError {
    pub fn push(&mut self, err: RobotError) {
        match err {
            RobotError::Multiple(inner) => self.errors.extend(inner.errors),
            other => self.errors.push(other),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// `None` when empty, the sole error when there is one, otherwise
    /// [`RobotError::Multiple`].
    pub fn into_error(mut self) -> Option<RobotError> {
        match self.errors.len() {
            0 => None,
            1 => self.errors.pop(),
            _ => Some(RobotError::Multiple(self)),
        }
    }

    pub fn into_result(self) -> Result<(), RobotError> {
        match self.into_error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {err}")?;
        }
        Ok(())
    }
}
