//! Error taxonomy for batch analysis.
//!
//! Every failure a batch can hit maps onto one [`ErrorKind`]. Per-unit
//! failures are recorded with their kind under the best-effort policy;
//! batch-level kinds always escalate to the caller.

use crate::results::AnnotationRef;
use std::fmt;
use std::path::PathBuf;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the fetcher, template manager, driver and publisher.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Remote store unreachable or a read failed. Not retried here.
    #[error("transport error at {location}: {message}")]
    Transport { location: String, message: String },

    /// Array metadata at a root is missing, malformed or unsupported.
    #[error("schema error at {location}: {message}")]
    Schema { location: String, message: String },

    /// Pipeline definition absent or unparsable.
    #[error("failed to load pipeline template {path}: {message}")]
    TemplateLoad { path: PathBuf, message: String },

    /// Template has fewer stages than the acquisition prefix being stripped.
    #[error("pipeline template has {found} stages, expected at least {required}")]
    TemplateShape { found: usize, required: usize },

    /// A pipeline stage failed while running a clone.
    #[error("analysis failed in stage '{stage}': {message}")]
    AnalysisExecution { stage: String, message: String },

    /// A result column has a type the table schema cannot express.
    #[error("unsupported column '{column}': {message}")]
    UnsupportedColumn { column: String, message: String },

    /// Upload or link failed. `preserved` points at the locally kept table;
    /// `published` lists annotations created before the failure.
    #[error("publish failed: {message}")]
    Publish {
        message: String,
        preserved: Option<PathBuf>,
        published: Vec<AnnotationRef>,
    },

    /// Collection provider could not list children or serve pixels.
    #[error("collection provider error: {0}")]
    Provider(String),

    /// A unit exceeded the configured per-unit timeout.
    #[error("unit timed out after {0}s")]
    Timeout(u64),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Discriminant of [`Error`], stored in failure records and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Transport,
    Schema,
    TemplateLoad,
    TemplateShape,
    AnalysisExecution,
    UnsupportedColumn,
    Publish,
    Provider,
    Timeout,
    Config,
}

impl Error {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transport { .. } => ErrorKind::Transport,
            Error::Schema { .. } => ErrorKind::Schema,
            Error::TemplateLoad { .. } => ErrorKind::TemplateLoad,
            Error::TemplateShape { .. } => ErrorKind::TemplateShape,
            Error::AnalysisExecution { .. } => ErrorKind::AnalysisExecution,
            Error::UnsupportedColumn { .. } => ErrorKind::UnsupportedColumn,
            Error::Publish { .. } => ErrorKind::Publish,
            Error::Provider(_) => ErrorKind::Provider,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether this error ends the whole batch regardless of failure policy.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::TemplateLoad
                | ErrorKind::TemplateShape
                | ErrorKind::UnsupportedColumn
                | ErrorKind::Publish
                | ErrorKind::Config
        )
    }

    pub(crate) fn transport(location: impl Into<String>, err: impl fmt::Display) -> Self {
        Error::Transport {
            location: location.into(),
            message: err.to_string(),
        }
    }

    pub(crate) fn schema(location: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Schema {
            location: location.into(),
            message: message.into(),
        }
    }

    pub(crate) fn publish(err: impl fmt::Display, preserved: Option<PathBuf>) -> Self {
        Error::Publish {
            message: err.to_string(),
            preserved,
            published: Vec::new(),
        }
    }

    /// Attach the annotations that were published before this failure.
    pub(crate) fn with_published(self, refs: Vec<AnnotationRef>) -> Self {
        match self {
            Error::Publish { message, preserved, .. } => Error::Publish {
                message,
                preserved,
                published: refs,
            },
            other => Error::Publish {
                message: other.to_string(),
                preserved: None,
                published: refs,
            },
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Transport => "TransportError",
            ErrorKind::Schema => "SchemaError",
            ErrorKind::TemplateLoad => "TemplateLoadError",
            ErrorKind::TemplateShape => "TemplateShapeError",
            ErrorKind::AnalysisExecution => "AnalysisExecutionError",
            ErrorKind::UnsupportedColumn => "UnsupportedColumnError",
            ErrorKind::Publish => "PublishError",
            ErrorKind::Provider => "ProviderError",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Config => "ConfigError",
        };
        f.write_str(name)
    }
}
