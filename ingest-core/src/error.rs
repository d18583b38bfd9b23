use serde::Serialize;
use std::fmt;

/// Pipeline step an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Config,
    Schema,
    Fetch,
    Normalize,
    Persist,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::Config => "config",
            Step::Schema => "schema",
            Step::Fetch => "fetch",
            Step::Normalize => "normalize",
            Step::Persist => "persist",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse classification reported to the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Transport,
    HttpStatus,
    Upstream,
    Parse,
    Schema,
    Write,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config_error",
            ErrorKind::Transport => "transport_error",
            ErrorKind::HttpStatus => "http_status_error",
            ErrorKind::Upstream => "upstream_error",
            ErrorKind::Parse => "parse_error",
            ErrorKind::Schema => "schema_error",
            ErrorKind::Write => "write_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a failed write is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailure {
    /// Connection-level problem; the same insert may succeed later.
    Transient,
    /// Constraint, type or statement problem; retrying cannot help.
    Fatal,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteFailure::Transient => f.write_str("transient"),
            WriteFailure::Fatal => f.write_str("fatal"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("weather API returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("weather API reported error {code} ({kind}): {info}")]
    Upstream {
        code: i64,
        kind: String,
        info: String,
    },

    #[error("malformed payload: {0}")]
    Parse(String),

    #[error("schema setup failed: {0}")]
    Schema(String),

    #[error("write failed ({failure}): {message}")]
    Write {
        failure: WriteFailure,
        message: String,
    },

    #[error("run cancelled before {0}")]
    Cancelled(Step),
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Config(_) => ErrorKind::Config,
            IngestError::Transport(_) => ErrorKind::Transport,
            IngestError::HttpStatus { .. } => ErrorKind::HttpStatus,
            IngestError::Upstream { .. } => ErrorKind::Upstream,
            IngestError::Parse(_) => ErrorKind::Parse,
            IngestError::Schema(_) => ErrorKind::Schema,
            IngestError::Write { .. } => ErrorKind::Write,
            IngestError::Cancelled(_) => ErrorKind::Cancelled,
        }
    }

    /// Only network blips and connection-level write failures are retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Transport(_)
                | IngestError::Write {
                    failure: WriteFailure::Transient,
                    ..
                }
        )
    }

    pub fn transient_write(message: impl Into<String>) -> Self {
        IngestError::Write {
            failure: WriteFailure::Transient,
            message: message.into(),
        }
    }

    pub fn fatal_write(message: impl Into<String>) -> Self {
        IngestError::Write {
            failure: WriteFailure::Fatal,
            message: message.into(),
        }
    }

    pub fn at(self, step: Step) -> StepError {
        StepError { step, source: self }
    }
}

/// An [`IngestError`] tagged with the step that produced it.
#[derive(Debug, thiserror::Error)]
#[error("{step}: {source}")]
pub struct StepError {
    pub step: Step,
    #[source]
    pub source: IngestError,
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
