use crate::broker::MessageId;
use crate::job::{JobId, JobStatus, StageName};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("input reference must not be empty")]
    EmptyInputRef,
    #[error("query is {len} characters long; the limit is {max}")]
    QueryTooLong { len: usize, max: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl StageError {
    pub fn transient(message: impl Into<String>) -> Self {
        StageError::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        StageError::Fatal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            StageError::Transient(message) | StageError::Fatal(message) => message,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    DuplicateId(JobId),
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is {actual}, expected {expected}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("job {id} is owned by {}, expected {expected}", .actual.as_deref().unwrap_or("nobody"))]
    OwnerConflict {
        id: JobId,
        expected: String,
        actual: Option<String>,
    },
    #[error("job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("job {id} update rejected: {reason}")]
    InvalidState { id: JobId, reason: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is closed")]
    Closed,
    #[error("delivery {0} is not known to the broker")]
    UnknownDelivery(MessageId),
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// Store or broker faults. These never become job failures; the operation is
/// retried through redelivery instead.
#[derive(Debug, thiserror::Error)]
pub enum InfrastructureError {
    #[error("job store: {0}")]
    Store(#[from] StoreError),
    #[error("broker: {0}")]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}

impl From<StoreError> for SubmitError {
    fn from(err: StoreError) -> Self {
        SubmitError::Infrastructure(err.into())
    }
}

impl From<BrokerError> for SubmitError {
    fn from(err: BrokerError) -> Self {
        SubmitError::Infrastructure(err.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error(transparent)]
    Infrastructure(#[from] InfrastructureError),
}

impl From<StoreError> for QueryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => QueryError::NotFound(id),
            other => QueryError::Infrastructure(other.into()),
        }
    }
}

impl From<BrokerError> for QueryError {
    fn from(err: BrokerError) -> Self {
        QueryError::Infrastructure(err.into())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no capability bound for stage(s): {}", join_stages(.0))]
    MissingBindings(Vec<StageName>),
}

fn join_stages(stages: &[StageName]) -> String {
    stages
        .iter()
        .map(StageName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid settings: {}", .0.join("; "))]
    Invalid(Vec<String>),
}
