use thiserror::Error;

pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Invalid configuration: {message}")]
    InvalidConfiguration { message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Already exists: {resource}")]
    AlreadyExists { resource: String },

    #[error("Resource exhausted: {resource}")]
    ResourceExhausted { resource: String },

    #[error("Invalid operation '{operation}': {reason}")]
    InvalidOperation { operation: String, reason: String },

    #[error("Conflict updating {resource}")]
    Conflict { resource: String },

    #[error("Invariant violated: {message}")]
    InvariantViolation { message: String },

    #[error("Store error: {message}")]
    Store { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),
}

impl MeshError {
    /// True for optimistic-concurrency failures from the node store; the only
    /// class of error the persistence retry loop retries.
    pub fn is_conflict(&self) -> bool {
        matches!(self, MeshError::Conflict { .. })
    }

    /// True for unrecoverable invariant breaches. A supervising layer should
    /// treat these as a crash signal rather than retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MeshError::InvariantViolation { .. })
    }
}
