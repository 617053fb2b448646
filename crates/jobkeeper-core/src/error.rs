use std::fmt;

/// Errors raised while resolving or invoking a handler.
#[derive(Debug, Clone, thiserror::Error, serde::Serialize, serde::Deserialize)]
pub enum JobError {
    #[error("handler not found: {0}")]
    HandlerNotFound(String),

    #[error("handler {0} does not satisfy the execute contract")]
    HandlerContractViolation(String),

    #[error("{0}")]
    HandlerFailure(String),
}

/// Main error type for jobkeeper
#[derive(Debug)]
pub enum Error {
    /// Configuration errors
    Config(String),

    /// Database errors (sqlx wrapped)
    Database(sqlx::Error),

    /// IO errors
    Io(std::io::Error),

    /// Serialization/deserialization errors
    Serialization(serde_json::Error),

    /// Unknown queue driver named in configuration
    UnknownDriver(String),

    /// Handler registry / handler execution errors
    Job(JobError),

    /// Generic errors with description
    Other(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(msg) => write!(f, "configuration error: {}", msg),
            Error::Database(e) => write!(f, "database error: {}", e),
            Error::Io(e) => write!(f, "io error: {}", e),
            Error::Serialization(e) => write!(f, "serialization error: {}", e),
            Error::UnknownDriver(name) => write!(f, "unknown queue driver: {}", name),
            Error::Job(e) => write!(f, "job error: {}", e),
            Error::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Database(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::Serialization(e) => Some(e),
            Error::Job(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(error: sqlx::Error) -> Self {
        Error::Database(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Io(error)
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Serialization(error)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Error::Config(error.to_string())
    }
}

impl From<JobError> for Error {
    fn from(error: JobError) -> Self {
        Error::Job(error)
    }
}

impl Error {
    /// Create a new configuration error
    pub fn config<T: Into<String>>(msg: T) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new generic error
    pub fn other<T: Into<String>>(msg: T) -> Self {
        Error::Other(msg.into())
    }

    /// Error category for logging/metrics classification
    pub fn category(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Database(_) => "database",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::UnknownDriver(_) => "config",
            Error::Job(_) => "job",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_category_classification() {
        assert_eq!(Error::config("bad").category(), "config");
        assert_eq!(Error::UnknownDriver("redis".into()).category(), "config");
    }

    #[test]
    fn job_error_display() {
        let err = JobError::HandlerNotFound("SendEmail".to_string());
        assert!(err.to_string().contains("SendEmail"));
    }
}
