//! Error types for Gridline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Configuration errors (fatal, raised before any job starts)
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unknown backend: {0}")]
    UnknownBackend(String),

    #[error("Matrix resolved to zero combinations")]
    EmptyMatrix,

    // Per-job errors
    #[error("Infrastructure error during {step}: {message}")]
    Infrastructure { step: String, message: String },

    #[error("Test failure: {0}")]
    TestFailure(String),

    // Build errors
    #[error("Build error: {0}")]
    Build(String),

    #[error("Unsatisfiable requirement for {package}: {reason}")]
    Unsatisfiable { package: String, reason: String },

    #[error("Import verification failed for modules: {modules:?}")]
    ImportVerification { modules: Vec<String> },

    // Lifecycle
    #[error("Trigger cancelled: {0}")]
    Cancelled(String),

    // Infrastructure plumbing
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification of an [`Error`], used when reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Infrastructure,
    TestFailure,
    Build,
    ImportVerification,
    Cancelled,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) | Error::UnknownBackend(_) | Error::EmptyMatrix => {
                ErrorKind::Configuration
            }
            Error::Infrastructure { .. } => ErrorKind::Infrastructure,
            Error::TestFailure(_) => ErrorKind::TestFailure,
            Error::Build(_) | Error::Unsatisfiable { .. } => ErrorKind::Build,
            Error::ImportVerification { .. } => ErrorKind::ImportVerification,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Io(_) | Error::Serialization(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn infrastructure(step: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Infrastructure {
            step: step.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::EmptyMatrix.kind(), ErrorKind::Configuration);
        assert_eq!(
            Error::UnknownBackend("oracle".into()).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            Error::infrastructure("provision", "timeout").kind(),
            ErrorKind::Infrastructure
        );
        assert_eq!(
            Error::Unsatisfiable {
                package: "pyarrow".into(),
                reason: "no versions".into()
            }
            .kind(),
            ErrorKind::Build
        );
        assert_eq!(
            Error::ImportVerification {
                modules: vec!["ibis.backends.duckdb".into()]
            }
            .kind(),
            ErrorKind::ImportVerification
        );
    }

    #[test]
    fn test_yaml_errors_are_configuration_errors() {
        let err: Error = serde_yaml::from_str::<Vec<String>>("{not: [a list")
            .unwrap_err()
            .into();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }
}
