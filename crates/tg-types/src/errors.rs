use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One of the five files that make up a run's artifact bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactComponent {
    Params,
    LabelEncoder,
    Tokenizer,
    Weights,
    Performance,
}

impl ArtifactComponent {
    pub const ALL: [ArtifactComponent; 5] = [
        ArtifactComponent::Params,
        ArtifactComponent::LabelEncoder,
        ArtifactComponent::Tokenizer,
        ArtifactComponent::Weights,
        ArtifactComponent::Performance,
    ];

    /// File name of the component inside an artifact location
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::Params => "params.json",
            Self::LabelEncoder => "label_encoder.json",
            Self::Tokenizer => "tokenizer.json",
            Self::Weights => "model.bin",
            Self::Performance => "performance.json",
        }
    }
}

impl fmt::Display for ArtifactComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Params => "params",
            Self::LabelEncoder => "label encoder",
            Self::Tokenizer => "tokenizer",
            Self::Weights => "model weights",
            Self::Performance => "performance report",
        };
        write!(f, "{name} ({})", self.file_name())
    }
}

/// Main error type for the Tagifai system
#[derive(Error, Debug)]
pub enum TgError {
    #[error("Run not found: {id}")]
    RunNotFound { id: String },

    #[error("Artifact corruption in {component}: {message}")]
    ArtifactCorruption {
        component: ArtifactComponent,
        message: String,
    },

    #[error("Failed to parse {path}: {message}")]
    Parse { path: String, message: String },

    #[error("Search exhausted: no trial of study '{study}' completed ({attempted} attempted)")]
    SearchExhausted { study: String, attempted: usize },

    #[error("Upstream failure: {0}")]
    Upstream(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Tracking error: {0}")]
    Tracking(#[from] TrackingError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl TgError {
    pub fn run_not_found(id: impl Into<String>) -> Self {
        Self::RunNotFound { id: id.into() }
    }

    pub fn corruption(component: ArtifactComponent, message: impl fmt::Display) -> Self {
        Self::ArtifactCorruption {
            component,
            message: message.to_string(),
        }
    }

    pub fn parse(path: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::Parse {
            path: path.to_string(),
            message: message.to_string(),
        }
    }

    /// Wrap a collaborator's own error without reinterpreting it
    pub fn upstream<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Upstream(Box::new(error))
    }

    /// Component named by an `ArtifactCorruption` error
    pub fn corrupted_component(&self) -> Option<ArtifactComponent> {
        match self {
            Self::ArtifactCorruption { component, .. } => Some(*component),
            _ => None,
        }
    }
}

/// Errors raised by the run tracking backend
#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("Experiment not found: {name}")]
    ExperimentNotFound { name: String },

    #[error("Run {run_id} is not active")]
    RunNotActive { run_id: String },

    #[error("Artifacts of run {run_id} are already published")]
    AlreadyPublished { run_id: String },

    #[error("Corrupt run metadata at {path}: {message}")]
    CorruptMetadata { path: String, message: String },
}

/// Result type alias for Tagifai operations
pub type TgResult<T> = Result<T, TgError>;

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::TgError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::TgError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::TgError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_names_component() {
        let error = TgError::corruption(ArtifactComponent::Weights, "file is missing");
        let message = error.to_string();

        assert!(message.contains("model weights"));
        assert!(message.contains("model.bin"));
        assert_eq!(error.corrupted_component(), Some(ArtifactComponent::Weights));
    }

    #[test]
    fn test_error_conversion() {
        let tracking = TrackingError::RunNotActive {
            run_id: "abc".to_string(),
        };
        let error: TgError = tracking.into();

        match error {
            TgError::Tracking(_) => (),
            _ => panic!("Expected Tracking error"),
        }
    }

    #[test]
    fn test_upstream_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "gpu fell over");
        let error = TgError::upstream(io);

        assert!(error.to_string().contains("gpu fell over"));
        assert!(std::error::Error::source(&error).is_some());
    }

    #[test]
    fn test_component_file_names_are_distinct() {
        let mut names: Vec<_> = ArtifactComponent::ALL.iter().map(|c| c.file_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_macros() {
        let _validation_err = validation_error!("Invalid value: {}", 42);
        let _internal_err = internal_error!("Something went wrong");
        let _config_err = config_error!("Missing required field: {}", "lr");
    }
}
