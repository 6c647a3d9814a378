use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GenreError {
    #[error("Input not found: {}", .0.display())]
    InputNotFound(PathBuf),
    #[error("Audio decode error: {0}")]
    AudioDecode(String),
    #[error("Insufficient audio: {samples} samples, at least {required} needed for one window")]
    InsufficientAudio { samples: usize, required: usize },
    #[error("Feature extraction error: {0}")]
    FeatureExtraction(String),
    #[error("Model load error: {0}")]
    ModelLoad(String),
    #[error("Inference error: {0}")]
    Inference(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Recommendation lookup failed: {0}")]
    Recommendation(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Failure of any pipeline stage, wrapped at the service boundary.
    #[error("Audio processing failed: {0}")]
    AudioProcessing(#[source] Box<GenreError>),
}

impl GenreError {
    /// True when the caller supplied something unusable, as opposed to an
    /// internal failure of the pipeline or model.
    pub fn is_bad_input(&self) -> bool {
        match self {
            GenreError::InputNotFound(_)
            | GenreError::AudioDecode(_)
            | GenreError::InsufficientAudio { .. }
            | GenreError::Invalid(_) => true,
            GenreError::AudioProcessing(inner) => inner.is_bad_input(),
            _ => false,
        }
    }

    /// The innermost error, looking through `AudioProcessing` wrappers.
    pub fn root_cause(&self) -> &GenreError {
        match self {
            GenreError::AudioProcessing(inner) => inner.root_cause(),
            other => other,
        }
    }

    /// Translate a stage error for the service boundary. Missing input, short
    /// clips and invalid arguments keep their own variant so callers can give
    /// a specific diagnosis; everything else is wrapped.
    pub(crate) fn at_service_boundary(self) -> GenreError {
        match self {
            e @ GenreError::InputNotFound(_)
            | e @ GenreError::InsufficientAudio { .. }
            | e @ GenreError::Invalid(_)
            | e @ GenreError::AudioProcessing(_) => e,
            other => GenreError::AudioProcessing(Box::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, GenreError>;
