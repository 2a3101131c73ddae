use std::path::PathBuf;
use thiserror::Error;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for the compositing pipeline.
///
/// The first four variants are the request-level taxonomy of the core stages:
/// they are fatal to the single image being processed and carry no partial
/// output. The remaining variants wrap the I/O and runtime collaborators the
/// orchestrator talks to. Numeric anomalies are not errors; they are reported
/// through `CompositeDiagnostics`.
#[derive(Error, Debug)]
pub enum CompositeError {
    #[error("Invalid input: {reason}")]
    InvalidInput { reason: String },

    #[error("Foreground extraction unavailable: {backend}")]
    ExtractionUnavailable {
        backend: String,
        #[source]
        source: Option<BoxedError>,
    },

    #[error("Invalid options: {field} {reason}")]
    InvalidOptions { field: String, reason: String },

    #[error("Dimension mismatch: {what} is {actual:?}, expected {expected:?}")]
    DimensionMismatch {
        what: String,
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("Background unavailable: {operation} failed")]
    BackgroundUnavailable {
        operation: String,
        #[source]
        source: BoxedError,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxedError,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxedError,
    },
}

pub type Result<T> = std::result::Result<T, CompositeError>;

impl CompositeError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn invalid_options(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidOptions {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn dimension_mismatch(what: impl Into<String>, expected: (u32, u32), actual: (u32, u32)) -> Self {
        Self::DimensionMismatch {
            what: what.into(),
            expected,
            actual,
        }
    }

    pub fn unavailable(backend: impl Into<String>) -> Self {
        Self::ExtractionUnavailable {
            backend: backend.into(),
            source: None,
        }
    }

    /// True for the precondition failures that must never be retried.
    pub const fn is_precondition(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput { .. } | Self::InvalidOptions { .. } | Self::DimensionMismatch { .. }
        )
    }
}

/// Convert anyhow errors to configuration errors.
///
/// anyhow only shows up at the binary boundary, where everything that fails
/// is a startup or configuration problem.
impl From<anyhow::Error> for CompositeError {
    fn from(err: anyhow::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that knows the path and operation should construct
/// `CompositeError::FileSystem` directly.
impl From<std::io::Error> for CompositeError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// Convert image crate errors to image processing errors.
impl From<image::ImageError> for CompositeError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

/// Convert ONNX Runtime errors to model errors.
impl From<ort::Error> for CompositeError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors only happen while reshaping inference tensors, so they are
/// model errors.
impl From<ndarray::ShapeError> for CompositeError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for CompositeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration {
            message: format!("settings document: {err}"),
        }
    }
}
