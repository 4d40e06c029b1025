use std::path::PathBuf;
use thiserror::Error;

use crate::image_state::ExampleId;
use crate::session::SessionId;

/// Structured error types for the point-prompt segmentation demo.
///
/// Each variant carries the context of its own domain (filesystem, image
/// decoding, model execution, session bookkeeping) so the router can pick an
/// HTTP status without parsing messages.
#[derive(Error, Debug)]
pub enum SamDemoError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// 利用者が送った画像を扱えなかった
    #[error("Image processing error: {operation} failed (source: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Image work on the server side: registered examples, composition,
    /// response encoding.
    #[error("Rendering error: {operation} failed")]
    Rendering {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("No image has been loaded in this session")]
    NoImage,

    #[error("Example {0} is not registered")]
    UnknownExample(ExampleId),

    #[error("Session {0} does not exist")]
    UnknownSession(SessionId),
}

pub type Result<T> = std::result::Result<T, SamDemoError>;

impl SamDemoError {
    pub fn model(operation: impl Into<String>, message: impl Into<String>) -> Self {
        let message: String = message.into();
        Self::Model {
            operation: operation.into(),
            source: message.into(),
        }
    }

    pub fn rendering(operation: impl Into<String>, source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Rendering {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Whether the failure was caused by the request rather than the server.
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::NoImage | Self::ImageProcessing { .. }
        )
    }

    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::UnknownExample(_) | Self::UnknownSession(_))
    }
}

/// anyhow を返す依存先のエラーは設定エラーとして扱う
impl From<anyhow::Error> for SamDemoError {
    fn from(err: anyhow::Error) -> Self {
        Self::Configuration {
            message: err.to_string(),
        }
    }
}

/// Fallback for I/O errors raised without path context. Callers that know
/// the path construct `FileSystem` directly.
impl From<std::io::Error> for SamDemoError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

/// `image` errors raised without more context happen on server-owned
/// buffers. Client uploads are mapped to `ImageProcessing` where they are decoded.
impl From<image::ImageError> for SamDemoError {
    fn from(err: image::ImageError) -> Self {
        Self::Rendering {
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for SamDemoError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors only occur while building or reading tensors, so they count
/// as model errors.
impl From<ndarray::ShapeError> for SamDemoError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}
