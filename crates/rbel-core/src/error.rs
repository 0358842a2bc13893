//! Error types for the decoding core.

use thiserror::Error;

/// Core error type.
#[derive(Debug, Error)]
pub enum CoreError {
    /// IO error (reading config files or key folders).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key material could not be decoded.
    #[error("invalid key material for '{name}': {reason}")]
    KeyMaterial { name: String, reason: String },

    /// The converter dependency graph contains a cycle.
    #[error("converter dependency cycle involving: {0}")]
    ConverterCycle(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Failure raised by a single converter while working on one element.
///
/// These never escape the pipeline: they are logged and attached to the
/// offending element as an error note.
#[derive(Debug, Clone, Error)]
#[error("converter '{converter}' failed at {path}: {message}")]
pub struct ConversionError {
    /// Name of the converter that failed.
    pub converter: String,
    /// Path of the element the converter was working on.
    pub path: String,
    /// Failure description.
    pub message: String,
}

impl ConversionError {
    /// Creates an error that is not yet bound to a converter or element.
    ///
    /// The pipeline fills in `converter` and `path` when it catches it.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            converter: String::new(),
            path: String::new(),
            message: message.into(),
        }
    }

    /// Binds the error to the converter and element that produced it.
    pub fn bind(mut self, converter: &str, path: &str) -> Self {
        self.converter = converter.to_string();
        self.path = path.to_string();
        self
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_error_bind_sets_location() {
        let err = ConversionError::new("bad chunk size").bind("http", "$.body");
        assert_eq!(err.converter, "http");
        assert_eq!(err.path, "$.body");
        assert_eq!(
            err.to_string(),
            "converter 'http' failed at $.body: bad chunk size"
        );
    }

    #[test]
    fn key_material_error_display() {
        let err = CoreError::KeyMaterial {
            name: "k1".to_string(),
            reason: "odd length".to_string(),
        };
        assert!(err.to_string().contains("k1"));
    }
}
