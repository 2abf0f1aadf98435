//! Core error types for Steward operations.
//!
//! Every failure names the document it concerns.

use std::path::PathBuf;

use thiserror::Error;

/// Failure reading, writing or decoding a document.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot read '{path}': {reason}")]
    FileReadFailed { path: PathBuf, reason: String },

    #[error("cannot write '{path}': {reason}")]
    FileWriteFailed { path: PathBuf, reason: String },

    #[error("cannot create directory '{path}': {reason}")]
    DirectoryCreationFailed { path: PathBuf, reason: String },

    /// Stored bytes are not the expected JSON document.
    #[error("malformed JSON document: {reason}")]
    JsonParseFailed { reason: String },

    /// A value could not be turned into JSON.
    #[error("cannot encode JSON document: {reason}")]
    JsonEncodeFailed { reason: String },

    #[error("malformed TOML document: {reason}")]
    TomlParseFailed { reason: String },
}

impl Error {
    pub fn file_read_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileReadFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn file_write_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::FileWriteFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn directory_creation_failed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DirectoryCreationFailed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn json_parse_failed(reason: impl Into<String>) -> Self {
        Self::JsonParseFailed {
            reason: reason.into(),
        }
    }

    pub fn json_encode_failed(reason: impl Into<String>) -> Self {
        Self::JsonEncodeFailed {
            reason: reason.into(),
        }
    }

    pub fn toml_parse_failed(reason: impl Into<String>) -> Self {
        Self::TomlParseFailed {
            reason: reason.into(),
        }
    }

    /// Whether the failure is in the document's contents rather than in
    /// reaching it.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            Self::JsonParseFailed { .. } | Self::TomlParseFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_read_failed_names_path() {
        let err = Error::file_read_failed("/var/lib/steward/specs.json", "permission denied");
        let message = err.to_string();
        assert!(message.contains("/var/lib/steward/specs.json"));
        assert!(message.contains("permission denied"));
    }

    #[test]
    fn test_malformed_is_about_contents() {
        assert!(Error::toml_parse_failed("expected '='").is_malformed());
        assert!(!Error::json_encode_failed("key must be a string").is_malformed());
        assert!(!Error::file_write_failed("/tmp/x", "read-only").is_malformed());
    }
}
