//! Whole-document file helpers.
//!
//! Documents are read and replaced as a unit. Writes go to a sibling
//! temporary file first and are renamed into place, so readers never see
//! a half-written document.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::result::Result;

/// Read a JSON document. A missing or blank file yields `None`.
///
/// # Errors
///
/// Returns `FileReadFailed` if the file exists but cannot be read, and
/// `JsonParseFailed` if its contents are not valid JSON for `T`.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::file_read_failed(path, e.to_string())),
    };

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| Error::json_parse_failed(format!("{}: {e}", path.display())))
}

/// Replace a JSON document atomically.
///
/// # Errors
///
/// Returns `DirectoryCreationFailed` when the parent directory cannot be
/// created, `JsonEncodeFailed` when `value` cannot be serialized and
/// `FileWriteFailed` when writing or renaming fails.
pub async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::directory_creation_failed(parent, e.to_string()))?;
    }

    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|e| Error::json_encode_failed(format!("{}: {e}", path.display())))?;

    let temp = temp_path(path);
    tokio::fs::write(&temp, &bytes)
        .await
        .map_err(|e| Error::file_write_failed(&temp, e.to_string()))?;
    tokio::fs::rename(&temp, path)
        .await
        .map_err(|e| Error::file_write_failed(path, e.to_string()))
}

/// Read and decode a TOML document.
///
/// # Errors
///
/// Returns `FileReadFailed` if the file cannot be read and
/// `TomlParseFailed` if it does not decode into `T`.
pub async fn read_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::file_read_failed(path, e.to_string()))?;
    parse_toml(&text)
}

/// Decode a TOML document held in memory.
///
/// # Errors
///
/// Returns `TomlParseFailed` if `text` does not decode into `T`.
pub fn parse_toml<T: DeserializeOwned>(text: &str) -> Result<T> {
    toml::from_str(text).map_err(|e| Error::toml_parse_failed(e.to_string()))
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(OsString::from)
        .unwrap_or_else(|| OsString::from("document"));
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        size: u32,
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let doc: Option<Doc> = read_json(&dir.path().join("absent.json")).await.unwrap();
        assert!(doc.is_none());
    }

    #[tokio::test]
    async fn write_then_read_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        let doc = Doc {
            name: "workers".to_string(),
            size: 3,
        };

        write_json(&path, &doc).await.unwrap();
        let read: Option<Doc> = read_json(&path).await.unwrap();

        assert_eq!(read, Some(doc));
        assert!(!temp_path(&path).exists(), "temporary file should be renamed away");
    }

    #[tokio::test]
    async fn blank_file_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blank.json");
        tokio::fs::write(&path, "  \n").await.unwrap();
        let doc: Option<Doc> = read_json(&path).await.unwrap();
        assert!(doc.is_none());
    }

    #[tokio::test]
    async fn corrupt_json_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        let result: Result<Option<Doc>> = read_json(&path).await;
        assert!(matches!(result, Err(Error::JsonParseFailed { .. })));
    }

    #[test]
    fn parse_toml_reports_errors() {
        let ok: Doc = parse_toml("name = \"a\"\nsize = 1\n").unwrap();
        assert_eq!(ok.size, 1);
        let bad: Result<Doc> = parse_toml("name = ");
        assert!(matches!(bad, Err(Error::TomlParseFailed { .. })));
    }
}
