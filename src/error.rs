use std::path::PathBuf;

use thiserror::Error;

/// Failures that abort reconciliation of a single note. Sibling notes keep going.
#[derive(Debug, Error)]
pub enum NoteError {
    #[error("ParseError: malformed timestamp {value:?}")]
    Parse {
        value: String,
        #[source]
        source: chrono::ParseError,
    },
    #[error("WatermarkMissing: no last_update field in {}", .path.display())]
    WatermarkMissing { path: PathBuf },
    #[error("ReplaceExhausted: gave up replacing {} after {attempts} attempts", .path.display())]
    ReplaceExhausted {
        path: PathBuf,
        attempts: u32,
        #[source]
        source: std::io::Error,
    },
    #[error("IoError: {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl NoteError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        NoteError::Io {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HttpError: {0}")]
    Http(#[from] reqwest::Error),
    #[error("StatusError: {url} returned {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("DecodeError: {url}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("TemplateIoError: {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("MissingWatermark: header template {} has no last_update line", .path.display())]
    MissingWatermark { path: PathBuf },
    #[error("UnreadableWatermark: header template {} renders last_update as {value:?}", .path.display())]
    UnreadableWatermark { path: PathBuf, value: String },
}

pub fn unpack_error(err: &dyn std::error::Error) -> String {
    let mut parts = Vec::new();
    parts.push(err.to_string());
    let mut current = err.source();
    while let Some(source) = current {
        parts.push(source.to_string());
        current = source.source();
    }
    parts.join(": ")
}
