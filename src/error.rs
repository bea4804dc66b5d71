use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Invalid file: {0}")]
    InvalidFormat(String),

    #[error("Invalid magic: expected {expected}, got {actual}")]
    InvalidMagic { expected: String, actual: String },

    #[error("Unsupported file version: {0}")]
    UnsupportedVersion(String),

    #[error("Unsupported data type: {0}")]
    UnsupportedDataType(String),

    #[error("Metadata parse error: {0}")]
    MetadataParse(String),

    #[error("UTF-16 decoding error: {0}")]
    Utf16Decode(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TIFF error: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("No registered reader recognizes {}", path.display())]
    NoSuitableReader { path: PathBuf },

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, ReaderError>;
