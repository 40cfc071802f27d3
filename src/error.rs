// src/error.rs

#[derive(Debug, thiserror::Error)]
pub enum ReceiptError {
    #[error("credential missing: set the {var} environment variable (or add it to .env)")]
    CredentialMissing { var: String },

    #[error("{stage} extraction failed: {reason}")]
    ExtractionFailed { stage: &'static str, reason: String },

    #[error("malformed bounding box: {0}")]
    MalformedBox(String),

    #[error("rasterization failed: {0}")]
    Rasterize(String),

    #[error("database error: {0}")]
    Persistence(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
}

impl ReceiptError {
    pub fn extraction(stage: &'static str, reason: impl Into<String>) -> Self {
        Self::ExtractionFailed {
            stage,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReceiptError>;
