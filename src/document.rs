// src/document.rs

use crate::error::Result;
use lopdf::Document as PdfDocument;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// An ingested batch file. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct Document {
    pub path: PathBuf,
    pub filename: String,
    pub bytes: Vec<u8>,
    pub mime_type: &'static str,
}

impl Document {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let doc = Self::from_bytes(path, bytes);
        info!(filename = %doc.filename, bytes = doc.bytes.len(), mime = doc.mime_type, "Document loaded");
        Ok(doc)
    }

    pub fn from_bytes(path: impl AsRef<Path>, bytes: Vec<u8>) -> Self {
        let path = path.as_ref().to_path_buf();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self {
            mime_type: guess_mime_type(&path),
            path,
            filename,
            bytes,
        }
    }

    /// Filename without its extension, used to name result files.
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.filename.clone())
    }

    pub fn is_pdf(&self) -> bool {
        self.mime_type == "application/pdf"
    }

    /// Hex sha256 of the document bytes.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Number of pages according to the PDF page tree. `None` for non-PDF
    /// inputs or when the structure cannot be parsed.
    pub fn page_count(&self) -> Option<usize> {
        if !self.is_pdf() {
            return None;
        }
        match PdfDocument::load_mem(&self.bytes) {
            Ok(doc) => Some(doc.get_pages().len()),
            Err(e) => {
                warn!(error = %e, filename = %self.filename, "Could not read PDF page tree");
                None
            }
        }
    }
}

fn guess_mime_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_from_extension() {
        let doc = Document::from_bytes("batches/22102025 ATP.PDF", vec![]);
        assert_eq!(doc.mime_type, "application/pdf");
        assert_eq!(doc.filename, "22102025 ATP.PDF");
        assert_eq!(doc.stem(), "22102025 ATP");
        assert!(doc.is_pdf());

        let scan = Document::from_bytes("scan.jpeg", vec![]);
        assert_eq!(scan.mime_type, "image/jpeg");
        assert_eq!(scan.page_count(), None);
    }

    #[test]
    fn fingerprint_depends_only_on_bytes() {
        let a = Document::from_bytes("a.pdf", b"same".to_vec());
        let b = Document::from_bytes("b.pdf", b"same".to_vec());
        let c = Document::from_bytes("a.pdf", b"other".to_vec());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn garbage_pdf_has_no_page_count() {
        let doc = Document::from_bytes("broken.pdf", b"this is not a pdf".to_vec());
        assert_eq!(doc.page_count(), None);
    }
}
