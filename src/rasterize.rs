// src/rasterize.rs

use crate::error::{ReceiptError, Result};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::info;

/// Turns a PDF into one image per page, in page order.
pub trait Rasterizer {
    fn rasterize(&self, pdf_path: &Path, dpi: u32) -> Result<Vec<DynamicImage>>;
}

/// Rasterizes through poppler's `pdftoppm`.
pub struct Pdftoppm {
    binary: PathBuf,
}

impl Pdftoppm {
    /// `location` may be the binary itself or the poppler `bin` directory.
    pub fn new(location: Option<&Path>) -> Self {
        let binary = match location {
            Some(p) if p.is_dir() => p.join("pdftoppm"),
            Some(p) => p.to_path_buf(),
            None => PathBuf::from("pdftoppm"),
        };
        Self { binary }
    }
}

impl Rasterizer for Pdftoppm {
    fn rasterize(&self, pdf_path: &Path, dpi: u32) -> Result<Vec<DynamicImage>> {
        let temp_dir = tempfile::tempdir()?;
        let prefix = temp_dir.path().join("page");

        info!(pdf = %pdf_path.display(), dpi, "Rasterizing PDF");
        let output = Command::new(&self.binary)
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg(pdf_path)
            .arg(&prefix)
            .output()
            .map_err(|e| {
                ReceiptError::Rasterize(format!(
                    "failed to execute {} (install poppler-utils or set crop.pdftoppm): {e}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            return Err(ReceiptError::Rasterize(format!(
                "pdftoppm failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let mut pages = Vec::new();
        for entry in std::fs::read_dir(temp_dir.path())? {
            let path = entry?.path();
            if let Some(number) = page_number(&path) {
                pages.push((number, path));
            }
        }
        pages.sort_by_key(|(number, _)| *number);

        let images = pages
            .iter()
            .map(|(_, path)| image::open(path).map_err(ReceiptError::from))
            .collect::<Result<Vec<_>>>()?;
        info!(pages = images.len(), "Pages rendered");
        Ok(images)
    }
}

/// pdftoppm names pages `page-1.png` or `page-01.png` depending on the page count.
fn page_number(path: &Path) -> Option<u32> {
    if path.extension()? != "png" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    stem.rsplit_once('-')?.1.parse().ok()
}
