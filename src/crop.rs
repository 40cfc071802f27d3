// src/crop.rs

use crate::error::{ReceiptError, Result};
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Upper bound of the normalized coordinate space.
pub const NORMALIZED_MAX: f64 = 1000.0;

/// Bounding box on the 0-1000 scale, independent of page resolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormalizedBox {
    pub x_min: f64,
    pub y_min: f64,
    pub x_max: f64,
    pub y_max: f64,
}

/// Pixel-space rectangle, `x_max`/`y_max` exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x_min: u32,
    pub y_min: u32,
    pub x_max: u32,
    pub y_max: u32,
}

impl PixelRect {
    pub fn is_degenerate(&self) -> bool {
        self.x_max <= self.x_min || self.y_max <= self.y_min
    }
}

impl fmt::Display for PixelRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {}, {})", self.x_min, self.y_min, self.x_max, self.y_max)
    }
}

impl NormalizedBox {
    /// Accepts exactly four numeric values `[x_min, y_min, x_max, y_max]`.
    pub fn from_values(values: &[Value]) -> Result<Self> {
        let coords = values.iter().map(Value::as_f64).collect::<Option<Vec<f64>>>();
        match coords.as_deref() {
            Some(&[x_min, y_min, x_max, y_max]) => Ok(Self {
                x_min,
                y_min,
                x_max,
                y_max,
            }),
            _ => Err(ReceiptError::MalformedBox(format!(
                "expected 4 numbers [x_min, y_min, x_max, y_max], got {}",
                Value::Array(values.to_vec())
            ))),
        }
    }

    /// Expand every side outward by `padding` and clamp into `[0, 1000]`.
    /// Padding outside `0..=1000`, or not finite, counts as no padding.
    pub fn padded(&self, padding: f64) -> Self {
        let padding = if (0.0..=NORMALIZED_MAX).contains(&padding) {
            padding
        } else {
            0.0
        };
        let clamp = |v: f64| v.clamp(0.0, NORMALIZED_MAX);
        Self {
            x_min: clamp(self.x_min - padding),
            y_min: clamp(self.y_min - padding),
            x_max: clamp(self.x_max + padding),
            y_max: clamp(self.y_max + padding),
        }
    }

    /// Scale each axis independently: `round(normalized * dimension / 1000)`.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        let scale = |v: f64, dim: u32| -> u32 {
            let px = (v * f64::from(dim) / NORMALIZED_MAX).round();
            px.clamp(0.0, f64::from(dim)) as u32
        };
        PixelRect {
            x_min: scale(self.x_min, width),
            y_min: scale(self.y_min, height),
            x_max: scale(self.x_max, width),
            y_max: scale(self.y_max, height),
        }
    }
}

/// The 1x1 stand-in returned for boxes that collapse after padding.
pub fn placeholder() -> DynamicImage {
    DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([255, 0, 0])))
}

/// Result of cropping one box.
#[derive(Debug, Clone)]
pub enum Cropped {
    Receipt(DynamicImage),
    /// The box collapsed; holds the 1x1 stand-in.
    Placeholder(DynamicImage),
}

impl Cropped {
    pub fn image(&self) -> &DynamicImage {
        match self {
            Cropped::Receipt(image) | Cropped::Placeholder(image) => image,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Cropped::Placeholder(_))
    }
}

/// Crop one receipt out of a rendered page.
///
/// A box that is degenerate after padding and pixel conversion does not fail:
/// a warning is logged and a 1x1 placeholder is returned so the rest of the
/// batch can continue.
pub fn crop(image: &DynamicImage, bbox: &NormalizedBox, padding: f64) -> Cropped {
    let (width, height) = image.dimensions();
    let rect = bbox.padded(padding).to_pixels(width, height);

    if rect.is_degenerate() {
        warn!(rect = %rect, "Invalid padded bounding box, using placeholder");
        return Cropped::Placeholder(placeholder());
    }

    Cropped::Receipt(image.crop_imm(
        rect.x_min,
        rect.y_min,
        rect.x_max - rect.x_min,
        rect.y_max - rect.y_min,
    ))
}

/// `<page_number>_<receipt_index>`, both 1-indexed.
pub fn crop_id(page_number: usize, receipt_index: usize) -> String {
    format!("{page_number}_{receipt_index}")
}

/// File stem of a saved crop: `P<page>_Receipt_<index>`.
pub fn crop_name(page_number: usize, receipt_index: usize) -> String {
    format!("P{page_number}_Receipt_{receipt_index}")
}

/// A crop written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct SavedCrop {
    pub page_number: usize,
    pub receipt_index: usize,
    pub path: PathBuf,
    pub placeholder: bool,
}

/// What happened to one box on one page.
#[derive(Debug)]
pub enum CropOutcome {
    Saved(SavedCrop),
    Skipped {
        page_number: usize,
        receipt_index: usize,
        reason: String,
    },
}

/// Crop every box on every page and save the images into `output_dir`.
///
/// `boxes` holds one entry per page with the raw coordinate lists returned by
/// the service. Only `min(pages, boxes)` pages are processed. Malformed boxes
/// are skipped with a warning; write failures abort the batch.
pub fn crop_pages(
    pages: &[DynamicImage],
    boxes: &[Vec<Vec<Value>>],
    padding: f64,
    output_dir: &Path,
) -> Result<Vec<CropOutcome>> {
    std::fs::create_dir_all(output_dir)?;

    if pages.len() != boxes.len() {
        warn!(
            rendered = pages.len(),
            with_boxes = boxes.len(),
            "Page count mismatch, processing only the shorter of the two"
        );
    }

    let mut outcomes = Vec::new();
    for (page_index, (page, page_boxes)) in pages.iter().zip(boxes).enumerate() {
        let page_number = page_index + 1;
        let span = tracing::info_span!("page", page = page_number);
        let _guard = span.enter();
        info!(receipts = page_boxes.len(), "Processing page");

        for (i, coords) in page_boxes.iter().enumerate() {
            let receipt_index = i + 1;
            let bbox = match NormalizedBox::from_values(coords) {
                Ok(b) => b,
                Err(e) => {
                    warn!(receipt = receipt_index, error = %e, "Skipping malformed coordinates");
                    outcomes.push(CropOutcome::Skipped {
                        page_number,
                        receipt_index,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let cropped = crop(page, &bbox, padding);
            let path = output_dir.join(format!("{}.png", crop_name(page_number, receipt_index)));
            cropped.image().save(&path)?;
            info!(id = %crop_id(page_number, receipt_index), path = %path.display(), "Saved receipt crop");

            outcomes.push(CropOutcome::Saved(SavedCrop {
                page_number,
                receipt_index,
                path,
                placeholder: cropped.is_placeholder(),
            }));
        }
    }
    Ok(outcomes)
}
