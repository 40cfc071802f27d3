// src/boxes.rs

use crate::document::Document;
use crate::error::{ReceiptError, Result};
use crate::gemini::{VisionRequest, VisionService};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

const STAGE: &str = "bounding box";

const BOX_PROMPT: &str = r#"Analyze the uploaded PDF document. Identify every distinct financial receipt, settlement report, or financial summary block on each page.
For each identified block, provide its normalized bounding box coordinates [x_min, y_min, x_max, y_max],
where coordinates are scaled from 0 to 1000 across the page width and height.
Output the result as a single JSON object matching the provided schema exactly."#;

/// Pages -> receipts -> coordinates, in Gemini's OpenAPI schema dialect.
pub fn response_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "bboxes": {
                "type": "ARRAY",
                "description": "A list of pages, where each page contains a list of receipts/bounding boxes.",
                "items": {
                    "type": "ARRAY",
                    "description": "A list of normalized bounding boxes for a single page.",
                    "items": {
                        "type": "ARRAY",
                        "description": "The bounding box [x_min, y_min, x_max, y_max] normalized from 0 to 1000.",
                        "items": {
                            "type": "NUMBER",
                            "description": "A single normalized coordinate value (0-1000)."
                        }
                    }
                }
            }
        },
        "required": ["bboxes"]
    })
}

/// Boxes per page, in page order. The innermost lists are left undecoded so
/// that one malformed box is rejected by the cropper instead of failing the batch.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageBoxes {
    #[serde(default)]
    pub bboxes: Vec<Vec<Vec<Value>>>,
}

impl PageBoxes {
    pub fn is_empty(&self) -> bool {
        self.bboxes.iter().all(|page| page.is_empty())
    }

    pub fn receipts_per_page(&self) -> Vec<usize> {
        self.bboxes.iter().map(Vec::len).collect()
    }
}

fn decode_boxes(text: &str) -> Result<PageBoxes> {
    serde_json::from_str(text.trim())
        .map_err(|e| ReceiptError::extraction(STAGE, format!("response does not match the box schema: {e}")))
}

/// Ask the service where the receipts are on every page.
pub async fn extract_boxes(service: &dyn VisionService, document: &Document) -> Result<PageBoxes> {
    let text = service
        .generate(
            STAGE,
            VisionRequest {
                data: &document.bytes,
                mime_type: document.mime_type,
                prompt: BOX_PROMPT,
                response_schema: Some(response_schema()),
            },
        )
        .await?;

    let boxes = decode_boxes(&text)?;
    info!(
        pages = boxes.bboxes.len(),
        receipts = boxes.receipts_per_page().iter().sum::<usize>(),
        "Bounding boxes received"
    );
    Ok(boxes)
}
