// src/fields.rs

use crate::document::Document;
use crate::error::{ReceiptError, Result};
use crate::gemini::{VisionRequest, VisionService};
use crate::receipt::ReceiptRecord;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const STAGE: &str = "field";

/// Instructions for transcribing every receipt in the batch.
const FIELD_PROMPT: &str = r#"Extract all text from these receipts.
There are multiple receipts, so extract all of them.
Output the response ONLY as a JSON array with one object per receipt.
Remove thousands separators (dots and commas) from amounts so that all numbers become integers.
Make all field names lowercase, and replace spaces with underscores.

There are multiple types of receipts:

Type 1. If the receipt is a financial report, extract these fields:
{
    "operator": string,
    "date": string,
    "tanggal": string,
    "total_sales": integer,
    "disc_item": integer,
    "disc_total": integer,
    "net_omset": integer,
    "voucher": integer,
    "cash_in_hand": integer,
    "total_omset": integer,
    "cash": integer,
    "edc_debit": {},
    "edc_settle": integer,
    "cashier_cash": integer,
    "surplus": integer
}

Type 2. If the receipt is a settlement receipt, extract these fields:
{
    "batch_id": string,
    "merch_id": string,
    "bank_name": string,
    "datetime": string,
    "debit": {
        "grand_total": integer,
        "sale": integer
    },
    "credit": {
        "grand_total": integer,
        "sale": integer,
        "issuer": string
    },
    "qris": {
        "grand_total": integer,
        "sale": integer
    }
}

If a requested field is not on the receipt, output it with the value null. Never omit a field.
Do not wrap the response in ```json fences."#;

/// The cleaned service output plus the records decoded from it.
#[derive(Debug, Clone)]
pub struct FieldExtraction {
    pub json: String,
    pub records: Vec<ReceiptRecord>,
}

/// Remove markdown code fences the model may add despite instructions.
pub fn strip_fences(text: &str) -> String {
    text.replace("```json", "").replace("```JSON", "").replace("```", "").trim().to_string()
}

/// Decode a batch of records: a JSON array, or a single object for one-receipt batches.
pub fn parse_records(text: &str) -> Result<Vec<ReceiptRecord>> {
    let cleaned = strip_fences(text);
    let value: Value = serde_json::from_str(&cleaned).map_err(|e| {
        ReceiptError::extraction(STAGE, format!("response is not valid JSON: {e}"))
    })?;

    let items = match value {
        Value::Array(items) => items,
        Value::Object(_) => vec![value],
        other => {
            return Err(ReceiptError::extraction(
                STAGE,
                format!("expected an array of receipts, got {other}"),
            ));
        }
    };

    let records: Vec<ReceiptRecord> = items.into_iter().map(ReceiptRecord::from_value).collect();
    for (i, record) in records.iter().enumerate() {
        if let ReceiptRecord::Unrecognized { reason, .. } = record {
            warn!(position = i + 1, reason = %reason, "Record does not match a known receipt shape");
        }
    }
    Ok(records)
}

/// Read a pre-extracted results file.
pub fn load_records(path: &Path) -> Result<FieldExtraction> {
    let text = std::fs::read_to_string(path)?;
    let records = parse_records(&text)?;
    info!(path = %path.display(), records = records.len(), "Loaded extracted records");
    Ok(FieldExtraction {
        json: strip_fences(&text),
        records,
    })
}

/// Ask the service to transcribe every receipt in the document.
pub async fn extract_fields(service: &dyn VisionService, document: &Document) -> Result<FieldExtraction> {
    let text = service
        .generate(
            STAGE,
            VisionRequest {
                data: &document.bytes,
                mime_type: document.mime_type,
                prompt: FIELD_PROMPT,
                response_schema: None,
            },
        )
        .await?;

    let records = parse_records(&text)?;
    let financial = records
        .iter()
        .filter(|r| matches!(r, ReceiptRecord::Financial(_)))
        .count();
    let settlement = records
        .iter()
        .filter(|r| matches!(r, ReceiptRecord::Settlement(_)))
        .count();
    info!(
        records = records.len(),
        financial,
        settlement,
        unrecognized = records.len() - financial - settlement,
        "Fields extracted"
    );

    Ok(FieldExtraction {
        json: strip_fences(&text),
        records,
    })
}

/// Write the extraction next to other results as `<document stem>.json`.
pub fn write_results(results_dir: &Path, document: &Document, extraction: &FieldExtraction) -> Result<PathBuf> {
    std::fs::create_dir_all(results_dir)?;
    let path = results_dir.join(format!("{}.json", document.stem()));
    let pretty = match serde_json::from_str::<Value>(&extraction.json) {
        Ok(value) => serde_json::to_string_pretty(&value)?,
        Err(_) => extraction.json.clone(),
    };
    std::fs::write(&path, pretty)?;
    info!(path = %path.display(), "Extraction results written");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::tests::CannedService;

    #[test]
    fn strips_residual_fences() {
        assert_eq!(strip_fences("```json\n[{\"a\": 1}]\n```\n"), "[{\"a\": 1}]");
        assert_eq!(strip_fences("  [1]  "), "[1]");
    }

    #[test]
    fn single_object_is_a_batch_of_one() {
        let records = parse_records(r#"{"operator": "SITI", "total_sales": 10}"#).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind(), "financial_report");
    }

    #[test]
    fn non_json_fails_the_batch() {
        let err = parse_records("Here are your receipts: none").unwrap_err();
        assert!(matches!(err, ReceiptError::ExtractionFailed { stage: "field", .. }));

        let err = parse_records("42").unwrap_err();
        assert!(matches!(err, ReceiptError::ExtractionFailed { .. }));
    }

    #[tokio::test]
    async fn extracts_mixed_batch_from_fenced_reply() {
        let reply = r#"```json
[
  {"operator": "SITI", "date": "22/10/2025", "total_sales": 100000, "disc_item": 5000,
   "disc_total": 0, "net_omset": 95000, "voucher": null, "cash_in_hand": 300000, "edc_seetle": 20000},
  {"batch_id": "000045", "merch_id": "88123", "bank_name": "BCA", "datetime": "22/10/2025 21:04",
   "debit": {"grand_total": 20000, "sale": 20000}, "credit": null, "qris": null},
  "garbage"
]
```"#;
        let service = CannedService::ok(reply);
        let doc = Document::from_bytes("22102025 ATP.pdf", b"%PDF".to_vec());
        let out = extract_fields(&service, &doc).await.unwrap();

        let kinds: Vec<&str> = out.records.iter().map(ReceiptRecord::kind).collect();
        assert_eq!(kinds, vec!["financial_report", "settlement_receipt", "unrecognized"]);
        assert!(out.json.starts_with('['));

        let seen = service.seen.lock().unwrap();
        assert!(!seen[0].1, "field request is free text");
        assert!(seen[0].0.contains("null"));
    }

    #[test]
    fn results_file_mirrors_document_name() {
        let dir = tempfile::tempdir().unwrap();
        let doc = Document::from_bytes("in/22102025 ATP.pdf", vec![]);
        let extraction = FieldExtraction {
            json: r#"[{"operator":"SITI"}]"#.to_string(),
            records: vec![],
        };
        let path = write_results(dir.path(), &doc, &extraction).unwrap();
        assert_eq!(path, dir.path().join("22102025 ATP.json"));

        let loaded = load_records(&path).unwrap();
        assert_eq!(loaded.records.len(), 1);
    }
}
