// src/pipeline.rs

use crate::boxes;
use crate::config::{CropConfig, ExtractConfig};
use crate::crop::{self, CropOutcome};
use crate::document::Document;
use crate::error::{ReceiptError, Result};
use crate::fields::{self, FieldExtraction};
use crate::gemini::VisionService;
use crate::rasterize::Rasterizer;
use crate::receipt::validate::{Verdict, reconcile};
use crate::receipt::{ReceiptKey, ReceiptRecord};
use crate::receipt_db::{InsertOutcome, QuarantineEntry, ReceiptStore};
use image::DynamicImage;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{Instrument, error, info, warn};

/// Render the document into page images. Image inputs are a single page.
pub fn load_pages(document: &Document, rasterizer: &dyn Rasterizer, dpi: u32) -> Result<Vec<DynamicImage>> {
    if !document.is_pdf() {
        return Ok(vec![image::load_from_memory(&document.bytes)?]);
    }
    let pages = rasterizer.rasterize(&document.path, dpi)?;
    if let Some(expected) = document.page_count() {
        if expected != pages.len() {
            warn!(expected, rendered = pages.len(), "Rendered page count differs from the PDF page tree");
        }
    }
    Ok(pages)
}

/// Locate receipts, render the pages and save one image per receipt.
pub async fn run_crop(
    service: &dyn VisionService,
    rasterizer: &dyn Rasterizer,
    document: &Document,
    config: &CropConfig,
) -> Result<Vec<CropOutcome>> {
    let span = tracing::info_span!("crop", filename = %document.filename);
    let boxes = boxes::extract_boxes(service, document)
        .instrument(span.clone())
        .await?;
    let _guard = span.enter();
    if boxes.is_empty() {
        warn!("No bounding boxes returned, nothing to crop");
        return Ok(Vec::new());
    }

    info!(dpi = config.dpi, padding = config.padding, "Starting image extraction");
    let pages = load_pages(document, rasterizer, config.dpi)?;
    let outcomes = crop::crop_pages(&pages, &boxes.bboxes, config.padding, &config.output_dir)?;

    let saved = outcomes
        .iter()
        .filter(|o| matches!(o, CropOutcome::Saved(_)))
        .count();
    info!(saved, skipped = outcomes.len() - saved, output_dir = %config.output_dir.display(), "Extraction process finished");
    Ok(outcomes)
}

/// Receipts found per page, in page order.
pub async fn count_receipts(service: &dyn VisionService, document: &Document) -> Result<Vec<usize>> {
    let boxes = boxes::extract_boxes(service, document).await?;
    Ok(boxes.receipts_per_page())
}

/// Transcribe the document and write `<results_dir>/<stem>.json`.
pub async fn run_extract(
    service: &dyn VisionService,
    document: &Document,
    config: &ExtractConfig,
) -> Result<(FieldExtraction, PathBuf)> {
    let span = tracing::info_span!("extract", filename = %document.filename);
    let extraction = fields::extract_fields(service, document)
        .instrument(span.clone())
        .await?;
    let _guard = span.enter();
    let path = fields::write_results(&config.results_dir, document, &extraction)?;
    Ok((extraction, path))
}

/// Final state of one record in a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    Inserted(ReceiptKey),
    /// Same receipt key already stored; nothing written.
    Duplicate(ReceiptKey),
    /// Passed validation during a dry run.
    Validated(ReceiptKey),
    Quarantined(Verdict),
    InsertFailed { key: ReceiptKey, reason: String },
    /// Failed validation, and the quarantine row could not be written either.
    QuarantineFailed { verdict: Verdict, reason: String },
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Inserted(key) => write!(f, "inserted {key}"),
            Disposition::Duplicate(key) => write!(f, "already stored {key}"),
            Disposition::Validated(key) => write!(f, "valid {key}"),
            Disposition::Quarantined(verdict) => write!(f, "quarantined ({verdict})"),
            Disposition::InsertFailed { key, reason } => write!(f, "insert failed {key}: {reason}"),
            Disposition::QuarantineFailed { verdict, reason } => {
                write!(f, "quarantine failed ({verdict}): {reason}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordReport {
    pub position: usize,
    pub label: String,
    pub disposition: Disposition,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub document: String,
    pub records: Vec<RecordReport>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub inserted: usize,
    pub duplicate: usize,
    pub validated: usize,
    pub quarantined: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn counts(&self) -> BatchCounts {
        let mut c = BatchCounts::default();
        for r in &self.records {
            match r.disposition {
                Disposition::Inserted(_) => c.inserted += 1,
                Disposition::Duplicate(_) => c.duplicate += 1,
                Disposition::Validated(_) => c.validated += 1,
                Disposition::Quarantined(_) => c.quarantined += 1,
                Disposition::InsertFailed { .. } | Disposition::QuarantineFailed { .. } => {
                    c.failed += 1
                }
            }
        }
        c
    }

    pub fn print_summary(&self) {
        println!("\n--- {} ({} records) ---", self.document, self.records.len());
        for r in &self.records {
            println!("  #{:<3} {:<40} {}", r.position, r.label, r.disposition);
        }
        let c = self.counts();
        println!(
            "--- inserted {}, already stored {}, valid (dry run) {}, quarantined {}, failed {} ---\n",
            c.inserted, c.duplicate, c.validated, c.quarantined, c.failed
        );
    }
}

/// Validate a batch and route every record: valid reports go to the receipt
/// table, the rest to quarantine. With no store the batch is only validated.
///
/// Per-record failures never stop the batch.
pub fn ingest_records(
    document: &str,
    records: Vec<ReceiptRecord>,
    store: Option<&ReceiptStore>,
) -> BatchReport {
    let split = reconcile(records);
    info!(
        document,
        insertable = split.insertable.len(),
        quarantined = split.quarantined.len(),
        "Batch reconciled"
    );

    let mut report = BatchReport {
        document: document.to_string(),
        records: Vec::with_capacity(split.insertable.len() + split.quarantined.len()),
    };

    for item in split.insertable {
        let key = item.report.key();
        let label = item.report.label();
        let disposition = match store {
            None => Disposition::Validated(key),
            Some(db) => match db.insert(&item.report) {
                InsertOutcome::Inserted => Disposition::Inserted(key),
                InsertOutcome::AlreadyExists => Disposition::Duplicate(key),
                InsertOutcome::Failed(reason) => Disposition::InsertFailed { key, reason },
            },
        };
        report.records.push(RecordReport {
            position: item.position,
            label,
            disposition,
        });
    }

    for held in split.quarantined {
        warn!(position = held.position, record = %held.record.label(), reason = %held.verdict, "Record failed validation");
        let written = match store {
            None => Ok(()),
            Some(db) => {
                let entry = QuarantineEntry {
                    document,
                    position: held.position,
                    kind: held.record.kind(),
                    verdict: &held.verdict,
                    raw_json: held.record.to_json().to_string(),
                };
                db.quarantine(&entry).map(|_| ())
            }
        };
        let disposition = match written {
            Ok(()) => Disposition::Quarantined(held.verdict),
            Err(e) => {
                error!(position = held.position, error = %e, "Failed to write quarantine entry");
                Disposition::QuarantineFailed {
                    verdict: held.verdict,
                    reason: e.to_string(),
                }
            }
        };
        report.records.push(RecordReport {
            position: held.position,
            label: held.record.label(),
            disposition,
        });
    }

    report.records.sort_by_key(|r| r.position);
    report
}

/// Where the records of an ingest run come from.
pub enum IngestSource<'a> {
    /// A results JSON file written by a previous extraction.
    Results(&'a Path),
    /// A document to run field extraction on first.
    Document(&'a Document),
}

/// Load or extract the records, then validate and persist them.
pub async fn run_ingest(
    source: IngestSource<'_>,
    service: Option<&dyn VisionService>,
    extract_config: &ExtractConfig,
    store: Option<&ReceiptStore>,
) -> Result<BatchReport> {
    let (name, extraction) = match source {
        IngestSource::Results(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            (name, fields::load_records(path)?)
        }
        IngestSource::Document(document) => {
            let service = service.ok_or_else(|| {
                ReceiptError::Config("a vision service is required to ingest a document".into())
            })?;
            let (extraction, _) = run_extract(service, document, extract_config).await?;
            if let Some(db) = store {
                let seen = db.record_document(&document.fingerprint(), &document.filename, document.page_count())?;
                if seen > 1 {
                    info!(filename = %document.filename, times_seen = seen, "Document was ingested before");
                }
            }
            (document.filename.clone(), extraction)
        }
    };

    let span = tracing::info_span!("ingest", document = %name);
    let _guard = span.enter();
    Ok(ingest_records(&name, extraction.records, store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boxes::tests::CannedService;
    use image::RgbImage;
    use serde_json::json;

    struct FixedPages(Vec<DynamicImage>);

    impl Rasterizer for FixedPages {
        fn rasterize(&self, _pdf_path: &Path, _dpi: u32) -> Result<Vec<DynamicImage>> {
            Ok(self.0.clone())
        }
    }

    fn blank(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(w, h))
    }

    fn pdf() -> Document {
        Document::from_bytes("22102025 ATP.pdf", b"%PDF-1.4 not really".to_vec())
    }

    fn records(v: serde_json::Value) -> Vec<ReceiptRecord> {
        v.as_array()
            .unwrap()
            .iter()
            .cloned()
            .map(ReceiptRecord::from_value)
            .collect()
    }

    fn batch() -> Vec<ReceiptRecord> {
        records(json!([
            {"operator": "SITI", "date": "22/10/2025", "total_sales": 100000, "disc_item": 5000,
             "disc_total": 0, "net_omset": 95000, "voucher": 0, "cash_in_hand": 300000, "edc_settle": 0},
            {"operator": "BUDI", "date": "22/10/2025", "total_sales": 100000, "disc_item": 5000,
             "disc_total": 1000, "net_omset": 95000, "voucher": 0, "cash_in_hand": 300000, "edc_settle": 0},
            {"batch_id": "000045", "bank_name": "BCA", "debit": {"grand_total": 20000, "sale": 20000}}
        ]))
    }

    #[tokio::test]
    async fn crop_run_writes_one_file_per_box() {
        let dir = tempfile::tempdir().unwrap();
        let service = CannedService::ok(
            r#"{"bboxes": [[[100, 100, 200, 200], [300, 300, 600, 900]], [[0, 0, 500, 500]]]}"#,
        );
        let rasterizer = FixedPages(vec![blank(1000, 1000), blank(1000, 1000)]);
        let config = CropConfig {
            output_dir: dir.path().to_path_buf(),
            ..CropConfig::default()
        };

        let outcomes = run_crop(&service, &rasterizer, &pdf(), &config).await.unwrap();
        assert_eq!(outcomes.len(), 3);
        for name in ["P1_Receipt_1.png", "P1_Receipt_2.png", "P2_Receipt_1.png"] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }
        let first = image::open(dir.path().join("P1_Receipt_1.png")).unwrap();
        assert_eq!((first.width(), first.height()), (140, 140));
    }

    #[tokio::test]
    async fn no_boxes_means_no_rendering() {
        struct Unreachable;
        impl Rasterizer for Unreachable {
            fn rasterize(&self, _: &Path, _: u32) -> Result<Vec<DynamicImage>> {
                Err(ReceiptError::Rasterize("should not be called".into()))
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let config = CropConfig {
            output_dir: dir.path().join("out"),
            ..CropConfig::default()
        };
        let service = CannedService::ok(r#"{"bboxes": []}"#);
        let outcomes = run_crop(&service, &Unreachable, &pdf(), &config).await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn failed_box_extraction_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = CropConfig {
            output_dir: dir.path().to_path_buf(),
            ..CropConfig::default()
        };
        let service = CannedService::failing("503 Service Unavailable");
        let err = run_crop(&service, &FixedPages(vec![]), &pdf(), &config)
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiptError::ExtractionFailed { .. }));
    }

    #[tokio::test]
    async fn counts_receipts_per_page() {
        let service = CannedService::ok(r#"{"bboxes": [[[1,1,2,2],[3,3,4,4],[5,5,6,6]], [], [[1,1,9,9]]]}"#);
        assert_eq!(count_receipts(&service, &pdf()).await.unwrap(), vec![3, 0, 1]);
    }

    #[test]
    fn every_record_gets_a_disposition() {
        let db = ReceiptStore::in_memory().unwrap();
        let report = ingest_records("22102025 ATP.json", batch(), Some(&db));

        let positions: Vec<usize> = report.records.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert!(matches!(report.records[0].disposition, Disposition::Inserted(ref k) if k.as_str() == "SITI_22/10/2025_95000"));
        assert!(matches!(report.records[1].disposition, Disposition::Quarantined(ref v) if v.has_arithmetic_mismatch()));
        assert!(matches!(report.records[2].disposition, Disposition::Quarantined(ref v) if v.is_incomplete()));

        let (receipts, quarantined, _) = db.get_counts().unwrap();
        assert_eq!((receipts, quarantined), (1, 2));
    }

    #[test]
    fn unwritable_quarantine_is_reported_as_failed() {
        let db = ReceiptStore::in_memory().unwrap();
        db.connection().execute("DROP TABLE receipt_failed_ocr", []).unwrap();
        let report = ingest_records("a.json", batch(), Some(&db));

        assert!(matches!(report.records[0].disposition, Disposition::Inserted(_)));
        assert!(matches!(
            report.records[1].disposition,
            Disposition::QuarantineFailed { ref verdict, .. } if verdict.has_arithmetic_mismatch()
        ));
        assert!(report.records[1].disposition.to_string().starts_with("quarantine failed"));
        assert_eq!(
            report.counts(),
            BatchCounts {
                inserted: 1,
                failed: 2,
                ..BatchCounts::default()
            }
        );
    }

    #[tokio::test]
    async fn failed_extraction_does_not_log_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let service = CannedService::failing("429 Too Many Requests");
        let db = ReceiptStore::in_memory().unwrap();
        let config = ExtractConfig {
            results_dir: dir.path().to_path_buf(),
        };
        let doc = pdf();

        let err = run_ingest(
            IngestSource::Document(&doc),
            Some(&service as &dyn VisionService),
            &config,
            Some(&db),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ReceiptError::ExtractionFailed { .. }));

        let (_, _, documents) = db.get_counts().unwrap();
        assert_eq!(documents, 0);
    }

    #[test]
    fn rerun_is_idempotent_for_receipts() {
        let db = ReceiptStore::in_memory().unwrap();
        ingest_records("a.json", batch(), Some(&db));
        let again = ingest_records("a.json", batch(), Some(&db));
        assert_eq!(again.counts().duplicate, 1);
        assert_eq!(again.counts().inserted, 0);
        let (receipts, _, _) = db.get_counts().unwrap();
        assert_eq!(receipts, 1);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let report = ingest_records("a.json", batch(), None);
        assert_eq!(
            report.counts(),
            BatchCounts {
                validated: 1,
                quarantined: 2,
                ..BatchCounts::default()
            }
        );
    }

    #[tokio::test]
    async fn ingest_from_document_extracts_then_stores() {
        let dir = tempfile::tempdir().unwrap();
        let reply = format!("```json\n{}\n```", json!([
            {"operator": "ANI", "date": "23/10/2025", "total_sales": 50000, "disc_item": 0,
             "disc_total": 0, "net_omset": 50000, "voucher": null, "cash_in_hand": 50000, "edc_seetle": null}
        ]));
        let service = CannedService::ok(&reply);
        let db = ReceiptStore::in_memory().unwrap();
        let config = ExtractConfig {
            results_dir: dir.path().to_path_buf(),
        };
        let doc = pdf();

        let report = run_ingest(
            IngestSource::Document(&doc),
            Some(&service as &dyn VisionService),
            &config,
            Some(&db),
        )
            .await
            .unwrap();
        assert_eq!(report.counts().inserted, 1);
        assert!(dir.path().join("22102025 ATP.json").exists());

        let from_file = run_ingest(
            IngestSource::Results(&dir.path().join("22102025 ATP.json")),
            None,
            &config,
            Some(&db),
        )
        .await
        .unwrap();
        assert_eq!(from_file.counts().duplicate, 1);

        let (_, _, documents) = db.get_counts().unwrap();
        assert_eq!(documents, 1);
    }
}
