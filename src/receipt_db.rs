use crate::receipt::{Amount, Field, FinancialReport, ReceiptKey};
use crate::receipt::validate::Verdict;
use rusqlite::{Connection, Result as SqliteResult, params};
use std::path::Path;
use tracing::{error, info, warn};

/// Handle on the receipt database. Owns the connection for the length of a
/// batch; every statement auto-commits on its own.
pub struct ReceiptStore {
    conn: Connection,
}

/// How an insert ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row with the same receipt key is already stored.
    AlreadyExists,
    Failed(String),
}

impl InsertOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, InsertOutcome::Failed(_))
    }
}

/// A row from `receipt_idk`.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReceipt {
    pub receipt_id: String,
    pub total_sales: Option<i64>,
    pub net_omset: Option<i64>,
    pub date: Option<String>,
    pub operator: Option<String>,
    pub edc_settle: Option<i64>,
    pub cash_in_hand: Option<i64>,
    pub voucher: Option<i64>,
}

/// A record routed to manual review.
#[derive(Debug, Clone)]
pub struct QuarantineEntry<'a> {
    pub document: &'a str,
    pub position: usize,
    pub kind: &'a str,
    pub verdict: &'a Verdict,
    pub raw_json: String,
}

impl ReceiptStore {
    /// Open (or create) the SQLite database and make sure the tables exist.
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %e, "Could not create database directory");
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> SqliteResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS receipt_idk (
                receipt_id TEXT PRIMARY KEY,
                total_sales INTEGER,
                net_omset INTEGER,
                date TEXT,
                operator TEXT,
                edc_settle INTEGER,
                cash_in_hand INTEGER,
                voucher INTEGER,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        // Records that failed validation, kept for manual review
        conn.execute(
            "CREATE TABLE IF NOT EXISTS receipt_failed_ocr (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document TEXT NOT NULL,
                position INTEGER NOT NULL,
                kind TEXT NOT NULL,
                reason_code TEXT NOT NULL,
                reason TEXT NOT NULL,
                raw_json TEXT NOT NULL,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS ingested_documents (
                fingerprint TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                page_count INTEGER,
                first_seen DATETIME DEFAULT CURRENT_TIMESTAMP,
                last_seen DATETIME DEFAULT CURRENT_TIMESTAMP,
                times_seen INTEGER NOT NULL DEFAULT 1
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_receipt_idk_date ON receipt_idk(date)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_failed_ocr_document ON receipt_failed_ocr(document)",
            [],
        )?;

        info!("Database initialized successfully");
        Ok(Self { conn })
    }

    /// Insert a validated report under its receipt key. A key that already
    /// exists is left untouched.
    pub fn try_insert(&self, report: &FinancialReport) -> SqliteResult<(ReceiptKey, bool)> {
        let key = report.key();
        let amount = |f: &Field<Amount>| f.value().map(|a| a.0);
        let changed = self.conn.execute(
            "INSERT INTO receipt_idk
                (total_sales, net_omset, date, operator, edc_settle, cash_in_hand, voucher, receipt_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(receipt_id) DO NOTHING",
            params![
                amount(&report.total_sales),
                amount(&report.net_omset),
                report.date.value(),
                report.operator.value(),
                amount(&report.edc_settle),
                amount(&report.cash_in_hand),
                amount(&report.voucher),
                key.as_str(),
            ],
        )?;
        Ok((key, changed == 1))
    }

    /// Insert and report the outcome instead of failing; errors are logged so
    /// the rest of the batch keeps going.
    pub fn insert(&self, report: &FinancialReport) -> InsertOutcome {
        match self.try_insert(report) {
            Ok((key, true)) => {
                info!(receipt_id = %key, "Receipt inserted");
                InsertOutcome::Inserted
            }
            Ok((key, false)) => {
                info!(receipt_id = %key, "Receipt already stored");
                InsertOutcome::AlreadyExists
            }
            Err(e) => {
                error!(receipt_id = %report.key(), error = %e, "Failed to insert receipt");
                InsertOutcome::Failed(e.to_string())
            }
        }
    }

    pub fn quarantine(&self, entry: &QuarantineEntry<'_>) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO receipt_failed_ocr
                (document, position, kind, reason_code, reason, raw_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                entry.document,
                entry.position as i64,
                entry.kind,
                entry.verdict.code(),
                entry.verdict.to_string(),
                entry.raw_json,
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(id, document = %entry.document, position = entry.position, reason = %entry.verdict, "Record quarantined");
        Ok(id)
    }

    /// Log a document by content hash. Returns how many times it has now been seen.
    pub fn record_document(
        &self,
        fingerprint: &str,
        filename: &str,
        page_count: Option<usize>,
    ) -> SqliteResult<i64> {
        self.conn.execute(
            "INSERT INTO ingested_documents (fingerprint, filename, page_count)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(fingerprint) DO UPDATE SET
                filename = excluded.filename,
                last_seen = CURRENT_TIMESTAMP,
                times_seen = times_seen + 1",
            params![fingerprint, filename, page_count.map(|n| n as i64)],
        )?;
        self.conn.query_row(
            "SELECT times_seen FROM ingested_documents WHERE fingerprint = ?1",
            params![fingerprint],
            |row| row.get(0),
        )
    }

    pub fn get_receipt(&self, receipt_id: &str) -> SqliteResult<Option<StoredReceipt>> {
        let mut stmt = self.conn.prepare(
            "SELECT receipt_id, total_sales, net_omset, date, operator, edc_settle, cash_in_hand, voucher
             FROM receipt_idk
             WHERE receipt_id = ?1",
        )?;
        let mut rows = stmt.query(params![receipt_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(StoredReceipt {
                receipt_id: row.get(0)?,
                total_sales: row.get(1)?,
                net_omset: row.get(2)?,
                date: row.get(3)?,
                operator: row.get(4)?,
                edc_settle: row.get(5)?,
                cash_in_hand: row.get(6)?,
                voucher: row.get(7)?,
            })),
            None => Ok(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// (stored receipts, quarantined records, known documents)
    pub fn get_counts(&self) -> SqliteResult<(usize, usize, usize)> {
        let receipts: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM receipt_idk", [], |row| row.get(0))?;
        let quarantined: usize =
            self.conn
                .query_row("SELECT COUNT(*) FROM receipt_failed_ocr", [], |row| row.get(0))?;
        let documents: usize = self.conn.query_row(
            "SELECT COUNT(*) FROM ingested_documents",
            [],
            |row| row.get(0),
        )?;
        Ok((receipts, quarantined, documents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::ReceiptRecord;
    use crate::receipt::validate::validate;
    use serde_json::json;

    fn report(net: i64) -> FinancialReport {
        serde_json::from_value(json!({
            "operator": "SITI",
            "date": "22/10/2025",
            "total_sales": 100000,
            "disc_item": 100000 - net,
            "disc_total": 0,
            "net_omset": net,
            "voucher": null,
            "cash_in_hand": 300000,
            "edc_settle": 20000
        }))
        .unwrap()
    }

    #[test]
    fn insert_stores_columns_under_key() {
        let db = ReceiptStore::in_memory().unwrap();
        assert_eq!(db.insert(&report(95_000)), InsertOutcome::Inserted);

        let row = db.get_receipt("SITI_22/10/2025_95000").unwrap().unwrap();
        assert_eq!(row.total_sales, Some(100_000));
        assert_eq!(row.net_omset, Some(95_000));
        assert_eq!(row.operator.as_deref(), Some("SITI"));
        assert_eq!(row.edc_settle, Some(20_000));
        assert_eq!(row.voucher, None);
    }

    #[test]
    fn duplicate_key_is_not_a_second_row() {
        let db = ReceiptStore::in_memory().unwrap();
        assert_eq!(db.insert(&report(95_000)), InsertOutcome::Inserted);
        let second = db.insert(&report(95_000));
        assert_eq!(second, InsertOutcome::AlreadyExists);
        assert!(second.is_success());
        assert_eq!(db.insert(&report(90_000)), InsertOutcome::Inserted);

        let (receipts, _, _) = db.get_counts().unwrap();
        assert_eq!(receipts, 2);
    }

    #[test]
    fn failures_are_reported_not_raised() {
        let db = ReceiptStore::in_memory().unwrap();
        db.conn.execute("DROP TABLE receipt_idk", []).unwrap();
        let outcome = db.insert(&report(95_000));
        assert!(matches!(outcome, InsertOutcome::Failed(_)));
        assert!(!outcome.is_success());
    }

    #[test]
    fn quarantine_keeps_reason_and_raw_record() {
        let db = ReceiptStore::in_memory().unwrap();
        let record = ReceiptRecord::from_value(json!({"operator": "BUDI", "total_sales": 5}));
        let verdict = validate(&record);
        let id = db
            .quarantine(&QuarantineEntry {
                document: "22102025 ATP.pdf",
                position: 3,
                kind: record.kind(),
                verdict: &verdict,
                raw_json: record.to_json().to_string(),
            })
            .unwrap();
        assert!(id > 0);

        let (code, raw): (String, String) = db
            .conn
            .query_row(
                "SELECT reason_code, raw_json FROM receipt_failed_ocr WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(code, "arithmetic_mismatch+incomplete_schema");
        assert!(raw.contains("BUDI"));
    }

    #[test]
    fn documents_are_counted_by_fingerprint() {
        let db = ReceiptStore::in_memory().unwrap();
        assert_eq!(db.record_document("abc", "a.pdf", Some(2)).unwrap(), 1);
        assert_eq!(db.record_document("abc", "a-copy.pdf", Some(2)).unwrap(), 2);
        assert_eq!(db.record_document("def", "b.pdf", None).unwrap(), 1);
        let (_, _, documents) = db.get_counts().unwrap();
        assert_eq!(documents, 2);
    }
}
