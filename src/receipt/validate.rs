// src/receipt/validate.rs

use super::{Amount, Field, FinancialReport, ReceiptRecord};
use std::fmt;

/// Columns the receipt table needs. Presence is what counts; `null` is allowed.
pub const REQUIRED_FIELDS: [&str; 7] = [
    "total_sales",
    "net_omset",
    "operator",
    "date",
    "edc_settle",
    "cash_in_hand",
    "voucher",
];

/// Why `net_omset == total_sales - (disc_item + disc_total)` did not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArithmeticIssue {
    Mismatch { net_omset: i64, expected: i64 },
    /// One of the four operands is null or absent, so the identity cannot be confirmed.
    Unverifiable { missing: Vec<&'static str> },
    /// The discounts or their difference do not fit in an i64.
    Overflow,
}

impl fmt::Display for ArithmeticIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mismatch { net_omset, expected } => {
                write!(f, "net_omset {net_omset} != {expected}")
            }
            Self::Unverifiable { missing } => {
                write!(f, "cannot verify net_omset, no value for {}", missing.join(", "))
            }
            Self::Overflow => f.write_str("cannot verify net_omset, amounts overflow"),
        }
    }
}

/// Outcome of validating one record. Both checks run independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    ArithmeticMismatch(ArithmeticIssue),
    IncompleteSchema { missing: Vec<&'static str> },
    MismatchAndIncomplete {
        issue: ArithmeticIssue,
        missing: Vec<&'static str>,
    },
    /// The object could not be decoded into a known receipt shape.
    Undecodable { reason: String },
}

impl Verdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }

    pub fn has_arithmetic_mismatch(&self) -> bool {
        matches!(
            self,
            Verdict::ArithmeticMismatch(_) | Verdict::MismatchAndIncomplete { .. }
        )
    }

    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            Verdict::IncompleteSchema { .. } | Verdict::MismatchAndIncomplete { .. }
        )
    }

    /// Short machine-friendly code stored with quarantined records.
    pub fn code(&self) -> &'static str {
        match self {
            Verdict::Valid => "valid",
            Verdict::ArithmeticMismatch(_) => "arithmetic_mismatch",
            Verdict::IncompleteSchema { .. } => "incomplete_schema",
            Verdict::MismatchAndIncomplete { .. } => "arithmetic_mismatch+incomplete_schema",
            Verdict::Undecodable { .. } => "undecodable",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Valid => f.write_str("valid"),
            Verdict::ArithmeticMismatch(issue) => write!(f, "arithmetic mismatch: {issue}"),
            Verdict::IncompleteSchema { missing } => {
                write!(f, "missing fields: {}", missing.join(", "))
            }
            Verdict::MismatchAndIncomplete { issue, missing } => write!(
                f,
                "arithmetic mismatch: {issue}; missing fields: {}",
                missing.join(", ")
            ),
            Verdict::Undecodable { reason } => write!(f, "undecodable record: {reason}"),
        }
    }
}

/// Detection only: a mismatch is reported, never corrected.
pub fn check_arithmetic(report: &FinancialReport) -> Option<ArithmeticIssue> {
    let operands: [(&'static str, &Field<Amount>); 4] = [
        ("total_sales", &report.total_sales),
        ("disc_item", &report.disc_item),
        ("disc_total", &report.disc_total),
        ("net_omset", &report.net_omset),
    ];
    let missing: Vec<&'static str> = operands
        .iter()
        .filter(|(_, f)| f.value().is_none())
        .map(|(name, _)| *name)
        .collect();

    match (
        report.total_sales.value(),
        report.disc_item.value(),
        report.disc_total.value(),
        report.net_omset.value(),
    ) {
        (Some(total), Some(item), Some(disc), Some(net)) => {
            let expected = item
                .0
                .checked_add(disc.0)
                .and_then(|discounts| total.0.checked_sub(discounts));
            match expected {
                Some(expected) if expected == net.0 => None,
                Some(expected) => Some(ArithmeticIssue::Mismatch {
                    net_omset: net.0,
                    expected,
                }),
                None => Some(ArithmeticIssue::Overflow),
            }
        }
        _ => Some(ArithmeticIssue::Unverifiable { missing }),
    }
}

/// Required fields the record does not carry as keys.
pub fn missing_fields(record: &ReceiptRecord) -> Vec<&'static str> {
    REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| !record.has_key(field))
        .collect()
}

pub fn validate(record: &ReceiptRecord) -> Verdict {
    let arithmetic = match record {
        ReceiptRecord::Financial(report) => check_arithmetic(report),
        // Settlement slips carry no net/gross identity.
        ReceiptRecord::Settlement(_) => None,
        ReceiptRecord::Unrecognized { reason, .. } => {
            return Verdict::Undecodable {
                reason: reason.clone(),
            };
        }
    };
    let missing = missing_fields(record);

    match (arithmetic, missing.is_empty()) {
        (None, true) => Verdict::Valid,
        (Some(issue), true) => Verdict::ArithmeticMismatch(issue),
        (None, false) => Verdict::IncompleteSchema { missing },
        (Some(issue), false) => Verdict::MismatchAndIncomplete { issue, missing },
    }
}

/// A record headed for the main table.
#[derive(Debug, Clone)]
pub struct Insertable {
    /// 1-based position in the batch.
    pub position: usize,
    pub report: FinancialReport,
}

/// A record held back for manual review.
#[derive(Debug, Clone)]
pub struct Quarantined {
    pub position: usize,
    pub record: ReceiptRecord,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Default)]
pub struct Reconciliation {
    pub insertable: Vec<Insertable>,
    pub quarantined: Vec<Quarantined>,
}

/// Partition a batch into insertable and quarantined records, keeping batch order.
pub fn reconcile(records: Vec<ReceiptRecord>) -> Reconciliation {
    let mut out = Reconciliation::default();
    for (i, record) in records.into_iter().enumerate() {
        let position = i + 1;
        let verdict = validate(&record);
        match (record, verdict) {
            (ReceiptRecord::Financial(report), verdict) if verdict.is_valid() => {
                out.insertable.push(Insertable { position, report })
            }
            (record, verdict) => out.quarantined.push(Quarantined {
                position,
                record,
                verdict,
            }),
        }
    }
    out
}
