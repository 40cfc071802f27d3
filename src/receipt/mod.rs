// src/receipt/mod.rs

pub mod validate;

use regex::Regex;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::LazyLock;

/// A value as the extractor reported it. Key presence matters downstream,
/// so an absent key and an explicit `null` are kept apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    Missing,
    Null,
    Value(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Field::Missing
    }
}

impl<T> Field<T> {
    pub fn is_missing(&self) -> bool {
        matches!(self, Field::Missing)
    }

    pub fn is_present(&self) -> bool {
        !self.is_missing()
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Field::Value(v) => Some(v),
            Field::Missing | Field::Null => None,
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Option::<T>::deserialize(deserializer)? {
            Some(v) => Field::Value(v),
            None => Field::Null,
        })
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Field::Value(v) => v.serialize(serializer),
            Field::Missing | Field::Null => serializer.serialize_none(),
        }
    }
}

/// Whole-currency amount. Receipts carry no cents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Amount(pub i64);

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(-)?\s*(?:rp\.?\s*)?(\d{1,3}(?:[.,\s]\d{3})+|\d+)(?:[.,]0{1,2})?$")
        .expect("amount pattern is valid")
});

/// Parse a printed amount such as `"100.000"`, `"1,250,000"` or `"Rp 95.000"`.
/// Dots, commas and spaces between digit groups are thousands separators.
pub fn parse_amount(raw: &str) -> Option<i64> {
    let caps = AMOUNT_RE.captures(raw.trim())?;
    let digits: String = caps[2].chars().filter(char::is_ascii_digit).collect();
    let value: i64 = digits.parse().ok()?;
    Some(if caps.get(1).is_some() { -value } else { value })
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AmountVisitor;

        impl Visitor<'_> for AmountVisitor {
            type Value = Amount;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an integer amount or a string with thousands separators")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Amount, E> {
                Ok(Amount(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Amount, E> {
                i64::try_from(v)
                    .map(Amount)
                    .map_err(|_| E::custom(format!("amount {v} out of range")))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Amount, E> {
                if v.fract() == 0.0 && v.abs() < 9.0e15 {
                    Ok(Amount(v as i64))
                } else {
                    Err(E::custom(format!("amount {v} is not a whole number")))
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Amount, E> {
                parse_amount(v)
                    .map(Amount)
                    .ok_or_else(|| E::custom(format!("unreadable amount {v:?}")))
            }
        }

        deserializer.deserialize_any(AmountVisitor)
    }
}

/// End-of-shift financial report printed by the till.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinancialReport {
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub operator: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub date: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub tanggal: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub total_sales: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub disc_item: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub disc_total: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub net_omset: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub voucher: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub cash_in_hand: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub total_omset: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub cash: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub edc_debit: Field<Map<String, Value>>,
    #[serde(default, alias = "edc_seetle", skip_serializing_if = "Field::is_missing")]
    pub edc_settle: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub cashier_cash: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub surplus: Field<Amount>,
}

impl FinancialReport {
    /// Whether the extractor emitted `key` at all (a `null` value counts).
    pub fn has_key(&self, key: &str) -> bool {
        match key {
            "operator" => self.operator.is_present(),
            "date" => self.date.is_present(),
            "tanggal" => self.tanggal.is_present(),
            "total_sales" => self.total_sales.is_present(),
            "disc_item" => self.disc_item.is_present(),
            "disc_total" => self.disc_total.is_present(),
            "net_omset" => self.net_omset.is_present(),
            "voucher" => self.voucher.is_present(),
            "cash_in_hand" => self.cash_in_hand.is_present(),
            "total_omset" => self.total_omset.is_present(),
            "cash" => self.cash.is_present(),
            "edc_debit" => self.edc_debit.is_present(),
            "edc_settle" => self.edc_settle.is_present(),
            "cashier_cash" => self.cashier_cash.is_present(),
            "surplus" => self.surplus.is_present(),
            _ => false,
        }
    }

    pub fn label(&self) -> String {
        format!("operator {} on {}", text_or_unknown(&self.operator), text_or_unknown(&self.date))
    }

    pub fn key(&self) -> ReceiptKey {
        ReceiptKey::new(
            self.operator.value().map(String::as_str),
            self.date.value().map(String::as_str),
            self.net_omset.value().copied(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettlementTotals {
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub grand_total: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub sale: Field<Amount>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditTotals {
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub grand_total: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub sale: Field<Amount>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub issuer: Field<String>,
}

/// EDC terminal settlement slip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettlementReceipt {
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub batch_id: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub merch_id: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub bank_name: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub datetime: Field<String>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub debit: Field<SettlementTotals>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub credit: Field<CreditTotals>,
    #[serde(default, skip_serializing_if = "Field::is_missing")]
    pub qris: Field<SettlementTotals>,
}

const FINANCIAL_KEYS: &[&str] = &[
    "operator",
    "date",
    "tanggal",
    "total_sales",
    "disc_item",
    "disc_total",
    "net_omset",
    "voucher",
    "cash_in_hand",
    "total_omset",
    "cash",
    "edc_debit",
    "edc_settle",
    "edc_seetle",
    "cashier_cash",
    "surplus",
];

const SETTLEMENT_KEYS: &[&str] = &[
    "batch_id",
    "merch_id",
    "bank_name",
    "datetime",
    "debit",
    "credit",
    "qris",
];

/// One receipt as transcribed by the field extractor.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceiptRecord {
    Financial(FinancialReport),
    Settlement(SettlementReceipt),
    /// An object matching neither shape, or whose values could not be decoded.
    Unrecognized { raw: Value, reason: String },
}

impl ReceiptRecord {
    /// Classify one extracted JSON object by which receipt fields it carries.
    pub fn from_value(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::Unrecognized {
                reason: format!("expected a JSON object, got {}", json_kind(&value)),
                raw: value,
            };
        };

        let hits = |keys: &[&str]| keys.iter().filter(|k| object.contains_key(**k)).count();
        let financial = hits(FINANCIAL_KEYS);
        let settlement = hits(SETTLEMENT_KEYS);

        let decoded = if settlement > financial {
            serde_json::from_value(value.clone()).map(Self::Settlement)
        } else if financial > 0 {
            serde_json::from_value(value.clone()).map(Self::Financial)
        } else {
            return Self::Unrecognized {
                raw: value,
                reason: "no known receipt fields".to_string(),
            };
        };

        decoded.unwrap_or_else(|e| Self::Unrecognized {
            raw: value,
            reason: e.to_string(),
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Financial(_) => "financial_report",
            Self::Settlement(_) => "settlement_receipt",
            Self::Unrecognized { .. } => "unrecognized",
        }
    }

    /// Key presence check used by the completeness rule.
    pub fn has_key(&self, key: &str) -> bool {
        match self {
            Self::Financial(report) => report.has_key(key),
            Self::Settlement(_) => false,
            Self::Unrecognized { raw, .. } => raw.as_object().is_some_and(|o| o.contains_key(key)),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::Financial(report) => serde_json::to_value(report).unwrap_or(Value::Null),
            Self::Settlement(slip) => serde_json::to_value(slip).unwrap_or(Value::Null),
            Self::Unrecognized { raw, .. } => raw.clone(),
        }
    }

    /// Short human label for logs: operator and date for reports, batch for settlements.
    pub fn label(&self) -> String {
        match self {
            Self::Financial(r) => r.label(),
            Self::Settlement(s) => format!(
                "settlement batch {} ({})",
                text_or_unknown(&s.batch_id),
                text_or_unknown(&s.bank_name)
            ),
            Self::Unrecognized { .. } => "unrecognized record".to_string(),
        }
    }
}

fn text_or_unknown(field: &Field<String>) -> &str {
    field.value().map(String::as_str).unwrap_or("?")
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// `operator_date_net_omset`, the natural key of a stored receipt.
/// Null components render as `null`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptKey(String);

impl ReceiptKey {
    pub fn new(operator: Option<&str>, date: Option<&str>, net_omset: Option<Amount>) -> Self {
        let net = net_omset.map(|a| a.0.to_string());
        Self(format!(
            "{}_{}_{}",
            operator.unwrap_or("null"),
            date.unwrap_or("null"),
            net.as_deref().unwrap_or("null")
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_and_null_are_distinct() {
        let report: FinancialReport =
            serde_json::from_value(json!({"operator": "SITI", "voucher": null})).unwrap();
        assert_eq!(report.operator, Field::Value("SITI".to_string()));
        assert_eq!(report.voucher, Field::Null);
        assert_eq!(report.cash, Field::Missing);
        assert!(report.has_key("voucher"));
        assert!(!report.has_key("cash"));
    }

    #[test]
    fn amounts_accept_separators() {
        assert_eq!(parse_amount("100.000"), Some(100_000));
        assert_eq!(parse_amount("1,250,000"), Some(1_250_000));
        assert_eq!(parse_amount("Rp 95.000"), Some(95_000));
        assert_eq!(parse_amount("95.000,00"), Some(95_000));
        assert_eq!(parse_amount("-5.000"), Some(-5_000));
        assert_eq!(parse_amount("42"), Some(42));
        assert_eq!(parse_amount("12.5"), None);
        assert_eq!(parse_amount("abc"), None);

        let report: FinancialReport = serde_json::from_value(json!({
            "total_sales": "100.000",
            "net_omset": 95000.0,
            "disc_item": 5000
        }))
        .unwrap();
        assert_eq!(report.total_sales, Field::Value(Amount(100_000)));
        assert_eq!(report.net_omset, Field::Value(Amount(95_000)));
        assert_eq!(report.disc_item, Field::Value(Amount(5_000)));
    }

    #[test]
    fn legacy_settle_spelling_is_accepted() {
        let report: FinancialReport = serde_json::from_value(json!({"edc_seetle": 25000})).unwrap();
        assert_eq!(report.edc_settle, Field::Value(Amount(25_000)));
        assert!(report.has_key("edc_settle"));

        let out = serde_json::to_value(&report).unwrap();
        assert_eq!(out, json!({"edc_settle": 25000}));
    }

    #[test]
    fn classifies_by_shape() {
        let financial = ReceiptRecord::from_value(json!({
            "operator": "BUDI", "date": "22/10/2025", "total_sales": 100000, "edc_debit": {"bca": 20000}
        }));
        assert_eq!(financial.kind(), "financial_report");

        let settlement = ReceiptRecord::from_value(json!({
            "batch_id": "000123", "merch_id": "M-9", "bank_name": "BRI",
            "debit": {"grand_total": "150.000", "sale": 150000},
            "qris": null
        }));
        match &settlement {
            ReceiptRecord::Settlement(s) => {
                let debit = s.debit.value().unwrap();
                assert_eq!(debit.grand_total, Field::Value(Amount(150_000)));
                assert_eq!(s.qris, Field::Null);
                assert_eq!(s.credit, Field::Missing);
            }
            other => panic!("expected settlement, got {other:?}"),
        }

        let unknown = ReceiptRecord::from_value(json!({"hello": "world"}));
        assert_eq!(unknown.kind(), "unrecognized");
        assert!(unknown.has_key("hello"));

        let scalar = ReceiptRecord::from_value(json!(12));
        assert!(matches!(scalar, ReceiptRecord::Unrecognized { ref reason, .. } if reason.contains("number")));
    }

    #[test]
    fn undecodable_values_become_unrecognized() {
        let record = ReceiptRecord::from_value(json!({"operator": "ANI", "total_sales": "lots"}));
        match record {
            ReceiptRecord::Unrecognized { raw, reason } => {
                assert_eq!(raw["operator"], "ANI");
                assert!(reason.contains("lots"));
            }
            other => panic!("expected unrecognized, got {other:?}"),
        }
    }

    #[test]
    fn receipt_key_joins_with_underscores() {
        let report: FinancialReport = serde_json::from_value(json!({
            "operator": "SITI", "date": "22-10-2025", "net_omset": 95000
        }))
        .unwrap();
        assert_eq!(report.key().as_str(), "SITI_22-10-2025_95000");

        let partial: FinancialReport =
            serde_json::from_value(json!({"operator": "SITI", "date": null})).unwrap();
        assert_eq!(partial.key().to_string(), "SITI_null_null");
    }
}
