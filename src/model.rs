//! Core data model: classified lines, transactions, outbound jobs, NVR events.
//!
//! Types are closed tagged variants rather than an open class hierarchy
//! (spec.md §9 "Polymorphic line kinds"), and each type owns its data —
//! transactions pass serialized copies to the queue, never shared mutable
//! references (spec.md §3 "Ownership").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of line classifications (spec.md §3/§4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineType {
    Item,
    Total,
    Cash,
    Debit,
    Credit,
    Preauth,
    EndHeader,
    Cashier,
    AgeVerification,
    Ignore,
    Empty,
    Unknown,
}

impl LineType {
    /// Lines that never open or extend a transaction on their own.
    pub fn is_structural_only(self) -> bool {
        matches!(self, LineType::Ignore | LineType::Empty)
    }

    /// Tender line types, used for per-tender totals in the summary.
    pub fn is_tender(self) -> bool {
        matches!(
            self,
            LineType::Cash | LineType::Debit | LineType::Credit | LineType::Preauth
        )
    }
}

/// A two-decimal fixed-point money amount, stored as integer cents so
/// repeated summation never drifts from floating-point rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Amount(pub i64);

impl Amount {
    pub fn from_cents(cents: i64) -> Self {
        Amount(cents)
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / 100.0
    }

    pub fn checked_add(self, other: Amount) -> Amount {
        Amount(self.0 + other.0)
    }
}

impl std::str::FromStr for Amount {
    type Err = std::num::ParseFloatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: f64 = s.parse()?;
        Ok(Amount((value * 100.0).round() as i64))
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_f64(self.as_f64())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Ok(Amount((value * 100.0).round() as i64))
    }
}

/// The output of the classifier for one logical line (spec.md §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedLine {
    pub line_type: LineType,
    pub text: String,
    pub description: Option<String>,
    pub qty: Option<f64>,
    pub amount: Option<Amount>,
    pub store_id: Option<String>,
    pub drawer_id: Option<String>,
    pub transaction_number: Option<String>,
    pub cashier: Option<String>,
}

impl ClassifiedLine {
    pub fn parsed_successfully(&self) -> bool {
        !matches!(self.line_type, LineType::Unknown)
    }
}

/// Receipt metadata discovered from `end_header` / `cashier` lines, applied
/// to every line of a transaction (spec.md §3 "back-fill").
#[derive(Debug, Clone, Default)]
pub struct ReceiptMetadata {
    pub store_id: Option<String>,
    pub drawer_id: Option<String>,
    pub transaction_number: Option<String>,
    pub cashier: Option<String>,
}

/// Static per-device context repeated on every emitted payload.
#[derive(Debug, Clone)]
pub struct PosMetadata {
    pub pos_type: String,
    pub parser_version: String,
    pub terminal_id: String,
    pub drawer_id: Option<String>,
    pub store_id: Option<String>,
}

impl Serialize for PosMetadata {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("PosMetadata", 5)?;
        s.serialize_field("pos_type", &self.pos_type)?;
        s.serialize_field("parser_version", &self.parser_version)?;
        s.serialize_field("terminal_id", &self.terminal_id)?;
        s.serialize_field("drawer_id", &self.drawer_id)?;
        s.serialize_field("store_id", &self.store_id)?;
        s.end()
    }
}

/// One line within a transaction: the classified line plus its arrival
/// timestamp and dense zero-based position (spec.md §3).
#[derive(Debug, Clone)]
pub struct TransactionLine {
    pub line: ClassifiedLine,
    pub arrived_at: DateTime<Utc>,
    pub position: u32,
}

/// A receipt transaction, owned exclusively by the state machine until it
/// finalizes (spec.md §3 "Ownership").
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub lines: Vec<TransactionLine>,
    pub metadata: ReceiptMetadata,
    pub nvr_event: Option<NvrEvent>,
    closed: bool,
}

impl Transaction {
    pub fn new(id: Uuid, started_at: DateTime<Utc>) -> Self {
        Transaction {
            id,
            started_at,
            lines: Vec::new(),
            metadata: ReceiptMetadata::default(),
            nvr_event: None,
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}

/// Handle to an NVR event, bracketing a transaction (spec.md §3/§4.5). Absence
/// (`None` at the call site) never blocks the transaction pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvrEvent {
    pub event_id: String,
    pub event_url: Option<String>,
    pub camera: String,
    pub label: String,
}

/// One emitted line payload record (spec.md §4.2 finalization, "Lines payload").
#[derive(Debug, Clone, Serialize)]
pub struct LineRecord {
    pub device_id: String,
    pub device_name: String,
    pub device_timestamp: DateTime<Utc>,
    pub line_type: LineType,
    pub description: Option<String>,
    pub qty: Option<f64>,
    pub amount: Option<Amount>,
    pub raw_text: String,
    pub parsed_successfully: bool,
    pub position: u32,
    pub transaction_number: Option<String>,
    pub pos_metadata: PosMetadata,
    pub nvr_event_url: Option<String>,
}

/// The per-transaction summary (spec.md §4.2 finalization, "Transaction summary").
#[derive(Debug, Clone, Serialize)]
pub struct TransactionSummary {
    pub device_id: String,
    pub device_name: String,
    pub terminal_id: String,
    pub pos_type: String,
    pub transaction_number: Option<String>,
    pub total_amount: Option<Amount>,
    pub item_count: u32,
    pub line_count: u32,
    pub cash_amount: Option<Amount>,
    pub credit_amount: Option<Amount>,
    pub debit_amount: Option<Amount>,
    pub preauth_amount: Option<Amount>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub nvr_event_id: Option<String>,
    pub pos_metadata: PosMetadata,
}

/// Topics an [`OutboundJob`] can target (spec.md §3/§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    TransactionLine,
    TransactionLines,
    Transactions,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::TransactionLine => "transaction_line",
            Topic::TransactionLines => "transaction_lines",
            Topic::Transactions => "transactions",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Topic> {
        match s {
            "transaction_line" => Some(Topic::TransactionLine),
            "transaction_lines" => Some(Topic::TransactionLines),
            "transactions" => Some(Topic::Transactions),
            _ => None,
        }
    }
}

/// A durable unit of work in the outbound queue (spec.md §3/§4.3).
#[derive(Debug, Clone)]
pub struct OutboundJob {
    pub id: i64,
    pub topic: Topic,
    pub url: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
    pub attempts: u32,
    pub next_eligible: i64,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amount_parses_and_round_trips_cents() {
        let a: Amount = "5.78".parse().unwrap();
        assert_eq!(a.0, 578);
        assert_eq!(a.as_f64(), 5.78);
    }

    #[test]
    fn amount_parses_negative_refund() {
        let a: Amount = "-1.00".parse().unwrap();
        assert_eq!(a.0, -100);
    }

    #[test]
    fn amount_sums_without_float_drift() {
        let mut total = Amount::from_cents(0);
        for _ in 0..3 {
            total = total.checked_add("0.10".parse().unwrap());
        }
        assert_eq!(total.0, 30);
    }

    #[test]
    fn topic_round_trips_through_str() {
        for t in [
            Topic::TransactionLine,
            Topic::TransactionLines,
            Topic::Transactions,
        ] {
            assert_eq!(Topic::from_str_opt(t.as_str()), Some(t));
        }
    }
}
