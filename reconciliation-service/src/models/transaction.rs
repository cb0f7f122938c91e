use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Transaction Status
// ============================================================================

/// Stored lifecycle state of a bank transaction.
///
/// Import resolves a transaction straight to `Unmatched`, `Matched` or
/// `PartialMatch`; `WrittenOff` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Unmatched,
    Matched,
    PartialMatch,
    WrittenOff,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 4] = [
        Self::Unmatched,
        Self::Matched,
        Self::PartialMatch,
        Self::WrittenOff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unmatched => "unmatched",
            Self::Matched => "matched",
            Self::PartialMatch => "partial_match",
            Self::WrittenOff => "written_off",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unmatched" => Some(Self::Unmatched),
            "matched" => Some(Self::Matched),
            "partial_match" => Some(Self::PartialMatch),
            "written_off" => Some(Self::WrittenOff),
            _ => None,
        }
    }

    /// Statuses that hold a reference to a payment.
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched | Self::PartialMatch)
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Discrepancy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyType {
    AmountMismatch,
    DateMismatch,
    Duplicate,
    MissingPayment,
    Unexpected,
    Partial,
}

impl DiscrepancyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AmountMismatch => "amount_mismatch",
            Self::DateMismatch => "date_mismatch",
            Self::Duplicate => "duplicate",
            Self::MissingPayment => "missing_payment",
            Self::Unexpected => "unexpected",
            Self::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "amount_mismatch" => Some(Self::AmountMismatch),
            "date_mismatch" => Some(Self::DateMismatch),
            "duplicate" => Some(Self::Duplicate),
            "missing_payment" => Some(Self::MissingPayment),
            "unexpected" => Some(Self::Unexpected),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

/// Descriptive classification of why a transaction does not cleanly
/// correspond to an expected payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    #[serde(rename = "type")]
    pub kind: DiscrepancyType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_amount: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl Discrepancy {
    pub fn new(kind: DiscrepancyType) -> Self {
        Self {
            kind,
            expected_amount: None,
            actual_amount: None,
            notes: None,
        }
    }

    pub fn with_amounts(mut self, expected: Option<Decimal>, actual: Option<Decimal>) -> Self {
        self.expected_amount = expected;
        self.actual_amount = actual;
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

// ============================================================================
// Bank Transaction
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTransaction {
    pub transaction_id: Uuid,
    pub owner_id: String,
    pub bank_account_id: String,
    pub external_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub description: String,
    pub category: Option<String>,
    pub payer_name: Option<String>,
    pub payer_reference: Option<String>,
    pub status: TransactionStatus,
    pub matched_payment_id: Option<Uuid>,
    pub match_confidence: Option<Decimal>,
    pub match_type: Option<MatchType>,
    pub discrepancy: Option<Discrepancy>,
    pub imported_at: DateTime<Utc>,
    pub reconciled_at: Option<DateTime<Utc>>,
    pub reconciled_by: Option<String>,
    /// Optimistic concurrency token, bumped on every stored update.
    pub version: i64,
}

impl BankTransaction {
    /// Bind this transaction to a payment. Keeps `matched_payment_id` and
    /// `status` consistent with each other.
    pub fn apply_match(
        &mut self,
        status: TransactionStatus,
        payment_id: Uuid,
        confidence: Decimal,
        match_type: MatchType,
    ) {
        debug_assert!(status.is_matched());
        self.status = status;
        self.matched_payment_id = Some(payment_id);
        self.match_confidence = Some(confidence);
        self.match_type = Some(match_type);
    }

    /// Drop every match and resolution field and return to `unmatched`.
    pub fn clear_match(&mut self) {
        self.status = TransactionStatus::Unmatched;
        self.matched_payment_id = None;
        self.match_confidence = None;
        self.match_type = None;
        self.reconciled_at = None;
        self.reconciled_by = None;
    }

    pub fn mark_reconciled(&mut self, by: &str, at: DateTime<Utc>) {
        self.reconciled_at = Some(at);
        self.reconciled_by = Some(by.to_string());
    }
}

// ============================================================================
// Match Decision
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Exact,
    Rule,
    Fuzzy,
    Manual,
    None,
}

impl MatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Rule => "rule",
            Self::Fuzzy => "fuzzy",
            Self::Manual => "manual",
            Self::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "exact" => Some(Self::Exact),
            "rule" => Some(Self::Rule),
            "fuzzy" => Some(Self::Fuzzy),
            "manual" => Some(Self::Manual),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

/// Best candidate produced by the matcher. Never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchDecision {
    pub payment_id: Option<Uuid>,
    pub confidence: Decimal,
    pub match_type: MatchType,
    /// Category label from the first rule whose conditions held.
    pub category: Option<String>,
}

impl MatchDecision {
    pub fn none() -> Self {
        Self {
            payment_id: None,
            confidence: Decimal::ZERO,
            match_type: MatchType::None,
            category: None,
        }
    }
}
