//! Request and response bodies of the HTTP surface.

use crate::models::{BankTransaction, RuleActions, RuleConditions, TransactionStatus};
use crate::services::lifecycle::{ImportBatch, ImportRecord};
use crate::services::repository::{Page, TransactionFilter};
use crate::services::rules::RuleDraft;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

const DEFAULT_PAGE_SIZE: u32 = 20;
const DEFAULT_PERIOD_DAYS: i64 = 30;
const DEFAULT_RULE_PRIORITY: i32 = 100;

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    DEFAULT_RULE_PRIORITY
}

fn default_period() -> i64 {
    DEFAULT_PERIOD_DAYS
}

// ============================================================================
// Import
// ============================================================================

/// Records are validated one by one by the engine so a bad line is
/// rejected without failing the batch.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ImportRequest {
    #[validate(length(min = 1, max = 255, message = "bankAccountId is required"))]
    pub bank_account_id: String,
    #[serde(alias = "records")]
    pub transactions: Vec<ImportRecord>,
    pub max_items: Option<usize>,
}

impl From<ImportRequest> for ImportBatch {
    fn from(req: ImportRequest) -> Self {
        Self {
            bank_account_id: req.bank_account_id,
            records: req.transactions,
            max_items: req.max_items,
        }
    }
}

// ============================================================================
// Transactions
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionListParams {
    pub status: Option<TransactionStatus>,
    pub bank_account_id: Option<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl TransactionListParams {
    pub fn filter(&self) -> TransactionFilter {
        TransactionFilter {
            status: self.status,
            bank_account_id: self.bank_account_id.clone(),
            date_from: self.start_date,
            date_to: self.end_date,
        }
    }

    pub fn page(&self) -> Page {
        Page::new(
            self.page.unwrap_or(1),
            self.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
        )
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionListResponse {
    pub transactions: Vec<BankTransaction>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u64,
}

impl TransactionListResponse {
    pub fn new(transactions: Vec<BankTransaction>, total: u64, page: Page) -> Self {
        Self {
            transactions,
            total,
            page: page.page,
            page_size: page.page_size,
            total_pages: total.div_ceil(u64::from(page.page_size)),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualMatchRequest {
    pub transaction_id: Uuid,
    pub payment_id: Uuid,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct WriteOffRequest {
    pub transaction_id: Uuid,
    #[validate(length(min = 1, max = 1000, message = "reason is required"))]
    pub reason: String,
}

// ============================================================================
// Rules
// ============================================================================

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RuleRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub conditions: RuleConditions,
    #[serde(default)]
    pub actions: RuleActions,
}

impl From<RuleRequest> for RuleDraft {
    fn from(req: RuleRequest) -> Self {
        Self {
            name: req.name,
            priority: req.priority,
            is_active: req.is_active,
            conditions: req.conditions,
            actions: req.actions,
        }
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryParams {
    #[serde(default = "default_period")]
    pub period_days: i64,
    /// Reference date, today when absent.
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingPaymentsParams {
    #[serde(default = "default_period")]
    pub days_overdue: i64,
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportParams {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub bank_account_id: Option<String>,
}
