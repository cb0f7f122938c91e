//! Read-only aggregates over transactions and expected payments.
//!
//! Every report is computed as of a caller-supplied date so results are
//! reproducible; empty ranges yield zeroed aggregates, never errors.

use crate::models::{
    BankTransaction, DateRange, Discrepancy, Payment, PaymentQuery, PaymentStatus,
    TransactionStatus,
};
use crate::services::payments::PaymentGateway;
use crate::services::repository::{TransactionFilter, TransactionStore};
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;
use uuid::Uuid;

const RATE_DECIMALS: u32 = 4;

// ============================================================================
// Report types
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBreakdown {
    pub unmatched: u64,
    pub matched: u64,
    pub partial_match: u64,
    pub written_off: u64,
}

impl StatusBreakdown {
    fn count(&mut self, status: TransactionStatus) {
        match status {
            TransactionStatus::Unmatched => self.unmatched += 1,
            TransactionStatus::Matched => self.matched += 1,
            TransactionStatus::PartialMatch => self.partial_match += 1,
            TransactionStatus::WrittenOff => self.written_off += 1,
        }
    }
}

/// Totals shared by the summary and the period report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionTotals {
    pub count: u64,
    pub by_status: StatusBreakdown,
    pub total_amount: Decimal,
    pub matched_amount: Decimal,
    pub unmatched_amount: Decimal,
    pub written_off_amount: Decimal,
    /// Discrepancy counts keyed by type.
    pub discrepancies: BTreeMap<String, u64>,
    /// `(matched + partial_match) / count`, zero when there is nothing to rate.
    pub match_rate: Decimal,
}

impl TransactionTotals {
    fn from_transactions<'a>(txns: impl IntoIterator<Item = &'a BankTransaction>) -> Self {
        let mut totals = Self::default();
        for txn in txns {
            totals.count += 1;
            totals.by_status.count(txn.status);
            totals.total_amount += txn.amount;
            match txn.status {
                TransactionStatus::Matched | TransactionStatus::PartialMatch => {
                    totals.matched_amount += txn.amount
                }
                TransactionStatus::Unmatched => totals.unmatched_amount += txn.amount,
                TransactionStatus::WrittenOff => totals.written_off_amount += txn.amount,
            }
            if let Some(d) = &txn.discrepancy {
                *totals
                    .discrepancies
                    .entry(d.kind.as_str().to_string())
                    .or_default() += 1;
            }
        }
        totals.match_rate = ratio(
            totals.by_status.matched + totals.by_status.partial_match,
            totals.count,
        );
        totals
    }
}

/// `as_of - days`, or a validation error when the date is not representable.
fn days_before(as_of: NaiveDate, days: i64, field: &str) -> Result<NaiveDate, AppError> {
    Duration::try_days(days)
        .and_then(|span| as_of.checked_sub_signed(span))
        .ok_or_else(|| AppError::BadRequest(anyhow::anyhow!("{} is out of range", field)))
}

fn ratio(part: u64, whole: u64) -> Decimal {
    if whole == 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(part) / Decimal::from(whole)).round_dp(RATE_DECIMALS)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationSummary {
    pub period_days: i64,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    #[serde(flatten)]
    pub totals: TransactionTotals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingPayment {
    #[serde(flatten)]
    pub payment: Payment,
    pub days_overdue: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingPaymentsReport {
    pub as_of: NaiveDate,
    pub days_overdue: i64,
    pub count: usize,
    pub total_amount: Decimal,
    pub payments: Vec<MissingPayment>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedPayments {
    pub count: u64,
    pub total_amount: Decimal,
    pub completed_count: u64,
    pub completed_amount: Decimal,
    pub pending_count: u64,
    pub pending_amount: Decimal,
}

impl ExpectedPayments {
    fn from_payments(payments: &[Payment]) -> Self {
        let mut expected = Self::default();
        for payment in payments {
            expected.count += 1;
            expected.total_amount += payment.amount;
            match payment.status {
                PaymentStatus::Completed => {
                    expected.completed_count += 1;
                    expected.completed_amount += payment.amount;
                }
                PaymentStatus::Pending => {
                    expected.pending_count += 1;
                    expected.pending_amount += payment.amount;
                }
            }
        }
        expected
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Variance {
    /// Sum of transaction amounts minus sum of completed payment amounts.
    pub amount: Decimal,
    pub match_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscrepancyEntry {
    pub transaction_id: Uuid,
    pub external_id: String,
    pub bank_account_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub matched_payment_id: Option<Uuid>,
    pub discrepancy: Discrepancy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodReport {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub bank_account_id: Option<String>,
    pub transactions: TransactionTotals,
    pub expected_payments: ExpectedPayments,
    pub variance: Variance,
    pub discrepancies: Vec<DiscrepancyEntry>,
}

// ============================================================================
// Service
// ============================================================================

#[derive(Clone)]
pub struct ReportingService {
    transactions: Arc<dyn TransactionStore>,
    payments: Arc<dyn PaymentGateway>,
}

impl ReportingService {
    pub fn new(transactions: Arc<dyn TransactionStore>, payments: Arc<dyn PaymentGateway>) -> Self {
        Self {
            transactions,
            payments,
        }
    }

    /// Transactions dated within the trailing `period_days` up to `as_of`.
    #[instrument(skip(self))]
    pub async fn summary(
        &self,
        owner_id: &str,
        period_days: i64,
        as_of: NaiveDate,
    ) -> Result<ReconciliationSummary, AppError> {
        if period_days < 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "periodDays must not be negative"
            )));
        }
        let start_date = days_before(as_of, period_days, "periodDays")?;
        let txns = self
            .transactions
            .list_all(owner_id, &TransactionFilter::between(start_date, as_of))
            .await?;

        Ok(ReconciliationSummary {
            period_days,
            start_date,
            end_date: as_of,
            totals: TransactionTotals::from_transactions(&txns),
        })
    }

    /// Pending payments due strictly before `as_of - days_overdue` that no
    /// stored transaction references.
    #[instrument(skip(self))]
    pub async fn missing_payments(
        &self,
        owner_id: &str,
        days_overdue: i64,
        as_of: NaiveDate,
    ) -> Result<MissingPaymentsReport, AppError> {
        if days_overdue < 0 {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "daysOverdue must not be negative"
            )));
        }
        let cutoff = days_before(as_of, days_overdue, "daysOverdue")?;
        let matched = self.transactions.matched_payment_ids(owner_id).await?;

        let mut payments: Vec<MissingPayment> = self
            .payments
            .find_payments(&PaymentQuery::for_owner(owner_id).pending())
            .await?
            .into_iter()
            .filter(|p| p.due_date < cutoff && !matched.contains(&p.payment_id))
            .map(|payment| MissingPayment {
                days_overdue: (as_of - payment.due_date).num_days(),
                payment,
            })
            .collect();
        payments.sort_by(|a, b| {
            a.payment
                .due_date
                .cmp(&b.payment.due_date)
                .then(a.payment.payment_id.cmp(&b.payment.payment_id))
        });

        Ok(MissingPaymentsReport {
            as_of,
            days_overdue,
            count: payments.len(),
            total_amount: payments.iter().map(|p| p.payment.amount).sum(),
            payments,
        })
    }

    /// Transactions and expected payments for `[start_date, end_date]`.
    #[instrument(skip(self))]
    pub async fn period_report(
        &self,
        owner_id: &str,
        start_date: NaiveDate,
        end_date: NaiveDate,
        bank_account_id: Option<String>,
    ) -> Result<PeriodReport, AppError> {
        if start_date > end_date {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "startDate must not be after endDate"
            )));
        }

        let filter = TransactionFilter {
            bank_account_id: bank_account_id.clone(),
            ..TransactionFilter::between(start_date, end_date)
        };
        let txns = self.transactions.list_all(owner_id, &filter).await?;
        let payments = self
            .payments
            .find_payments(
                &PaymentQuery::for_owner(owner_id).due(DateRange::new(start_date, end_date)),
            )
            .await?;

        let transactions = TransactionTotals::from_transactions(&txns);
        let expected_payments = ExpectedPayments::from_payments(&payments);
        let variance = Variance {
            amount: transactions.total_amount - expected_payments.completed_amount,
            match_rate: transactions.match_rate,
        };

        let discrepancies = txns
            .into_iter()
            .filter_map(|txn| {
                let discrepancy = txn.discrepancy?;
                Some(DiscrepancyEntry {
                    transaction_id: txn.transaction_id,
                    external_id: txn.external_id,
                    bank_account_id: txn.bank_account_id,
                    date: txn.date,
                    amount: txn.amount,
                    status: txn.status,
                    matched_payment_id: txn.matched_payment_id,
                    discrepancy,
                })
            })
            .collect();

        Ok(PeriodReport {
            start_date,
            end_date,
            bank_account_id,
            transactions,
            expected_payments,
            variance,
            discrepancies,
        })
    }
}
