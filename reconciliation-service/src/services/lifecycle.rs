//! Bank transaction lifecycle: import with auto-matching, manual match,
//! unmatch and write-off.
//!
//! Manual match and unmatch touch two stores, the transaction store and the
//! payment ledger. They run as a small saga: the ledger write goes first
//! with an idempotency key and retries, the transaction write follows, and a
//! failed transaction write is compensated by restoring the payment's prior
//! state. Each call is its own saga attempt with its own keys, so a caller
//! retrying after a compensated failure writes to the ledger again. Mutations of one transaction are serialised in process by a
//! per-transaction mutex and across processes by the stored `version`.

use crate::config::{ImportConfig, ReconciliationConfig};
use crate::models::{
    BankTransaction, MatchType, Payment, PaymentStatus, TransactionStatus,
};
use crate::services::discrepancy::{unexpected, DiscrepancyDetector};
use crate::services::matcher::{CompiledRuleSet, MatchSuggestion, Matcher};
use crate::services::metrics::{
    record_imported_transaction, record_lifecycle_operation, record_payment_compensation,
};
use crate::services::payments::PaymentGateway;
use crate::services::repository::{Page, RuleStore, TransactionFilter, TransactionStore};
use chrono::{NaiveDate, Utc};
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use service_core::retry::{retry_async, RetryConfig};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Recorded as `reconciledBy` for automatic resolutions.
pub const SYSTEM_ACTOR: &str = "system";

// ============================================================================
// Import types
// ============================================================================

/// One pre-parsed statement line.
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ImportRecord {
    #[validate(length(min = 1, max = 255, message = "externalId is required"))]
    pub external_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    #[serde(default)]
    pub description: String,
    pub category: Option<String>,
    pub payer_name: Option<String>,
    pub payer_reference: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportBatch {
    pub bank_account_id: String,
    pub records: Vec<ImportRecord>,
    /// Caller-supplied cutoff, capped by the configured maximum batch size.
    pub max_items: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedRecord {
    pub index: usize,
    pub external_id: String,
    pub reason: String,
}

/// A record that was still imported, but whose matching or persistence
/// hit a backend error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportFailure {
    pub external_id: String,
    pub error: String,
}

impl ImportFailure {
    fn new(txn: &BankTransaction, err: &AppError) -> Self {
        Self {
            external_id: txn.external_id.clone(),
            error: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub imported: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectedRecord>,
    pub failures: Vec<ImportFailure>,
    /// Records beyond the cutoff, left for a later call.
    pub deferred: usize,
    pub transactions: Vec<BankTransaction>,
}

/// A transaction together with manual-match candidates.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDetail {
    pub transaction: BankTransaction,
    pub suggestions: Vec<MatchSuggestion>,
}

// ============================================================================
// Engine
// ============================================================================

pub struct ReconciliationEngine {
    transactions: Arc<dyn TransactionStore>,
    rules: Arc<dyn RuleStore>,
    payments: Arc<dyn PaymentGateway>,
    matcher: Matcher,
    detector: DiscrepancyDetector,
    import: ImportConfig,
    write_retry: RetryConfig,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ReconciliationEngine {
    pub fn new(
        transactions: Arc<dyn TransactionStore>,
        rules: Arc<dyn RuleStore>,
        payments: Arc<dyn PaymentGateway>,
        config: &ReconciliationConfig,
    ) -> Self {
        Self {
            transactions,
            rules,
            matcher: Matcher::new(payments.clone(), config.matching.clone()),
            payments,
            detector: DiscrepancyDetector::new(config.discrepancy.clone()),
            import: config.import.clone(),
            write_retry: config.payment_ledger.write_retry.clone(),
            locks: DashMap::new(),
        }
    }

    async fn lock(&self, transaction_id: Uuid) -> TransactionLock<'_> {
        let mutex = self.locks.entry(transaction_id).or_default().clone();
        TransactionLock {
            locks: &self.locks,
            transaction_id,
            guard: Some(mutex.lock_owned().await),
        }
    }

    async fn fetch(&self, owner_id: &str, transaction_id: Uuid) -> Result<BankTransaction, AppError> {
        self.transactions
            .get(owner_id, transaction_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Transaction {} not found", transaction_id))
            })
    }

    // ------------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------------

    /// Import a batch. Duplicates are skipped, invalid records rejected and
    /// backend failures degrade single transactions to `unmatched`; none of
    /// these abort the batch.
    #[instrument(
        skip(self, batch),
        fields(owner_id = %owner_id, bank_account_id = %batch.bank_account_id, records = batch.records.len())
    )]
    pub async fn import(&self, owner_id: &str, batch: ImportBatch) -> Result<ImportResult, AppError> {
        let ImportBatch {
            bank_account_id,
            mut records,
            max_items,
        } = batch;

        if bank_account_id.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("bankAccountId is required")));
        }

        let limit = max_items
            .unwrap_or(self.import.max_batch)
            .min(self.import.max_batch);
        let mut result = ImportResult {
            deferred: records.len().saturating_sub(limit),
            ..Default::default()
        };
        records.truncate(limit);

        let rules = match self.rules.list(owner_id).await {
            Ok(rules) => CompiledRuleSet::compile(rules),
            Err(e) => {
                warn!(error = %e, "Failed to load rules, matching without them");
                CompiledRuleSet::empty()
            }
        };

        let imported_at = Utc::now();
        let mut seen = HashSet::new();
        let mut fresh = Vec::with_capacity(records.len());
        for (index, record) in records.into_iter().enumerate() {
            if let Err(e) = record.validate() {
                record_imported_transaction("rejected");
                result.rejected.push(RejectedRecord {
                    index,
                    external_id: record.external_id,
                    reason: e.to_string(),
                });
                continue;
            }

            if !seen.insert(record.external_id.clone()) {
                record_imported_transaction("duplicate");
                result.duplicates += 1;
                continue;
            }
            match self
                .transactions
                .exists(&bank_account_id, &record.external_id)
                .await
            {
                Ok(true) => {
                    record_imported_transaction("duplicate");
                    result.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                // The insert is conditional on the dedupe key as well.
                Err(e) => {
                    warn!(external_id = %record.external_id, error = %e, "Dedupe lookup failed, relying on the insert");
                }
            }

            fresh.push(BankTransaction {
                transaction_id: Uuid::new_v4(),
                owner_id: owner_id.to_string(),
                bank_account_id: bank_account_id.clone(),
                external_id: record.external_id,
                date: record.date,
                amount: record.amount,
                description: record.description,
                category: record.category,
                payer_name: record.payer_name,
                payer_reference: record.payer_reference,
                status: TransactionStatus::Unmatched,
                matched_payment_id: None,
                match_confidence: None,
                match_type: None,
                discrepancy: None,
                imported_at,
                reconciled_at: None,
                reconciled_by: None,
                version: 0,
            });
        }

        let resolved: Vec<(BankTransaction, Option<ImportFailure>)> = stream::iter(fresh)
            .map(|txn| self.resolve(txn, &rules, owner_id))
            .buffered(self.import.concurrency)
            .collect()
            .await;

        for (txn, failure) in resolved {
            result.failures.extend(failure);
            match self.transactions.insert(&txn).await {
                Ok(true) => {
                    record_imported_transaction("imported");
                    result.imported += 1;
                    result.transactions.push(txn);
                }
                Ok(false) => {
                    record_imported_transaction("duplicate");
                    result.duplicates += 1;
                }
                Err(e) => {
                    error!(external_id = %txn.external_id, error = %e, "Failed to store imported transaction");
                    record_imported_transaction("failed");
                    result.failures.push(ImportFailure::new(&txn, &e));
                }
            }
        }

        info!(
            imported = result.imported,
            duplicates = result.duplicates,
            rejected = result.rejected.len(),
            failures = result.failures.len(),
            deferred = result.deferred,
            "Statement import completed"
        );
        Ok(result)
    }

    /// Decide the initial state of a fresh transaction.
    async fn resolve(
        &self,
        mut txn: BankTransaction,
        rules: &CompiledRuleSet,
        owner_id: &str,
    ) -> (BankTransaction, Option<ImportFailure>) {
        let decision = match self.matcher.find_match(&txn, rules, owner_id).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(external_id = %txn.external_id, error = %e, "Matching failed, importing as unmatched");
                let failure = ImportFailure::new(&txn, &e);
                txn.discrepancy = Some(unexpected(&txn));
                return (txn, Some(failure));
            }
        };

        if txn.category.is_none() {
            txn.category = decision.category.clone();
        }

        let threshold = self.matcher.config().auto_match_threshold;
        let payment_id = match decision.payment_id {
            Some(id) if decision.confidence >= threshold => id,
            _ => {
                txn.discrepancy = Some(unexpected(&txn));
                return (txn, None);
            }
        };

        let payment = match self.payments.get_payment(owner_id, payment_id).await {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                let e = AppError::NotFound(anyhow::anyhow!(
                    "Payment {} disappeared during matching",
                    payment_id
                ));
                warn!(external_id = %txn.external_id, error = %e, "Importing as unmatched");
                let failure = ImportFailure::new(&txn, &e);
                txn.discrepancy = Some(unexpected(&txn));
                return (txn, Some(failure));
            }
            Err(e) => {
                warn!(external_id = %txn.external_id, error = %e, "Payment lookup failed, importing as unmatched");
                let failure = ImportFailure::new(&txn, &e);
                txn.discrepancy = Some(unexpected(&txn));
                return (txn, Some(failure));
            }
        };

        let status = if decision.confidence >= Decimal::ONE_HUNDRED {
            TransactionStatus::Matched
        } else {
            TransactionStatus::PartialMatch
        };
        txn.apply_match(status, payment_id, decision.confidence, decision.match_type);
        if status == TransactionStatus::Matched {
            txn.mark_reconciled(SYSTEM_ACTOR, Utc::now());
        }
        txn.discrepancy = self.detector.detect(&txn, Some(&payment));
        (txn, None)
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    #[instrument(skip(self, filter))]
    pub async fn list_transactions(
        &self,
        owner_id: &str,
        filter: &TransactionFilter,
        page: Page,
    ) -> Result<(Vec<BankTransaction>, u64), AppError> {
        self.transactions.list(owner_id, filter, page).await
    }

    /// The transaction plus ranked candidates when it is still open to a
    /// manual match. A failed candidate lookup yields no suggestions.
    #[instrument(skip(self))]
    pub async fn transaction_detail(
        &self,
        owner_id: &str,
        transaction_id: Uuid,
    ) -> Result<TransactionDetail, AppError> {
        let transaction = self.fetch(owner_id, transaction_id).await?;

        let suggestions = match transaction.status {
            TransactionStatus::Unmatched | TransactionStatus::PartialMatch => {
                self.matcher
                    .suggestions(&transaction, owner_id)
                    .await
                    .unwrap_or_else(|e| {
                        warn!(error = %e, "Failed to load match suggestions");
                        Vec::new()
                    })
            }
            TransactionStatus::Matched | TransactionStatus::WrittenOff => Vec::new(),
        };

        Ok(TransactionDetail {
            transaction,
            suggestions,
        })
    }

    // ------------------------------------------------------------------------
    // Manual match
    // ------------------------------------------------------------------------

    /// Bind a transaction to a payment and mark the payment paid.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn manual_match(
        &self,
        owner_id: &str,
        transaction_id: Uuid,
        payment_id: Uuid,
    ) -> Result<BankTransaction, AppError> {
        let _guard = self.lock(transaction_id).await;
        let txn = self.fetch(owner_id, transaction_id).await?;

        if !matches!(
            txn.status,
            TransactionStatus::Unmatched | TransactionStatus::PartialMatch
        ) {
            record_lifecycle_operation("manual_match", "rejected");
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Transaction is {} and cannot be matched",
                txn.status
            )));
        }

        let payment = self
            .payments
            .get_payment(owner_id, payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment {} not found", payment_id)))?;
        if payment.status == PaymentStatus::Completed {
            record_lifecycle_operation("manual_match", "rejected");
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Payment {} is already settled",
                payment_id
            )));
        }

        let key = saga_key(transaction_id, "match", txn.version);
        let paid = retry_async(&self.write_retry, "mark_paid", || {
            self.payments.mark_paid(payment_id, txn.date, &key)
        })
        .await;

        if let Err(e) = paid {
            error!(payment_id = %payment_id, error = %e, "Failed to mark payment paid, degrading transaction to unmatched");
            record_lifecycle_operation("manual_match", "failed");
            self.restore_payment("manual_match", &payment, txn.date, &format!("{}:revert", key))
                .await;
            self.degrade_to_unmatched(txn).await;
            return Err(e);
        }

        let mut matched = txn.clone();
        matched.apply_match(
            TransactionStatus::Matched,
            payment_id,
            Decimal::ONE_HUNDRED,
            MatchType::Manual,
        );
        matched.mark_reconciled(owner_id, Utc::now());
        matched.discrepancy = self.detector.detect(&matched, Some(&payment));

        match self.transactions.update(&matched).await {
            Ok(stored) => {
                info!(transaction_id = %transaction_id, payment_id = %payment_id, "Transaction matched manually");
                record_lifecycle_operation("manual_match", "success");
                Ok(stored)
            }
            Err(e) => {
                error!(transaction_id = %transaction_id, error = %e, "Failed to store manual match, reverting payment");
                record_lifecycle_operation("manual_match", "failed");
                self.restore_payment("manual_match", &payment, txn.date, &format!("{}:revert", key))
                    .await;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Unmatch
    // ------------------------------------------------------------------------

    /// Return a matched transaction to `unmatched` and its payment to pending.
    #[instrument(skip(self), fields(owner_id = %owner_id))]
    pub async fn unmatch(
        &self,
        owner_id: &str,
        transaction_id: Uuid,
    ) -> Result<BankTransaction, AppError> {
        let _guard = self.lock(transaction_id).await;
        let txn = self.fetch(owner_id, transaction_id).await?;

        let Some(payment_id) = txn.matched_payment_id.filter(|_| txn.status.is_matched()) else {
            record_lifecycle_operation("unmatch", "rejected");
            return Err(AppError::InvalidState(anyhow::anyhow!(
                "Transaction is {} and has no match to revert",
                txn.status
            )));
        };

        let prior = self
            .payments
            .get_payment(owner_id, payment_id)
            .await?
            .filter(|p| p.status == PaymentStatus::Completed);
        if prior.is_none() {
            info!(payment_id = %payment_id, "Payment is not settled, nothing to revert in the ledger");
        }

        let key = saga_key(transaction_id, "unmatch", txn.version);
        if prior.is_some() {
            retry_async(&self.write_retry, "mark_pending", || {
                self.payments.mark_pending(payment_id, &key)
            })
            .await
            .inspect_err(|e| {
                error!(payment_id = %payment_id, error = %e, "Failed to revert payment to pending");
                record_lifecycle_operation("unmatch", "failed");
            })?;
        }

        let mut cleared = txn.clone();
        cleared.clear_match();
        cleared.discrepancy = None;

        match self.transactions.update(&cleared).await {
            Ok(stored) => {
                info!(transaction_id = %transaction_id, payment_id = %payment_id, "Transaction unmatched");
                record_lifecycle_operation("unmatch", "success");
                Ok(stored)
            }
            Err(e) => {
                error!(transaction_id = %transaction_id, error = %e, "Failed to store unmatch, restoring payment");
                record_lifecycle_operation("unmatch", "failed");
                if let Some(prior) = prior {
                    self.restore_payment("unmatch", &prior, txn.date, &format!("{}:revert", key))
                        .await;
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Write-off
    // ------------------------------------------------------------------------

    /// Resolve an open transaction as intentionally unreconciled. Terminal.
    #[instrument(skip(self, reason), fields(owner_id = %owner_id))]
    pub async fn write_off(
        &self,
        owner_id: &str,
        transaction_id: Uuid,
        reason: &str,
    ) -> Result<BankTransaction, AppError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "A write-off reason is required"
            )));
        }

        let _guard = self.lock(transaction_id).await;
        let txn = self.fetch(owner_id, transaction_id).await?;

        match txn.status {
            TransactionStatus::Unmatched | TransactionStatus::PartialMatch => {}
            TransactionStatus::Matched => {
                record_lifecycle_operation("write_off", "rejected");
                return Err(AppError::InvalidState(anyhow::anyhow!(
                    "Matched transactions must be unmatched before a write-off"
                )));
            }
            TransactionStatus::WrittenOff => {
                record_lifecycle_operation("write_off", "rejected");
                return Err(AppError::InvalidState(anyhow::anyhow!(
                    "Transaction is already written off"
                )));
            }
        }

        let mut written_off = txn.clone();
        written_off.clear_match();
        written_off.status = TransactionStatus::WrittenOff;
        written_off.discrepancy = Some(unexpected(&written_off).with_notes(reason));
        written_off.mark_reconciled(owner_id, Utc::now());

        let stored = self.transactions.update(&written_off).await?;
        info!(transaction_id = %transaction_id, "Transaction written off");
        record_lifecycle_operation("write_off", "success");
        Ok(stored)
    }

    // ------------------------------------------------------------------------
    // Saga helpers
    // ------------------------------------------------------------------------

    /// Put the payment back into `prior`'s state. Failures are logged: at
    /// that point the ledger and the transaction store disagree and an
    /// operator has to reconcile them.
    async fn restore_payment(
        &self,
        operation: &str,
        prior: &Payment,
        fallback_paid_date: NaiveDate,
        key: &str,
    ) {
        let payment_id = prior.payment_id;
        let restored = match prior.status {
            PaymentStatus::Pending => {
                retry_async(&self.write_retry, "mark_pending", || {
                    self.payments.mark_pending(payment_id, key)
                })
                .await
            }
            PaymentStatus::Completed => {
                let paid_date = prior.paid_date.unwrap_or(fallback_paid_date);
                retry_async(&self.write_retry, "mark_paid", || {
                    self.payments.mark_paid(payment_id, paid_date, key)
                })
                .await
            }
        };

        match restored {
            Ok(()) => {
                warn!(payment_id = %payment_id, operation = operation, "Payment restored by compensation");
                record_payment_compensation(operation, "success");
            }
            Err(e) => {
                error!(
                    payment_id = %payment_id,
                    operation = operation,
                    error = %e,
                    "Compensation failed, payment ledger needs manual correction"
                );
                record_payment_compensation(operation, "failed");
            }
        }
    }

    async fn degrade_to_unmatched(&self, mut txn: BankTransaction) {
        if txn.status == TransactionStatus::Unmatched {
            return;
        }
        txn.clear_match();
        txn.discrepancy = Some(unexpected(&txn));
        if let Err(e) = self.transactions.update(&txn).await {
            error!(transaction_id = %txn.transaction_id, error = %e, "Failed to degrade transaction to unmatched");
        }
    }
}

/// Idempotency key for one saga attempt. Retries inside the attempt share it;
/// a new call never reuses a key of an earlier, possibly compensated, attempt.
fn saga_key(transaction_id: Uuid, operation: &str, version: i64) -> String {
    format!("{}:{}:{}:{}", transaction_id, operation, version, Uuid::new_v4())
}

/// Mutation lock of one transaction. The map entry is dropped with the last
/// holder so the map only tracks transactions being mutated.
struct TransactionLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    transaction_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TransactionLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.transaction_id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DiscrepancyType;
    use crate::services::fixtures::{date, payment, rule, OWNER};
    use crate::services::payments::InMemoryPaymentLedger;
    use crate::services::repository::{InMemoryRuleStore, InMemoryTransactionStore};
    use rust_decimal_macros::dec;

    struct Harness {
        engine: ReconciliationEngine,
        transactions: Arc<InMemoryTransactionStore>,
        rules: Arc<InMemoryRuleStore>,
        ledger: Arc<InMemoryPaymentLedger>,
    }

    fn harness() -> Harness {
        harness_with(ReconciliationConfig::in_memory())
    }

    fn harness_with(config: ReconciliationConfig) -> Harness {
        let transactions = Arc::new(InMemoryTransactionStore::new());
        let rules = Arc::new(InMemoryRuleStore::new());
        let ledger = Arc::new(InMemoryPaymentLedger::new());
        let engine =
            ReconciliationEngine::new(transactions.clone(), rules.clone(), ledger.clone(), &config);
        Harness {
            engine,
            transactions,
            rules,
            ledger,
        }
    }

    fn record(external_id: &str, amount: Decimal, on: &str) -> ImportRecord {
        ImportRecord {
            external_id: external_id.to_string(),
            date: date(on),
            amount,
            description: "RENT MARCH".to_string(),
            category: None,
            payer_name: None,
            payer_reference: None,
        }
    }

    fn batch(records: Vec<ImportRecord>) -> ImportBatch {
        ImportBatch {
            bank_account_id: "acct-1".to_string(),
            records,
            max_items: None,
        }
    }

    async fn import_one(h: &Harness, r: ImportRecord) -> BankTransaction {
        let mut result = h.engine.import(OWNER, batch(vec![r])).await.unwrap();
        assert_eq!(result.imported, 1);
        result.transactions.remove(0)
    }

    #[tokio::test]
    async fn exact_amount_near_due_date_is_matched() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        h.ledger.insert(rent.clone()).await;

        let txn = import_one(&h, record("tx-1", dec!(1500.00), "2025-03-01")).await;

        assert_eq!(txn.status, TransactionStatus::Matched);
        assert_eq!(txn.match_confidence, Some(dec!(100)));
        assert_eq!(txn.match_type, Some(MatchType::Exact));
        assert_eq!(txn.matched_payment_id, Some(rent.payment_id));
        assert_eq!(txn.discrepancy, None);
        assert_eq!(txn.reconciled_by.as_deref(), Some(SYSTEM_ACTOR));
        assert!(txn.reconciled_at.is_some());
    }

    #[tokio::test]
    async fn difference_beyond_fuzzy_tolerance_stays_unmatched() {
        let h = harness();
        h.ledger.insert(payment(dec!(1500.00), "2025-03-03")).await;

        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;

        assert_eq!(txn.status, TransactionStatus::Unmatched);
        assert_eq!(txn.matched_payment_id, None);
        assert_eq!(txn.match_confidence, None);
        let discrepancy = txn.discrepancy.unwrap();
        assert_eq!(discrepancy.kind, DiscrepancyType::Unexpected);
        assert_eq!(discrepancy.actual_amount, Some(dec!(1400.00)));
    }

    #[tokio::test]
    async fn write_off_records_reason_and_is_terminal() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        h.ledger.insert(rent.clone()).await;
        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;

        let written = h
            .engine
            .write_off(OWNER, txn.transaction_id, "tenant paid via other bank")
            .await
            .unwrap();

        assert_eq!(written.status, TransactionStatus::WrittenOff);
        let discrepancy = written.discrepancy.clone().unwrap();
        assert_eq!(discrepancy.kind, DiscrepancyType::Unexpected);
        assert_eq!(discrepancy.notes.as_deref(), Some("tenant paid via other bank"));
        assert!(written.reconciled_at.is_some());
        assert_eq!(written.reconciled_by.as_deref(), Some(OWNER));

        let err = h
            .engine
            .manual_match(OWNER, txn.transaction_id, rent.payment_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        let err = h.engine.unmatch(OWNER, txn.transaction_id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        let err = h
            .engine
            .write_off(OWNER, txn.transaction_id, "again")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        assert_eq!(
            h.ledger.payment(rent.payment_id).await.unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn write_off_requires_a_reason() {
        let h = harness();
        let txn = import_one(&h, record("tx-1", dec!(10), "2025-03-01")).await;
        let err = h
            .engine
            .write_off(OWNER, txn.transaction_id, "   ")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn reimport_is_idempotent() {
        let h = harness();
        let first = h
            .engine
            .import(OWNER, batch(vec![record("tx-1", dec!(10), "2025-03-01")]))
            .await
            .unwrap();
        assert_eq!((first.imported, first.duplicates), (1, 0));

        let second = h
            .engine
            .import(OWNER, batch(vec![record("tx-1", dec!(10), "2025-03-01")]))
            .await
            .unwrap();
        assert_eq!((second.imported, second.duplicates), (0, 1));
        assert!(second.transactions.is_empty());
        assert_eq!(h.transactions.len().await, 1);
    }

    #[tokio::test]
    async fn repeats_within_one_batch_are_duplicates() {
        let h = harness();
        let result = h
            .engine
            .import(
                OWNER,
                batch(vec![
                    record("tx-1", dec!(10), "2025-03-01"),
                    record("tx-1", dec!(10), "2025-03-01"),
                ]),
            )
            .await
            .unwrap();
        assert_eq!((result.imported, result.duplicates), (1, 1));
    }

    #[tokio::test]
    async fn invalid_records_are_rejected_without_aborting() {
        let h = harness();
        let result = h
            .engine
            .import(
                OWNER,
                batch(vec![
                    record("", dec!(10), "2025-03-01"),
                    record("tx-1", dec!(10), "2025-03-01"),
                ]),
            )
            .await
            .unwrap();
        assert_eq!(result.imported, 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].index, 0);
    }

    #[tokio::test]
    async fn cutoff_defers_the_remainder() {
        let mut config = ReconciliationConfig::in_memory();
        config.import.max_batch = 3;
        let h = harness_with(config);

        let records: Vec<ImportRecord> = (0..5)
            .map(|i| record(&format!("tx-{}", i), dec!(10), "2025-03-01"))
            .collect();
        let result = h
            .engine
            .import(
                OWNER,
                ImportBatch {
                    max_items: Some(10),
                    ..batch(records.clone())
                },
            )
            .await
            .unwrap();
        assert_eq!((result.imported, result.deferred), (3, 2));

        let result = h
            .engine
            .import(
                OWNER,
                ImportBatch {
                    max_items: Some(1),
                    ..batch(records)
                },
            )
            .await
            .unwrap();
        assert_eq!((result.imported, result.duplicates, result.deferred), (0, 1, 4));
    }

    #[tokio::test]
    async fn ledger_outage_degrades_import_to_unmatched() {
        let h = harness();
        h.ledger.insert(payment(dec!(1500.00), "2025-03-03")).await;
        h.ledger.set_reads_down(true);

        let result = h
            .engine
            .import(OWNER, batch(vec![record("tx-1", dec!(1500.00), "2025-03-01")]))
            .await
            .unwrap();

        assert_eq!(result.imported, 1);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].external_id, "tx-1");
        assert_eq!(result.transactions[0].status, TransactionStatus::Unmatched);
        assert_eq!(
            result.transactions[0].discrepancy.as_ref().map(|d| d.kind),
            Some(DiscrepancyType::Unexpected)
        );
    }

    #[tokio::test]
    async fn near_match_below_full_confidence_is_partial() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-12");
        h.ledger.insert(rent.clone()).await;

        let txn = import_one(&h, record("tx-1", dec!(1500.00), "2025-03-01")).await;

        assert_eq!(txn.status, TransactionStatus::PartialMatch);
        assert_eq!(txn.match_type, Some(MatchType::Fuzzy));
        assert_eq!(txn.match_confidence, Some(dec!(80)));
        assert_eq!(txn.matched_payment_id, Some(rent.payment_id));
        assert_eq!(txn.reconciled_at, None);
        // Import never settles the payment.
        assert_eq!(
            h.ledger.payment(rent.payment_id).await.unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn rule_category_is_copied_onto_uncategorised_transactions() {
        let h = harness();
        let mut labelling = rule(1, "rent", dec!(0), false);
        labelling.actions.category = Some("rent".to_string());
        h.rules.insert(&labelling).await.unwrap();

        let txn = import_one(&h, record("tx-1", dec!(10), "2025-03-01")).await;
        assert_eq!(txn.category.as_deref(), Some("rent"));
        assert_eq!(txn.status, TransactionStatus::Unmatched);
    }

    #[tokio::test]
    async fn manual_match_settles_the_payment() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        h.ledger.insert(rent.clone()).await;
        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;

        let matched = h
            .engine
            .manual_match(OWNER, txn.transaction_id, rent.payment_id)
            .await
            .unwrap();

        assert_eq!(matched.status, TransactionStatus::Matched);
        assert_eq!(matched.match_confidence, Some(dec!(100)));
        assert_eq!(matched.match_type, Some(MatchType::Manual));
        assert_eq!(matched.reconciled_by.as_deref(), Some(OWNER));
        assert_eq!(matched.version, txn.version + 1);
        let discrepancy = matched.discrepancy.unwrap();
        assert_eq!(discrepancy.kind, DiscrepancyType::Partial);
        assert_eq!(discrepancy.expected_amount, Some(dec!(1500.00)));

        let settled = h.ledger.payment(rent.payment_id).await.unwrap();
        assert_eq!(settled.status, PaymentStatus::Completed);
        assert_eq!(settled.paid_date, Some(date("2025-03-01")));
    }

    #[tokio::test]
    async fn unmatch_reverses_a_manual_match() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        h.ledger.insert(rent.clone()).await;
        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;
        h.engine
            .manual_match(OWNER, txn.transaction_id, rent.payment_id)
            .await
            .unwrap();

        let reverted = h.engine.unmatch(OWNER, txn.transaction_id).await.unwrap();

        assert_eq!(reverted.status, TransactionStatus::Unmatched);
        assert_eq!(reverted.matched_payment_id, None);
        assert_eq!(reverted.match_confidence, None);
        assert_eq!(reverted.match_type, None);
        assert_eq!(reverted.reconciled_at, None);
        assert_eq!(reverted.reconciled_by, None);
        assert_eq!(reverted.discrepancy, None);

        let payment = h.ledger.payment(rent.payment_id).await.unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(payment.paid_date, None);

        // The same pair can be matched again after the reset.
        h.engine
            .manual_match(OWNER, txn.transaction_id, rent.payment_id)
            .await
            .unwrap();
        assert_eq!(
            h.ledger.payment(rent.payment_id).await.unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn unmatch_requires_a_match() {
        let h = harness();
        let txn = import_one(&h, record("tx-1", dec!(10), "2025-03-01")).await;
        let err = h.engine.unmatch(OWNER, txn.transaction_id).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn matched_transactions_cannot_be_matched_or_written_off() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        let other = payment(dec!(1500.00), "2025-04-03");
        h.ledger.insert(rent.clone()).await;
        h.ledger.insert(other.clone()).await;
        let txn = import_one(&h, record("tx-1", dec!(1500.00), "2025-03-01")).await;
        assert_eq!(txn.status, TransactionStatus::Matched);

        let err = h
            .engine
            .manual_match(OWNER, txn.transaction_id, other.payment_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
        let err = h
            .engine
            .write_off(OWNER, txn.transaction_id, "reason")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE");
    }

    #[tokio::test]
    async fn other_owners_see_not_found_and_cause_no_side_effects() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        h.ledger.insert(rent.clone()).await;
        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;

        let err = h
            .engine
            .manual_match("intruder", txn.transaction_id, rent.payment_id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = h
            .engine
            .write_off("intruder", txn.transaction_id, "mine now")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        assert_eq!(
            h.ledger.payment(rent.payment_id).await.unwrap().status,
            PaymentStatus::Pending
        );
        let stored = h.engine.fetch(OWNER, txn.transaction_id).await.unwrap();
        assert_eq!(stored, txn);
    }

    #[tokio::test]
    async fn unknown_payment_is_not_found() {
        let h = harness();
        let txn = import_one(&h, record("tx-1", dec!(10), "2025-03-01")).await;
        let err = h
            .engine
            .manual_match(OWNER, txn.transaction_id, Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn failed_transaction_write_reverts_the_payment() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        h.ledger.insert(rent.clone()).await;
        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;
        h.transactions.fail_next_updates(1);

        let err = h
            .engine
            .manual_match(OWNER, txn.transaction_id, rent.payment_id)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(
            h.ledger.payment(rent.payment_id).await.unwrap().status,
            PaymentStatus::Pending
        );
        let stored = h.engine.fetch(OWNER, txn.transaction_id).await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Unmatched);

        // Retrying after the compensation settles the payment again.
        let matched = h
            .engine
            .manual_match(OWNER, txn.transaction_id, rent.payment_id)
            .await
            .unwrap();
        assert_eq!(matched.status, TransactionStatus::Matched);
        let settled = h.ledger.payment(rent.payment_id).await.unwrap();
        assert_eq!(settled.status, PaymentStatus::Completed);
        assert_eq!(settled.paid_date, Some(date("2025-03-01")));
    }

    #[tokio::test]
    async fn unmatch_retry_after_failed_transaction_write_reverts_the_payment() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        h.ledger.insert(rent.clone()).await;
        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;
        h.engine
            .manual_match(OWNER, txn.transaction_id, rent.payment_id)
            .await
            .unwrap();

        h.transactions.fail_next_updates(1);
        let err = h.engine.unmatch(OWNER, txn.transaction_id).await.unwrap_err();
        assert_eq!(err.code(), "INTERNAL");
        assert_eq!(
            h.ledger.payment(rent.payment_id).await.unwrap().status,
            PaymentStatus::Completed
        );
        let stored = h.engine.fetch(OWNER, txn.transaction_id).await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Matched);

        let unmatched = h.engine.unmatch(OWNER, txn.transaction_id).await.unwrap();
        assert_eq!(unmatched.status, TransactionStatus::Unmatched);
        let reverted = h.ledger.payment(rent.payment_id).await.unwrap();
        assert_eq!(reverted.status, PaymentStatus::Pending);
        assert_eq!(reverted.paid_date, None);
    }

    #[tokio::test]
    async fn dedupe_lookup_failure_does_not_abort_the_batch() {
        let h = harness();
        import_one(&h, record("tx-1", dec!(10), "2025-03-01")).await;

        h.transactions.fail_next_lookups(1);
        let result = h
            .engine
            .import(
                OWNER,
                batch(vec![
                    record("tx-1", dec!(10), "2025-03-01"),
                    record("tx-3", dec!(12), "2025-03-02"),
                ]),
            )
            .await
            .unwrap();

        assert_eq!(result.imported, 1);
        assert_eq!(result.duplicates, 1);
        assert_eq!(result.transactions[0].external_id, "tx-3");
        assert_eq!(h.transactions.len().await, 2);
    }

    #[tokio::test]
    async fn ledger_write_failure_degrades_to_unmatched() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-12");
        h.ledger.insert(rent.clone()).await;
        let txn = import_one(&h, record("tx-1", dec!(1500.00), "2025-03-01")).await;
        assert_eq!(txn.status, TransactionStatus::PartialMatch);
        h.ledger.set_writes_down(true);

        let err = h
            .engine
            .manual_match(OWNER, txn.transaction_id, rent.payment_id)
            .await
            .unwrap_err();

        assert_eq!(err.code(), "UPSTREAM_ERROR");
        let stored = h.engine.fetch(OWNER, txn.transaction_id).await.unwrap();
        assert_eq!(stored.status, TransactionStatus::Unmatched);
        assert_eq!(stored.matched_payment_id, None);
        assert_eq!(
            h.ledger.payment(rent.payment_id).await.unwrap().status,
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn transient_ledger_failures_are_retried() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        h.ledger.insert(rent.clone()).await;
        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;
        h.ledger.fail_next_writes(2);

        let matched = h
            .engine
            .manual_match(OWNER, txn.transaction_id, rent.payment_id)
            .await
            .unwrap();
        assert_eq!(matched.status, TransactionStatus::Matched);
        assert_eq!(
            h.ledger.payment(rent.payment_id).await.unwrap().status,
            PaymentStatus::Completed
        );
    }

    #[tokio::test]
    async fn concurrent_manual_matches_are_serialised() {
        let h = harness();
        let first = payment(dec!(1500.00), "2025-03-03");
        let second = payment(dec!(1500.00), "2025-03-04");
        h.ledger.insert(first.clone()).await;
        h.ledger.insert(second.clone()).await;
        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;

        let (a, b) = tokio::join!(
            h.engine
                .manual_match(OWNER, txn.transaction_id, first.payment_id),
            h.engine
                .manual_match(OWNER, txn.transaction_id, second.payment_id),
        );

        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        let loser = a.err().or(b.err()).unwrap();
        assert_eq!(loser.code(), "INVALID_STATE");

        let settled = [
            h.ledger.payment(first.payment_id).await.unwrap().status,
            h.ledger.payment(second.payment_id).await.unwrap().status,
        ];
        assert_eq!(
            settled
                .iter()
                .filter(|s| **s == PaymentStatus::Completed)
                .count(),
            1
        );
        assert!(h.engine.locks.is_empty());
    }

    #[tokio::test]
    async fn locks_are_released_after_each_operation() {
        let h = harness();
        let a = import_one(&h, record("tx-a", dec!(10), "2025-03-01")).await;
        let b = import_one(&h, record("tx-b", dec!(11), "2025-03-01")).await;

        h.engine.write_off(OWNER, a.transaction_id, "bank fee").await.unwrap();
        h.engine.unmatch(OWNER, b.transaction_id).await.unwrap_err();
        h.engine
            .manual_match(OWNER, Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();

        assert!(h.engine.locks.is_empty());
    }

    #[tokio::test]
    async fn detail_lists_suggestions_for_open_transactions() {
        let h = harness();
        let rent = payment(dec!(1500.00), "2025-03-03");
        h.ledger.insert(rent.clone()).await;
        h.ledger.insert(payment(dec!(5000.00), "2025-03-03")).await;
        let txn = import_one(&h, record("tx-2", dec!(1400.00), "2025-03-01")).await;

        let detail = h
            .engine
            .transaction_detail(OWNER, txn.transaction_id)
            .await
            .unwrap();
        assert_eq!(detail.transaction.transaction_id, txn.transaction_id);
        assert_eq!(detail.suggestions.len(), 1);
        assert_eq!(detail.suggestions[0].payment.payment_id, rent.payment_id);
        assert_eq!(detail.suggestions[0].amount_difference, dec!(100.00));
    }
}
