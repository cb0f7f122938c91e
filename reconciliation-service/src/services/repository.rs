//! Storage seams for bank transactions and reconciliation rules.
//!
//! The engine only talks to [`TransactionStore`] and [`RuleStore`]. The
//! PostgreSQL implementation lives in [`super::database`]; the in-memory
//! implementations below back local runs and tests.

use crate::models::{BankTransaction, ReconciliationRule, TransactionStatus};
use async_trait::async_trait;
use chrono::NaiveDate;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Optional filters for transaction listings. All present filters apply.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub status: Option<TransactionStatus>,
    pub bank_account_id: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl TransactionFilter {
    pub fn between(date_from: NaiveDate, date_to: NaiveDate) -> Self {
        Self {
            date_from: Some(date_from),
            date_to: Some(date_to),
            ..Default::default()
        }
    }

    pub fn admits(&self, txn: &BankTransaction) -> bool {
        self.status.map_or(true, |s| txn.status == s)
            && self
                .bank_account_id
                .as_deref()
                .map_or(true, |id| txn.bank_account_id == id)
            && self.date_from.map_or(true, |d| txn.date >= d)
            && self.date_to.map_or(true, |d| txn.date <= d)
    }
}

/// One-based page request.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, 100),
        }
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.page_size)
    }
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    async fn health_check(&self) -> Result<(), AppError>;

    /// Whether the `(bank_account_id, external_id)` dedupe key is taken.
    async fn exists(&self, bank_account_id: &str, external_id: &str) -> Result<bool, AppError>;

    /// Insert a new transaction. Returns `false`, without writing, when the
    /// dedupe key is already taken.
    async fn insert(&self, txn: &BankTransaction) -> Result<bool, AppError>;

    async fn get(&self, owner_id: &str, transaction_id: Uuid)
        -> Result<Option<BankTransaction>, AppError>;

    /// Replace the stored transaction if its version still equals
    /// `txn.version`. Returns the stored copy with the bumped version.
    async fn update(&self, txn: &BankTransaction) -> Result<BankTransaction, AppError>;

    /// Newest first, with the total number of matching rows.
    async fn list(
        &self,
        owner_id: &str,
        filter: &TransactionFilter,
        page: Page,
    ) -> Result<(Vec<BankTransaction>, u64), AppError>;

    /// Every matching transaction, oldest first. Used by reports.
    async fn list_all(
        &self,
        owner_id: &str,
        filter: &TransactionFilter,
    ) -> Result<Vec<BankTransaction>, AppError>;

    /// Payment ids referenced by any of the owner's transactions.
    async fn matched_payment_ids(&self, owner_id: &str) -> Result<HashSet<Uuid>, AppError>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn insert(&self, rule: &ReconciliationRule) -> Result<(), AppError>;

    async fn get(&self, owner_id: &str, rule_id: Uuid)
        -> Result<Option<ReconciliationRule>, AppError>;

    /// Ascending priority, ties broken by creation time.
    async fn list(&self, owner_id: &str) -> Result<Vec<ReconciliationRule>, AppError>;

    /// `None` when the rule does not exist for this owner.
    async fn update(&self, rule: &ReconciliationRule)
        -> Result<Option<ReconciliationRule>, AppError>;

    /// `false` when the rule does not exist for this owner.
    async fn delete(&self, owner_id: &str, rule_id: Uuid) -> Result<bool, AppError>;
}

pub(crate) fn version_conflict(transaction_id: Uuid) -> AppError {
    AppError::Conflict(anyhow::anyhow!(
        "Transaction {} was modified concurrently",
        transaction_id
    ))
}

// ============================================================================
// In-memory transaction store
// ============================================================================

#[derive(Default)]
struct TransactionTable {
    by_id: HashMap<Uuid, BankTransaction>,
    by_key: HashMap<(String, String), Uuid>,
}

#[derive(Default)]
pub struct InMemoryTransactionStore {
    table: RwLock<TransactionTable>,
    failing_updates: AtomicU32,
    failing_lookups: AtomicU32,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` updates with a storage error.
    pub fn fail_next_updates(&self, n: u32) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` dedupe lookups with a storage error.
    pub fn fail_next_lookups(&self, n: u32) {
        self.failing_lookups.store(n, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.table.read().await.by_id.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn exists(&self, bank_account_id: &str, external_id: &str) -> Result<bool, AppError> {
        let injected = self
            .failing_lookups
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to check transaction existence: storage unavailable"
            )));
        }

        let key = (bank_account_id.to_string(), external_id.to_string());
        Ok(self.table.read().await.by_key.contains_key(&key))
    }

    async fn insert(&self, txn: &BankTransaction) -> Result<bool, AppError> {
        let mut table = self.table.write().await;
        let key = (txn.bank_account_id.clone(), txn.external_id.clone());
        if table.by_key.contains_key(&key) {
            return Ok(false);
        }
        table.by_key.insert(key, txn.transaction_id);
        table.by_id.insert(txn.transaction_id, txn.clone());
        Ok(true)
    }

    async fn get(
        &self,
        owner_id: &str,
        transaction_id: Uuid,
    ) -> Result<Option<BankTransaction>, AppError> {
        Ok(self
            .table
            .read()
            .await
            .by_id
            .get(&transaction_id)
            .filter(|t| t.owner_id == owner_id)
            .cloned())
    }

    async fn update(&self, txn: &BankTransaction) -> Result<BankTransaction, AppError> {
        let injected = self
            .failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "Failed to update transaction: storage unavailable"
            )));
        }

        let mut table = self.table.write().await;
        let stored = table
            .by_id
            .get_mut(&txn.transaction_id)
            .filter(|t| t.owner_id == txn.owner_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Transaction not found")))?;
        if stored.version != txn.version {
            return Err(version_conflict(txn.transaction_id));
        }
        let mut updated = txn.clone();
        updated.version += 1;
        *stored = updated.clone();
        Ok(updated)
    }

    async fn list(
        &self,
        owner_id: &str,
        filter: &TransactionFilter,
        page: Page,
    ) -> Result<(Vec<BankTransaction>, u64), AppError> {
        let table = self.table.read().await;
        let mut rows: Vec<&BankTransaction> = table
            .by_id
            .values()
            .filter(|t| t.owner_id == owner_id && filter.admits(t))
            .collect();
        rows.sort_by(|a, b| {
            b.date
                .cmp(&a.date)
                .then(b.imported_at.cmp(&a.imported_at))
                .then(a.transaction_id.cmp(&b.transaction_id))
        });
        let total = rows.len() as u64;
        let items = rows
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.page_size as usize)
            .cloned()
            .collect();
        Ok((items, total))
    }

    async fn list_all(
        &self,
        owner_id: &str,
        filter: &TransactionFilter,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let table = self.table.read().await;
        let mut rows: Vec<BankTransaction> = table
            .by_id
            .values()
            .filter(|t| t.owner_id == owner_id && filter.admits(t))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.date
                .cmp(&b.date)
                .then(a.imported_at.cmp(&b.imported_at))
                .then(a.transaction_id.cmp(&b.transaction_id))
        });
        Ok(rows)
    }

    async fn matched_payment_ids(&self, owner_id: &str) -> Result<HashSet<Uuid>, AppError> {
        Ok(self
            .table
            .read()
            .await
            .by_id
            .values()
            .filter(|t| t.owner_id == owner_id)
            .filter_map(|t| t.matched_payment_id)
            .collect())
    }
}

// ============================================================================
// In-memory rule store
// ============================================================================

#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<HashMap<Uuid, ReconciliationRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn insert(&self, rule: &ReconciliationRule) -> Result<(), AppError> {
        self.rules.write().await.insert(rule.rule_id, rule.clone());
        Ok(())
    }

    async fn get(
        &self,
        owner_id: &str,
        rule_id: Uuid,
    ) -> Result<Option<ReconciliationRule>, AppError> {
        Ok(self
            .rules
            .read()
            .await
            .get(&rule_id)
            .filter(|r| r.owner_id == owner_id)
            .cloned())
    }

    async fn list(&self, owner_id: &str) -> Result<Vec<ReconciliationRule>, AppError> {
        let mut rules: Vec<ReconciliationRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect();
        rules.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.rule_id.cmp(&b.rule_id))
        });
        Ok(rules)
    }

    async fn update(
        &self,
        rule: &ReconciliationRule,
    ) -> Result<Option<ReconciliationRule>, AppError> {
        let mut rules = self.rules.write().await;
        match rules.get_mut(&rule.rule_id) {
            Some(stored) if stored.owner_id == rule.owner_id => {
                *stored = rule.clone();
                Ok(Some(rule.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, owner_id: &str, rule_id: Uuid) -> Result<bool, AppError> {
        let mut rules = self.rules.write().await;
        let owned = rules.get(&rule_id).is_some_and(|r| r.owner_id == owner_id);
        if owned {
            rules.remove(&rule_id);
        }
        Ok(owned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::fixtures::{date, transaction, OWNER};
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn dedupe_key_is_unique() {
        let store = InMemoryTransactionStore::new();
        assert!(store.insert(&transaction("tx-1", dec!(10), "2025-03-01")).await.unwrap());
        assert!(!store.insert(&transaction("tx-1", dec!(99), "2025-03-02")).await.unwrap());
        assert!(store.exists("acct-1", "tx-1").await.unwrap());
        assert!(!store.exists("acct-2", "tx-1").await.unwrap());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn stale_versions_conflict() {
        let store = InMemoryTransactionStore::new();
        let txn = transaction("tx-1", dec!(10), "2025-03-01");
        store.insert(&txn).await.unwrap();

        let updated = store.update(&txn).await.unwrap();
        assert_eq!(updated.version, 1);

        let err = store.update(&txn).await.unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn reads_are_owner_scoped() {
        let store = InMemoryTransactionStore::new();
        let txn = transaction("tx-1", dec!(10), "2025-03-01");
        store.insert(&txn).await.unwrap();

        assert!(store.get("someone-else", txn.transaction_id).await.unwrap().is_none());
        let mut foreign = txn.clone();
        foreign.owner_id = "someone-else".to_string();
        assert_eq!(store.update(&foreign).await.unwrap_err().code(), "NOT_FOUND");
    }

    #[tokio::test]
    async fn listing_filters_and_pages_newest_first() {
        let store = InMemoryTransactionStore::new();
        for (id, on) in [("a", "2025-03-01"), ("b", "2025-03-05"), ("c", "2025-03-09")] {
            store.insert(&transaction(id, dec!(10), on)).await.unwrap();
        }

        let (items, total) = store
            .list(OWNER, &TransactionFilter::default(), Page::new(1, 2))
            .await
            .unwrap();
        assert_eq!(total, 3);
        let ids: Vec<&str> = items.iter().map(|t| t.external_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);

        let filter = TransactionFilter::between(date("2025-03-02"), date("2025-03-09"));
        let all = store.list_all(OWNER, &filter).await.unwrap();
        let ids: Vec<&str> = all.iter().map(|t| t.external_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn page_bounds_are_clamped() {
        let page = Page::new(0, 1000);
        assert_eq!((page.page, page.page_size), (1, 100));
        assert_eq!(Page::new(3, 20).offset(), 40);
    }
}
