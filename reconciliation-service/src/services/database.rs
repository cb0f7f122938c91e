//! PostgreSQL storage for reconciliation-service.

use crate::models::{
    BankTransaction, Discrepancy, DiscrepancyType, MatchType, ReconciliationRule, RuleActions,
    RuleConditions, TransactionStatus,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::repository::{
    version_conflict, Page, RuleStore, TransactionFilter, TransactionStore,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const TRANSACTION_COLUMNS: &str = "transaction_id, owner_id, bank_account_id, external_id, \
    transaction_date, amount, description, category, payer_name, payer_reference, status, \
    matched_payment_id, match_confidence, match_type, discrepancy_type, \
    discrepancy_expected_amount, discrepancy_actual_amount, discrepancy_notes, imported_utc, \
    reconciled_utc, reconciled_by, version";

const RULE_COLUMNS: &str = "rule_id, owner_id, name, priority, is_active, description_pattern, \
    amount_min, amount_max, payer_name_pattern, property_id, tenant_id, category, auto_match, \
    tolerance, created_utc, updated_utc";

fn db_error(context: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

// ============================================================================
// Row mapping
// ============================================================================

#[derive(Debug, FromRow)]
struct BankTransactionRow {
    transaction_id: Uuid,
    owner_id: String,
    bank_account_id: String,
    external_id: String,
    transaction_date: NaiveDate,
    amount: Decimal,
    description: String,
    category: Option<String>,
    payer_name: Option<String>,
    payer_reference: Option<String>,
    status: String,
    matched_payment_id: Option<Uuid>,
    match_confidence: Option<Decimal>,
    match_type: Option<String>,
    discrepancy_type: Option<String>,
    discrepancy_expected_amount: Option<Decimal>,
    discrepancy_actual_amount: Option<Decimal>,
    discrepancy_notes: Option<String>,
    imported_utc: DateTime<Utc>,
    reconciled_utc: Option<DateTime<Utc>>,
    reconciled_by: Option<String>,
    version: i64,
}

impl TryFrom<BankTransactionRow> for BankTransaction {
    type Error = AppError;

    fn try_from(r: BankTransactionRow) -> Result<Self, Self::Error> {
        let status = TransactionStatus::parse(&r.status).ok_or_else(|| {
            AppError::DatabaseError(anyhow::anyhow!("Unknown transaction status '{}'", r.status))
        })?;
        let discrepancy = match r.discrepancy_type.as_deref() {
            Some(kind) => {
                let kind = DiscrepancyType::parse(kind).ok_or_else(|| {
                    AppError::DatabaseError(anyhow::anyhow!("Unknown discrepancy type '{}'", kind))
                })?;
                Some(Discrepancy {
                    kind,
                    expected_amount: r.discrepancy_expected_amount,
                    actual_amount: r.discrepancy_actual_amount,
                    notes: r.discrepancy_notes,
                })
            }
            None => None,
        };

        Ok(Self {
            transaction_id: r.transaction_id,
            owner_id: r.owner_id,
            bank_account_id: r.bank_account_id,
            external_id: r.external_id,
            date: r.transaction_date,
            amount: r.amount,
            description: r.description,
            category: r.category,
            payer_name: r.payer_name,
            payer_reference: r.payer_reference,
            status,
            matched_payment_id: r.matched_payment_id,
            match_confidence: r.match_confidence,
            match_type: r.match_type.as_deref().and_then(MatchType::parse),
            discrepancy,
            imported_at: r.imported_utc,
            reconciled_at: r.reconciled_utc,
            reconciled_by: r.reconciled_by,
            version: r.version,
        })
    }
}

#[derive(Debug, FromRow)]
struct RuleRow {
    rule_id: Uuid,
    owner_id: String,
    name: String,
    priority: i32,
    is_active: bool,
    description_pattern: Option<String>,
    amount_min: Option<Decimal>,
    amount_max: Option<Decimal>,
    payer_name_pattern: Option<String>,
    property_id: Option<Uuid>,
    tenant_id: Option<Uuid>,
    category: Option<String>,
    auto_match: bool,
    tolerance: Decimal,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<RuleRow> for ReconciliationRule {
    fn from(r: RuleRow) -> Self {
        Self {
            rule_id: r.rule_id,
            owner_id: r.owner_id,
            name: r.name,
            priority: r.priority,
            is_active: r.is_active,
            conditions: RuleConditions {
                description_pattern: r.description_pattern,
                amount_min: r.amount_min,
                amount_max: r.amount_max,
                payer_name_pattern: r.payer_name_pattern,
            },
            actions: RuleActions {
                property_id: r.property_id,
                tenant_id: r.tenant_id,
                category: r.category,
                auto_match: r.auto_match,
                tolerance: r.tolerance,
            },
            created_at: r.created_utc,
            updated_at: r.updated_utc,
        }
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, owner_id: &str, filter: &TransactionFilter) {
    builder.push(" WHERE owner_id = ").push_bind(owner_id.to_string());
    if let Some(status) = filter.status {
        builder.push(" AND status = ").push_bind(status.as_str());
    }
    if let Some(account) = &filter.bank_account_id {
        builder.push(" AND bank_account_id = ").push_bind(account.clone());
    }
    if let Some(from) = filter.date_from {
        builder.push(" AND transaction_date >= ").push_bind(from);
    }
    if let Some(to) = filter.date_to {
        builder.push(" AND transaction_date <= ").push_bind(to);
    }
}

// ============================================================================
// Database
// ============================================================================

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "reconciliation-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| db_error("Failed to connect", e))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_transactions(
        &self,
        mut builder: QueryBuilder<'_, Postgres>,
    ) -> Result<Vec<BankTransaction>, AppError> {
        builder
            .build_query_as::<BankTransactionRow>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("Failed to list transactions", e))?
            .into_iter()
            .map(BankTransaction::try_from)
            .collect()
    }
}

#[async_trait]
impl TransactionStore for Database {
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("Health check failed", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn exists(&self, bank_account_id: &str, external_id: &str) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["transaction_exists"])
            .start_timer();

        let found: Option<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT transaction_id FROM bank_transactions
            WHERE bank_account_id = $1 AND external_id = $2
            "#,
        )
        .bind(bank_account_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to check duplicate", e))?;

        timer.observe_duration();
        Ok(found.is_some())
    }

    #[instrument(skip(self, txn), fields(transaction_id = %txn.transaction_id, external_id = %txn.external_id))]
    async fn insert(&self, txn: &BankTransaction) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transaction"])
            .start_timer();

        let d = txn.discrepancy.as_ref();
        let result = sqlx::query(
            r#"
            INSERT INTO bank_transactions (
                transaction_id, owner_id, bank_account_id, external_id, transaction_date, amount,
                description, category, payer_name, payer_reference, status, matched_payment_id,
                match_confidence, match_type, discrepancy_type, discrepancy_expected_amount,
                discrepancy_actual_amount, discrepancy_notes, imported_utc, reconciled_utc,
                reconciled_by, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22)
            ON CONFLICT (bank_account_id, external_id) DO NOTHING
            "#,
        )
        .bind(txn.transaction_id)
        .bind(&txn.owner_id)
        .bind(&txn.bank_account_id)
        .bind(&txn.external_id)
        .bind(txn.date)
        .bind(txn.amount)
        .bind(&txn.description)
        .bind(&txn.category)
        .bind(&txn.payer_name)
        .bind(&txn.payer_reference)
        .bind(txn.status.as_str())
        .bind(txn.matched_payment_id)
        .bind(txn.match_confidence)
        .bind(txn.match_type.map(|m| m.as_str()))
        .bind(d.map(|d| d.kind.as_str()))
        .bind(d.and_then(|d| d.expected_amount))
        .bind(d.and_then(|d| d.actual_amount))
        .bind(d.and_then(|d| d.notes.clone()))
        .bind(txn.imported_at)
        .bind(txn.reconciled_at)
        .bind(&txn.reconciled_by)
        .bind(txn.version)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to insert transaction", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn get(
        &self,
        owner_id: &str,
        transaction_id: Uuid,
    ) -> Result<Option<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let row = sqlx::query_as::<_, BankTransactionRow>(&format!(
            "SELECT {} FROM bank_transactions WHERE owner_id = $1 AND transaction_id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(owner_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get transaction", e))?;

        timer.observe_duration();
        row.map(BankTransaction::try_from).transpose()
    }

    #[instrument(skip(self, txn), fields(transaction_id = %txn.transaction_id, status = %txn.status))]
    async fn update(&self, txn: &BankTransaction) -> Result<BankTransaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_transaction"])
            .start_timer();

        let d = txn.discrepancy.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE bank_transactions
            SET category = $4,
                status = $5,
                matched_payment_id = $6,
                match_confidence = $7,
                match_type = $8,
                discrepancy_type = $9,
                discrepancy_expected_amount = $10,
                discrepancy_actual_amount = $11,
                discrepancy_notes = $12,
                reconciled_utc = $13,
                reconciled_by = $14,
                version = version + 1
            WHERE transaction_id = $1 AND owner_id = $2 AND version = $3
            "#,
        )
        .bind(txn.transaction_id)
        .bind(&txn.owner_id)
        .bind(txn.version)
        .bind(&txn.category)
        .bind(txn.status.as_str())
        .bind(txn.matched_payment_id)
        .bind(txn.match_confidence)
        .bind(txn.match_type.map(|m| m.as_str()))
        .bind(d.map(|d| d.kind.as_str()))
        .bind(d.and_then(|d| d.expected_amount))
        .bind(d.and_then(|d| d.actual_amount))
        .bind(d.and_then(|d| d.notes.clone()))
        .bind(txn.reconciled_at)
        .bind(&txn.reconciled_by)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update transaction", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return match TransactionStore::get(self, &txn.owner_id, txn.transaction_id).await? {
                Some(_) => Err(version_conflict(txn.transaction_id)),
                None => Err(AppError::NotFound(anyhow::anyhow!("Transaction not found"))),
            };
        }

        let mut updated = txn.clone();
        updated.version += 1;
        Ok(updated)
    }

    #[instrument(skip(self, filter))]
    async fn list(
        &self,
        owner_id: &str,
        filter: &TransactionFilter,
        page: Page,
    ) -> Result<(Vec<BankTransaction>, u64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_transactions"])
            .start_timer();

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM bank_transactions");
        push_filters(&mut count, owner_id, filter);
        let (total,): (i64,) = count
            .build_query_as()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("Failed to count transactions", e))?;

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM bank_transactions",
            TRANSACTION_COLUMNS
        ));
        push_filters(&mut builder, owner_id, filter);
        builder
            .push(" ORDER BY transaction_date DESC, imported_utc DESC, transaction_id LIMIT ")
            .push_bind(i64::from(page.page_size))
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let items = self.fetch_transactions(builder).await?;

        timer.observe_duration();
        Ok((items, total.max(0) as u64))
    }

    #[instrument(skip(self, filter))]
    async fn list_all(
        &self,
        owner_id: &str,
        filter: &TransactionFilter,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_all_transactions"])
            .start_timer();

        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "SELECT {} FROM bank_transactions",
            TRANSACTION_COLUMNS
        ));
        push_filters(&mut builder, owner_id, filter);
        builder.push(" ORDER BY transaction_date, imported_utc, transaction_id");
        let items = self.fetch_transactions(builder).await?;

        timer.observe_duration();
        Ok(items)
    }

    #[instrument(skip(self))]
    async fn matched_payment_ids(&self, owner_id: &str) -> Result<HashSet<Uuid>, AppError> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT matched_payment_id FROM bank_transactions
            WHERE owner_id = $1 AND matched_payment_id IS NOT NULL
            "#,
        )
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list matched payments", e))?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[async_trait]
impl RuleStore for Database {
    #[instrument(skip(self, rule), fields(rule_id = %rule.rule_id, owner_id = %rule.owner_id))]
    async fn insert(&self, rule: &ReconciliationRule) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_rule"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO reconciliation_rules (
                rule_id, owner_id, name, priority, is_active, description_pattern, amount_min,
                amount_max, payer_name_pattern, property_id, tenant_id, category, auto_match,
                tolerance, created_utc, updated_utc
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(rule.rule_id)
        .bind(&rule.owner_id)
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(&rule.conditions.description_pattern)
        .bind(rule.conditions.amount_min)
        .bind(rule.conditions.amount_max)
        .bind(&rule.conditions.payer_name_pattern)
        .bind(rule.actions.property_id)
        .bind(rule.actions.tenant_id)
        .bind(&rule.actions.category)
        .bind(rule.actions.auto_match)
        .bind(rule.actions.tolerance)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create rule", e))?;

        timer.observe_duration();
        info!(rule_id = %rule.rule_id, "Reconciliation rule created");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(
        &self,
        owner_id: &str,
        rule_id: Uuid,
    ) -> Result<Option<ReconciliationRule>, AppError> {
        let row = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {} FROM reconciliation_rules WHERE owner_id = $1 AND rule_id = $2",
            RULE_COLUMNS
        ))
        .bind(owner_id)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to get rule", e))?;

        Ok(row.map(ReconciliationRule::from))
    }

    #[instrument(skip(self))]
    async fn list(&self, owner_id: &str) -> Result<Vec<ReconciliationRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_rules"])
            .start_timer();

        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {} FROM reconciliation_rules WHERE owner_id = $1 ORDER BY priority, created_utc, rule_id",
            RULE_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to list rules", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().map(ReconciliationRule::from).collect())
    }

    #[instrument(skip(self, rule), fields(rule_id = %rule.rule_id, owner_id = %rule.owner_id))]
    async fn update(
        &self,
        rule: &ReconciliationRule,
    ) -> Result<Option<ReconciliationRule>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_rule"])
            .start_timer();

        let row = sqlx::query_as::<_, RuleRow>(&format!(
            r#"
            UPDATE reconciliation_rules
            SET name = $3, priority = $4, is_active = $5, description_pattern = $6,
                amount_min = $7, amount_max = $8, payer_name_pattern = $9, property_id = $10,
                tenant_id = $11, category = $12, auto_match = $13, tolerance = $14,
                updated_utc = $15
            WHERE owner_id = $1 AND rule_id = $2
            RETURNING {}
            "#,
            RULE_COLUMNS
        ))
        .bind(&rule.owner_id)
        .bind(rule.rule_id)
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(&rule.conditions.description_pattern)
        .bind(rule.conditions.amount_min)
        .bind(rule.conditions.amount_max)
        .bind(&rule.conditions.payer_name_pattern)
        .bind(rule.actions.property_id)
        .bind(rule.actions.tenant_id)
        .bind(&rule.actions.category)
        .bind(rule.actions.auto_match)
        .bind(rule.actions.tolerance)
        .bind(rule.updated_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("Failed to update rule", e))?;

        timer.observe_duration();
        Ok(row.map(ReconciliationRule::from))
    }

    #[instrument(skip(self))]
    async fn delete(&self, owner_id: &str, rule_id: Uuid) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_rule"])
            .start_timer();

        let result = sqlx::query(
            r#"
            DELETE FROM reconciliation_rules
            WHERE owner_id = $1 AND rule_id = $2
            "#,
        )
        .bind(owner_id)
        .bind(rule_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to delete rule", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() > 0)
    }
}
