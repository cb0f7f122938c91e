//! Payment collaborator: the ledger that owns expected payments.
//!
//! The engine reads candidate payments through [`PaymentGateway`] and flips
//! their paid/pending state on manual match and unmatch. Writes carry an
//! idempotency key so they can be retried safely.

use crate::models::{Payment, PaymentQuery, PaymentStatus};
use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// All payments visible to the query's owner that satisfy the query.
    async fn find_payments(&self, query: &PaymentQuery) -> Result<Vec<Payment>, AppError>;

    async fn get_payment(&self, owner_id: &str, payment_id: Uuid)
        -> Result<Option<Payment>, AppError>;

    async fn mark_paid(
        &self,
        payment_id: Uuid,
        paid_date: NaiveDate,
        idempotency_key: &str,
    ) -> Result<(), AppError>;

    async fn mark_pending(&self, payment_id: Uuid, idempotency_key: &str) -> Result<(), AppError>;

    /// Single best pending payment for the query, or `None`.
    async fn find_pending_payment(&self, query: &PaymentQuery) -> Result<Option<Payment>, AppError> {
        let query = query.clone().pending();
        let candidates = self.find_payments(&query).await?;
        Ok(pick_closest(&query, candidates))
    }
}

/// Prefer the payment nearest the centre of the amount range, then the
/// centre of the due-date range, then the earliest due date.
pub fn pick_closest(query: &PaymentQuery, candidates: Vec<Payment>) -> Option<Payment> {
    let amount_center = query
        .amount
        .map(|r| (r.min + r.max) / Decimal::TWO);
    let date_center = query
        .due
        .map(|r| r.start + (r.end - r.start) / 2);

    candidates.into_iter().min_by(|a, b| {
        let amount_key = |p: &Payment| amount_center.map(|c| (p.amount - c).abs());
        let date_key = |p: &Payment| date_center.map(|c| (p.due_date - c).num_days().abs());
        amount_key(a)
            .cmp(&amount_key(b))
            .then_with(|| date_key(a).cmp(&date_key(b)))
            .then_with(|| a.due_date.cmp(&b.due_date))
            .then_with(|| a.payment_id.cmp(&b.payment_id))
    })
}

// ============================================================================
// In-memory ledger
// ============================================================================

/// Payment ledger kept in process memory, for local development and tests.
#[derive(Default)]
pub struct InMemoryPaymentLedger {
    payments: RwLock<HashMap<Uuid, Payment>>,
    applied_keys: RwLock<HashSet<String>>,
    transient_write_failures: AtomicU32,
    writes_down: AtomicBool,
    reads_down: AtomicBool,
}

impl InMemoryPaymentLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, payment: Payment) {
        self.payments.write().await.insert(payment.payment_id, payment);
    }

    pub async fn payment(&self, payment_id: Uuid) -> Option<Payment> {
        self.payments.read().await.get(&payment_id).cloned()
    }

    /// Fail the next `n` writes with a transient error.
    pub fn fail_next_writes(&self, n: u32) {
        self.transient_write_failures.store(n, Ordering::SeqCst);
    }

    /// Make every write fail until switched back.
    pub fn set_writes_down(&self, down: bool) {
        self.writes_down.store(down, Ordering::SeqCst);
    }

    /// Make every read fail until switched back.
    pub fn set_reads_down(&self, down: bool) {
        self.reads_down.store(down, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<(), AppError> {
        if self.reads_down.load(Ordering::SeqCst) {
            return Err(AppError::BadGateway("payment ledger unavailable".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), AppError> {
        if self.writes_down.load(Ordering::SeqCst) {
            return Err(AppError::BadGateway("payment ledger unavailable".to_string()));
        }
        let injected = self
            .transient_write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(AppError::BadGateway("payment ledger timed out".to_string()));
        }
        Ok(())
    }

    async fn apply_once(
        &self,
        payment_id: Uuid,
        idempotency_key: &str,
        status: PaymentStatus,
        paid_date: Option<NaiveDate>,
    ) -> Result<(), AppError> {
        self.check_write()?;

        let mut keys = self.applied_keys.write().await;
        if keys.contains(idempotency_key) {
            return Ok(());
        }

        let mut payments = self.payments.write().await;
        let payment = payments
            .get_mut(&payment_id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Payment not found")))?;
        payment.status = status;
        payment.paid_date = paid_date;
        keys.insert(idempotency_key.to_string());
        Ok(())
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentLedger {
    async fn find_payments(&self, query: &PaymentQuery) -> Result<Vec<Payment>, AppError> {
        self.check_read()?;
        let payments = self.payments.read().await;
        let mut found: Vec<Payment> = payments
            .values()
            .filter(|p| query.admits(p))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.due_date.cmp(&b.due_date).then(a.payment_id.cmp(&b.payment_id)));
        Ok(found)
    }

    async fn get_payment(
        &self,
        owner_id: &str,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, AppError> {
        self.check_read()?;
        Ok(self
            .payments
            .read()
            .await
            .get(&payment_id)
            .filter(|p| p.owner_id == owner_id)
            .cloned())
    }

    async fn mark_paid(
        &self,
        payment_id: Uuid,
        paid_date: NaiveDate,
        idempotency_key: &str,
    ) -> Result<(), AppError> {
        self.apply_once(payment_id, idempotency_key, PaymentStatus::Completed, Some(paid_date))
            .await
    }

    async fn mark_pending(&self, payment_id: Uuid, idempotency_key: &str) -> Result<(), AppError> {
        self.apply_once(payment_id, idempotency_key, PaymentStatus::Pending, None)
            .await
    }
}

// ============================================================================
// HTTP ledger client
// ============================================================================

/// Client for the payment ledger's HTTP API.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MarkPaidBody {
    paid_date: NaiveDate,
}

const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

impl HttpPaymentGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!("Failed to build HTTP client: {}", e)))?;

        info!(base_url = %base_url, "Payment ledger client configured");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn upstream(e: reqwest::Error) -> AppError {
        AppError::BadGateway(format!("payment ledger request failed: {}", e))
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AppError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            reqwest::StatusCode::NOT_FOUND => AppError::NotFound(anyhow::anyhow!("Payment not found")),
            reqwest::StatusCode::CONFLICT => {
                AppError::InvalidState(anyhow::anyhow!("Payment ledger rejected update: {}", body))
            }
            _ => AppError::BadGateway(format!("payment ledger returned {}: {}", status, body)),
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self), fields(owner_id = %query.owner_id))]
    async fn find_payments(&self, query: &PaymentQuery) -> Result<Vec<Payment>, AppError> {
        let mut params: Vec<(&str, String)> = vec![("ownerId", query.owner_id.clone())];
        if let Some(status) = query.status {
            let status = match status {
                PaymentStatus::Pending => "pending",
                PaymentStatus::Completed => "completed",
            };
            params.push(("status", status.to_string()));
        }
        if let Some(range) = query.amount {
            params.push(("minAmount", range.min.to_string()));
            params.push(("maxAmount", range.max.to_string()));
        }
        if let Some(range) = query.due {
            params.push(("dueFrom", range.start.to_string()));
            params.push(("dueTo", range.end.to_string()));
        }
        if let Some(scope) = query.scope {
            if let Some(id) = scope.property_id {
                params.push(("propertyId", id.to_string()));
            }
            if let Some(id) = scope.tenant_id {
                params.push(("tenantId", id.to_string()));
            }
        }

        let response = self
            .client
            .get(format!("{}/payments", self.base_url))
            .query(&params)
            .send()
            .await
            .map_err(Self::upstream)?;

        let payments: Vec<Payment> = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(Self::upstream)?;

        // Guard against a ledger that ignores some filters.
        Ok(payments.into_iter().filter(|p| query.admits(p)).collect())
    }

    #[instrument(skip(self))]
    async fn get_payment(
        &self,
        owner_id: &str,
        payment_id: Uuid,
    ) -> Result<Option<Payment>, AppError> {
        let response = self
            .client
            .get(format!("{}/payments/{}", self.base_url, payment_id))
            .query(&[("ownerId", owner_id)])
            .send()
            .await
            .map_err(Self::upstream)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let payment: Payment = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(Self::upstream)?;

        Ok(Some(payment).filter(|p| p.owner_id == owner_id))
    }

    #[instrument(skip(self))]
    async fn mark_paid(
        &self,
        payment_id: Uuid,
        paid_date: NaiveDate,
        idempotency_key: &str,
    ) -> Result<(), AppError> {
        let response = self
            .client
            .post(format!("{}/payments/{}/mark-paid", self.base_url, payment_id))
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .json(&MarkPaidBody { paid_date })
            .send()
            .await
            .map_err(Self::upstream)?;

        Self::check_status(response).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_pending(&self, payment_id: Uuid, idempotency_key: &str) -> Result<(), AppError> {
        let response = self
            .client
            .post(format!("{}/payments/{}/mark-pending", self.base_url, payment_id))
            .header(IDEMPOTENCY_KEY_HEADER, idempotency_key)
            .send()
            .await
            .map_err(Self::upstream)?;

        Self::check_status(response).await?;
        Ok(())
    }
}
