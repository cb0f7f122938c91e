//! Common test utilities for reconciliation-service integration tests.
#![allow(dead_code)]

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::NaiveDate;
use http_body_util::BodyExt;
use reconciliation_service::config::ReconciliationConfig;
use reconciliation_service::models::{Payment, PaymentStatus};
use reconciliation_service::services::{
    InMemoryPaymentLedger, InMemoryRuleStore, InMemoryTransactionStore,
};
use reconciliation_service::startup::{router, AppState};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use std::sync::{Arc, Once};
use tower::util::ServiceExt;
use uuid::Uuid;

static INIT: Once = Once::new();

pub const OWNER: &str = "owner-1";

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciliation_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Test application wrapper.
pub struct TestApp {
    pub router: Router,
    pub ledger: Arc<InMemoryPaymentLedger>,
}

/// Build the full HTTP stack over in-memory stores and ledger.
pub fn spawn_app() -> TestApp {
    init_tracing();

    let ledger = Arc::new(InMemoryPaymentLedger::new());
    let state = AppState::new(
        ReconciliationConfig::in_memory(),
        Arc::new(InMemoryTransactionStore::new()),
        Arc::new(InMemoryRuleStore::new()),
        ledger.clone(),
    );

    TestApp {
        router: router(state),
        ledger,
    }
}

impl TestApp {
    /// Send a request as `owner` (or anonymously) and decode the JSON body.
    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        owner: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            builder = builder.header("x-user-id", owner);
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send("GET", uri, Some(OWNER), None).await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send("POST", uri, Some(OWNER), Some(body)).await
    }

    /// Register a pending payment for the default owner.
    pub async fn seed_payment(&self, amount: &str, due: &str) -> Payment {
        let payment = Payment {
            payment_id: Uuid::new_v4(),
            owner_id: OWNER.to_string(),
            property_id: None,
            tenant_id: None,
            amount: Decimal::from_str(amount).unwrap(),
            due_date: date(due),
            status: PaymentStatus::Pending,
            paid_date: None,
        };
        self.ledger.insert(payment.clone()).await;
        payment
    }

    /// Import `records` into `acct-1` and return the response body.
    pub async fn import(&self, records: Value) -> Value {
        let (status, body) = self
            .post(
                "/reconciliation/import",
                serde_json::json!({ "bankAccountId": "acct-1", "transactions": records }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "import failed: {}", body);
        body
    }
}

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Decimals are serialized as strings; compare them numerically.
pub fn decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).unwrap(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).unwrap(),
        other => panic!("not a decimal: {}", other),
    }
}
