//! Services module for reconciliation-service.

pub mod database;
pub mod discrepancy;
pub mod lifecycle;
pub mod matcher;
pub mod metrics;
pub mod patterns;
pub mod payments;
pub mod reporting;
pub mod repository;
pub mod rules;
pub mod tolerance;

#[cfg(test)]
pub(crate) mod fixtures;

pub use database::Database;
pub use discrepancy::DiscrepancyDetector;
pub use lifecycle::{ImportBatch, ImportRecord, ImportResult, ReconciliationEngine, TransactionDetail};
pub use matcher::{CompiledRuleSet, MatchSuggestion, Matcher};
pub use metrics::{get_metrics, init_metrics, record_error};
pub use payments::{HttpPaymentGateway, InMemoryPaymentLedger, PaymentGateway};
pub use reporting::ReportingService;
pub use repository::{
    InMemoryRuleStore, InMemoryTransactionStore, Page, RuleStore, TransactionFilter,
    TransactionStore,
};
pub use rules::{RuleDraft, RuleService};
