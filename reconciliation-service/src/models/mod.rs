//! Domain models for reconciliation-service.

mod payment;
mod rule;
mod transaction;

pub use payment::{AmountRange, DateRange, Payment, PaymentQuery, PaymentScope, PaymentStatus};
pub use rule::{ReconciliationRule, RuleActions, RuleConditions};
pub use transaction::{
    BankTransaction, Discrepancy, DiscrepancyType, MatchDecision, MatchType, TransactionStatus,
};
