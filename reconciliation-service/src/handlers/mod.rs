pub mod health;
pub mod reports;
pub mod rules;
pub mod transactions;

use crate::services::record_error;
use service_core::error::AppError;

pub use health::{health_check, metrics_handler, readiness_check};
pub use reports::{missing_payments, period_report, summary};
pub use rules::{create_rule, delete_rule, get_rule, list_rules, update_rule};
pub use transactions::{
    get_transaction, import_transactions, list_transactions, manual_match, unmatch, write_off,
};

/// Count a failed request by error code before it is rendered.
pub(crate) fn tally(e: AppError) -> AppError {
    record_error(e.code());
    e
}
