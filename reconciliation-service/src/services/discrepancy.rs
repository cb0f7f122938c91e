//! Discrepancy detection between a bank transaction and its payment.

use crate::config::DiscrepancyConfig;
use crate::models::{BankTransaction, Discrepancy, DiscrepancyType, Payment};
use crate::services::tolerance::{days_apart, exceeds_amount};

#[derive(Debug, Clone, Default)]
pub struct DiscrepancyDetector {
    config: DiscrepancyConfig,
}

impl DiscrepancyDetector {
    pub fn new(config: DiscrepancyConfig) -> Self {
        Self { config }
    }

    /// Classify how `txn` deviates from `payment`. Amount deviations take
    /// precedence over date deviations; `None` means a clean match.
    pub fn detect(&self, txn: &BankTransaction, payment: Option<&Payment>) -> Option<Discrepancy> {
        let Some(payment) = payment else {
            return Some(unexpected(txn));
        };

        if exceeds_amount(payment.amount, txn.amount, self.config.amount_tolerance) {
            let kind = if txn.amount < payment.amount {
                DiscrepancyType::Partial
            } else {
                DiscrepancyType::AmountMismatch
            };
            return Some(
                Discrepancy::new(kind).with_amounts(Some(payment.amount), Some(txn.amount)),
            );
        }

        if days_apart(txn.date, payment.due_date) > self.config.date_tolerance_days {
            return Some(Discrepancy::new(DiscrepancyType::DateMismatch));
        }

        None
    }
}

/// Discrepancy for a transaction with no corresponding payment.
pub fn unexpected(txn: &BankTransaction) -> Discrepancy {
    Discrepancy::new(DiscrepancyType::Unexpected).with_amounts(None, Some(txn.amount))
}
