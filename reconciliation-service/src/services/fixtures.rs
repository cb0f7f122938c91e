//! Builders shared by the service unit tests.

use crate::models::{
    BankTransaction, Payment, PaymentStatus, ReconciliationRule, RuleActions, RuleConditions,
    TransactionStatus,
};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

pub const OWNER: &str = "owner-1";

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn transaction(external_id: &str, amount: Decimal, on: &str) -> BankTransaction {
    BankTransaction {
        transaction_id: Uuid::new_v4(),
        owner_id: OWNER.to_string(),
        bank_account_id: "acct-1".to_string(),
        external_id: external_id.to_string(),
        date: date(on),
        amount,
        description: "RENT MARCH".to_string(),
        category: None,
        payer_name: None,
        payer_reference: None,
        status: TransactionStatus::Unmatched,
        matched_payment_id: None,
        match_confidence: None,
        match_type: None,
        discrepancy: None,
        imported_at: Utc::now(),
        reconciled_at: None,
        reconciled_by: None,
        version: 0,
    }
}

pub fn payment(amount: Decimal, due: &str) -> Payment {
    Payment {
        payment_id: Uuid::new_v4(),
        owner_id: OWNER.to_string(),
        property_id: None,
        tenant_id: None,
        amount,
        due_date: date(due),
        status: PaymentStatus::Pending,
        paid_date: None,
    }
}

pub fn rule(priority: i32, pattern: &str, tolerance: Decimal, auto_match: bool) -> ReconciliationRule {
    ReconciliationRule {
        rule_id: Uuid::new_v4(),
        owner_id: OWNER.to_string(),
        name: format!("rule {}", priority),
        priority,
        is_active: true,
        conditions: RuleConditions {
            description_pattern: Some(pattern.to_string()),
            ..Default::default()
        },
        actions: RuleActions {
            auto_match,
            tolerance,
            ..Default::default()
        },
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
