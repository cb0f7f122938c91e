use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Settlement state of an expected payment, owned by the payment ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
}

/// An expected payment as seen through the payment collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub payment_id: Uuid,
    /// Property owner the payment is visible to.
    pub owner_id: String,
    pub property_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub amount: Decimal,
    pub due_date: NaiveDate,
    pub status: PaymentStatus,
    pub paid_date: Option<NaiveDate>,
}

/// Inclusive amount bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmountRange {
    pub min: Decimal,
    pub max: Decimal,
}

impl AmountRange {
    pub fn exact(amount: Decimal) -> Self {
        Self {
            min: amount,
            max: amount,
        }
    }

    /// `[amount - tolerance, amount + tolerance]`; a negative tolerance is
    /// treated as its magnitude.
    pub fn around(amount: Decimal, tolerance: Decimal) -> Self {
        let tolerance = tolerance.abs();
        Self {
            min: amount - tolerance,
            max: amount + tolerance,
        }
    }

    /// `amount ± |amount| * percent / 100`.
    pub fn percent(amount: Decimal, percent: Decimal) -> Self {
        Self::around(amount, amount.abs() * percent / Decimal::ONE_HUNDRED)
    }

    pub fn contains(&self, amount: Decimal) -> bool {
        amount >= self.min && amount <= self.max
    }
}

/// Inclusive calendar-date bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }
}

/// Optional narrowing of a payment search to a property and/or tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentScope {
    pub property_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
}

impl PaymentScope {
    pub fn is_empty(&self) -> bool {
        self.property_id.is_none() && self.tenant_id.is_none()
    }

    pub fn admits(&self, payment: &Payment) -> bool {
        self.property_id
            .map_or(true, |id| payment.property_id == Some(id))
            && self
                .tenant_id
                .map_or(true, |id| payment.tenant_id == Some(id))
    }
}

/// Search criteria understood by every payment collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentQuery {
    pub owner_id: String,
    pub status: Option<PaymentStatus>,
    pub amount: Option<AmountRange>,
    pub due: Option<DateRange>,
    pub scope: Option<PaymentScope>,
}

impl PaymentQuery {
    pub fn for_owner(owner_id: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            status: None,
            amount: None,
            due: None,
            scope: None,
        }
    }

    pub fn pending(mut self) -> Self {
        self.status = Some(PaymentStatus::Pending);
        self
    }

    pub fn with_status(mut self, status: PaymentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn amount(mut self, range: AmountRange) -> Self {
        self.amount = Some(range);
        self
    }

    pub fn due(mut self, range: DateRange) -> Self {
        self.due = Some(range);
        self
    }

    pub fn scope(mut self, scope: Option<PaymentScope>) -> Self {
        self.scope = scope.filter(|s| !s.is_empty());
        self
    }

    pub fn admits(&self, payment: &Payment) -> bool {
        payment.owner_id == self.owner_id
            && self.status.map_or(true, |s| payment.status == s)
            && self.amount.map_or(true, |r| r.contains(payment.amount))
            && self.due.map_or(true, |r| r.contains(payment.due_date))
            && self.scope.map_or(true, |s| s.admits(payment))
    }
}
