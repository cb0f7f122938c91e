//! Day-window and amount-tolerance comparisons shared by matching,
//! discrepancy detection and reporting.

use crate::models::DateRange;
use chrono::{Duration, NaiveDate};
use rust_decimal::Decimal;

/// Absolute number of calendar days between two dates.
pub fn days_apart(a: NaiveDate, b: NaiveDate) -> i64 {
    (a - b).num_days().abs()
}

/// `true` when `a` and `b` are at most `days` calendar days apart.
pub fn within_days(a: NaiveDate, b: NaiveDate, days: i64) -> bool {
    days_apart(a, b) <= days
}

/// Inclusive window of `days` either side of `center`.
pub fn date_window(center: NaiveDate, days: i64) -> DateRange {
    let days = Duration::days(days.abs());
    DateRange::new(center - days, center + days)
}

/// `true` when the amounts differ by at most `tolerance` (inclusive).
pub fn within_amount(a: Decimal, b: Decimal, tolerance: Decimal) -> bool {
    (a - b).abs() <= tolerance
}

/// `true` when the amounts differ by strictly more than `tolerance`.
pub fn exceeds_amount(a: Decimal, b: Decimal, tolerance: Decimal) -> bool {
    (a - b).abs() > tolerance
}

/// `|difference| / reference * 100`. A zero reference yields zero for equal
/// amounts and `None` otherwise, since no percentage is defined.
pub fn percent_difference(actual: Decimal, reference: Decimal) -> Option<Decimal> {
    let difference = (actual - reference).abs();
    if reference.is_zero() {
        return difference.is_zero().then_some(Decimal::ZERO);
    }
    Some(difference / reference.abs() * Decimal::ONE_HUNDRED)
}

/// Confidence for a near match: `max(floor, base - percent difference)`.
pub fn scaled_confidence(
    actual: Decimal,
    reference: Decimal,
    base: Decimal,
    floor: Decimal,
) -> Decimal {
    match percent_difference(actual, reference) {
        Some(pct) => (base - pct).max(floor).min(Decimal::ONE_HUNDRED),
        None => floor,
    }
}
