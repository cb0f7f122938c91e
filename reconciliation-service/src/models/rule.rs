use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conditions are AND-combined; an absent condition always holds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    pub description_pattern: Option<String>,
    pub amount_min: Option<Decimal>,
    pub amount_max: Option<Decimal>,
    pub payer_name_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleActions {
    pub property_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub category: Option<String>,
    #[serde(default)]
    pub auto_match: bool,
    #[serde(default)]
    pub tolerance: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationRule {
    pub rule_id: Uuid,
    pub owner_id: String,
    pub name: String,
    /// Lower numbers are evaluated first.
    pub priority: i32,
    pub is_active: bool,
    pub conditions: RuleConditions,
    pub actions: RuleActions,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
