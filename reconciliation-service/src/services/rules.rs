//! Owner-scoped management of reconciliation rules.

use crate::models::{ReconciliationRule, RuleActions, RuleConditions};
use crate::services::patterns::TextPattern;
use crate::services::repository::RuleStore;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// User-supplied fields of a rule, shared by create and update.
#[derive(Debug, Clone)]
pub struct RuleDraft {
    pub name: String,
    pub priority: i32,
    pub is_active: bool,
    pub conditions: RuleConditions,
    pub actions: RuleActions,
}

impl RuleDraft {
    fn validate(&self) -> Result<(), AppError> {
        if self.name.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!("Rule name is required")));
        }

        let patterns = [
            ("descriptionPattern", &self.conditions.description_pattern),
            ("payerNamePattern", &self.conditions.payer_name_pattern),
        ];
        for (field, pattern) in patterns {
            if let Some(pattern) = pattern {
                TextPattern::compile_strict(pattern).map_err(|e| {
                    AppError::BadRequest(anyhow::anyhow!("Invalid {}: {}", field, e))
                })?;
            }
        }

        if let (Some(min), Some(max)) = (self.conditions.amount_min, self.conditions.amount_max) {
            if min > max {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "amountMin must not exceed amountMax"
                )));
            }
        }

        if self.actions.tolerance < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "tolerance must not be negative"
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RuleService {
    store: Arc<dyn RuleStore>,
}

impl RuleService {
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, draft), fields(name = %draft.name, priority = draft.priority))]
    pub async fn create(
        &self,
        owner_id: &str,
        draft: RuleDraft,
    ) -> Result<ReconciliationRule, AppError> {
        draft.validate()?;

        let now = Utc::now();
        let rule = ReconciliationRule {
            rule_id: Uuid::new_v4(),
            owner_id: owner_id.to_string(),
            name: draft.name.trim().to_string(),
            priority: draft.priority,
            is_active: draft.is_active,
            conditions: draft.conditions,
            actions: draft.actions,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&rule).await?;

        info!(rule_id = %rule.rule_id, "Rule created");
        Ok(rule)
    }

    /// Rules in evaluation order: ascending priority, oldest first on ties.
    #[instrument(skip(self))]
    pub async fn list(&self, owner_id: &str) -> Result<Vec<ReconciliationRule>, AppError> {
        self.store.list(owner_id).await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, owner_id: &str, rule_id: Uuid) -> Result<ReconciliationRule, AppError> {
        self.store
            .get(owner_id, rule_id)
            .await?
            .ok_or_else(|| rule_not_found(rule_id))
    }

    #[instrument(skip(self, draft))]
    pub async fn update(
        &self,
        owner_id: &str,
        rule_id: Uuid,
        draft: RuleDraft,
    ) -> Result<ReconciliationRule, AppError> {
        draft.validate()?;

        let existing = self.get(owner_id, rule_id).await?;
        let rule = ReconciliationRule {
            name: draft.name.trim().to_string(),
            priority: draft.priority,
            is_active: draft.is_active,
            conditions: draft.conditions,
            actions: draft.actions,
            updated_at: Utc::now(),
            ..existing
        };

        let updated = self
            .store
            .update(&rule)
            .await?
            .ok_or_else(|| rule_not_found(rule_id))?;
        info!(rule_id = %rule_id, "Rule updated");
        Ok(updated)
    }

    /// Already-matched transactions are left as they are.
    #[instrument(skip(self))]
    pub async fn delete(&self, owner_id: &str, rule_id: Uuid) -> Result<(), AppError> {
        if !self.store.delete(owner_id, rule_id).await? {
            return Err(rule_not_found(rule_id));
        }
        info!(rule_id = %rule_id, "Rule deleted");
        Ok(())
    }
}

fn rule_not_found(rule_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Rule {} not found", rule_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::repository::InMemoryRuleStore;
    use rust_decimal_macros::dec;

    fn draft(name: &str, priority: i32) -> RuleDraft {
        RuleDraft {
            name: name.to_string(),
            priority,
            is_active: true,
            conditions: RuleConditions {
                description_pattern: Some("rent".to_string()),
                ..Default::default()
            },
            actions: RuleActions {
                auto_match: true,
                tolerance: dec!(10),
                ..Default::default()
            },
        }
    }

    fn service() -> RuleService {
        RuleService::new(Arc::new(InMemoryRuleStore::new()))
    }

    #[tokio::test]
    async fn list_is_sorted_by_priority_and_scoped_to_owner() {
        let rules = service();
        rules.create("owner-1", draft("late", 10)).await.unwrap();
        rules.create("owner-1", draft("early", 1)).await.unwrap();
        rules.create("owner-2", draft("foreign", 0)).await.unwrap();

        let names: Vec<String> = rules
            .list("owner-1")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(names, vec!["early", "late"]);
    }

    #[tokio::test]
    async fn invalid_pattern_is_rejected() {
        let mut bad = draft("bad", 1);
        bad.conditions.description_pattern = Some("(unclosed".to_string());
        let err = service().create("owner-1", bad).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn inverted_amount_range_is_rejected() {
        let mut bad = draft("bad", 1);
        bad.conditions.amount_min = Some(dec!(500));
        bad.conditions.amount_max = Some(dec!(100));
        let err = service().create("owner-1", bad).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn other_owners_cannot_touch_a_rule() {
        let rules = service();
        let rule = rules.create("owner-1", draft("mine", 1)).await.unwrap();

        let err = rules.get("owner-2", rule.rule_id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = rules.delete("owner-2", rule.rule_id).await.unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");
        let err = rules
            .update("owner-2", rule.rule_id, draft("stolen", 1))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "NOT_FOUND");

        assert_eq!(rules.get("owner-1", rule.rule_id).await.unwrap().name, "mine");
    }

    #[tokio::test]
    async fn update_keeps_identity_and_creation_time() {
        let rules = service();
        let rule = rules.create("owner-1", draft("before", 5)).await.unwrap();

        let updated = rules
            .update("owner-1", rule.rule_id, draft("after", 2))
            .await
            .unwrap();
        assert_eq!(updated.rule_id, rule.rule_id);
        assert_eq!(updated.created_at, rule.created_at);
        assert_eq!(updated.name, "after");
        assert_eq!(updated.priority, 2);
    }

    #[tokio::test]
    async fn delete_removes_the_rule() {
        let rules = service();
        let rule = rules.create("owner-1", draft("gone", 1)).await.unwrap();
        rules.delete("owner-1", rule.rule_id).await.unwrap();
        assert!(rules.list("owner-1").await.unwrap().is_empty());
    }
}
