//! Matching strategy evaluator.
//!
//! Tiers run from most to least certain and the first tier that finds a
//! pending payment wins: exact amount, user rules in priority order, then
//! a percentage-tolerance fuzzy search. The matcher always returns its best
//! candidate; whether that candidate is applied is the caller's decision.

use crate::config::MatchingConfig;
use crate::models::{
    AmountRange, BankTransaction, MatchDecision, MatchType, Payment, PaymentQuery, PaymentScope,
    ReconciliationRule,
};
use crate::services::metrics::record_transaction_match;
use crate::services::patterns::{PatternMatcher, TextPattern};
use crate::services::payments::PaymentGateway;
use crate::services::tolerance::{date_window, days_apart, scaled_confidence};
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{debug, instrument};

// ============================================================================
// Compiled rules
// ============================================================================

/// A rule with its text patterns compiled once per batch.
pub struct CompiledRule {
    rule: ReconciliationRule,
    description: Option<TextPattern>,
    payer_name: Option<TextPattern>,
}

impl CompiledRule {
    pub fn new(rule: ReconciliationRule) -> Self {
        let description = rule
            .conditions
            .description_pattern
            .as_deref()
            .map(TextPattern::compile);
        let payer_name = rule
            .conditions
            .payer_name_pattern
            .as_deref()
            .map(TextPattern::compile);
        Self {
            rule,
            description,
            payer_name,
        }
    }

    pub fn rule(&self) -> &ReconciliationRule {
        &self.rule
    }

    /// All present conditions hold. The payer pattern is only consulted when
    /// the transaction carries a payer name.
    pub fn conditions_hold(&self, txn: &BankTransaction) -> bool {
        let conditions = &self.rule.conditions;

        if let Some(pattern) = &self.description {
            if !pattern.is_match(&txn.description) {
                return false;
            }
        }
        if conditions.amount_min.is_some_and(|min| txn.amount < min) {
            return false;
        }
        if conditions.amount_max.is_some_and(|max| txn.amount > max) {
            return false;
        }
        if let (Some(pattern), Some(payer)) = (&self.payer_name, txn.payer_name.as_deref()) {
            if !pattern.is_match(payer) {
                return false;
            }
        }
        true
    }

    fn scope(&self) -> Option<PaymentScope> {
        Some(PaymentScope {
            property_id: self.rule.actions.property_id,
            tenant_id: self.rule.actions.tenant_id,
        })
    }
}

/// Active rules in evaluation order (ascending priority, oldest first on ties).
#[derive(Default)]
pub struct CompiledRuleSet {
    rules: Vec<CompiledRule>,
}

impl CompiledRuleSet {
    pub fn compile(rules: impl IntoIterator<Item = ReconciliationRule>) -> Self {
        let mut active: Vec<ReconciliationRule> =
            rules.into_iter().filter(|r| r.is_active).collect();
        active.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.rule_id.cmp(&b.rule_id))
        });
        Self {
            rules: active.into_iter().map(CompiledRule::new).collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &CompiledRule> {
        self.rules.iter()
    }

    /// Category label of the first rule whose conditions hold and that
    /// carries one. Independent of `autoMatch`.
    pub fn category_for(&self, txn: &BankTransaction) -> Option<String> {
        self.rules
            .iter()
            .filter(|r| r.rule.actions.category.is_some())
            .find(|r| r.conditions_hold(txn))
            .and_then(|r| r.rule.actions.category.clone())
    }
}

// ============================================================================
// Suggestions
// ============================================================================

/// A pending payment offered to a human as a manual-match candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchSuggestion {
    pub payment: Payment,
    pub amount_difference: Decimal,
    pub days_from_due: i64,
}

// ============================================================================
// Matcher
// ============================================================================

#[derive(Clone)]
pub struct Matcher {
    payments: Arc<dyn PaymentGateway>,
    config: MatchingConfig,
}

impl Matcher {
    pub fn new(payments: Arc<dyn PaymentGateway>, config: MatchingConfig) -> Self {
        Self { payments, config }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Best candidate for `txn` among `owner_id`'s pending payments.
    #[instrument(skip(self, txn, rules), fields(external_id = %txn.external_id, rules = rules.len()))]
    pub async fn find_match(
        &self,
        txn: &BankTransaction,
        rules: &CompiledRuleSet,
        owner_id: &str,
    ) -> Result<MatchDecision, AppError> {
        let category = rules.category_for(txn);

        let decision = if let Some(decision) = self.exact_match(txn, owner_id).await? {
            decision
        } else if let Some(decision) = self.rule_match(txn, rules, owner_id).await? {
            decision
        } else if let Some(decision) = self.fuzzy_match(txn, owner_id).await? {
            decision
        } else {
            MatchDecision::none()
        };

        let decision = MatchDecision {
            category: decision.category.or(category),
            ..decision
        };

        debug!(
            match_type = decision.match_type.as_str(),
            confidence = %decision.confidence,
            "Match evaluated"
        );
        record_transaction_match(decision.match_type.as_str());
        Ok(decision)
    }

    async fn exact_match(
        &self,
        txn: &BankTransaction,
        owner_id: &str,
    ) -> Result<Option<MatchDecision>, AppError> {
        let query = PaymentQuery::for_owner(owner_id)
            .amount(AmountRange::exact(txn.amount))
            .due(date_window(txn.date, self.config.exact_date_window_days));

        Ok(self
            .payments
            .find_pending_payment(&query)
            .await?
            .map(|payment| MatchDecision {
                payment_id: Some(payment.payment_id),
                confidence: Decimal::ONE_HUNDRED,
                match_type: MatchType::Exact,
                category: None,
            }))
    }

    async fn rule_match(
        &self,
        txn: &BankTransaction,
        rules: &CompiledRuleSet,
        owner_id: &str,
    ) -> Result<Option<MatchDecision>, AppError> {
        for compiled in rules.iter() {
            let actions = &compiled.rule.actions;
            if !actions.auto_match || !compiled.conditions_hold(txn) {
                continue;
            }

            let query = PaymentQuery::for_owner(owner_id)
                .amount(AmountRange::around(txn.amount, actions.tolerance))
                .scope(compiled.scope());

            if let Some(payment) = self.payments.find_pending_payment(&query).await? {
                debug!(rule_id = %compiled.rule.rule_id, priority = compiled.rule.priority, "Rule matched");
                return Ok(Some(MatchDecision {
                    payment_id: Some(payment.payment_id),
                    confidence: scaled_confidence(
                        txn.amount,
                        payment.amount,
                        Decimal::ONE_HUNDRED,
                        self.config.rule_confidence_floor,
                    ),
                    match_type: MatchType::Rule,
                    category: actions.category.clone(),
                }));
            }
        }
        Ok(None)
    }

    async fn fuzzy_match(
        &self,
        txn: &BankTransaction,
        owner_id: &str,
    ) -> Result<Option<MatchDecision>, AppError> {
        let query = PaymentQuery::for_owner(owner_id)
            .amount(AmountRange::percent(txn.amount, self.config.fuzzy_amount_percent))
            .due(date_window(txn.date, self.config.fuzzy_date_window_days));

        Ok(self
            .payments
            .find_pending_payment(&query)
            .await?
            .map(|payment| MatchDecision {
                payment_id: Some(payment.payment_id),
                confidence: scaled_confidence(
                    txn.amount,
                    payment.amount,
                    self.config.fuzzy_base_confidence,
                    self.config.fuzzy_confidence_floor,
                ),
                match_type: MatchType::Fuzzy,
                category: None,
            }))
    }

    /// Pending payments within the suggestion band, closest amount first,
    /// then closest due date.
    #[instrument(skip(self, txn), fields(transaction_id = %txn.transaction_id))]
    pub async fn suggestions(
        &self,
        txn: &BankTransaction,
        owner_id: &str,
    ) -> Result<Vec<MatchSuggestion>, AppError> {
        let query = PaymentQuery::for_owner(owner_id)
            .pending()
            .amount(AmountRange::percent(txn.amount, self.config.suggestion_amount_percent));

        let mut suggestions: Vec<MatchSuggestion> = self
            .payments
            .find_payments(&query)
            .await?
            .into_iter()
            .map(|payment| MatchSuggestion {
                amount_difference: (payment.amount - txn.amount).abs(),
                days_from_due: days_apart(txn.date, payment.due_date),
                payment,
            })
            .collect();

        suggestions.sort_by(|a, b| {
            a.amount_difference
                .cmp(&b.amount_difference)
                .then(a.days_from_due.cmp(&b.days_from_due))
                .then(a.payment.payment_id.cmp(&b.payment.payment_id))
        });
        suggestions.truncate(self.config.suggestion_limit);
        Ok(suggestions)
    }
}
