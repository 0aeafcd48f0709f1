use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;

use statecraft_core::Problem;

use crate::{Category, NegativeAuthorization, NegativeRule, PositiveAuthorization, PositiveRule, RuleArgs};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    /// A negative rule vetoed the operation.
    #[error("{reason}")]
    Denied { rule: String, reason: String },

    /// No positive rule granted access.
    #[error("no rule granted access")]
    NotGranted { category: Category },
}

impl From<AuthzError> for Problem {
    fn from(err: AuthzError) -> Self {
        Problem::unauthorized(err.to_string())
    }
}

/// Outcome of evaluating one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(AuthzError),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

#[derive(Default, Clone)]
struct RuleSet {
    positive: Vec<PositiveRule>,
    negative: Vec<NegativeRule>,
}

/// Authorization rules for every [`Category`].
///
/// Evaluation is fail-closed: an operation is allowed only if at least one
/// positive rule returns `Allow` and no negative rule returns `Deny`. A
/// category without rules therefore denies everything.
#[derive(Clone, Default)]
pub struct AuthorizationRules {
    sets: HashMap<Category, RuleSet>,
}

impl AuthorizationRules {
    pub fn builder() -> AuthorizationRulesBuilder {
        AuthorizationRulesBuilder::default()
    }

    /// Rules that allow every operation. Intended for tests and trusted tooling.
    pub fn allow_all() -> Self {
        let mut builder = Self::builder();
        for category in [
            Category::Commands,
            Category::ReadModels,
            Category::ReadProperties,
            Category::EventLog,
        ] {
            builder = builder.positive(category, "allow_all", |_| PositiveAuthorization::Allow);
        }
        builder.build()
    }

    pub fn evaluate(&self, category: Category, args: &RuleArgs<'_>) -> Decision {
        let Some(set) = self.sets.get(&category) else {
            return Decision::Deny(AuthzError::NotGranted { category });
        };

        if !set
            .positive
            .iter()
            .any(|r| r.vote(args) == PositiveAuthorization::Allow)
        {
            return Decision::Deny(AuthzError::NotGranted { category });
        }

        match set
            .negative
            .iter()
            .find(|r| r.vote(args) == NegativeAuthorization::Deny)
        {
            Some(rule) => Decision::Deny(AuthzError::Denied {
                rule: rule.name().to_string(),
                reason: rule.reason().to_string(),
            }),
            None => Decision::Allow,
        }
    }

    /// Check an operation, logging denials.
    pub fn authorize(&self, category: Category, args: &RuleArgs<'_>) -> Result<(), AuthzError> {
        match self.evaluate(category, args) {
            Decision::Allow => Ok(()),
            Decision::Deny(err) => {
                tracing::debug!(
                    category = %category,
                    actor = %args.context.actor,
                    error = %err,
                    "authorization denied"
                );
                Err(err)
            }
        }
    }

    pub fn is_allowed(&self, category: Category, args: &RuleArgs<'_>) -> bool {
        self.evaluate(category, args).is_allowed()
    }

    /// Evaluate every rule and report which ones voted for or against.
    ///
    /// Unlike [`evaluate`](Self::evaluate) this does not short-circuit.
    pub fn explain(&self, category: Category, args: &RuleArgs<'_>) -> AuthorizationExplanation {
        let empty = RuleSet::default();
        let set = self.sets.get(&category).unwrap_or(&empty);

        let allowed_by: Vec<String> = set
            .positive
            .iter()
            .filter(|r| r.vote(args) == PositiveAuthorization::Allow)
            .map(|r| r.name().to_string())
            .collect();
        let denied_by: Vec<DeniedBy> = set
            .negative
            .iter()
            .filter(|r| r.vote(args) == NegativeAuthorization::Deny)
            .map(|r| DeniedBy {
                rule: r.name().to_string(),
                reason: r.reason().to_string(),
            })
            .collect();

        let granted = denied_by.is_empty() && !allowed_by.is_empty();
        let reason = match (allowed_by.first(), denied_by.first()) {
            (None, _) => format!(
                "none of {} positive {} rule(s) granted access",
                set.positive.len(),
                category
            ),
            (Some(_), Some(first)) => format!("denied by negative rule '{}': {}", first.rule, first.reason),
            (Some(first), None) => format!("allowed by positive rule '{first}'"),
        };

        AuthorizationExplanation {
            category,
            actor: args.context.actor.to_string(),
            granted,
            reason,
            positive_rules: set.positive.len(),
            negative_rules: set.negative.len(),
            allowed_by,
            denied_by,
        }
    }
}

#[derive(Default)]
pub struct AuthorizationRulesBuilder {
    sets: HashMap<Category, RuleSet>,
}

impl AuthorizationRulesBuilder {
    pub fn positive<F>(mut self, category: Category, name: &'static str, rule: F) -> Self
    where
        F: Fn(&RuleArgs<'_>) -> PositiveAuthorization + Send + Sync + 'static,
    {
        self.sets
            .entry(category)
            .or_default()
            .positive
            .push(PositiveRule::new(name, rule));
        self
    }

    pub fn negative<F>(mut self, category: Category, name: &'static str, reason: &'static str, rule: F) -> Self
    where
        F: Fn(&RuleArgs<'_>) -> NegativeAuthorization + Send + Sync + 'static,
    {
        self.sets
            .entry(category)
            .or_default()
            .negative
            .push(NegativeRule::new(name, reason, rule));
        self
    }

    pub fn build(self) -> AuthorizationRules {
        AuthorizationRules { sets: self.sets }
    }
}

/// Detailed explanation of an authorization decision.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationExplanation {
    pub category: Category,
    pub actor: String,
    pub granted: bool,
    /// Human-readable reason for the decision.
    pub reason: String,
    pub positive_rules: usize,
    pub negative_rules: usize,
    pub allowed_by: Vec<String>,
    pub denied_by: Vec<DeniedBy>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeniedBy {
    pub rule: String,
    pub reason: String,
}

impl core::fmt::Debug for AuthorizationRules {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (category, set) in &self.sets {
            map.entry(category, &(set.positive.len(), set.negative.len()));
        }
        map.finish()
    }
}
