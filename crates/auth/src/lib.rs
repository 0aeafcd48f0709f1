//! `statecraft-auth` — positive/negative authorization rules.
//!
//! Rules are pure functions of the call context, the subject being accessed
//! and a read handle. The engine consults them for commands, model reads,
//! property reads and the event log.

pub mod authorize;
pub mod rules;

pub use authorize::{AuthorizationExplanation, AuthorizationRules, AuthorizationRulesBuilder, AuthzError, Decision, DeniedBy};
pub use rules::{Category, NegativeAuthorization, NegativeRule, PositiveAuthorization, PositiveRule, RuleArgs, Subject};
