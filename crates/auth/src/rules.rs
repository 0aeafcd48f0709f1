use std::borrow::Cow;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value as JsonValue;

use statecraft_core::{Context, StoredModel};
use statecraft_machine::{Command, ModelReader};

/// Operation categories, each with its own positive and negative rule lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Commands,
    ReadModels,
    ReadProperties,
    EventLog,
}

impl core::fmt::Display for Category {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(match self {
            Category::Commands => "commands",
            Category::ReadModels => "read_models",
            Category::ReadProperties => "read_properties",
            Category::EventLog => "event_log",
        })
    }
}

/// What a rule is asked about.
#[derive(Debug, Clone, Copy)]
pub enum Subject<'a> {
    Command(&'a Command),
    Model(&'a StoredModel),
    Property {
        model: &'a StoredModel,
        name: &'a str,
        value: &'a JsonValue,
    },
    EventLog,
}

/// Arguments handed to every rule.
#[derive(Clone, Copy)]
pub struct RuleArgs<'a> {
    pub context: &'a Context,
    pub subject: Subject<'a>,
    pub reader: &'a dyn ModelReader,
}

impl<'a> RuleArgs<'a> {
    pub fn command(&self) -> Option<&'a Command> {
        match self.subject {
            Subject::Command(c) => Some(c),
            _ => None,
        }
    }

    /// The model being read (model and property categories).
    pub fn model(&self) -> Option<&'a StoredModel> {
        match self.subject {
            Subject::Model(m) | Subject::Property { model: m, .. } => Some(m),
            _ => None,
        }
    }

    pub fn property(&self) -> Option<(&'a str, &'a JsonValue)> {
        match self.subject {
            Subject::Property { name, value, .. } => Some((name, value)),
            _ => None,
        }
    }
}

/// Vote of a positive rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PositiveAuthorization {
    Allow,
    NoOpinion,
}

/// Vote of a negative rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegativeAuthorization {
    Pass,
    Deny,
}

type PositiveFn = Arc<dyn Fn(&RuleArgs<'_>) -> PositiveAuthorization + Send + Sync>;
type NegativeFn = Arc<dyn Fn(&RuleArgs<'_>) -> NegativeAuthorization + Send + Sync>;

/// A rule that may grant access. Any `Allow` grants.
#[derive(Clone)]
pub struct PositiveRule {
    name: Cow<'static, str>,
    rule: PositiveFn,
}

impl PositiveRule {
    pub fn new<F>(name: impl Into<Cow<'static, str>>, rule: F) -> Self
    where
        F: Fn(&RuleArgs<'_>) -> PositiveAuthorization + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            rule: Arc::new(rule),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vote(&self, args: &RuleArgs<'_>) -> PositiveAuthorization {
        (self.rule)(args)
    }
}

/// A rule that may veto access. Any `Deny` blocks, overriding positive votes.
#[derive(Clone)]
pub struct NegativeRule {
    name: Cow<'static, str>,
    reason: Cow<'static, str>,
    rule: NegativeFn,
}

impl NegativeRule {
    /// `reason` is shown to the caller when this rule denies.
    pub fn new<F>(name: impl Into<Cow<'static, str>>, reason: impl Into<Cow<'static, str>>, rule: F) -> Self
    where
        F: Fn(&RuleArgs<'_>) -> NegativeAuthorization + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            reason: reason.into(),
            rule: Arc::new(rule),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn vote(&self, args: &RuleArgs<'_>) -> NegativeAuthorization {
        (self.rule)(args)
    }
}

impl core::fmt::Debug for PositiveRule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("PositiveRule").field(&self.name).finish()
    }
}

impl core::fmt::Debug for NegativeRule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("NegativeRule").field(&self.name).finish()
    }
}
