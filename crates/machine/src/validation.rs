use serde::{Deserialize, Serialize};

/// Outcome of a single validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Validity {
    Valid,
    Invalid(String),
}

impl Validity {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    /// `Valid` when `ok`, otherwise `Invalid(reason())`.
    pub fn check(ok: bool, reason: impl FnOnce() -> String) -> Self {
        if ok { Self::Valid } else { Self::Invalid(reason()) }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Validity::Valid)
    }
}

/// Collect the reasons of every invalid outcome, in validator order.
pub fn collect_failures(results: impl IntoIterator<Item = Validity>) -> Vec<String> {
    results
        .into_iter()
        .filter_map(|v| match v {
            Validity::Valid => None,
            Validity::Invalid(reason) => Some(reason),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_keep_order_and_skip_valid() {
        let reasons = collect_failures([
            Validity::invalid("first"),
            Validity::Valid,
            Validity::check(false, || "second".to_string()),
        ]);
        assert_eq!(reasons, vec!["first", "second"]);
    }
}
