//! Optimistic concurrency expectations for stored models.

/// Optimistic concurrency expectation for a model write or read check.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// The model must not exist.
    Absent,
    /// Require the model to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Expectation matching what a reader saw: `None` when the model was missing.
    pub fn observed(version: Option<u64>) -> Self {
        version.map_or(ExpectedVersion::Absent, ExpectedVersion::Exact)
    }

    /// `actual` is `None` when the model does not exist.
    pub fn matches(self, actual: Option<u64>) -> bool {
        match (self, actual) {
            (ExpectedVersion::Absent, None) => true,
            (ExpectedVersion::Absent, Some(_)) => false,
            (ExpectedVersion::Exact(v), Some(a)) => v == a,
            (ExpectedVersion::Exact(_), None) => false,
        }
    }
}
