use std::borrow::Cow;
use std::sync::Arc;

use statecraft_core::{Model, ModelProps};

type Filter<P> = Arc<dyn Fn(&Model<P>) -> bool + Send + Sync>;

/// A named view over all models of one type.
///
/// Collections are cheap to clone and hold no data; readers evaluate them
/// against the store.
pub struct Collection<P> {
    name: Cow<'static, str>,
    filter: Option<Filter<P>>,
}

impl<P: ModelProps> Collection<P> {
    /// Every model of type `P`.
    pub fn all() -> Self {
        Self {
            name: Cow::Owned(format!("{}.all", P::MODEL_TYPE)),
            filter: None,
        }
    }

    /// Models of type `P` matching `filter`.
    pub fn new<F>(name: impl Into<Cow<'static, str>>, filter: F) -> Self
    where
        F: Fn(&Model<P>) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            filter: Some(Arc::new(filter)),
        }
    }

    /// Models of type `P` currently in `state`.
    pub fn in_state(state: &'static str) -> Self {
        Self::new(format!("{}.{state}", P::MODEL_TYPE), move |m| m.state == state)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, model: &Model<P>) -> bool {
        self.filter.as_ref().is_none_or(|f| f(model))
    }
}

impl<P> Clone for Collection<P> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            filter: self.filter.clone(),
        }
    }
}

impl<P> core::fmt::Debug for Collection<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}
