use statecraft_core::{Model, ModelId, ModelProps, Problem, StoredModel};

use crate::Collection;

/// Read handle passed to validators, builders, cascades and authorization rules.
///
/// Inside the processor it sees the command's own unit of work (staged writes
/// included). It is deliberately unfiltered: rules use it to make decisions,
/// so it cannot itself depend on rules.
pub trait ModelReader {
    /// Load a model by id, `Problem::NotFound` if absent.
    fn get_stored(&self, id: ModelId) -> Result<StoredModel, Problem>;

    /// All models of a type, in creation order.
    fn list_stored(&self, model_type: &str) -> Result<Vec<StoredModel>, Problem>;
}

/// Typed helpers over any [`ModelReader`] (usable through `&dyn ModelReader`).
pub trait ModelReaderExt: ModelReader {
    /// Typed lookup. A model of another type is reported as `NotFound`.
    fn get<P: ModelProps>(&self, id: ModelId) -> Result<Model<P>, Problem> {
        let stored = self.get_stored(id)?;
        if !stored.is_of::<P>() {
            return Err(Problem::NotFound);
        }
        stored.decode()
    }

    fn list<P: ModelProps>(&self, collection: &Collection<P>) -> Result<Vec<Model<P>>, Problem> {
        self.list_where(collection, |_| true)
    }

    fn list_where<P, F>(&self, collection: &Collection<P>, predicate: F) -> Result<Vec<Model<P>>, Problem>
    where
        P: ModelProps,
        F: Fn(&Model<P>) -> bool,
    {
        let mut out = Vec::new();
        for stored in self.list_stored(P::MODEL_TYPE)? {
            let model = stored.decode::<P>()?;
            if collection.contains(&model) && predicate(&model) {
                out.push(model);
            }
        }
        Ok(out)
    }

    fn first_or_none<P, F>(&self, collection: &Collection<P>, predicate: F) -> Result<Option<Model<P>>, Problem>
    where
        P: ModelProps,
        F: Fn(&Model<P>) -> bool,
    {
        Ok(self.list_where(collection, predicate)?.into_iter().next())
    }
}

impl<R: ModelReader + ?Sized> ModelReaderExt for R {}
