//! Authorized reads.
//!
//! A [`ReadView`] is handed to the closure passed to `Engine::read`. Every
//! model it returns passed the `ReadModels` rules; typed models are returned
//! only when every top-level property also passed `ReadProperties`, while the
//! JSON views drop the properties the caller may not see.

use serde_json::{Map, Value as JsonValue, json};

use statecraft_auth::{AuthorizationRules, Category, RuleArgs, Subject};
use statecraft_core::{Context, Model, ModelId, ModelProps, Problem, StoredModel};
use statecraft_machine::{Collection, Command, EventRef, ModelReader};

use crate::registration::ModelRegistry;
use crate::store::{EventLogEntry, ModelStore};

/// Unfiltered reader straight over the store.
///
/// Handed to authorization rules and to the scheduler; never to callers.
pub struct StoreReader<'a>(pub &'a dyn ModelStore);

impl ModelReader for StoreReader<'_> {
    fn get_stored(&self, id: ModelId) -> Result<StoredModel, Problem> {
        self.0.load(id)?.ok_or(Problem::NotFound)
    }

    fn list_stored(&self, model_type: &str) -> Result<Vec<StoredModel>, Problem> {
        Ok(self.0.list_by_type(model_type)?)
    }
}

pub struct ReadView<'a> {
    context: &'a Context,
    store: &'a dyn ModelStore,
    registry: &'a ModelRegistry,
    rules: &'a AuthorizationRules,
}

impl<'a> ReadView<'a> {
    pub fn new(
        context: &'a Context,
        store: &'a dyn ModelStore,
        registry: &'a ModelRegistry,
        rules: &'a AuthorizationRules,
    ) -> Self {
        Self {
            context,
            store,
            registry,
            rules,
        }
    }

    pub fn context(&self) -> &Context {
        self.context
    }

    fn authorize(&self, category: Category, subject: Subject<'_>) -> Result<(), Problem> {
        let reader = StoreReader(self.store);
        let args = RuleArgs {
            context: self.context,
            subject,
            reader: &reader,
        };
        Ok(self.rules.authorize(category, &args)?)
    }

    fn allows(&self, category: Category, subject: Subject<'_>) -> bool {
        let reader = StoreReader(self.store);
        let args = RuleArgs {
            context: self.context,
            subject,
            reader: &reader,
        };
        self.rules.is_allowed(category, &args)
    }

    /// Model-level and every property-level decision must allow.
    fn check_fully_readable(&self, stored: &StoredModel) -> Result<(), Problem> {
        self.authorize(Category::ReadModels, Subject::Model(stored))?;
        if let JsonValue::Object(props) = &stored.props {
            for (name, value) in props {
                self.authorize(
                    Category::ReadProperties,
                    Subject::Property {
                        model: stored,
                        name,
                        value,
                    },
                )?;
            }
        }
        Ok(())
    }

    fn is_fully_readable(&self, stored: &StoredModel) -> bool {
        self.check_fully_readable(stored).is_ok()
    }

    fn load_stored(&self, id: ModelId) -> Result<StoredModel, Problem> {
        self.store.load(id)?.ok_or(Problem::NotFound)
    }

    fn stored_in<P: ModelProps>(&self, collection: &Collection<P>) -> Result<Vec<(StoredModel, Model<P>)>, Problem> {
        let mut out = Vec::new();
        for stored in self.store.list_by_type(P::MODEL_TYPE)? {
            let model = stored.decode::<P>()?;
            if collection.contains(&model) {
                out.push((stored, model));
            }
        }
        Ok(out)
    }

    /// Typed lookup. `NotFound` if absent or of another type, `Unauthorized` if hidden.
    pub fn get<P: ModelProps>(&self, id: ModelId) -> Result<Model<P>, Problem> {
        let stored = self.load_stored(id)?;
        if !stored.is_of::<P>() {
            return Err(Problem::NotFound);
        }
        self.check_fully_readable(&stored)?;
        stored.decode()
    }

    /// Every member of `collection`; `Unauthorized` if any of them is hidden.
    pub fn list<P: ModelProps>(&self, collection: &Collection<P>) -> Result<Vec<Model<P>>, Problem> {
        let mut out = Vec::new();
        for (stored, model) in self.stored_in(collection)? {
            self.check_fully_readable(&stored)?;
            out.push(model);
        }
        Ok(out)
    }

    /// The readable members of `collection`; hidden ones are left out.
    pub fn list_if_authorized<P: ModelProps>(&self, collection: &Collection<P>) -> Result<Vec<Model<P>>, Problem> {
        Ok(self
            .stored_in(collection)?
            .into_iter()
            .filter(|(stored, _)| self.is_fully_readable(stored))
            .map(|(_, model)| model)
            .collect())
    }

    /// First readable member matching `predicate`, in creation order.
    pub fn first_or_none<P, F>(&self, collection: &Collection<P>, predicate: F) -> Result<Option<Model<P>>, Problem>
    where
        P: ModelProps,
        F: Fn(&Model<P>) -> bool,
    {
        Ok(self
            .stored_in(collection)?
            .into_iter()
            .find(|(stored, model)| predicate(model) && self.is_fully_readable(stored))
            .map(|(_, model)| model))
    }

    /// Like [`first_or_none`](Self::first_or_none) but `NotFound` when nothing matches.
    pub fn get_first_where<P, F>(&self, collection: &Collection<P>, predicate: F) -> Result<Model<P>, Problem>
    where
        P: ModelProps,
        F: Fn(&Model<P>) -> bool,
    {
        self.first_or_none(collection, predicate)?.ok_or(Problem::NotFound)
    }

    /// JSON view of one model, with unreadable properties removed.
    pub fn view(&self, id: ModelId) -> Result<JsonValue, Problem> {
        let stored = self.load_stored(id)?;
        self.authorize(Category::ReadModels, Subject::Model(&stored))?;
        Ok(self.render(&stored))
    }

    /// Views of the members of `collection` the caller may read.
    pub fn list_views<P: ModelProps>(&self, collection: &Collection<P>) -> Result<Vec<JsonValue>, Problem> {
        Ok(self
            .stored_in(collection)?
            .into_iter()
            .filter(|(stored, _)| self.allows(Category::ReadModels, Subject::Model(stored)))
            .map(|(stored, _)| self.render(&stored))
            .collect())
    }

    fn render(&self, stored: &StoredModel) -> JsonValue {
        let props = match &stored.props {
            JsonValue::Object(all) => JsonValue::Object(
                all.iter()
                    .filter(|(name, value)| {
                        self.allows(
                            Category::ReadProperties,
                            Subject::Property {
                                model: stored,
                                name,
                                value,
                            },
                        )
                    })
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect::<Map<String, JsonValue>>(),
            ),
            other => other.clone(),
        };
        json!({
            "id": stored.id,
            "type": stored.model_type,
            "state": stored.state,
            "created_at": stored.created_at,
            "last_state_transition_at": stored.last_state_transition_at,
            "props": props,
        })
    }

    /// The event log, if the `EventLog` rules allow it.
    pub fn event_log(&self) -> Result<Vec<EventLogEntry>, Problem> {
        self.authorize(Category::EventLog, Subject::EventLog)?;
        Ok(self.store.event_log()?)
    }

    /// External events legal for the model that a parameterless command would be authorized for.
    ///
    /// Validators are not run; a listed event may still be rejected on submit.
    pub fn possible_events(&self, id: ModelId) -> Result<Vec<EventRef>, Problem> {
        let stored = self.load_stored(id)?;
        self.authorize(Category::ReadModels, Subject::Model(&stored))?;
        let registration = self.registry.get(&stored.model_type)?;

        let mut events: Vec<EventRef> = registration
            .external_events(Some(&stored.state))
            .into_iter()
            .filter(|event| {
                let command = Command::instance(*event, id);
                self.allows(Category::Commands, Subject::Command(&command))
            })
            .collect();
        events.sort_by_key(|e| e.name());
        Ok(events)
    }
}
