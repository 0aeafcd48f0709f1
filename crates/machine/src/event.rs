use serde::Serialize;

/// Whether an event targets an existing model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventShape {
    /// No target model; may create one.
    Void,
    /// Operates on an existing model id.
    Instance,
}

/// Who may submit an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invocation {
    /// Callers may submit it directly.
    External,
    /// Only the engine submits it (cascades, time triggers).
    Internal,
}

/// A named, typed operation declared against a model type.
///
/// Events are plain constants, declared next to the model they belong to:
///
/// ```ignore
/// pub const MARK_COMPLETE: EventRef = EventRef::instance("todo", "MarkComplete");
/// pub const DELETE_TODO_INTERNAL: EventRef =
///     EventRef::instance("todo", "DeleteTodoInternal").internal();
/// ```
///
/// Parameters are not part of the reference: they travel in the command as
/// serde payloads and are decoded by the validators/builders that need them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct EventRef {
    model_type: &'static str,
    name: &'static str,
    shape: EventShape,
    invocation: Invocation,
}

impl EventRef {
    pub const fn void(model_type: &'static str, name: &'static str) -> Self {
        Self {
            model_type,
            name,
            shape: EventShape::Void,
            invocation: Invocation::External,
        }
    }

    pub const fn instance(model_type: &'static str, name: &'static str) -> Self {
        Self {
            model_type,
            name,
            shape: EventShape::Instance,
            invocation: Invocation::External,
        }
    }

    /// Mark the event as internal-only.
    pub const fn internal(mut self) -> Self {
        self.invocation = Invocation::Internal;
        self
    }

    pub fn model_type(&self) -> &'static str {
        self.model_type
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn shape(&self) -> EventShape {
        self.shape
    }

    pub fn invocation(&self) -> Invocation {
        self.invocation
    }

    pub fn is_void(&self) -> bool {
        self.shape == EventShape::Void
    }

    pub fn is_external(&self) -> bool {
        self.invocation == Invocation::External
    }
}

impl core::fmt::Display for EventRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.model_type, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CREATE: EventRef = EventRef::void("note", "Create");
    const PURGE: EventRef = EventRef::instance("note", "Purge").internal();

    #[test]
    fn const_declarations_carry_shape_and_invocation() {
        assert!(CREATE.is_void());
        assert!(CREATE.is_external());
        assert_eq!(PURGE.shape(), EventShape::Instance);
        assert!(!PURGE.is_external());
        assert_eq!(PURGE.to_string(), "note.Purge");
    }
}
