//! Built-in event types

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::{downcast, DocumentEvent, EventType, Identity, Parameters};

/// An event carrying a single string value
///
/// Two string events with the same value are duplicates: each supersedes the
/// other, so whichever is seen first survives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringEvent {
    pub value: String,
}

impl StringEvent {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
        }
    }
}

impl DocumentEvent for StringEvent {
    fn event_type(&self) -> &str {
        Self::TYPE
    }

    fn identity(&self) -> Identity {
        Identity::new(Self::TYPE, [self.value.as_str()])
    }

    fn parameters(&self) -> Parameters {
        Parameters::new().with("value", self.value.as_str())
    }

    fn is_superseded_by(&self, other: &dyn DocumentEvent) -> bool {
        downcast::<Self>(other).is_some_and(|other| other.value == self.value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl EventType for StringEvent {
    const TYPE: &'static str = "str";

    fn from_parameters(parameters: &Parameters) -> Result<Self, String> {
        parameters
            .get("value")
            .map(Self::new)
            .ok_or_else(|| "missing parameter: value".to_string())
    }
}

/// Notification that fields of an entity changed at a given version
///
/// A change is superseded by a change of the same entity at an equal or later
/// version that covers all of its fields. Changes of the same entity that do
/// not cover each other merge into one change of the union of fields at the
/// later version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityChangeEvent {
    pub entity: String,
    pub version: u64,
    pub fields: BTreeSet<String>,
}

impl EntityChangeEvent {
    pub fn new<I, S>(entity: impl Into<String>, version: u64, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity: entity.into(),
            version,
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }
}

impl DocumentEvent for EntityChangeEvent {
    fn event_type(&self) -> &str {
        Self::TYPE
    }

    fn identity(&self) -> Identity {
        Identity::new(Self::TYPE, [self.entity.as_str()])
    }

    fn parameters(&self) -> Parameters {
        // a JSON array of strings always serializes
        let fields = serde_json::to_string(&self.fields).unwrap_or_default();
        Parameters::new()
            .with("entity", self.entity.as_str())
            .with("version", self.version.to_string())
            .with("fields", fields)
    }

    fn is_superseded_by(&self, other: &dyn DocumentEvent) -> bool {
        downcast::<Self>(other).is_some_and(|other| {
            other.entity == self.entity
                && other.version >= self.version
                && other.fields.is_superset(&self.fields)
        })
    }

    fn could_merge_with(&self, other: &dyn DocumentEvent) -> bool {
        downcast::<Self>(other).is_some_and(|other| other.entity == self.entity)
    }

    fn merge(&self, other: &dyn DocumentEvent) -> Option<Arc<dyn DocumentEvent>> {
        let other = downcast::<Self>(other)?;
        Some(Arc::new(Self {
            entity: self.entity.clone(),
            version: self.version.max(other.version),
            fields: self.fields.union(&other.fields).cloned().collect(),
        }))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl EventType for EntityChangeEvent {
    const TYPE: &'static str = "entity_change";

    fn from_parameters(parameters: &Parameters) -> Result<Self, String> {
        let entity = parameters
            .get("entity")
            .ok_or_else(|| "missing parameter: entity".to_string())?;
        let version = parameters
            .get("version")
            .ok_or_else(|| "missing parameter: version".to_string())?
            .parse::<u64>()
            .map_err(|e| format!("invalid version: {e}"))?;
        let fields: BTreeSet<String> = match parameters.get("fields") {
            Some(raw) => {
                serde_json::from_str(raw).map_err(|e| format!("invalid fields: {e}"))?
            }
            None => BTreeSet::new(),
        };

        Ok(Self::new(entity, version, fields))
    }
}
