//! Registry of event types for type-erased parsing
//!
//! Records come out of the store as a type name plus parameters. The registry
//! maps type names to parsers; anything it cannot interpret becomes an
//! unparseable placeholder instead of an error so one malformed record never
//! blocks a batch.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::{DocumentEvent, Event, EventRecord, EventType, Parameters, ParseFailure, Payload};

/// Parser from persisted parameters to a document event
pub type EventParser =
    Box<dyn Fn(&Parameters) -> Result<Arc<dyn DocumentEvent>, String> + Send + Sync>;

/// Registry of event parsers keyed by type name
pub struct EventTypeRegistry {
    parsers: HashMap<String, EventParser>,
}

impl Default for EventTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTypeRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Register an event type
    pub fn register<E: EventType>(&mut self) {
        let parser: EventParser = Box::new(|parameters: &Parameters| {
            let event = E::from_parameters(parameters)?;
            Ok(Arc::new(event) as Arc<dyn DocumentEvent>)
        });
        self.parsers.insert(E::TYPE.to_string(), parser);
    }

    /// Builder-style registration
    pub fn with<E: EventType>(mut self) -> Self {
        self.register::<E>();
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.parsers.contains_key(event_type)
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// Registered type names, sorted
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.parsers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Interpret a stored record
    pub fn parse(&self, record: EventRecord) -> Event {
        if let Some(reason) = record.decode_error.clone() {
            let failure = ParseFailure {
                event_type: record.event_type.clone(),
                reason,
            };
            return Event::loaded(record, Payload::Unparseable(failure));
        }
        let payload = match self.parsers.get(&record.event_type) {
            Some(parser) => match parser(&record.parameters) {
                Ok(document) => Payload::Document(document),
                Err(reason) => Payload::Unparseable(ParseFailure {
                    event_type: record.event_type.clone(),
                    reason,
                }),
            },
            None => Payload::Unparseable(ParseFailure {
                event_type: record.event_type.clone(),
                reason: "unknown event type".to_string(),
            }),
        };
        Event::loaded(record, payload)
    }
}

impl fmt::Debug for EventTypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventTypeRegistry")
            .field("event_types", &self.types())
            .finish()
    }
}
