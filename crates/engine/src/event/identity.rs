//! Event identity
//!
//! Events with equal identities describe the same real-world entity and are
//! candidates for supersede/merge. The identity's string form doubles as the
//! lease resource id for the group.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::EventId;

const LEASE_PREFIX: &str = "document-event";

/// Stable grouping key for document events
///
/// Built from the event type plus an ordered list of key components taken
/// from the event's logical payload. Store ids and timestamps must not be used
/// as components, except for the unparseable placeholder which has no payload
/// to group on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identity {
    event_type: String,
    components: Vec<String>,
}

impl Identity {
    pub fn new<I, S>(event_type: impl Into<String>, components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            event_type: event_type.into(),
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    /// Identity of a record whose payload could not be parsed
    ///
    /// Each such record forms its own group.
    pub fn unparseable(event_type: &str, id: Option<EventId>) -> Self {
        let id = id.map_or_else(|| "unsaved".to_string(), |id| id.to_string());
        Self::new(format!("unparseable:{event_type}"), [id])
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Resource id used when leasing this identity
    pub fn lease_resource_id(&self) -> String {
        format!("{LEASE_PREFIX}:{self}")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&escape(&self.event_type))?;
        for component in &self.components {
            write!(f, "/{}", escape(component))?;
        }
        Ok(())
    }
}

/// Percent-escape separators so distinct identities never share a string form
fn escape(part: &str) -> String {
    let mut out = String::with_capacity(part.len());
    for c in part.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(c),
        }
    }
    out
}
