//! Document events
//!
//! This module provides:
//! - [`EventRecord`] - the persisted unit of work and its status machine
//! - [`Identity`] - the grouping key for supersede/merge and leasing
//! - [`DocumentEvent`] - the capability each event type implements
//! - [`EventTypeRegistry`] - parsing of stored records into [`Event`]s
//! - Built-in [`StringEvent`] and [`EntityChangeEvent`] types

mod builtin;
mod document;
mod identity;
mod record;
mod registry;

pub use builtin::{EntityChangeEvent, StringEvent};
pub use document::{downcast, DocumentEvent, Event, EventType, ParseFailure, Payload};
pub use identity::Identity;
pub use record::{EventId, EventRecord, EventStatus, Parameters};
pub use registry::{EventParser, EventTypeRegistry};
