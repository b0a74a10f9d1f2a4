//! Observation layer.
//!
//! Collections and documents own an [`EventEmitter`] each and publish a
//! [`CollectionEvent`] / [`DocumentEvent`] after every state change.
//! Callbacks fire synchronously, after internal locks are released.

pub mod emitter;
pub mod event;

pub use emitter::{EventEmitter, ListenerFn, ListenerId};
pub use event::{CollectionEvent, DocumentEvent};
