#![deny(clippy::all)]
#![deny(clippy::pedantic)]
// Triggered by many derive macros (serde, thiserror)
#![allow(clippy::default_trait_access)]
#![allow(clippy::module_name_repetitions)]

//! A client-side cache for a declarative control-plane API: the
//! Reflector/Informer/Store triad that keeps an in-memory replica of a
//! server-side resource collection in sync via list-then-watch.
//!
//! The core does not authenticate, parse schemas beyond the envelope fields
//! it needs, persist to disk, or journal events. Transport, TLS, auth, and
//! URL construction are external collaborators reached only through the
//! [`listwatcher::ListWatcher`] trait.

pub mod backoff;
pub mod informer;
pub mod listwatcher;
pub mod object;
pub mod pager;
pub mod reflector;
pub mod store;

pub use backoff::{BackoffConfig, BackoffManager};
pub use informer::{Informer, StoreEvent};
pub use listwatcher::{ErrorClassifier, ListWatcher, ResourceDescriptor};
pub use object::Object;
pub use pager::{Pager, PagerConfig};
pub use reflector::{Reflector, ReflectorConfig};
pub use store::{Predicate, Store, StoreSink, Writer};
