//! In-memory keyed collection of observed objects.
//!
//! Split into a non-`Clone` [`Writer`] (owned by exactly one
//! [`crate::reflector::Reflector`]) and a `Clone` [`Store`] reader handle.
//! The `hasSynced` latch is a [`tokio::sync::watch`] channel, a natural fit
//! for one-shot, level-triggered state signaling that many readers can
//! observe independently.

use crate::object::Object;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use tokio::sync::watch;

type Map = HashMap<String, Object, BuildHasherDefault<ahash::AHasher>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid predicate")]
    InvalidPredicate,
}

pub type Result<T> = std::result::Result<T, Error>;

/// A predicate accepted by [`Store::find`].
///
/// Each variant is one recognized predicate shape; there is no catch-all
/// "none of the above" state to construct, so an unrecognized predicate is
/// a compile error rather than a runtime one.
pub enum Predicate<'a> {
    /// An arbitrary predicate function.
    Fn(&'a dyn Fn(&Object) -> bool),
    /// A dotted path, truthy if the resolved value is present and not `false`/`null`.
    Path(&'a str),
    /// A dotted path paired with an expected value, compared by deep equality.
    PathEquals(&'a str, serde_json::Value),
    /// A shallow field-by-field match against the object's top-level map.
    Shallow(&'a serde_json::Map<String, serde_json::Value>),
}

fn truthy(v: &serde_json::Value) -> bool {
    !matches!(v, serde_json::Value::Null | serde_json::Value::Bool(false))
}

impl Predicate<'_> {
    fn matches(&self, obj: &Object) -> bool {
        match self {
            Predicate::Fn(f) => f(obj),
            Predicate::Path(path) => obj.get_path(path).is_some_and(truthy),
            Predicate::PathEquals(path, expected) => obj.get_path(path) == Some(expected),
            Predicate::Shallow(fields) => fields.iter().all(|(k, v)| obj.0.get(k) == Some(v)),
        }
    }
}

/// The four mutation operations a [`crate::reflector::Reflector`] drives its
/// sink through.
///
/// [`Writer`] implements this directly; [`crate::informer::Informer`] wraps a
/// `Writer` in a decorator that forwards to it and also fans out a named
/// event.
pub trait StoreSink: Send {
    fn replace(&mut self, items: Vec<Object>);
    fn add(&mut self, obj: Object);
    fn update(&mut self, obj: Object);
    fn delete(&mut self, obj: Object);
}

impl StoreSink for Writer {
    fn replace(&mut self, items: Vec<Object>) {
        Writer::replace(self, items);
    }

    fn add(&mut self, obj: Object) {
        Writer::add(self, obj);
    }

    fn update(&mut self, obj: Object) {
        Writer::update(self, obj);
    }

    fn delete(&mut self, obj: Object) {
        Writer::delete(self, &obj);
    }
}

/// The writable half of a [`Store`].
///
/// Not [`Clone`]: it is unsafe to share a single writable store between
/// multiple reflectors, since a `replace` from one would clobber the state
/// observed by the other.
pub struct Writer {
    key_path: String,
    map: Arc<RwLock<Map>>,
    synced_tx: watch::Sender<bool>,
}

impl Writer {
    /// Creates an empty store using the given dotted key path (e.g. `"metadata.uid"`).
    #[must_use]
    pub fn new(key_path: impl Into<String>) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            key_path: key_path.into(),
            map: Arc::new(RwLock::new(Map::default())),
            synced_tx,
        }
    }

    /// Returns a cloneable read handle to this store.
    #[must_use]
    pub fn as_reader(&self) -> Store {
        Store {
            key_path: Arc::from(self.key_path.as_str()),
            map: self.map.clone(),
            synced_rx: self.synced_tx.subscribe(),
        }
    }

    fn key(&self, obj: &Object) -> String {
        obj.key(&self.key_path)
    }

    /// `add` and `update` are deliberately indistinguishable: the server's
    /// ADDED/MODIFIED tagging is advisory, both just set the latest value.
    pub fn add(&mut self, obj: Object) {
        let key = self.key(&obj);
        self.map.write().insert(key, obj);
    }

    pub fn update(&mut self, obj: Object) {
        self.add(obj);
    }

    /// Silently a no-op if the key is absent.
    pub fn delete(&mut self, obj: &Object) {
        let key = self.key(obj);
        self.map.write().remove(&key);
    }

    /// Clears the map, inserts every item, then fulfills `hasSynced`.
    ///
    /// Idempotent: calling `replace` again re-sends `true` on the watch
    /// channel, which is a no-op for receivers that already observed it.
    pub fn replace(&mut self, items: Vec<Object>) {
        let mut map = self.map.write();
        map.clear();
        for item in items {
            let key = self.key(&item);
            map.insert(key, item);
        }
        drop(map);
        let _ = self.synced_tx.send(true);
    }
}

/// A readable cache of observed objects.
///
/// Cloning produces a new handle to the same backing map.
#[derive(Clone)]
pub struct Store {
    key_path: Arc<str>,
    map: Arc<RwLock<Map>>,
    synced_rx: watch::Receiver<bool>,
}

impl Store {
    #[must_use]
    pub fn get_by_key(&self, key: &str) -> Option<Object> {
        self.map.read().get(key).cloned()
    }

    /// Looks up `obj` using this store's configured key path, the same path
    /// its owning [`Writer`] derives keys with.
    #[must_use]
    pub fn get(&self, obj: &Object) -> Option<Object> {
        self.get_by_key(&obj.key(&self.key_path))
    }

    #[must_use]
    pub fn has_by_key(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    #[must_use]
    pub fn has(&self, obj: &Object) -> bool {
        self.has_by_key(&obj.key(&self.key_path))
    }

    #[must_use]
    pub fn list(&self) -> Vec<Object> {
        self.map.read().values().cloned().collect()
    }

    #[must_use]
    pub fn list_keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// Linear scan returning the first object matching `predicate`.
    #[must_use]
    pub fn find(&self, predicate: &Predicate<'_>) -> Option<Object> {
        self.map.read().values().find(|obj| predicate.matches(obj)).cloned()
    }

    /// `true` once `replace` has been called at least once; never reverts.
    #[must_use]
    pub fn has_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Awaits the first `replace` call.
    pub async fn wait_until_synced(&mut self) {
        if self.has_synced() {
            return;
        }
        // A sender can only ever send `true` once observable state changes
        // from its `false` default, so a single change is sufficient here.
        let _ = self.synced_rx.changed().await;
    }
}
