//! Thin composition of one [`Store`] and one [`Reflector`]: forwards every
//! mutation as a named event to subscribers and exposes a cancellation handle.
//!
//! Uses `async_broadcast` so multiple subscribers can observe the same
//! reflector without each paying for their own watch connection.

use crate::listwatcher::{ErrorClassifier, ListWatcher};
use crate::object::Object;
use crate::reflector::{Reflector, ReflectorConfig};
use crate::store::{Store, StoreSink, Writer};
use async_broadcast::{InactiveReceiver, Receiver, Sender};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A mutation observed by the owning [`Reflector`], mirrored to subscribers.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    Replace(Vec<Object>),
    Add(Object),
    Update(Object),
    Delete(Object),
}

/// Decorates a [`Writer`] so every mutation is both applied to the store and
/// broadcast to subscribers.
struct Dispatching {
    writer: Writer,
    tx: Sender<StoreEvent>,
}

impl StoreSink for Dispatching {
    fn replace(&mut self, items: Vec<Object>) {
        self.writer.replace(items.clone());
        let _ = self.tx.try_broadcast(StoreEvent::Replace(items));
    }

    fn add(&mut self, obj: Object) {
        self.writer.add(obj.clone());
        let _ = self.tx.try_broadcast(StoreEvent::Add(obj));
    }

    fn update(&mut self, obj: Object) {
        self.writer.update(obj.clone());
        let _ = self.tx.try_broadcast(StoreEvent::Update(obj));
    }

    fn delete(&mut self, obj: Object) {
        self.writer.delete(&obj);
        let _ = self.tx.try_broadcast(StoreEvent::Delete(obj));
    }
}

/// Composes a [`Store`] with a [`Reflector`], fanning out mutations as
/// [`StoreEvent`]s.
pub struct Informer {
    store: Store,
    reflector: Reflector<Dispatching>,
    _inactive_rx: InactiveReceiver<StoreEvent>,
}

impl Informer {
    #[must_use]
    pub fn new(
        list_watcher: Arc<dyn ListWatcher>,
        classifier: Arc<dyn ErrorClassifier>,
        config: ReflectorConfig,
        event_buffer: usize,
    ) -> Self {
        let writer = Writer::new(config.key_path);
        let store = writer.as_reader();
        let (mut tx, rx) = async_broadcast::broadcast(event_buffer);
        tx.set_await_active(false);
        let sink = Dispatching { writer, tx };
        let reflector = Reflector::new(list_watcher, classifier, sink, config);
        Self {
            store,
            reflector,
            _inactive_rx: rx.deactivate(),
        }
    }

    #[must_use]
    pub fn store(&self) -> Store {
        self.store.clone()
    }

    #[must_use]
    pub fn has_synced(&self) -> bool {
        self.store.has_synced()
    }

    #[must_use]
    pub fn last_sync_resource_version(&self) -> String {
        self.reflector.last_sync_resource_version().to_string()
    }

    /// Subscribes to mutation events fanned out by this informer's reflector.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<StoreEvent> {
        self.reflector.sink_sender().new_receiver()
    }

    /// Runs until `cancel` fires; propagates cancellation to the underlying reflector.
    ///
    /// Returns a handle that, when invoked, also cancels the reflector — the
    /// composition of the caller's token and the reflector's own.
    pub fn run(&mut self, cancel: CancellationToken) -> CancellationToken {
        let reflector_token = self.reflector.cancellation_token();
        let linked = reflector_token.clone();
        let guard_token = cancel.clone();
        tokio::spawn(async move {
            guard_token.cancelled().await;
            linked.cancel();
        });
        reflector_token
    }

    pub async fn run_to_completion(&mut self) {
        self.reflector.run().await;
    }
}

impl Reflector<Dispatching> {
    fn sink_sender(&self) -> &Sender<StoreEvent> {
        &self.sink_ref().tx
    }
}
