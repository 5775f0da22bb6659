//! The list-then-watch loop: owns the resource-version cursor, drives a
//! [`StoreSink`] via four mutation callbacks, and restarts itself under
//! [`BackoffManager`] control after any failure.
//!
//! Implemented as a plain imperative `async fn` state machine: five named
//! states executed in sequence, not a lazily-pulled generator. Cancellation
//! is a first-class [`tokio_util::sync::CancellationToken`] raced against
//! every suspension point via `tokio::select!`.

use crate::backoff::{BackoffConfig, BackoffManager};
use crate::listwatcher::{ErrorClassifier, ListWatcher, WatchEventType, WatchOptions};
use crate::pager::{Pager, PagerConfig};
use crate::store::StoreSink;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("server returned an ERROR event: {0}")]
    ServerError(String),
    #[error("watch stream ended after less than one second with zero events")]
    VeryShortWatch,
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy)]
pub struct ReflectorConfig {
    pub pager: PagerConfig,
    pub backoff: BackoffConfig,
    /// Minimum watch duration before the server closes the stream; actual
    /// duration is `randomize(min_watch_timeout)`, i.e. uniform in `[d, 2d)`.
    pub min_watch_timeout: Duration,
    /// Sleep between watch retries after a connection-refused error.
    pub connection_refused_retry_period: Duration,
    /// Dotted path used to derive the Store key for each object.
    pub key_path: &'static str,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            pager: PagerConfig::default(),
            backoff: BackoffConfig::default(),
            min_watch_timeout: Duration::from_secs(5 * 60),
            connection_refused_retry_period: Duration::from_secs(1),
            key_path: "metadata.uid",
        }
    }
}

/// `⌊d · (1 + U[0,1))⌋` — uniform over `[d, 2d)`, spreading reconnect load.
fn randomize(d: Duration) -> Duration {
    let r: f64 = rand::rng().random_range(0.0..1.0);
    Duration::from_secs_f64(d.as_secs_f64() * (1.0 + r))
}

/// The list-then-watch loop for one resource type.
pub struct Reflector<S: StoreSink> {
    list_watcher: Arc<dyn ListWatcher>,
    classifier: Arc<dyn ErrorClassifier>,
    sink: S,
    config: ReflectorConfig,
    backoff: BackoffManager,
    cancel: CancellationToken,

    last_sync_resource_version: String,
    is_last_sync_resource_version_unavailable: bool,
    paginated_result: bool,
}

impl<S: StoreSink> Reflector<S> {
    #[must_use]
    pub fn new(
        list_watcher: Arc<dyn ListWatcher>,
        classifier: Arc<dyn ErrorClassifier>,
        sink: S,
        config: ReflectorConfig,
    ) -> Self {
        let backoff = BackoffManager::new(config.backoff);
        Self {
            list_watcher,
            classifier,
            sink,
            config,
            backoff,
            cancel: CancellationToken::new(),
            last_sync_resource_version: String::new(),
            is_last_sync_resource_version_unavailable: false,
            paginated_result: false,
        }
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn last_sync_resource_version(&self) -> &str {
        &self.last_sync_resource_version
    }

    /// Grants [`crate::informer::Informer`] access to the sink it installed,
    /// so it can reach through to the broadcast sender it wraps the `Writer`
    /// with.
    pub(crate) fn sink_ref(&self) -> &S {
        &self.sink
    }

    /// Idempotent; safe to call concurrently with `run()`.
    pub fn stop(&self) {
        self.cancel.cancel();
        // The underlying connection agent's `destroy()` has no counterpart
        // here: the token above is raced against every I/O await point, so
        // cancelling it already unblocks any in-flight list/watch call.
        self.backoff.clear_timeout();
    }

    /// Drives the loop until [`Reflector::stop`] is called.
    pub async fn run(&mut self) {
        while !self.cancel.is_cancelled() {
            if let Err(err) = self.list_and_watch().await {
                tracing::error!(error = %err, "list-and-watch iteration failed");
            }
            if self.cancel.is_cancelled() {
                break;
            }
            let delay = self.backoff.duration();
            tracing::debug!(?delay, "backing off before next relist");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.cancel.cancelled() => break,
            }
        }
    }

    fn relist_resource_version(&self) -> String {
        if self.is_last_sync_resource_version_unavailable {
            String::new()
        } else if self.last_sync_resource_version.is_empty() {
            "0".to_string()
        } else {
            self.last_sync_resource_version.clone()
        }
    }

    async fn list_and_watch(&mut self) -> Result<()> {
        let relist_rv = self.relist_resource_version();

        let mut page_size = self.config.pager.page_size;
        if !self.paginated_result && relist_rv != "0" && !relist_rv.is_empty() {
            // Not the initial (RV="0") list and not a forced-consistent (RV="")
            // relist either: steer the server to its watch cache instead of
            // stampeding the authoritative store with a paginated read.
            page_size = 0;
        }
        let pager = Pager::new(
            self.list_watcher.as_ref(),
            self.classifier.as_ref(),
            PagerConfig { page_size },
        );

        let mut used_rv = relist_rv.clone();
        let list_result = match pager.list(&relist_rv, &self.cancel).await {
            Ok(r) => r,
            Err(e) if is_list_error_expired(&e, self.classifier.as_ref()) => {
                tracing::debug!("list failed with expired/too-large resource version, relisting with empty RV");
                self.is_last_sync_resource_version_unavailable = true;
                let retry_rv = self.relist_resource_version();
                used_rv = retry_rv.clone();
                match pager.list(&retry_rv, &self.cancel).await {
                    Ok(r) => r,
                    Err(e2) => {
                        tracing::error!(error = %e2, "paginated list failed");
                        return Ok(());
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "paginated list failed");
                return Ok(());
            }
        };

        let rv = list_result.metadata.resource_version;
        // Only the *initial* list (RV="0") latches `paginated_result`; an
        // expired-recovery list (RV="") never does, even if it comes back
        // paginated. Check the RV actually used for the successful call, not
        // the RV computed before a possible expired-retry swapped it out.
        if used_rv == "0" && list_result.metadata.paginated {
            self.paginated_result = true;
        }
        self.is_last_sync_resource_version_unavailable = false;
        self.sink.replace(list_result.items);
        self.last_sync_resource_version = rv;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(());
            }
            match self.watch_once().await {
                WatchOutcome::Relist | WatchOutcome::Stopped => return Ok(()),
                WatchOutcome::Retry => continue,
                WatchOutcome::RetryAfterDelay => {
                    let delay = randomize(self.config.connection_refused_retry_period);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = self.cancel.cancelled() => return Ok(()),
                    }
                }
                WatchOutcome::Error(e) => return Err(e),
            }
        }
    }

    async fn watch_once(&mut self) -> WatchOutcome {
        let timeout = randomize(self.config.min_watch_timeout);
        let opts = WatchOptions {
            resource_version: self.last_sync_resource_version.clone(),
            allow_watch_bookmarks: true,
            timeout_seconds: timeout.as_secs(),
        };

        let stream = match self.list_watcher.watch(opts, &self.cancel).await {
            Ok(s) => s,
            Err(e) => return self.classify_watch_error(e),
        };

        use futures::StreamExt;
        let mut stream = std::pin::pin!(stream);
        let started = tokio::time::Instant::now();
        let mut events_seen = 0u32;

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return WatchOutcome::Stopped,
                item = stream.next() => item,
            };
            let Some(item) = next else {
                break;
            };
            match item {
                Ok(event) => {
                    events_seen += 1;
                    if let Err(e) = self.handle_event(event) {
                        return WatchOutcome::Error(e);
                    }
                }
                Err(e) => return self.classify_watch_error(e),
            }
        }

        if started.elapsed() < Duration::from_secs(1) && events_seen == 0 {
            return WatchOutcome::Error(Error::VeryShortWatch);
        }
        WatchOutcome::Retry
    }

    fn classify_watch_error(&self, err: crate::listwatcher::WatchError) -> WatchOutcome {
        if self.classifier.is_connection_refused(&err) {
            tracing::debug!(error = %err, "watch connection refused, retrying without relisting");
            WatchOutcome::RetryAfterDelay
        } else if self.classifier.is_watch_expired(&err) {
            tracing::info!(error = %err, "watch expired, relisting with current cursor");
            WatchOutcome::Relist
        } else {
            tracing::warn!(error = %err, "watch failed");
            WatchOutcome::Relist
        }
    }

    fn handle_event(&mut self, event: crate::listwatcher::WatchEvent) -> Result<()> {
        if event.event_type == WatchEventType::Error {
            return Err(Error::ServerError(format!("{}", event.object)));
        }

        let descriptor = self.list_watcher.descriptor();
        let api_version = event.object.api_version().unwrap_or_default().to_string();
        let kind = event.object.kind().unwrap_or_default().to_string();
        if !descriptor.matches(&api_version, &kind) {
            tracing::warn!(%api_version, %kind, "dropping event for mismatched apiVersion/kind");
            return Ok(());
        }

        match event.event_type {
            WatchEventType::Added => self.sink.add(event.object.clone()),
            WatchEventType::Modified => self.sink.update(event.object.clone()),
            WatchEventType::Deleted => self.sink.delete(event.object.clone()),
            WatchEventType::Bookmark => {}
            WatchEventType::Error => unreachable!("handled above"),
        }

        match event.object.resource_version() {
            Some(rv) => self.last_sync_resource_version = rv.to_string(),
            None => tracing::error!("watch event carried no resourceVersion"),
        }
        Ok(())
    }
}

#[derive(Debug)]
enum WatchOutcome {
    /// Return to the outer loop; it will relist using the current cursor.
    Relist,
    /// Sleep the connection-refused retry period, then reopen the watch.
    RetryAfterDelay,
    /// Reopen the watch immediately (used after a bookmark-only drain).
    Retry,
    Stopped,
    Error(Error),
}

fn is_list_error_expired(err: &crate::listwatcher::ListError, classifier: &dyn ErrorClassifier) -> bool {
    classifier.is_expired(err) || classifier.is_too_large_resource_version(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listwatcher::{
        ListError, ListOptions, ListPage, ListPageMetadata, ResourceDescriptor, WatchError, WatchEvent,
        WatchEventType, WatchStream,
    };
    use crate::object::Object;
    use crate::store::Writer;
    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tracing_subscriber::util::SubscriberInitExt;

    fn obj(uid: &str, rv: &str) -> Object {
        Object::new(json!({"apiVersion": "v1", "kind": "X", "metadata": {"uid": uid, "resourceVersion": rv}}))
    }

    fn descriptor() -> ResourceDescriptor {
        ResourceDescriptor {
            group: String::new(),
            version: "v1".into(),
            kind: "X".into(),
        }
    }

    enum ListStep {
        Ok {
            rv: &'static str,
            continue_token: Option<&'static str>,
            items: Vec<Object>,
        },
        Err(&'static str),
    }

    enum WatchStep {
        OpenErr(&'static str),
        Events(Vec<std::result::Result<WatchEvent, WatchError>>),
    }

    struct Scripted {
        descriptor: ResourceDescriptor,
        lists: Mutex<VecDeque<ListStep>>,
        watches: Mutex<VecDeque<WatchStep>>,
    }

    #[async_trait]
    impl ListWatcher for Scripted {
        fn descriptor(&self) -> &ResourceDescriptor {
            &self.descriptor
        }

        async fn list(&self, _opts: ListOptions, _cancel: &CancellationToken) -> std::result::Result<ListPage, ListError> {
            match self.lists.lock().unwrap().pop_front().expect("no more scripted lists") {
                ListStep::Ok { rv, continue_token, items } => Ok(ListPage {
                    metadata: ListPageMetadata {
                        resource_version: rv.to_string(),
                        continue_token: continue_token.map(str::to_string),
                    },
                    items,
                }),
                ListStep::Err(msg) => Err(ListError(msg.to_string())),
            }
        }

        async fn watch(&self, _opts: WatchOptions, _cancel: &CancellationToken) -> std::result::Result<WatchStream, WatchError> {
            match self.watches.lock().unwrap().pop_front().expect("no more scripted watches") {
                WatchStep::OpenErr(msg) => Err(WatchError(msg.to_string())),
                WatchStep::Events(events) => Ok(futures::stream::iter(events).boxed()),
            }
        }
    }

    fn setup_tracing() -> tracing::dispatcher::DefaultGuard {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .finish()
            .set_default()
    }

    /// Classifies errors by a marker substring in their message.
    struct MarkerClassifier;
    impl ErrorClassifier for MarkerClassifier {
        fn is_expired(&self, err: &ListError) -> bool {
            err.0.contains("expired")
        }
        fn is_too_large_resource_version(&self, err: &ListError) -> bool {
            err.0.contains("too-large")
        }
        fn is_connection_refused(&self, err: &WatchError) -> bool {
            err.0.contains("connection-refused")
        }
        fn is_watch_expired(&self, err: &WatchError) -> bool {
            err.0.contains("expired")
        }
    }

    fn new_reflector(lw: Scripted) -> (Reflector<Writer>, crate::store::Store) {
        let writer = Writer::new("metadata.uid");
        let store = writer.as_reader();
        let reflector = Reflector::new(Arc::new(lw), Arc::new(MarkerClassifier), writer, ReflectorConfig::default());
        (reflector, store)
    }

    #[tokio::test]
    async fn happy_path_list_and_watch() {
        let _tracing = setup_tracing();
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::from([ListStep::Ok {
                rv: "100",
                continue_token: None,
                items: vec![obj("a", "99"), obj("b", "100")],
            }])),
            watches: Mutex::new(VecDeque::from([
                WatchStep::Events(vec![
                    Ok(WatchEvent {
                        event_type: WatchEventType::Added,
                        object: obj("c", "101"),
                    }),
                    Ok(WatchEvent {
                        event_type: WatchEventType::Deleted,
                        object: obj("a", "102"),
                    }),
                ]),
                // Second watch-open ends the loop with a non-retriable error
                // so the test doesn't need to script a third round.
                WatchStep::OpenErr("boom"),
            ])),
        };
        let (mut reflector, store) = new_reflector(lw);

        reflector.list_and_watch().await.unwrap();

        let mut keys = store.list_keys();
        keys.sort();
        assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(reflector.last_sync_resource_version, "102");
        assert!(!reflector.is_last_sync_resource_version_unavailable);
    }

    #[tokio::test]
    async fn expired_list_recovery_does_not_latch_paginated_result() {
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::from([
                ListStep::Err("resource version too old: expired"),
                // Recovery relist (RV="") comes back paginated across two pages.
                ListStep::Ok {
                    rv: "",
                    continue_token: Some("tok1"),
                    items: vec![],
                },
                ListStep::Ok {
                    rv: "200",
                    continue_token: None,
                    items: vec![],
                },
            ])),
            watches: Mutex::new(VecDeque::from([WatchStep::Events(vec![])])),
        };
        let (mut reflector, store) = new_reflector(lw);

        // The scripted watch ends instantly with zero events, which is a
        // "very short watch" error; that's fine, we only care about the
        // list-stage invariants it left behind.
        let _ = reflector.list_and_watch().await;

        assert!(!reflector.is_last_sync_resource_version_unavailable);
        assert!(!reflector.paginated_result, "recovery list used RV=\"\", not \"0\"; must not latch");
        assert!(store.has_synced());
        assert!(store.is_empty());
        assert_eq!(reflector.last_sync_resource_version, "200");
    }

    #[tokio::test]
    async fn watch_expired_mid_stream_does_not_set_unavailable_flag() {
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::from([ListStep::Ok {
                rv: "50",
                continue_token: None,
                items: vec![obj("a", "50")],
            }])),
            watches: Mutex::new(VecDeque::from([WatchStep::Events(vec![
                Ok(WatchEvent {
                    event_type: WatchEventType::Modified,
                    object: obj("a", "51"),
                }),
                Err(WatchError("resource version too old: expired".into())),
            ])])),
        };
        let (mut reflector, _store) = new_reflector(lw);

        reflector.list_and_watch().await.unwrap();

        assert_eq!(reflector.last_sync_resource_version, "51");
        assert!(!reflector.is_last_sync_resource_version_unavailable);
    }

    #[tokio::test(start_paused = true)]
    async fn connection_refused_retries_watch_without_relisting() {
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::from([ListStep::Ok {
                rv: "10",
                continue_token: None,
                items: vec![],
            }])),
            watches: Mutex::new(VecDeque::from([
                WatchStep::OpenErr("connection-refused"),
                WatchStep::Events(vec![Ok(WatchEvent {
                    event_type: WatchEventType::Added,
                    object: obj("a", "11"),
                })]),
                WatchStep::OpenErr("boom"),
            ])),
        };
        let (mut reflector, store) = new_reflector(lw);

        reflector.list_and_watch().await.unwrap();

        assert_eq!(reflector.last_sync_resource_version, "11");
        assert_eq!(store.list().len(), 1);
    }

    #[tokio::test]
    async fn mismatched_kind_is_dropped_without_advancing_cursor() {
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::from([ListStep::Ok {
                rv: "5",
                continue_token: None,
                items: vec![],
            }])),
            watches: Mutex::new(VecDeque::from([
                WatchStep::Events(vec![Ok(WatchEvent {
                    event_type: WatchEventType::Added,
                    object: Object::new(json!({
                        "apiVersion": "v1", "kind": "Y",
                        "metadata": {"uid": "a", "resourceVersion": "6"},
                    })),
                })]),
                WatchStep::OpenErr("boom"),
            ])),
        };
        let (mut reflector, store) = new_reflector(lw);

        reflector.list_and_watch().await.unwrap();

        assert!(store.is_empty());
        assert_eq!(reflector.last_sync_resource_version, "5");
    }

    #[tokio::test]
    async fn bookmark_advances_cursor_without_touching_the_store() {
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::from([ListStep::Ok {
                rv: "5",
                continue_token: None,
                items: vec![obj("a", "5")],
            }])),
            watches: Mutex::new(VecDeque::from([
                WatchStep::Events(vec![Ok(WatchEvent {
                    event_type: WatchEventType::Bookmark,
                    // A bookmark's payload is not a real object; its uid
                    // must never show up as a store key if the dispatch is
                    // correctly skipping store mutation for this type.
                    object: obj("bookmark-marker", "9"),
                })]),
                WatchStep::OpenErr("boom"),
            ])),
        };
        let (mut reflector, store) = new_reflector(lw);

        reflector.list_and_watch().await.unwrap();

        assert_eq!(store.list_keys(), vec!["a".to_string()]);
        assert_eq!(reflector.last_sync_resource_version, "9");
    }

    #[tokio::test]
    async fn very_short_empty_watch_is_an_error() {
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::from([ListStep::Ok {
                rv: "1",
                continue_token: None,
                items: vec![],
            }])),
            watches: Mutex::new(VecDeque::from([WatchStep::Events(vec![])])),
        };
        let (mut reflector, _store) = new_reflector(lw);

        let result = reflector.list_and_watch().await;
        assert!(matches!(result, Err(Error::VeryShortWatch)));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::new()),
            watches: Mutex::new(VecDeque::new()),
        };
        let (reflector, _store) = new_reflector(lw);
        reflector.stop();
        reflector.stop();
        assert!(reflector.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn stop_clears_the_backoff_idle_timer() {
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::new()),
            watches: Mutex::new(VecDeque::new()),
        };
        let (mut reflector, _store) = new_reflector(lw);
        reflector.backoff.duration();
        assert!(reflector.backoff.has_pending_reset());
        reflector.stop();
        assert!(!reflector.backoff.has_pending_reset());
    }

    #[test]
    fn classify_watch_error_sorts_errors_into_the_right_buckets() {
        let lw = Scripted {
            descriptor: descriptor(),
            lists: Mutex::new(VecDeque::new()),
            watches: Mutex::new(VecDeque::new()),
        };
        let (reflector, _store) = new_reflector(lw);

        assert!(matches!(
            reflector.classify_watch_error(WatchError("connection-refused".into())),
            WatchOutcome::RetryAfterDelay
        ));
        assert!(matches!(
            reflector.classify_watch_error(WatchError("expired".into())),
            WatchOutcome::Relist
        ));
        assert!(matches!(
            reflector.classify_watch_error(WatchError("something else entirely".into())),
            WatchOutcome::Relist
        ));
    }
}
