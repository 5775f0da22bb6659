//! The external contract the core consumes: a `ListWatcher` capability plus
//! error classifiers, supplied by the caller. Everything behind this trait
//! (HTTP/2 transport, TLS, auth, URL construction) is an external
//! collaborator out of scope for this crate.

use crate::object::Object;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// A group/version/kind descriptor for the resource type a [`ListWatcher`] serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceDescriptor {
    #[must_use]
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    #[must_use]
    pub fn matches(&self, api_version: &str, kind: &str) -> bool {
        self.api_version() == api_version && self.kind == kind
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub resource_version: String,
    pub page_size: i64,
    pub continue_token: Option<String>,
}

/// Metadata returned alongside one page from [`ListWatcher::list`].
#[derive(Debug, Clone)]
pub struct ListPageMetadata {
    pub resource_version: String,
    /// `Some` when more pages remain; the token to pass as `continue_token` on the next call.
    pub continue_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ListPage {
    pub metadata: ListPageMetadata,
    pub items: Vec<Object>,
}

/// The aggregated result [`crate::pager::Pager::list`] hands to the [`crate::reflector::Reflector`].
#[derive(Debug, Clone)]
pub struct ListMetadata {
    pub resource_version: String,
    /// Latched true if and only if the fetch spanned more than one page.
    pub paginated: bool,
}

#[derive(Debug, Clone)]
pub struct ListResponse {
    pub metadata: ListMetadata,
    pub items: Vec<Object>,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub resource_version: String,
    pub allow_watch_bookmarks: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    /// Populated for every type except `Error`, whose payload is a status object instead.
    pub object: Object,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, WatchError>>;

#[derive(Debug, thiserror::Error)]
#[error("list failed: {0}")]
pub struct ListError(pub String);

/// An error either opening a watch stream or draining an already-open one.
///
/// Both cases classify under the same three buckets (connection refused,
/// expired, other), so a single error type is enough here.
#[derive(Debug, thiserror::Error)]
#[error("watch failed: {0}")]
pub struct WatchError(pub String);

/// Caller-supplied capability performing list/watch HTTP calls for one resource type.
#[async_trait]
pub trait ListWatcher: Send + Sync {
    fn descriptor(&self) -> &ResourceDescriptor;

    async fn list(&self, opts: ListOptions, cancel: &CancellationToken) -> Result<ListPage, ListError>;

    async fn watch(&self, opts: WatchOptions, cancel: &CancellationToken) -> Result<WatchStream, WatchError>;
}

/// Pure predicates classifying a caller's error values.
///
/// The core never parses error payloads itself; it only asks these
/// questions of whatever error type the `ListWatcher` implementation uses.
pub trait ErrorClassifier: Send + Sync {
    fn is_expired(&self, err: &ListError) -> bool;
    fn is_too_large_resource_version(&self, err: &ListError) -> bool;
    fn is_connection_refused(&self, err: &WatchError) -> bool;
    fn is_watch_expired(&self, err: &WatchError) -> bool;
}
