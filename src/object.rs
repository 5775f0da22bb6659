//! The opaque resource object and dotted-path field access.

use jsonptr::Pointer;
use serde_json::Value;
use std::fmt;

/// An opaque, server-returned resource.
///
/// Wraps a JSON value and exposes only the three envelope fields the core
/// is allowed to read by name (`apiVersion`, `kind`, `metadata.resourceVersion`),
/// plus a generic dotted-path accessor used by [`crate::store::Store::find`]
/// and by key derivation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Object(pub Value);

impl Object {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn api_version(&self) -> Option<&str> {
        self.0.get("apiVersion").and_then(Value::as_str)
    }

    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.0.get("kind").and_then(Value::as_str)
    }

    #[must_use]
    pub fn resource_version(&self) -> Option<&str> {
        self.get_path("metadata.resourceVersion").and_then(Value::as_str)
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.get_path("metadata.uid").and_then(Value::as_str)
    }

    /// Resolves a dotted path (e.g. `"metadata.uid"`) against the object.
    ///
    /// Dots are translated into an RFC 6901 JSON Pointer and resolved with
    /// [`jsonptr`]; segments containing a literal `.`, `~`, or `/` are not
    /// representable by this accessor. The default key path (`metadata.uid`)
    /// never needs them.
    #[must_use]
    pub fn get_path(&self, dotted: &str) -> Option<&Value> {
        let pointer_str = dotted_to_pointer(dotted);
        let pointer = Pointer::parse(&pointer_str).ok()?;
        pointer.resolve(&self.0).ok()
    }

    /// Derives the store key for this object using a dotted key path.
    ///
    /// Missing keys resolve to the literal string `"<absent>"` — the store
    /// still accepts such objects, uniqueness becomes the caller's problem.
    #[must_use]
    pub fn key(&self, key_path: &str) -> String {
        match self.get_path(key_path) {
            Some(Value::String(s)) => s.clone(),
            Some(v) => v.to_string(),
            None => "<absent>".to_string(),
        }
    }
}

impl fmt::Display for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} uid={}",
            self.api_version().unwrap_or("?"),
            self.kind().unwrap_or("?"),
            self.uid().unwrap_or("?")
        )
    }
}

fn dotted_to_pointer(dotted: &str) -> String {
    let mut out = String::with_capacity(dotted.len() + 1);
    for segment in dotted.split('.') {
        out.push('/');
        out.push_str(segment);
    }
    out
}
