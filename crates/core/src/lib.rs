//! Orka core types: raw objects, keys and the list/watch contract.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod watch;

pub use watch::{
    ListOptions, ListResult, ListWatchError, ListerWatcher, Status, WatchEvent, WatchOptions,
    WatchSender, WatchStopper, WatchStream, RESOURCE_VERSION_ANY,
};

pub mod prelude {
    pub use super::{
        meta_namespace_index, meta_namespace_key, ExpectedType, KeyError, Object, TypeTag,
    };
    pub use super::watch::{
        ListOptions, ListResult, ListWatchError, ListerWatcher, Status, WatchEvent, WatchOptions,
        WatchStream,
    };
}

/// A mirrored object in its raw wire form.
///
/// The reflector never interprets the payload beyond `apiVersion`, `kind` and
/// a handful of `metadata` fields; everything else is carried verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Object(serde_json::Value);

impl Object {
    pub fn new(raw: serde_json::Value) -> Self { Self(raw) }

    pub fn raw(&self) -> &serde_json::Value { &self.0 }
    pub fn into_raw(self) -> serde_json::Value { self.0 }

    fn meta_str(&self, field: &str) -> Option<&str> {
        self.0.get("metadata")?.get(field)?.as_str()
    }

    pub fn name(&self) -> Option<&str> { self.meta_str("name") }

    /// Namespace, treating an empty string the same as absent (cluster-scoped).
    pub fn namespace(&self) -> Option<&str> {
        self.meta_str("namespace").filter(|ns| !ns.is_empty())
    }

    /// Server-assigned version marker. Opaque: only compared for equality or passed back.
    pub fn resource_version(&self) -> Option<&str> { self.meta_str("resourceVersion") }

    pub fn uid(&self) -> Option<&str> { self.meta_str("uid") }

    pub fn type_tag(&self) -> Option<TypeTag> {
        let api_version = self.0.get("apiVersion")?.as_str()?;
        let kind = self.0.get("kind")?.as_str()?;
        Some(TypeTag::new(api_version, kind))
    }
}

impl From<serde_json::Value> for Object {
    fn from(v: serde_json::Value) -> Self { Self(v) }
}

/// Static descriptor of an object type: `apiVersion` plus `kind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeTag {
    pub api_version: String,
    pub kind: String,
}

impl TypeTag {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { api_version: api_version.into(), kind: kind.into() }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.kind)
    }
}

/// The type a reflector promises to put in its store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExpectedType {
    /// Accept any object.
    #[default]
    Any,
    Tag(TypeTag),
}

impl ExpectedType {
    pub fn matches(&self, obj: &Object) -> bool {
        match self {
            ExpectedType::Any => true,
            ExpectedType::Tag(want) => obj.type_tag().as_ref() == Some(want),
        }
    }
}

impl From<TypeTag> for ExpectedType {
    fn from(t: TypeTag) -> Self { ExpectedType::Tag(t) }
}

impl fmt::Display for ExpectedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedType::Any => f.write_str("*"),
            ExpectedType::Tag(t) => t.fmt(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no metadata")]
    MissingMetadata,
    #[error("object has no metadata.name")]
    MissingName,
    #[error("unexpected key format: {0:?}")]
    BadKey(String),
}

/// Default key function: `namespace/name`, or just `name` for cluster-scoped objects.
pub fn meta_namespace_key(obj: &Object) -> Result<String, KeyError> {
    if obj.raw().get("metadata").map_or(true, |m| !m.is_object()) {
        return Err(KeyError::MissingMetadata);
    }
    let name = obj.name().filter(|n| !n.is_empty()).ok_or(KeyError::MissingName)?;
    Ok(match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, name),
        None => name.to_string(),
    })
}

/// Inverse of [`meta_namespace_key`]: returns `(namespace, name)`.
pub fn split_meta_namespace_key(key: &str) -> Result<(Option<&str>, &str), KeyError> {
    let parts: Vec<&str> = key.split('/').collect();
    match parts.as_slice() {
        [name] if !name.is_empty() => Ok((None, *name)),
        [ns, name] if !name.is_empty() => Ok((Some(*ns), *name)),
        _ => Err(KeyError::BadKey(key.to_string())),
    }
}

/// Index function yielding the object's namespace (empty for cluster-scoped).
pub fn meta_namespace_index(obj: &Object) -> Result<Vec<String>, KeyError> {
    if obj.raw().get("metadata").map_or(true, |m| !m.is_object()) {
        return Err(KeyError::MissingMetadata);
    }
    Ok(vec![obj.namespace().unwrap_or("").to_string()])
}
