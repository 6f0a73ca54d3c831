//! Deterministic identity for mounted components, endpoints, and durable IO.
//!
//! Every id is derived from a path built out of the ancestor chain. Two runs
//! of the same application instance mount the same structure, so they
//! compute the same ids, and that is what lets a resumed instance find its
//! history in the log.
//!
//! ```text
//! SocialMediaGenerator                                   root
//! SocialMediaGenerator/TwitterPost:Post                  singleton
//! .../TwitterPost:Post/ChatMessages:ChatMessage:chat-message-1   list
//! endpoint:.../TwitterPost:Post/message:message-3        endpoint
//! io:.../KeyPoints:KeyPoints/key-points                  durable IO
//! ```
//!
//! Names, properties and keys are escaped before they are joined (`%`, `/`
//! and `:` become `%25`, `%2F` and `%3A`), so a segment can never forge the
//! separators of another mount. Segments without those characters appear
//! verbatim.

use std::borrow::Cow;
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Log id under which the root payload is stored on `initialize`.
pub const INITIAL_PAYLOAD_ID: &str = "initialPayload";

/// Escape the path separators inside one segment.
pub fn escape_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains(|c: char| matches!(c, '%' | '/' | ':')) {
        return Cow::Borrowed(segment);
    }
    let mut out = String::with_capacity(segment.len() + 4);
    for c in segment.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            ':' => out.push_str("%3A"),
            other => out.push(other),
        }
    }
    Cow::Owned(out)
}

/// SHA-256 of the path, base64url encoded without padding.
pub fn hash_path(path: &str) -> String {
    let digest = Sha256::digest(path.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Key of a list child. Handlers pass either strings or numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListKey {
    Text(String),
    Index(u64),
}

impl fmt::Display for ListKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListKey::Text(s) => f.write_str(s),
            ListKey::Index(n) => write!(f, "{}", n),
        }
    }
}

impl From<&str> for ListKey {
    fn from(value: &str) -> Self {
        ListKey::Text(value.to_string())
    }
}

impl From<String> for ListKey {
    fn from(value: String) -> Self {
        ListKey::Text(value)
    }
}

impl From<u64> for ListKey {
    fn from(value: u64) -> Self {
        ListKey::Index(value)
    }
}

impl From<usize> for ListKey {
    fn from(value: usize) -> Self {
        ListKey::Index(value as u64)
    }
}

/// Where a component sits in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountInfo {
    Root {
        name: String,
    },
    Singleton {
        parent_id: String,
        parent_path: String,
        property: String,
        name: String,
    },
    List {
        parent_id: String,
        parent_path: String,
        property: String,
        name: String,
        key: ListKey,
    },
}

impl MountInfo {
    pub fn root(name: impl Into<String>) -> Self {
        MountInfo::Root { name: name.into() }
    }

    /// Component name being mounted.
    pub fn name(&self) -> &str {
        match self {
            MountInfo::Root { name }
            | MountInfo::Singleton { name, .. }
            | MountInfo::List { name, .. } => name,
        }
    }

    /// Parent component id, `None` for the root.
    pub fn parent_id(&self) -> Option<&str> {
        match self {
            MountInfo::Root { .. } => None,
            MountInfo::Singleton { parent_id, .. } | MountInfo::List { parent_id, .. } => {
                Some(parent_id)
            }
        }
    }

    /// Property of the parent this component is mounted under.
    pub fn property(&self) -> Option<&str> {
        match self {
            MountInfo::Root { .. } => None,
            MountInfo::Singleton { property, .. } | MountInfo::List { property, .. } => {
                Some(property)
            }
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, MountInfo::List { .. })
    }

    pub fn path(&self) -> String {
        match self {
            MountInfo::Root { name } => escape_segment(name).into_owned(),
            MountInfo::Singleton {
                parent_path,
                property,
                name,
                ..
            } => format!(
                "{}/{}:{}",
                parent_path,
                escape_segment(property),
                escape_segment(name)
            ),
            MountInfo::List {
                parent_path,
                property,
                name,
                key,
                ..
            } => format!(
                "{}/{}:{}:{}",
                parent_path,
                escape_segment(property),
                escape_segment(name),
                escape_segment(&key.to_string())
            ),
        }
    }

    pub fn id(&self) -> String {
        hash_path(&self.path())
    }
}

/// Log path of an endpoint opened by the component at `component_path`.
pub fn endpoint_path(component_path: &str, property: &str, key: &str) -> String {
    format!(
        "endpoint:{}/{}:{}",
        component_path,
        escape_segment(property),
        escape_segment(key)
    )
}

/// Log id of a durable operation.
pub fn io_id(component_path: &str, key: &str) -> String {
    format!("io:{}/{}", component_path, escape_segment(key))
}

/// Parent id shared by every chunk of an event stream.
pub fn stream_id(io_id: &str) -> String {
    format!("{}:stream", io_id)
}

/// Id of the marker written when a live run of a stream starts. Replay
/// begins at the latest marker, so chunks of an interrupted attempt are
/// never mixed into a later one.
pub fn stream_start_id(stream_id: &str) -> String {
    format!("{}:start", stream_id)
}

/// Id of the `n`th chunk of a stream.
pub fn chunk_id(stream_id: &str, n: usize) -> String {
    format!("{}[{}]", stream_id, n)
}
