//! Core data types for the a3s-gateway system
//!
//! `Event` and `Filter` use the relay wire field names (`created_at`,
//! `#e` tag filters). Gateway-level types use camelCase JSON.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// An immutable, timestamped record
///
/// The `id` is derived from the content (see [`Event::compute_id`]); events
/// are never mutated after creation, only superseded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Content-derived identifier (lowercase hex SHA-256)
    pub id: String,

    /// Author public key
    pub pubkey: String,

    /// Unix timestamp in seconds
    pub created_at: u64,

    /// Integer category
    pub kind: u32,

    /// Ordered list of string lists (e.g. `["d", "profile"]`)
    #[serde(default)]
    pub tags: Vec<Vec<String>>,

    /// Free-form content
    #[serde(default)]
    pub content: String,

    /// Signature, carried opaquely
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Compute the content-derived id for this event's fields
    ///
    /// SHA-256 over the canonical JSON array
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> String {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        hex::encode(digest)
    }

    /// Whether `id` matches the event's content
    pub fn verify_id(&self) -> bool {
        self.id == self.compute_id()
    }

    /// First value of the `d` tag, if any
    pub fn identifier(&self) -> Option<&str> {
        self.tag_value("d")
    }

    /// First value of the first tag named `name`
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Logical replaceable key, or `None` for regular events
    pub fn replaceable_key(&self) -> Option<ReplaceableKey> {
        if is_replaceable_kind(self.kind) || is_addressable_kind(self.kind) {
            Some(ReplaceableKey::new(
                self.kind,
                self.pubkey.clone(),
                self.identifier().map(str::to_string),
            ))
        } else {
            None
        }
    }

    /// Whether this event supersedes `other` under the replaceable rule
    ///
    /// Newer `created_at` wins; ties are broken by the lower id so every
    /// provider picks the same winner.
    pub fn supersedes(&self, other: &Event) -> bool {
        self.created_at > other.created_at
            || (self.created_at == other.created_at && self.id < other.id)
    }
}

/// Kinds keyed by `(kind, author)`
pub fn is_replaceable_kind(kind: u32) -> bool {
    kind == 0 || kind == 3 || (10_000..20_000).contains(&kind)
}

/// Kinds keyed by `(kind, author, d-tag)`
pub fn is_addressable_kind(kind: u32) -> bool {
    (30_000..40_000).contains(&kind)
}

/// Logical key `(kind, author, identifier?)` of a replaceable event
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaceableKey {
    pub kind: u32,
    pub author: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

impl ReplaceableKey {
    /// Addressable kinds always carry an identifier (empty when absent);
    /// replaceable kinds never do.
    pub fn new(kind: u32, author: impl Into<String>, identifier: Option<String>) -> Self {
        let identifier = if is_addressable_kind(kind) {
            Some(identifier.unwrap_or_default())
        } else if is_replaceable_kind(kind) {
            None
        } else {
            identifier
        };
        Self {
            kind,
            author: author.into(),
            identifier,
        }
    }

    /// Whether `event` belongs to this key
    pub fn matches(&self, event: &Event) -> bool {
        if event.kind != self.kind || event.pubkey != self.author {
            return false;
        }
        match &self.identifier {
            Some(d) => event.identifier().unwrap_or_default() == d,
            None => true,
        }
    }

    /// Equivalent query filter
    pub fn to_filter(&self) -> Filter {
        let mut filter = Filter::new().kind(self.kind).author(self.author.clone());
        // An empty identifier also covers events with no `d` tag, which a
        // tag filter cannot express; `matches` narrows those down.
        if let Some(d) = self.identifier.as_ref().filter(|d| !d.is_empty()) {
            filter = filter.tag('d', [d.clone()]);
        }
        filter
    }
}

/// Builder for unsigned events with a computed id
#[derive(Debug, Clone)]
pub struct EventBuilder {
    pubkey: String,
    kind: u32,
    content: String,
    tags: Vec<Vec<String>>,
    created_at: Option<u64>,
}

impl EventBuilder {
    pub fn new(kind: u32, pubkey: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            pubkey: pubkey.into(),
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: None,
        }
    }

    /// Append a tag
    pub fn tag<I, S>(mut self, tag: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(tag.into_iter().map(Into::into).collect());
        self
    }

    /// Override the creation time (defaults to now)
    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn build(self) -> Event {
        let mut event = Event {
            id: String::new(),
            pubkey: self.pubkey,
            created_at: self
                .created_at
                .unwrap_or_else(|| chrono::Utc::now().timestamp().max(0) as u64),
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig: String::new(),
        };
        event.id = event.compute_id();
        event
    }
}

/// Query predicate over event fields
///
/// Every populated field must match; multiple filters in one request are OR-ed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,

    /// Full-text query; honored only by providers advertising `search`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Tag filters keyed `#<letter>`
    #[serde(flatten)]
    pub tags: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.ids.get_or_insert_with(Vec::new).push(id.into());
        self
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.authors.get_or_insert_with(Vec::new).push(author.into());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Add a tag filter, e.g. `tag('p', [pubkey])`
    pub fn tag<I, S>(mut self, letter: char, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(format!("#{}", letter))
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// Whether `event` satisfies every populated field
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        if let Some(query) = &self.search {
            if !event
                .content
                .to_lowercase()
                .contains(&query.to_lowercase())
            {
                return false;
            }
        }
        for (key, values) in &self.tags {
            let Some(letter) = key.strip_prefix('#') else {
                continue;
            };
            let tagged = event.tags.iter().any(|t| {
                t.first().map(String::as_str) == Some(letter)
                    && t.get(1).is_some_and(|v| values.contains(v))
            });
            if !tagged {
                return false;
            }
        }
        true
    }
}

/// Whether `event` matches any of `filters` (an empty set matches nothing)
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|f| f.matches(event))
}

/// Optional behavior a provider may honor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    /// Honors `Filter::search`
    Search,
    /// Delivers events that arrive after a subscription starts
    LiveSubscribe,
}

/// Set of advertised capabilities
pub type Capabilities = BTreeSet<Capability>;

/// Administrative view of one registered provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatus {
    pub id: String,
    pub name: String,
    pub connected: bool,
    pub failed_attempts: u32,
}

/// Snapshot answered by `get_backend_status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    pub current: Option<String>,
    pub preferred: Option<String>,
    pub connected: bool,
    pub health_check_running: bool,
    pub providers: Vec<ProviderStatus>,
}

static STREAM_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Globally unique stream identifier
///
/// Timestamp plus a process-wide counter, so ids stay unique across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn generate() -> Self {
        let n = STREAM_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("stream-{}-{}", now_millis(), n))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one caller context (one transport connection)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(format!("session-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Current time in Unix milliseconds
pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
