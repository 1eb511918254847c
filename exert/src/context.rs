//! Path-addressed data contexts.
//!
//! A [`Context`] is an ordered mapping from slash-delimited paths to JSON
//! values. Every entry carries a [`Direction`] and its insertion index. A
//! context can link a path prefix to a sub-tree of another
//! [`SharedContext`]; reads and writes under that prefix go to the owning
//! context. Links hold weak references, so a link whose target has been
//! dropped (or that crossed a serialization boundary) is reported as broken
//! on access instead of failing at construction.

use std::collections::{HashMap, HashSet};
use std::fmt::Display;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::ContextError;

/// A context that other contexts can link into and conditions can bind to.
pub type SharedContext = Arc<RwLock<Context>>;

/// Unique identifier for a context.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ContextId(pub Uuid);

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextId {
    /// Create a new context ID using UUID v7.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data flow direction of a context entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
    InOut,
}

impl Direction {
    /// Whether a provider may write to an entry with this direction.
    pub fn is_writable(self) -> bool {
        !matches!(self, Direction::In)
    }

    pub fn is_input(self) -> bool {
        matches!(self, Direction::In | Direction::InOut)
    }

    pub fn is_output(self) -> bool {
        matches!(self, Direction::Out | Direction::InOut)
    }
}

/// A single value stored in a context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub value: Value,
    pub direction: Direction,
    /// Insertion position, used for positional access.
    pub index: usize,
}

/// A declared propagation rule from a path in this context to a path in
/// another context. Declaring a mapping does not move any data; the
/// dispatcher applies it when the destination is about to run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PathMapping {
    pub from_path: String,
    pub to_path: String,
    pub to_context: ContextId,
}

/// Terminal location of a path after link resolution.
#[derive(Clone, Debug)]
pub enum Resolved {
    /// The path is owned by the context it was resolved against.
    Local(String),
    /// The path lives in another context.
    Linked { context: SharedContext, path: String },
}

impl Resolved {
    /// The terminal path.
    pub fn path(&self) -> &str {
        match self {
            Resolved::Local(path) => path,
            Resolved::Linked { path, .. } => path,
        }
    }

    /// Whether two resolutions point at the same (context, path) pair.
    pub fn same_target(&self, other: &Resolved) -> bool {
        match (self, other) {
            (Resolved::Local(a), Resolved::Local(b)) => a == b,
            (
                Resolved::Linked { context: a, path: pa },
                Resolved::Linked { context: b, path: pb },
            ) => Arc::ptr_eq(a, b) && pa == pb,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Link {
    path: String,
    target_id: ContextId,
    offset: String,
    #[serde(skip)]
    target: Weak<RwLock<Context>>,
}

impl Link {
    /// Remote path for `path` if it falls under this link's prefix.
    fn remote_path(&self, path: &str) -> Option<String> {
        let rest = strip_prefix(path, &self.path)?;
        Some(join(&self.offset, rest))
    }

    fn upgrade(&self, origin_path: &str) -> Result<SharedContext, ContextError> {
        self.target.upgrade().ok_or_else(|| ContextError::BrokenLink {
            path: origin_path.to_string(),
            target: self.target_id.to_string(),
        })
    }
}

/// Hierarchical, path-addressed value store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Context {
    id: ContextId,
    name: String,
    entries: HashMap<String, ContextEntry>,
    order: Vec<String>,
    return_path: Option<String>,
    links: Vec<Link>,
    mappings: Vec<PathMapping>,
    #[serde(skip)]
    this: Weak<RwLock<Context>>,
}

impl Context {
    /// Create an empty context.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: ContextId::new(),
            name: name.into(),
            entries: HashMap::new(),
            order: Vec::new(),
            return_path: None,
            links: Vec::new(),
            mappings: Vec::new(),
            this: Weak::new(),
        }
    }

    /// Move this context behind a shared lock so other contexts can link
    /// into it.
    pub fn into_shared(self) -> SharedContext {
        Arc::new_cyclic(|this| {
            let mut ctx = self;
            ctx.this = this.clone();
            RwLock::new(ctx)
        })
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of local entries.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Builder form of [`Context::put`] for an `In` entry.
    ///
    /// Invalid paths are logged and skipped.
    pub fn with_input(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.put_or_warn(path, value.into(), Direction::In);
        self
    }

    /// Builder form of [`Context::put`] for an `Out` entry holding `null`.
    pub fn with_output(mut self, path: &str) -> Self {
        self.put_or_warn(path, Value::Null, Direction::Out);
        self
    }

    /// Builder form of [`Context::put`] for an `InOut` entry.
    pub fn with_inout(mut self, path: &str, value: impl Into<Value>) -> Self {
        self.put_or_warn(path, value.into(), Direction::InOut);
        self
    }

    /// Builder form of [`Context::set_return_path`].
    pub fn with_return_path(mut self, path: &str) -> Self {
        if let Err(err) = self.set_return_path(path) {
            tracing::warn!(context = %self.name, %err, "ignoring return path");
        }
        self
    }

    fn put_or_warn(&mut self, path: &str, value: Value, direction: Direction) {
        if let Err(err) = self.put(path, value, direction) {
            tracing::warn!(context = %self.name, %err, "ignoring context entry");
        }
    }

    /// Declare or overwrite the entry at `path`.
    ///
    /// Overwriting keeps the entry's original index.
    pub fn put(
        &mut self,
        path: &str,
        value: impl Into<Value>,
        direction: Direction,
    ) -> Result<(), ContextError> {
        let value = value.into();
        match self.resolve(path)? {
            Resolved::Local(path) => {
                self.insert_local(path, value, direction);
                Ok(())
            }
            Resolved::Linked { context, path } => {
                context.write().put(&path, value, direction)
            }
        }
    }

    /// Provider-side write.
    ///
    /// Fails with [`ContextError::DirectionViolation`] when the entry is
    /// input-only. A missing entry is created as `Out`.
    pub fn set_value(
        &mut self,
        path: &str,
        value: impl Into<Value>,
    ) -> Result<(), ContextError> {
        let value = value.into();
        match self.resolve(path)? {
            Resolved::Local(path) => match self.entries.get_mut(&path) {
                Some(entry) if !entry.direction.is_writable() => {
                    Err(ContextError::DirectionViolation(path))
                }
                Some(entry) => {
                    entry.value = value;
                    Ok(())
                }
                None => {
                    self.insert_local(path, value, Direction::Out);
                    Ok(())
                }
            },
            Resolved::Linked { context, path } => {
                context.write().set_value(&path, value)
            }
        }
    }

    /// Dispatcher-side write used for mappings and loop increments.
    ///
    /// Keeps the existing direction; a missing entry is created as `In`.
    pub fn assign(
        &mut self,
        path: &str,
        value: impl Into<Value>,
    ) -> Result<(), ContextError> {
        let value = value.into();
        match self.resolve(path)? {
            Resolved::Local(path) => {
                match self.entries.get_mut(&path) {
                    Some(entry) => entry.value = value,
                    None => self.insert_local(path, value, Direction::In),
                }
                Ok(())
            }
            Resolved::Linked { context, path } => {
                context.write().assign(&path, value)
            }
        }
    }

    /// Read the value at `path`, following links.
    pub fn get(&self, path: &str) -> Result<Value, ContextError> {
        match self.resolve(path)? {
            Resolved::Local(path) => self
                .entries
                .get(&path)
                .map(|entry| entry.value.clone())
                .ok_or(ContextError::PathNotFound(path)),
            Resolved::Linked { context, path } => {
                context.read_recursive().get(&path)
            }
        }
    }

    /// Read the value at `path` as a number.
    pub fn get_f64(&self, path: &str) -> Result<f64, ContextError> {
        let value = self.get(path)?;
        value.as_f64().ok_or_else(|| ContextError::TypeMismatch {
            path: path.to_string(),
            expected: "a number".to_string(),
        })
    }

    /// Read the value at `path` as a string.
    pub fn get_str(&self, path: &str) -> Result<String, ContextError> {
        match self.get(path)? {
            Value::String(s) => Ok(s),
            _ => Err(ContextError::TypeMismatch {
                path: path.to_string(),
                expected: "a string".to_string(),
            }),
        }
    }

    /// Direction of the entry at `path`, following links.
    pub fn direction(&self, path: &str) -> Result<Direction, ContextError> {
        match self.resolve(path)? {
            Resolved::Local(path) => self
                .entries
                .get(&path)
                .map(|entry| entry.direction)
                .ok_or(ContextError::PathNotFound(path)),
            Resolved::Linked { context, path } => {
                context.read_recursive().direction(&path)
            }
        }
    }

    /// Whether a value exists at `path`. Broken links count as absent.
    pub fn contains(&self, path: &str) -> bool {
        self.get(path).is_ok()
    }

    /// Remove a local entry, re-indexing the entries after it.
    pub fn remove(&mut self, path: &str) -> Option<ContextEntry> {
        let entry = self.entries.remove(path)?;
        self.order.retain(|p| p != path);
        for (index, p) in self.order.iter().enumerate() {
            if let Some(e) = self.entries.get_mut(p) {
                e.index = index;
            }
        }
        if self.return_path.as_deref() == Some(path) {
            self.return_path = None;
        }
        Some(entry)
    }

    /// Local paths in insertion order.
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Local entries in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &ContextEntry)> {
        self.order
            .iter()
            .filter_map(|p| self.entries.get(p).map(|e| (p.as_str(), e)))
    }

    /// Local paths whose direction is `In` or `InOut`.
    pub fn input_paths(&self) -> Vec<&str> {
        self.entries()
            .filter(|(_, e)| e.direction.is_input())
            .map(|(p, _)| p)
            .collect()
    }

    /// Local paths whose direction is `Out` or `InOut`.
    pub fn output_paths(&self) -> Vec<&str> {
        self.entries()
            .filter(|(_, e)| e.direction.is_output())
            .map(|(p, _)| p)
            .collect()
    }

    /// Positional access to local values.
    pub fn value_at(&self, index: usize) -> Option<&Value> {
        self.order
            .get(index)
            .and_then(|p| self.entries.get(p))
            .map(|e| &e.value)
    }

    /// Designate the entry holding the scalar result of the owning task.
    pub fn set_return_path(&mut self, path: &str) -> Result<(), ContextError> {
        validate_path(path)?;
        self.return_path = Some(path.to_string());
        Ok(())
    }

    pub fn return_path(&self) -> Option<&str> {
        self.return_path.as_deref()
    }

    /// Value at the return path, if one is set.
    pub fn return_value(&self) -> Result<Option<Value>, ContextError> {
        match &self.return_path {
            Some(path) => self.get(path).map(Some),
            None => Ok(None),
        }
    }

    /// Declare a propagation rule from `source_path` here to `dest_path`
    /// in `destination`.
    pub fn map(
        &mut self,
        source_path: &str,
        dest_path: &str,
        destination: &Context,
    ) -> Result<(), ContextError> {
        self.map_to(source_path, dest_path, destination.id())
    }

    /// Like [`Context::map`], naming the destination by id.
    pub fn map_to(
        &mut self,
        source_path: &str,
        dest_path: &str,
        destination: ContextId,
    ) -> Result<(), ContextError> {
        validate_path(source_path)?;
        validate_path(dest_path)?;
        let mapping = PathMapping {
            from_path: source_path.to_string(),
            to_path: dest_path.to_string(),
            to_context: destination,
        };
        if !self.mappings.contains(&mapping) {
            self.mappings.push(mapping);
        }
        Ok(())
    }

    /// Declared outbound mappings.
    pub fn mappings(&self) -> &[PathMapping] {
        &self.mappings
    }

    /// Link `path` here to the sub-tree at `other_path` in `other`.
    ///
    /// The link is re-homed to the context that ultimately owns
    /// `other_path`, so it never points at another link. Linking a context
    /// to itself, or through a chain back to itself, fails with
    /// [`ContextError::CircularLink`].
    pub fn link(
        &mut self,
        path: &str,
        other: &SharedContext,
        other_path: &str,
    ) -> Result<(), ContextError> {
        validate_path(path)?;
        if !other_path.is_empty() {
            validate_path(other_path)?;
        }
        if std::ptr::eq(Arc::as_ptr(other), self.this.as_ptr()) {
            return Err(ContextError::CircularLink(path.to_string()));
        }

        let (target, target_id, offset) = {
            let guard = other.read_recursive();
            if guard.id == self.id {
                return Err(ContextError::CircularLink(path.to_string()));
            }
            match guard.find_link(other_path) {
                None => (Arc::clone(other), guard.id, other_path.to_string()),
                Some((link, remote)) => {
                    let first = link.upgrade(path)?;
                    guard.follow(other_path, path, first, link.target_id, remote, self.id)?
                }
            }
        };
        if target_id == self.id {
            return Err(ContextError::CircularLink(path.to_string()));
        }
        if !target.read_recursive().has_subtree(&offset) {
            return Err(ContextError::PathNotFound(offset));
        }

        self.links.retain(|l| l.path != path);
        self.links.push(Link {
            path: path.to_string(),
            target_id,
            offset,
            target: Arc::downgrade(&target),
        });
        Ok(())
    }

    /// Remove the link at exactly `path`.
    pub fn unlink(&mut self, path: &str) -> bool {
        let before = self.links.len();
        self.links.retain(|l| l.path != path);
        before != self.links.len()
    }

    /// Linked path prefixes whose target is no longer available.
    pub fn broken_links(&self) -> Vec<&str> {
        self.links
            .iter()
            .filter(|l| l.target.strong_count() == 0)
            .map(|l| l.path.as_str())
            .collect()
    }

    /// Resolve `path` to the context and path that own its value.
    pub fn resolve(&self, path: &str) -> Result<Resolved, ContextError> {
        validate_path(path)?;
        let Some((link, remote)) = self.find_link(path) else {
            return Ok(Resolved::Local(path.to_string()));
        };
        if link.target_id == self.id {
            return Err(ContextError::CircularLink(path.to_string()));
        }
        let first = link.upgrade(path)?;
        let (context, _, path) =
            self.follow(path, path, first, link.target_id, remote, self.id)?;
        Ok(Resolved::Linked { context, path })
    }

    /// Re-home every link that now points through a further link so it
    /// targets the owning context directly. Broken links are left alone.
    ///
    /// Returns the number of links rewritten.
    pub fn compact_links(&mut self) -> Result<usize, ContextError> {
        let mut rewritten = 0;
        let mut updated = Vec::with_capacity(self.links.len());
        for link in &self.links {
            let Some(first) = link.target.upgrade() else {
                updated.push(link.clone());
                continue;
            };
            let (target, target_id, offset) = self.follow(
                &link.path,
                &link.path,
                first,
                link.target_id,
                link.offset.clone(),
                self.id,
            )?;
            if target_id != link.target_id || offset != link.offset {
                rewritten += 1;
            }
            updated.push(Link {
                path: link.path.clone(),
                target_id,
                offset,
                target: Arc::downgrade(&target),
            });
        }
        self.links = updated;
        Ok(rewritten)
    }

    /// Copy every local entry of `other` into this context, keeping this
    /// context's identity. Used to materialize compound results.
    pub fn merge_from(&mut self, other: &Context) {
        for (path, entry) in other.entries() {
            self.insert_local(path.to_string(), entry.value.clone(), entry.direction);
        }
        if self.return_path.is_none() {
            self.return_path = other.return_path.clone();
        }
    }

    fn insert_local(&mut self, path: String, value: Value, direction: Direction) {
        match self.entries.get_mut(&path) {
            Some(entry) => {
                entry.value = value;
                entry.direction = direction;
            }
            None => {
                let index = self.order.len();
                self.order.push(path.clone());
                self.entries.insert(
                    path,
                    ContextEntry {
                        value,
                        direction,
                        index,
                    },
                );
            }
        }
    }

    fn has_subtree(&self, prefix: &str) -> bool {
        if prefix.is_empty() {
            return true;
        }
        self.order.iter().any(|p| strip_prefix(p, prefix).is_some())
            || self.links.iter().any(|l| {
                strip_prefix(&l.path, prefix).is_some()
                    || strip_prefix(prefix, &l.path).is_some()
            })
    }

    /// Longest link prefix covering `path`, with the remote path.
    fn find_link(&self, path: &str) -> Option<(&Link, String)> {
        self.links
            .iter()
            .filter_map(|l| l.remote_path(path).map(|remote| (l, remote)))
            .max_by_key(|(l, _)| l.path.len())
    }

    /// Follow a link chain starting at (`target`, `remote`) until a context
    /// owns the path directly. Never locks a context whose id is `origin`.
    ///
    /// `start` is the path the chain starts from in this context; errors
    /// name `reported` instead.
    fn follow(
        &self,
        start: &str,
        reported: &str,
        mut target: SharedContext,
        mut target_id: ContextId,
        mut remote: String,
        origin: ContextId,
    ) -> Result<(SharedContext, ContextId, String), ContextError> {
        let mut visited = HashSet::new();
        visited.insert((self.id, start.to_string()));
        loop {
            if target_id == origin || !visited.insert((target_id, remote.clone())) {
                return Err(ContextError::CircularLink(reported.to_string()));
            }
            let next = {
                let guard = target.read_recursive();
                match guard.find_link(&remote) {
                    None => None,
                    Some((link, next_remote)) => {
                        if link.target_id == origin {
                            return Err(ContextError::CircularLink(reported.to_string()));
                        }
                        Some((link.upgrade(reported)?, link.target_id, next_remote))
                    }
                }
            };
            match next {
                None => return Ok((target, target_id, remote)),
                Some((next_target, next_id, next_remote)) => {
                    target = next_target;
                    target_id = next_id;
                    remote = next_remote;
                }
            }
        }
    }
}

/// Check path syntax: non-empty, slash-separated, no empty segments.
pub fn validate_path(path: &str) -> Result<(), ContextError> {
    if path.is_empty() || path.split('/').any(str::is_empty) {
        return Err(ContextError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// Remainder of `path` after `prefix` ("" or "/..."), if `prefix` covers it.
fn strip_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

fn join(offset: &str, rest: &str) -> String {
    if offset.is_empty() {
        rest.trim_start_matches('/').to_string()
    } else {
        format!("{offset}{rest}")
    }
}

/// Serde adapter for fields holding a [`SharedContext`]: the snapshot is
/// serialized, and deserialization produces a fresh shared context.
pub(crate) mod shared_serde {
    use super::{Context, SharedContext};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(ctx: &SharedContext, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        ctx.read().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SharedContext, D::Error>
    where
        D: Deserializer<'de>,
    {
        Context::deserialize(deserializer).map(Context::into_shared)
    }
}
