//! Observable module state.
//!
//! Every mutation of a [`StateTree`] is first expressed as [`PatchOp`]s and
//! then applied with [`apply`], so replaying the emitted operations onto an
//! empty object always reproduces the tree. Operations serialize as RFC 6902
//! JSON patch entries.

use core::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{error, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("path {0} does not exist")]
    Missing(String),
    #[error("parent of {0} is not an object or array")]
    NotContainer(String),
    #[error("the root can only be replaced as a whole")]
    Root,
    #[error("invalid JSON pointer `{0}`")]
    InvalidPointer(String),
}

/// One step of a path: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathKey {
    Key(String),
    Index(usize),
}

impl PathKey {
    fn as_object_key(&self) -> String {
        match self {
            PathKey::Key(key) => key.clone(),
            PathKey::Index(index) => index.to_string(),
        }
    }

    fn as_index(&self) -> Option<usize> {
        match self {
            PathKey::Key(key) => key.parse().ok(),
            PathKey::Index(index) => Some(*index),
        }
    }
}

impl From<&str> for PathKey {
    fn from(key: &str) -> Self {
        PathKey::Key(key.to_string())
    }
}

impl From<String> for PathKey {
    fn from(key: String) -> Self {
        PathKey::Key(key)
    }
}

impl From<usize> for PathKey {
    fn from(index: usize) -> Self {
        PathKey::Index(index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path(Vec<PathKey>);

impl Path {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.0.push(PathKey::Key(key.into()));
        self
    }

    pub fn index(mut self, index: usize) -> Self {
        self.0.push(PathKey::Index(index));
        self
    }

    pub fn keys(&self) -> &[PathKey] {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    fn prefix(&self, len: usize) -> Path {
        Path(self.0[..len].to_vec())
    }

    /// RFC 6901 rendering, e.g. `/messages/ModuleStatus8PBU/program`.
    pub fn to_pointer(&self) -> String {
        let mut pointer = String::new();
        for key in &self.0 {
            pointer.push('/');
            pointer.push_str(&key.as_object_key().replace('~', "~0").replace('/', "~1"));
        }
        pointer
    }

    pub fn from_pointer(pointer: &str) -> Result<Self, PatchError> {
        if pointer.is_empty() {
            return Ok(Self::root());
        }
        let Some(rest) = pointer.strip_prefix('/') else {
            return Err(PatchError::InvalidPointer(pointer.to_string()));
        };
        Ok(Path(
            rest.split('/')
                .map(|segment| PathKey::Key(segment.replace("~1", "/").replace("~0", "~")))
                .collect(),
        ))
    }
}

impl<K: Into<PathKey>> FromIterator<K> for Path {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        Path(iter.into_iter().map(Into::into).collect())
    }
}

impl<K: Into<PathKey>, const N: usize> From<[K; N]> for Path {
    fn from(keys: [K; N]) -> Self {
        keys.into_iter().collect()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "/")
        } else {
            write!(f, "{}", self.to_pointer())
        }
    }
}

impl Serialize for Path {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_pointer())
    }
}

impl<'de> Deserialize<'de> for Path {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pointer = String::deserialize(deserializer)?;
        Path::from_pointer(&pointer).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOp {
    Add { path: Path, value: Value },
    Replace { path: Path, value: Value },
    Remove { path: Path },
}

impl PatchOp {
    pub fn path(&self) -> &Path {
        match self {
            PatchOp::Add { path, .. } | PatchOp::Replace { path, .. } | PatchOp::Remove { path } => {
                path
            }
        }
    }
}

fn lookup<'a>(root: &'a Value, keys: &[PathKey]) -> Option<&'a Value> {
    keys.iter().try_fold(root, |node, key| match node {
        Value::Object(map) => map.get(&key.as_object_key()),
        Value::Array(items) => key.as_index().and_then(|index| items.get(index)),
        _ => None,
    })
}

fn lookup_mut<'a>(root: &'a mut Value, path: &Path) -> Result<&'a mut Value, PatchError> {
    let mut node = root;
    for key in path.keys() {
        node = match node {
            Value::Object(map) => map.get_mut(&key.as_object_key()),
            Value::Array(items) => key.as_index().and_then(move |index| items.get_mut(index)),
            _ => return Err(PatchError::NotContainer(path.to_string())),
        }
        .ok_or_else(|| PatchError::Missing(path.to_string()))?;
    }
    Ok(node)
}

/// Apply a single operation to `target`.
pub fn apply(target: &mut Value, op: &PatchOp) -> Result<(), PatchError> {
    let path = op.path();
    let Some((last, parent_keys)) = path.keys().split_last() else {
        return match op {
            PatchOp::Add { value, .. } | PatchOp::Replace { value, .. } => {
                *target = value.clone();
                Ok(())
            }
            PatchOp::Remove { .. } => Err(PatchError::Root),
        };
    };

    let parent_path = Path(parent_keys.to_vec());
    let parent = lookup_mut(target, &parent_path)?;
    let missing = || PatchError::Missing(path.to_string());

    match (parent, op) {
        (Value::Object(map), PatchOp::Add { value, .. }) => {
            map.insert(last.as_object_key(), value.clone());
        }
        (Value::Object(map), PatchOp::Replace { value, .. }) => {
            let slot = map.get_mut(&last.as_object_key()).ok_or_else(missing)?;
            *slot = value.clone();
        }
        (Value::Object(map), PatchOp::Remove { .. }) => {
            map.remove(&last.as_object_key()).ok_or_else(missing)?;
        }
        (Value::Array(items), PatchOp::Add { value, .. }) => {
            let index = match last {
                PathKey::Key(key) if key == "-" => items.len(),
                _ => last.as_index().ok_or_else(missing)?,
            };
            if index > items.len() {
                return Err(missing());
            }
            items.insert(index, value.clone());
        }
        (Value::Array(items), PatchOp::Replace { value, .. }) => {
            let slot = last
                .as_index()
                .and_then(|index| items.get_mut(index))
                .ok_or_else(missing)?;
            *slot = value.clone();
        }
        (Value::Array(items), PatchOp::Remove { .. }) => {
            let index = last
                .as_index()
                .filter(|index| *index < items.len())
                .ok_or_else(missing)?;
            items.remove(index);
        }
        _ => return Err(PatchError::NotContainer(path.to_string())),
    }
    Ok(())
}

#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ObserverError(pub String);

/// Receives every batch of operations in mutation order.
pub type Observer = Box<dyn FnMut(&[PatchOp]) -> Result<(), ObserverError> + Send>;

pub type ObserverId = u64;

/// JSON object tree that reports every change as patch operations.
pub struct StateTree {
    root: Value,
    observers: Vec<(ObserverId, Observer)>,
    next_observer_id: ObserverId,
    patches_emitted: u64,
}

impl fmt::Debug for StateTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateTree")
            .field("root", &self.root)
            .field("observers", &self.observers.len())
            .field("patches_emitted", &self.patches_emitted)
            .finish()
    }
}

impl Default for StateTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTree {
    pub fn new() -> Self {
        Self {
            root: Value::Object(Map::new()),
            observers: Vec::new(),
            next_observer_id: 1,
            patches_emitted: 0,
        }
    }

    pub fn value(&self) -> &Value {
        &self.root
    }

    pub fn get(&self, path: &Path) -> Option<&Value> {
        lookup(&self.root, path.keys())
    }

    pub fn patches_emitted(&self) -> u64 {
        self.patches_emitted
    }

    /// Add or replace the value at `path`. Missing parents are created as
    /// objects with a single `add` of the nested value. Setting a value equal
    /// to the current one emits nothing.
    pub fn set(&mut self, path: impl Into<Path>, value: impl Into<Value>) -> Result<(), PatchError> {
        let path = path.into();
        let value = value.into();
        if path.is_root() {
            return Err(PatchError::Root);
        }

        let keys = path.keys();
        let mut node = &self.root;
        for (depth, key) in keys.iter().enumerate() {
            let is_last = depth + 1 == keys.len();
            let child = match node {
                Value::Object(map) => map.get(&key.as_object_key()),
                Value::Array(items) => match key.as_index() {
                    Some(index) if index < items.len() => items.get(index),
                    Some(index) if index == items.len() => None,
                    _ => return Err(PatchError::Missing(path.prefix(depth + 1).to_string())),
                },
                _ => return Err(PatchError::NotContainer(path.prefix(depth + 1).to_string())),
            };

            match child {
                Some(existing) if is_last => {
                    if *existing == value {
                        return Ok(());
                    }
                    let op = PatchOp::Replace { path, value };
                    return self.commit(vec![op]);
                }
                Some(existing) => node = existing,
                None => {
                    let nested = keys[depth + 1..]
                        .iter()
                        .rev()
                        .fold(value, |inner, key| {
                            let mut map = Map::new();
                            map.insert(key.as_object_key(), inner);
                            Value::Object(map)
                        });
                    let op = PatchOp::Add {
                        path: path.prefix(depth + 1),
                        value: nested,
                    };
                    return self.commit(vec![op]);
                }
            }
        }
        Ok(())
    }

    /// Remove the value at `path`, returning it. Absent paths are a no-op.
    pub fn remove(&mut self, path: impl Into<Path>) -> Result<Option<Value>, PatchError> {
        let path = path.into();
        if path.is_root() {
            return Err(PatchError::Root);
        }
        let Some(previous) = self.get(&path).cloned() else {
            return Ok(None);
        };
        self.commit(vec![PatchOp::Remove { path }])?;
        Ok(Some(previous))
    }

    /// Wholesale replacement, emitted as removal of every top-level key
    /// followed by an add per key of `value`.
    pub fn replace_all(&mut self, value: Value) -> Result<(), PatchError> {
        let Value::Object(next) = value else {
            return Err(PatchError::NotContainer(Path::root().to_string()));
        };
        let mut ops: Vec<PatchOp> = self
            .root
            .as_object()
            .map(|current| {
                current
                    .keys()
                    .map(|key| PatchOp::Remove {
                        path: Path::root().key(key.clone()),
                    })
                    .collect()
            })
            .unwrap_or_default();
        ops.extend(next.into_iter().map(|(key, value)| PatchOp::Add {
            path: Path::root().key(key),
            value,
        }));
        self.commit(ops)
    }

    /// The whole tree as adds from an empty object.
    pub fn full_sync(&self) -> Vec<PatchOp> {
        self.root
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(key, value)| PatchOp::Add {
                        path: Path::root().key(key.clone()),
                        value: value.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Register an observer; it first receives the current state as a full
    /// sync, then every later change.
    pub fn subscribe(&mut self, mut observer: Observer) -> ObserverId {
        let id = self.next_observer_id;
        self.next_observer_id += 1;

        let initial = self.full_sync();
        if !initial.is_empty() {
            notify(id, &mut observer, &initial);
        }
        self.observers.push((id, observer));
        id
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(observer_id, _)| *observer_id != id);
        self.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn commit(&mut self, ops: Vec<PatchOp>) -> Result<(), PatchError> {
        for op in &ops {
            apply(&mut self.root, op)?;
        }
        self.patches_emitted += ops.len() as u64;
        for (id, observer) in &mut self.observers {
            notify(*id, observer, &ops);
        }
        Ok(())
    }
}

/// Deliver to one observer; its failures stay with it.
fn notify(id: ObserverId, observer: &mut Observer, ops: &[PatchOp]) {
    match catch_unwind(AssertUnwindSafe(|| observer(ops))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(observer = id, error = %e, "state observer failed"),
        Err(_) => error!(observer = id, "state observer panicked"),
    }
}
