//! Structural patches for imperative cache edits.
//!
//! A recipe mutates a cloned draft; [`diff`] records the forward patches and
//! the inverse patches that undo them.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::actions::Action;
use super::api::Api;
use super::keys::CacheKey;

/// One step of a patch path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathSegment {
    Index(usize),
    Key(String),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "{index}"),
            Self::Key(key) => f.write_str(key),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Patch {
    Add { path: Vec<PathSegment>, value: Value },
    Remove { path: Vec<PathSegment> },
    Replace { path: Vec<PathSegment>, value: Value },
}

impl Patch {
    pub fn path(&self) -> &[PathSegment] {
        match self {
            Self::Add { path, .. } | Self::Remove { path } | Self::Replace { path, .. } => path,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PatchError {
    #[error("patch path `{path}` does not exist")]
    MissingPath { path: String },
    #[error("patch path `{path}` crosses a value of the wrong shape")]
    ShapeMismatch { path: String },
}

fn render_path(path: &[PathSegment]) -> String {
    let mut out = String::new();
    for segment in path {
        out.push('/');
        out.push_str(&segment.to_string());
    }
    out
}

/// Patches turning `before` into `after`.
pub fn diff(before: &Value, after: &Value) -> Vec<Patch> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    diff_into(&mut path, before, after, &mut out);
    out
}

fn diff_into(path: &mut Vec<PathSegment>, before: &Value, after: &Value, out: &mut Vec<Patch>) {
    if before == after {
        return;
    }
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                path.push(PathSegment::Key(key.clone()));
                match new.get(key) {
                    Some(new_value) => diff_into(path, old_value, new_value, out),
                    None => out.push(Patch::Remove { path: path.clone() }),
                }
                path.pop();
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    let mut added = path.clone();
                    added.push(PathSegment::Key(key.clone()));
                    out.push(Patch::Add {
                        path: added,
                        value: new_value.clone(),
                    });
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            let common = old.len().min(new.len());
            for index in 0..common {
                path.push(PathSegment::Index(index));
                diff_into(path, &old[index], &new[index], out);
                path.pop();
            }
            // Trailing removals run back to front so indices stay valid.
            for index in (common..old.len()).rev() {
                let mut removed = path.clone();
                removed.push(PathSegment::Index(index));
                out.push(Patch::Remove { path: removed });
            }
            for (index, value) in new.iter().enumerate().skip(common) {
                let mut added = path.clone();
                added.push(PathSegment::Index(index));
                out.push(Patch::Add {
                    path: added,
                    value: value.clone(),
                });
            }
        }
        _ => out.push(Patch::Replace {
            path: path.clone(),
            value: after.clone(),
        }),
    }
}

/// Apply `patches` in order. Stops at the first failing patch.
pub fn apply_patches(target: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        apply_one(target, patch)?;
    }
    Ok(())
}

fn apply_one(target: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let Some((last, parent_path)) = patch.path().split_last() else {
        match patch {
            Patch::Add { value, .. } | Patch::Replace { value, .. } => *target = value.clone(),
            Patch::Remove { .. } => *target = Value::Null,
        }
        return Ok(());
    };

    let full_path = || render_path(patch.path());
    let parent = navigate(target, parent_path).ok_or_else(|| PatchError::MissingPath {
        path: render_path(parent_path),
    })?;

    match (parent, last, patch) {
        (Value::Object(map), PathSegment::Key(key), Patch::Add { value, .. })
        | (Value::Object(map), PathSegment::Key(key), Patch::Replace { value, .. }) => {
            map.insert(key.clone(), value.clone());
        }
        (Value::Object(map), PathSegment::Key(key), Patch::Remove { .. }) => {
            map.remove(key)
                .ok_or_else(|| PatchError::MissingPath { path: full_path() })?;
        }
        (Value::Array(items), PathSegment::Index(index), Patch::Add { value, .. }) => {
            if *index > items.len() {
                return Err(PatchError::MissingPath { path: full_path() });
            }
            items.insert(*index, value.clone());
        }
        (Value::Array(items), PathSegment::Index(index), Patch::Replace { value, .. }) => {
            let slot = items
                .get_mut(*index)
                .ok_or_else(|| PatchError::MissingPath { path: full_path() })?;
            *slot = value.clone();
        }
        (Value::Array(items), PathSegment::Index(index), Patch::Remove { .. }) => {
            if *index >= items.len() {
                return Err(PatchError::MissingPath { path: full_path() });
            }
            items.remove(*index);
        }
        _ => return Err(PatchError::ShapeMismatch { path: full_path() }),
    }
    Ok(())
}

fn navigate<'a>(mut current: &'a mut Value, path: &[PathSegment]) -> Option<&'a mut Value> {
    for segment in path {
        current = match (current, segment) {
            (Value::Object(map), PathSegment::Key(key)) => map.get_mut(key)?,
            (Value::Array(items), PathSegment::Index(index)) => items.get_mut(*index)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Result of an imperative cache edit: what changed and how to revert it.
pub struct PatchCollection {
    pub key: CacheKey,
    pub patches: Vec<Patch>,
    pub inverse_patches: Vec<Patch>,
    api: Option<Api>,
}

impl PatchCollection {
    pub(crate) fn empty(key: CacheKey) -> Self {
        Self {
            key,
            patches: Vec::new(),
            inverse_patches: Vec::new(),
            api: None,
        }
    }

    pub(crate) fn new(
        key: CacheKey,
        patches: Vec<Patch>,
        inverse_patches: Vec<Patch>,
        api: Api,
    ) -> Self {
        Self {
            key,
            patches,
            inverse_patches,
            api: Some(api),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Revert the edit by dispatching the inverse patches.
    pub fn undo(&self) {
        let Some(api) = &self.api else {
            return;
        };
        if self.inverse_patches.is_empty() {
            return;
        }
        debug!(key = %self.key, patches = self.inverse_patches.len(), "Undoing cache patch");
        api.dispatch(Action::QueryResultPatched {
            key: self.key.clone(),
            patches: self.inverse_patches.clone(),
        });
    }
}

impl fmt::Debug for PatchCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchCollection")
            .field("key", &self.key)
            .field("patches", &self.patches)
            .field("inverse_patches", &self.inverse_patches)
            .finish_non_exhaustive()
    }
}
