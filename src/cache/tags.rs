//! Invalidation tags.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::QueryError;

/// Application-defined label grouping cache entries for bulk invalidation.
///
/// A tag without an id matches every provided tag of the same kind when
/// invalidated; a tag with an id matches only itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    pub kind: String,
    pub id: Option<String>,
}

impl Tag {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
        }
    }

    pub fn with_id(kind: impl Into<String>, id: impl ToString) -> Self {
        Self {
            kind: kind.into(),
            id: Some(id.to_string()),
        }
    }

    /// Whether invalidating `self` hits a provided tag `other`.
    pub fn matches(&self, other: &Tag) -> bool {
        self.kind == other.kind && (self.id.is_none() || self.id == other.id)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{}", self.kind, id),
            None => f.write_str(&self.kind),
        }
    }
}

type TagFn = dyn Fn(Result<&Value, &QueryError>, &Value) -> Vec<Tag> + Send + Sync;

/// How an endpoint derives its provided or invalidated tags.
#[derive(Clone, Default)]
pub enum TagsSpec {
    #[default]
    None,
    Fixed(Vec<Tag>),
    /// Computed from the request outcome and the original arguments.
    Computed(Arc<TagFn>),
}

impl TagsSpec {
    pub fn fixed(tags: impl IntoIterator<Item = Tag>) -> Self {
        Self::Fixed(tags.into_iter().collect())
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(Result<&Value, &QueryError>, &Value) -> Vec<Tag> + Send + Sync + 'static,
    {
        Self::Computed(Arc::new(f))
    }

    pub fn resolve(&self, outcome: Result<&Value, &QueryError>, args: &Value) -> Vec<Tag> {
        match self {
            Self::None => Vec::new(),
            Self::Fixed(tags) => tags.clone(),
            Self::Computed(f) => f(outcome, args),
        }
    }
}

impl fmt::Debug for TagsSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("TagsSpec::None"),
            Self::Fixed(tags) => f.debug_tuple("TagsSpec::Fixed").field(tags).finish(),
            Self::Computed(_) => f.write_str("TagsSpec::Computed(..)"),
        }
    }
}
