use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A single dimension value produced by the term stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Term {
    Int(i64),
    Str(String),
}

impl Term {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Term::Int(v) => Some(*v),
            Term::Str(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Int(v) => write!(f, "{v}"),
            Term::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term::Int(value)
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Term::Str(value.to_string())
    }
}

impl From<String> for Term {
    fn from(value: String) -> Self {
        Term::Str(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FieldKind {
    Int,
    Str,
}

/// A document field as seen by the term stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Field {
    name: String,
    kind: FieldKind,
}

impl Field {
    pub fn int(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Int,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Str,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> FieldKind {
        self.kind
    }

    pub fn is_int(&self) -> bool {
        self.kind == FieldKind::Int
    }

    /// The same field read through its integer view.
    pub fn as_int_field(&self) -> Field {
        Field::int(self.name.clone())
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug)]
struct KeyNode {
    term: Term,
    parent: Option<Arc<KeyNode>>,
    len: usize,
}

/// The chain of dimension values that identifies one output group.
///
/// Keys are persistent: [`GroupKey::add`] shares the parent chain instead of copying it, so a
/// regroup that fans one parent out into many children stays cheap.
#[derive(Clone, Default)]
pub struct GroupKey {
    tail: Option<Arc<KeyNode>>,
}

impl GroupKey {
    /// The key of the single group that exists before any grouping runs.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn add(&self, term: impl Into<Term>) -> Self {
        let len = self.len() + 1;
        Self {
            tail: Some(Arc::new(KeyNode {
                term: term.into(),
                parent: self.tail.clone(),
                len,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.tail.as_ref().map_or(0, |node| node.len)
    }

    pub fn is_empty(&self) -> bool {
        self.tail.is_none()
    }

    pub fn last(&self) -> Option<&Term> {
        self.tail.as_deref().map(|node| &node.term)
    }

    /// Terms from the outermost grouping to the innermost.
    pub fn terms(&self) -> Vec<&Term> {
        let mut out = Vec::with_capacity(self.len());
        let mut cursor = self.tail.as_deref();
        while let Some(node) = cursor {
            out.push(&node.term);
            cursor = node.parent.as_deref();
        }
        out.reverse();
        out
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.terms() == other.terms()
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.terms().hash(state);
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.terms()).finish()
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (idx, term) in self.terms().into_iter().enumerate() {
            if idx > 0 {
                f.write_str("/")?;
            }
            write!(f, "{term}")?;
        }
        Ok(())
    }
}

/// Live group ids mapped to the key that produced them. Group 0 is never present; it holds
/// documents that no longer belong to any group.
pub type GroupKeyMap = BTreeMap<u32, GroupKey>;

/// One output row: a group key and its values in declared column order.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupStats {
    pub key: GroupKey,
    pub values: Vec<f64>,
}

impl GroupStats {
    pub fn new(key: GroupKey, values: Vec<f64>) -> Self {
        Self { key, values }
    }
}
