//! A project: every source entry sharing one uuid, split into roots and
//! children, with the field resolution rules used by the table generators.

use std::collections::BTreeMap;

use housing_core::{Entry, NameValue, SourceKind};
use tracing::warn;
use uuid::Uuid;

use crate::graph::RecordGraph;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Any non-empty value.
    Exists,
    Equals(String),
    OneOf(Vec<String>),
}

impl Matcher {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Matcher::Exists => !value.is_empty(),
            Matcher::Equals(expected) => value == expected,
            Matcher::OneOf(allowed) => allowed.iter().any(|candidate| candidate == value),
        }
    }
}

/// Conjunction of clauses on an entry's latest values. A field the entry
/// does not have is tested as the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Predicate {
    clauses: Vec<(String, Matcher)>,
}

impl Predicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: impl Into<String>, matcher: Matcher) -> Self {
        self.clauses.push((field.into(), matcher));
        self
    }

    pub fn exists(self, field: impl Into<String>) -> Self {
        self.with(field, Matcher::Exists)
    }

    pub fn equals(self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.with(field, Matcher::Equals(value.into()))
    }

    pub fn one_of<I, S>(self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.with(field, Matcher::OneOf(values.into_iter().map(Into::into).collect()))
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        self.clauses.iter().all(|(field, matcher)| {
            let value = entry.latest(field).map(|nv| nv.value.as_str()).unwrap_or("");
            matcher.matches(value)
        })
    }
}

fn passes(entry: &Entry, predicate: Option<&Predicate>) -> bool {
    predicate.map_or(true, |predicate| predicate.matches(entry))
}

/// Latest value of `name` among entries passing `predicate`; the first entry
/// wins equal timestamps.
fn latest_among<'e>(entries: &'e [Entry], name: &str, predicate: Option<&Predicate>) -> Option<&'e NameValue> {
    let mut best: Option<&NameValue> = None;
    for entry in entries {
        let Some(candidate) = entry.latest(name) else {
            continue;
        };
        if !passes(entry, predicate) {
            continue;
        }
        if best.map_or(true, |current| candidate.last_updated > current.last_updated) {
            best = Some(candidate);
        }
    }
    best
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub uuid: Uuid,
    roots: BTreeMap<SourceKind, Vec<Entry>>,
    children: BTreeMap<SourceKind, Vec<Entry>>,
}

impl Project {
    /// Entries without a parent in `graph` become roots, the rest children.
    /// When nothing is a root, the child with the earliest fact is promoted.
    /// The graph is only read.
    pub fn assemble(uuid: Uuid, entries: Vec<Entry>, graph: &RecordGraph) -> Self {
        let mut roots: BTreeMap<SourceKind, Vec<Entry>> = BTreeMap::new();
        let mut children: BTreeMap<SourceKind, Vec<Entry>> = BTreeMap::new();
        for entry in entries {
            let Some(node) = graph.get(&entry.fk) else {
                warn!(%uuid, fk = %entry.fk, source = %entry.source, "entry is not in the record graph");
                continue;
            };
            let side = if node.parents.is_empty() { &mut roots } else { &mut children };
            side.entry(entry.source).or_default().push(entry);
        }

        if roots.is_empty() {
            let mut oldest: Option<(SourceKind, usize, chrono::NaiveDateTime)> = None;
            for (source, entries) in &children {
                for (at, entry) in entries.iter().enumerate() {
                    let Some(first) = entry.oldest_timestamp() else {
                        continue;
                    };
                    if oldest.map_or(true, |(_, _, seen)| first < seen) {
                        oldest = Some((*source, at, first));
                    }
                }
            }
            if let Some((source, at, _)) = oldest {
                if let Some(entries) = children.get_mut(&source) {
                    let promoted = entries.remove(at);
                    if entries.is_empty() {
                        children.remove(&source);
                    }
                    roots.entry(source).or_default().push(promoted);
                }
            }
        }

        Self { uuid, roots, children }
    }

    pub fn roots(&self) -> &BTreeMap<SourceKind, Vec<Entry>> {
        &self.roots
    }

    pub fn children(&self) -> &BTreeMap<SourceKind, Vec<Entry>> {
        &self.children
    }

    pub fn roots_for(&self, source: SourceKind) -> &[Entry] {
        self.roots.get(&source).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn children_for(&self, source: SourceKind) -> &[Entry] {
        self.children.get(&source).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.roots.values().chain(self.children.values()).flatten()
    }

    pub fn has_authoritative_root(&self) -> bool {
        self.roots
            .iter()
            .any(|(source, entries)| source.is_authoritative() && !entries.is_empty())
    }

    /// Foreign key of some root entry, for log messages.
    pub fn any_root_fk(&self) -> Option<&str> {
        self.roots.values().flatten().next().map(|entry| entry.fk.as_str())
    }

    /// Resolve one value for `name` from `source`.
    ///
    /// The newest matching root value wins. For the authoritative source a
    /// non-empty root value is final. Otherwise the newest matching child
    /// value replaces the root value when that is missing, empty or older.
    /// Returns `""` when nothing matches.
    pub fn field(&self, name: &str, source: SourceKind, predicate: Option<&Predicate>) -> String {
        let mut best = latest_among(self.roots_for(source), name, predicate);
        let settled = best.is_some_and(|nv| !nv.value.is_empty());
        if !(settled && source.is_authoritative()) {
            if let Some(child) = latest_among(self.children_for(source), name, predicate) {
                let replace = match best {
                    None => true,
                    Some(root) => root.value.is_empty() || child.last_updated > root.last_updated,
                };
                if replace {
                    best = Some(child);
                }
            }
        }
        best.map(|nv| nv.value.clone()).unwrap_or_default()
    }

    /// Every entry of `source`, roots first, that passes `predicate` and has a
    /// value for `name`, grouped by foreign key.
    pub fn fields(
        &self,
        name: &str,
        source: SourceKind,
        predicate: Option<&Predicate>,
    ) -> BTreeMap<String, Vec<&Entry>> {
        let mut grouped: BTreeMap<String, Vec<&Entry>> = BTreeMap::new();
        for entry in self.roots_for(source).iter().chain(self.children_for(source)) {
            if entry.latest(name).is_some() && passes(entry, predicate) {
                grouped.entry(entry.fk.clone()).or_default().push(entry);
            }
        }
        grouped
    }
}
