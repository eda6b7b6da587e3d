use crate::link::ParsedNode;
use crate::prelude::*;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserializer, Serializer};
use std::fmt;

mod pattern;
pub use pattern::{matches_pattern, Pattern};

/// Where a filter is evaluated. `flow` is only visible to skip filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldScope {
  Skip,
  Selector,
}

/// Value of `key` on `node`. Unknown keys read as the empty string.
pub fn node_value<'a>(node: &'a ParsedNode, key: &str, scope: FieldScope) -> &'a str {
  match key {
    "tag" => node.tag.as_str(),
    "host" => node.server.as_str(),
    "label" | "fragment" => node.label.as_str(),
    "scheme" => node.scheme().as_str(),
    "comment" => node.comment.as_str(),
    "flow" if scope == FieldScope::Skip => node.flow.as_str(),
    _ => "",
  }
}

/// `{field: pattern, ...}`; every field must match.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Clause {
  entries: Vec<(SmolStr, Pattern)>,
}

impl Clause {
  pub fn new<I, K, P>(entries: I) -> Self
  where
    I: IntoIterator<Item = (K, P)>,
    K: Into<SmolStr>,
    P: Into<String>,
  {
    Self {
      entries: entries
        .into_iter()
        .map(|(k, p)| (k.into(), Pattern::new(p)))
        .collect(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn matches(&self, node: &ParsedNode, scope: FieldScope) -> bool {
    self.entries
      .iter()
      .all(|(key, pattern)| pattern.is_match(node_value(node, key, scope)))
  }
}

impl Serialize for Clause {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(self.entries.len()))?;
    for (key, pattern) in &self.entries {
      map.serialize_entry(key.as_str(), pattern)?;
    }
    map.end()
  }
}

impl<'de> Deserialize<'de> for Clause {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct ClauseVisitor;

    impl<'de> Visitor<'de> for ClauseVisitor {
      type Value = Clause;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of node field to pattern string")
      }

      fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Clause, A::Error> {
        let mut entries = Vec::new();
        while let Some((key, value)) = access.next_entry::<SmolStr, serde_json::Value>()? {
          match value {
            serde_json::Value::String(raw) => entries.push((key, Pattern::new(raw))),
            other => warn!("Ignoring non-string filter value for '{}': {}", key, other),
          }
        }
        Ok(Clause { entries })
      }
    }

    deserializer.deserialize_map(ClauseVisitor)
  }
}

/// Node inclusion predicate of a selector.
///
/// A single object is an AND of its keys, an array is an OR of such objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
  AnyOf(Vec<Clause>),
  All(Clause),
}

impl Filter {
  /// True when the filter carries no condition at all.
  pub fn is_empty(&self) -> bool {
    match self {
      Filter::AnyOf(clauses) => clauses.iter().all(Clause::is_empty),
      Filter::All(clause) => clause.is_empty(),
    }
  }

  pub fn matches(&self, node: &ParsedNode, scope: FieldScope) -> bool {
    match self {
      Filter::AnyOf(clauses) => clauses.iter().any(|c| c.matches(node, scope)),
      Filter::All(clause) => clause.matches(node, scope),
    }
  }
}

/// Nodes a selector includes. No filter, or an empty object, includes everything.
pub fn select_nodes<'a>(nodes: &[&'a ParsedNode], filter: Option<&Filter>) -> Vec<&'a ParsedNode> {
  match filter {
    None => nodes.to_vec(),
    Some(Filter::All(clause)) if clause.is_empty() => nodes.to_vec(),
    Some(filter) => nodes
      .iter()
      .copied()
      .filter(|node| filter.matches(node, FieldScope::Selector))
      .collect(),
  }
}

/// True when any skip clause matches; skip lists are always OR-ed.
pub fn should_skip(node: &ParsedNode, skip: &[Clause]) -> bool {
  skip.iter().any(|clause| clause.matches(node, FieldScope::Skip))
}
