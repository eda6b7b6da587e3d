use crate::prelude::*;
use regex::{Regex, RegexBuilder};
use serde::{Deserializer, Serializer};

/// A single filter value.
///
/// | form        | meaning                              |
/// |-------------|--------------------------------------|
/// | `literal`   | exact, case-sensitive equality       |
/// | `!literal`  | inequality                           |
/// | `/re/i`     | case-insensitive regex match         |
/// | `!/re/i`    | negated case-insensitive regex match |
///
/// A regex that fails to compile never matches, negated or not.
#[derive(Debug, Clone)]
pub struct Pattern {
  raw: String,
  kind: PatternKind,
}

#[derive(Debug, Clone)]
enum PatternKind {
  Literal(String),
  NotLiteral(String),
  Regex(Regex),
  NotRegex(Regex),
  Invalid,
}

impl Pattern {
  pub fn new(raw: impl Into<String>) -> Self {
    let raw = raw.into();
    let kind = Self::compile(&raw);
    Self { raw, kind }
  }

  fn compile(raw: &str) -> PatternKind {
    if let Some(body) = raw
      .strip_prefix("!/")
      .and_then(|rest| rest.strip_suffix("/i"))
    {
      return Self::regex(raw, body).map_or(PatternKind::Invalid, PatternKind::NotRegex);
    }
    if let Some(literal) = raw.strip_prefix('!') {
      if !literal.starts_with('/') {
        return PatternKind::NotLiteral(literal.to_string());
      }
    }
    if let Some(body) = raw.strip_prefix('/').and_then(|rest| rest.strip_suffix("/i")) {
      return Self::regex(raw, body).map_or(PatternKind::Invalid, PatternKind::Regex);
    }
    PatternKind::Literal(raw.to_string())
  }

  fn regex(raw: &str, body: &str) -> Option<Regex> {
    match RegexBuilder::new(body).case_insensitive(true).build() {
      Ok(re) => Some(re),
      Err(err) => {
        warn!("Invalid regex pattern {}: {}", raw, err);
        None
      }
    }
  }

  pub fn is_match(&self, value: &str) -> bool {
    match &self.kind {
      PatternKind::Literal(expected) => value == expected,
      PatternKind::NotLiteral(expected) => value != expected,
      PatternKind::Regex(re) => re.is_match(value),
      PatternKind::NotRegex(re) => !re.is_match(value),
      PatternKind::Invalid => false,
    }
  }

  pub fn as_str(&self) -> &str {
    &self.raw
  }
}

impl PartialEq for Pattern {
  fn eq(&self, other: &Self) -> bool {
    self.raw == other.raw
  }
}

impl Serialize for Pattern {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&self.raw)
  }
}

impl<'de> Deserialize<'de> for Pattern {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let raw = String::deserialize(deserializer)?;
    Ok(Pattern::new(raw))
  }
}

/// One-shot helper for callers holding a raw pattern string.
pub fn matches_pattern(value: &str, pattern: &str) -> bool {
  Pattern::new(pattern).is_match(value)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn literal_and_negation() {
    assert!(matches_pattern("x", "x"));
    assert!(!matches_pattern("X", "x"));
    assert!(!matches_pattern("x", "!x"));
    assert!(matches_pattern("x", "!y"));
  }

  #[test]
  fn regex_is_case_insensitive() {
    assert!(matches_pattern("xxABCxx", "/abc/i"));
    assert!(!matches_pattern("xyz", "/abc/i"));
    assert!(matches_pattern("🇩🇪 Frankfurt", "/frank/i"));
  }

  #[test]
  fn negated_regex() {
    assert!(!matches_pattern("Premium NL", "!/premium/i"));
    assert!(matches_pattern("Free NL", "!/premium/i"));
  }

  #[test]
  fn invalid_regex_never_matches() {
    assert!(!matches_pattern("anything", "/([/i"));
    assert!(!matches_pattern("anything", "!/([/i"));
  }

  #[test]
  fn slash_without_flag_is_literal() {
    assert!(matches_pattern("/abc/", "/abc/"));
    assert!(!matches_pattern("abc", "/abc/"));
    assert!(matches_pattern("!/abc", "!/abc"));
  }
}
