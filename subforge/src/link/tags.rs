use super::ParsedNode;
use crate::prelude::*;
use std::collections::HashSet;

/// Issues unique node tags for one run.
///
/// The first occurrence of a tag is kept as is, later ones get `-2`, `-3`, ...
/// Generated tags are remembered too, so a literal `eu-2` arriving after a generated
/// one does not collide with it.
#[derive(Debug, Default)]
pub struct TagCounter {
  counts: HashMap<SmolStr, usize>,
  issued: HashSet<SmolStr>,
}

impl TagCounter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn make_unique(&mut self, tag: &str) -> SmolStr {
    let count = self.counts.entry(SmolStr::from(tag)).or_insert(0);
    *count += 1;

    if *count == 1 && !self.issued.contains(tag) {
      let tag = SmolStr::from(tag);
      self.issued.insert(tag.clone());
      return tag;
    }

    loop {
      if *count == 1 {
        *count = 2;
      }
      let candidate = SmolStr::from(format!("{}-{}", tag, count));
      if !self.issued.contains(&candidate) {
        debug!("Duplicate tag '{}' renamed to '{}'", tag, candidate);
        self.issued.insert(candidate.clone());
        return candidate;
      }
      *count += 1;
    }
  }

  /// Tags seen more than once, with how often, sorted by tag.
  pub fn duplicates(&self) -> Vec<(SmolStr, usize)> {
    let mut dups: Vec<_> = self
      .counts
      .iter()
      .filter(|&(_, &n)| n > 1)
      .map(|(tag, &n)| (tag.clone(), n))
      .collect();
    dups.sort();
    dups
  }

  pub fn log_duplicates(&self) {
    let dups = self.duplicates();
    if dups.is_empty() {
      return;
    }
    info!("Found {} duplicate tag(s):", dups.len());
    for (tag, n) in dups {
      info!("  '{}' appeared {} times", tag, n);
    }
  }
}

/// Expands `{$tag}`, `{$scheme}`, `{$protocol}`, `{$server}`, `{$port}`, `{$label}`,
/// `{$comment}` and `{$num}` in `template`.
pub fn expand_template(template: &str, node: &ParsedNode, num: usize) -> String {
  let port = node.port.to_string();
  let num = num.to_string();
  let vars: [(&str, &str); 8] = [
    ("{$tag}", node.tag.as_str()),
    ("{$scheme}", node.scheme().as_str()),
    ("{$protocol}", node.scheme().as_str()),
    ("{$server}", node.server.as_str()),
    ("{$port}", port.as_str()),
    ("{$label}", node.label.as_str()),
    ("{$comment}", node.comment.as_str()),
    ("{$num}", num.as_str()),
  ];
  vars
    .iter()
    .fold(template.to_string(), |acc, (var, value)| acc.replace(var, value))
}

/// Source-level tag decoration. A non-empty mask replaces the tag entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagStyle<'a> {
  pub prefix: Option<&'a str>,
  pub postfix: Option<&'a str>,
  pub mask: Option<&'a str>,
}

impl TagStyle<'_> {
  pub fn apply(&self, node: &ParsedNode, num: usize) -> String {
    if let Some(mask) = self.mask.filter(|m| !m.is_empty()) {
      return expand_template(mask, node, num);
    }
    let mut tag = node.tag.to_string();
    if let Some(prefix) = self.prefix.filter(|p| !p.is_empty()) {
      tag = format!("{}{}", expand_template(prefix, node, num), tag);
    }
    if let Some(postfix) = self.postfix.filter(|p| !p.is_empty()) {
      tag.push_str(&expand_template(postfix, node, num));
    }
    tag
  }
}
