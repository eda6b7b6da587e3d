//! Selector resolution in three passes.
//!
//! 1. Collect: every selector filters its node pool (own source for local selectors,
//!    all nodes for global ones).
//! 2. Resolve: Kahn's algorithm over `addOutbounds` references computes how many members
//!    each selector ends up with. Selectors caught in a cycle stay unprocessed and count
//!    as empty.
//! 3. Emit: valid selectors get their final member list and optional default.

use crate::config::{OutboundConfig, ParserConfig};
use crate::link::ParsedNode;
use crate::matching::{select_nodes, FieldScope};
use crate::prelude::*;
use itertools::Itertools;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
  /// Declared under `proxies[n].outbounds`.
  Local(usize),
  Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  Pending,
  Resolved,
  /// Never dequeued because of a reference cycle.
  Unprocessed,
}

#[derive(Debug)]
pub struct SelectorInfo<'a> {
  pub config: &'a OutboundConfig,
  pub scope: Scope,
  pub filtered: Vec<&'a ParsedNode>,
  pub member_count: usize,
  pub resolution: Resolution,
}

impl SelectorInfo<'_> {
  pub fn is_valid(&self) -> bool {
    self.resolution == Resolution::Resolved && self.member_count > 0
  }
}

/// A selector that made it into the output.
#[derive(Debug, Clone)]
pub struct ResolvedSelector<'a> {
  pub config: &'a OutboundConfig,
  pub scope: Scope,
  pub default: Option<SmolStr>,
  pub members: Vec<SmolStr>,
}

pub struct SelectorGraph<'a> {
  infos: Vec<SelectorInfo<'a>>,
  index: HashMap<SmolStr, usize>,
}

impl<'a> SelectorGraph<'a> {
  /// Pass 1. `nodes` holds the nodes of each source, in source order.
  pub fn collect(config: &'a ParserConfig, nodes: &'a [Vec<ParsedNode>]) -> Self {
    let mut graph = SelectorGraph {
      infos: Vec::new(),
      index: HashMap::new(),
    };

    for (i, source) in config.proxies.iter().enumerate() {
      let pool: Vec<&ParsedNode> = nodes.get(i).map(|n| n.iter().collect()).unwrap_or_default();
      for outbound in &source.outbounds {
        graph.insert(outbound, Scope::Local(i), &pool);
      }
    }

    let all: Vec<&ParsedNode> = nodes.iter().flatten().collect();
    for outbound in &config.outbounds {
      graph.insert(outbound, Scope::Global, &all);
    }
    graph
  }

  fn insert(&mut self, config: &'a OutboundConfig, scope: Scope, pool: &[&'a ParsedNode]) {
    let filtered = select_nodes(pool, config.filters.as_ref());
    debug!(
      "Selector '{}' ({:?}): {} node(s) matched",
      config.tag,
      scope,
      filtered.len()
    );

    let position = self.infos.len();
    if let Some(previous) = self.index.insert(config.tag.clone(), position) {
      warn!(
        "Duplicate selector tag '{}': {:?} declaration replaces {:?} declaration",
        config.tag, scope, self.infos[previous].scope
      );
    }
    self.infos.push(SelectorInfo {
      config,
      scope,
      member_count: filtered.len(),
      filtered,
      resolution: Resolution::Pending,
    });
  }

  /// Declarations that lost a tag collision are not part of the graph.
  fn is_shadowed(&self, position: usize) -> bool {
    self.index.get(&self.infos[position].config.tag) != Some(&position)
  }

  pub fn get(&self, tag: &str) -> Option<&SelectorInfo<'a>> {
    self.index.get(tag).map(|&i| &self.infos[i])
  }

  /// Pass 2. Returns the tags left unprocessed by a cycle.
  pub fn resolve(&mut self) -> Vec<SmolStr> {
    let count = self.infos.len();
    let mut in_degree = vec![0usize; count];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];

    for (i, info) in self.infos.iter().enumerate() {
      if self.is_shadowed(i) {
        continue;
      }
      for add in &info.config.add_outbounds {
        if let Some(&dependency) = self.index.get(add) {
          dependents[dependency].push(i);
          in_degree[i] += 1;
        }
      }
    }

    let mut queue: VecDeque<usize> = (0..count)
      .filter(|&i| in_degree[i] == 0 && !self.is_shadowed(i))
      .collect();

    while let Some(i) = queue.pop_front() {
      let referenced = self.infos[i]
        .config
        .add_outbounds
        .iter()
        .filter(|add| match self.index.get(add.as_str()) {
          Some(&dependency) => self.infos[dependency].is_valid(),
          None => true,
        })
        .count();

      let info = &mut self.infos[i];
      info.member_count = info.filtered.len() + referenced;
      info.resolution = Resolution::Resolved;
      debug!(
        "Selector '{}' resolved with {} member(s)",
        info.config.tag, info.member_count
      );

      for &dependent in &dependents[i] {
        in_degree[dependent] -= 1;
        if in_degree[dependent] == 0 {
          queue.push_back(dependent);
        }
      }
    }

    let mut unprocessed = Vec::new();
    for i in 0..count {
      if self.is_shadowed(i) || self.infos[i].resolution != Resolution::Pending {
        continue;
      }
      self.infos[i].resolution = Resolution::Unprocessed;
      unprocessed.push(self.infos[i].config.tag.clone());
    }
    if !unprocessed.is_empty() {
      warn!(
        "Selectors in a reference cycle are left out: {}",
        unprocessed.iter().join(", ")
      );
    }
    unprocessed
  }

  /// Pass 3. Valid selectors, local ones first, in declaration order.
  pub fn emit(&self) -> Vec<ResolvedSelector<'a>> {
    let mut selectors = Vec::new();
    for (i, info) in self.infos.iter().enumerate() {
      let tag = &info.config.tag;
      if self.is_shadowed(i) {
        continue;
      }
      if !info.is_valid() {
        debug!("Skipping selector '{}': no members", tag);
        continue;
      }

      let members = self.members(info);
      if members.is_empty() {
        debug!("Skipping selector '{}': member list is empty", tag);
        continue;
      }

      let default = info.config.preferred_default().and_then(|filter| {
        info
          .filtered
          .iter()
          .find(|node| filter.matches(node, FieldScope::Selector))
          .map(|node| node.tag.clone())
      });

      selectors.push(ResolvedSelector {
        config: info.config,
        scope: info.scope,
        default,
        members,
      });
    }
    selectors
  }

  fn members(&self, info: &SelectorInfo<'a>) -> Vec<SmolStr> {
    let tag = &info.config.tag;
    let mut seen = HashSet::new();
    let mut members = Vec::new();

    for add in &info.config.add_outbounds {
      if !seen.insert(add.clone()) {
        warn!("Selector '{}': duplicate addOutbounds entry '{}'", tag, add);
        continue;
      }
      match self.get(add) {
        Some(dependency) if !dependency.is_valid() => {
          debug!("Selector '{}': dropping empty selector '{}'", tag, add);
        }
        _ => members.push(add.clone()),
      }
    }

    let mut duplicates = 0;
    for node in &info.filtered {
      if seen.insert(node.tag.clone()) {
        members.push(node.tag.clone());
      } else {
        duplicates += 1;
      }
    }
    if duplicates > 0 {
      warn!("Selector '{}': {} duplicate member(s) dropped", tag, duplicates);
    }
    members
  }
}

/// Everything the emitter needs from the graph.
pub struct Resolved<'a> {
  pub selectors: Vec<ResolvedSelector<'a>>,
  pub unprocessed: Vec<SmolStr>,
}

/// Runs all three passes.
pub fn build<'a>(config: &'a ParserConfig, nodes: &'a [Vec<ParsedNode>]) -> Resolved<'a> {
  let mut graph = SelectorGraph::collect(config, nodes);
  let unprocessed = graph.resolve();
  Resolved {
    selectors: graph.emit(),
    unprocessed,
  }
}
