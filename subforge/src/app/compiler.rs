use super::Progress;
use crate::config::{self, ParserConfig};
use crate::graph::{Scope, SelectorGraph};
use crate::link::{ParsedNode, TagCounter};
use crate::prelude::*;
use crate::source::{self, HttpFetcher, SubscriptionFetcher};
use crate::{emit, splice};
use anyhow::{bail, Context};
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Output of one compile run, before it is written anywhere.
#[derive(Debug, Default)]
pub struct GeneratedOutbounds {
  /// Node fragments first, then local and global selector fragments.
  pub fragments: Vec<String>,
  pub nodes_count: usize,
  pub local_selectors_count: usize,
  pub global_selectors_count: usize,
  /// Selectors dropped because of a reference cycle.
  pub unprocessed: Vec<SmolStr>,
}

impl GeneratedOutbounds {
  /// Text for the managed region.
  pub fn content(&self) -> String {
    self.fragments.join("\n")
  }
}

pub struct Compiler<F> {
  fetcher: F,
}

impl Compiler<HttpFetcher> {
  pub fn with_http() -> Result<Self> {
    Ok(Self::new(HttpFetcher::new()?))
  }
}

impl<F: SubscriptionFetcher> Compiler<F> {
  pub fn new(fetcher: F) -> Self {
    Self { fetcher }
  }

  /// Loads every source and builds the outbound fragments.
  pub async fn generate(
    &self,
    config: &ParserConfig,
    cancel: &CancellationToken,
    progress: Progress<'_>,
  ) -> Result<GeneratedOutbounds> {
    let result = self.run(config, cancel, &mut *progress).await;
    if let Err(err) = &result {
      progress(-1.0, &format!("Error: {:#}", err));
    }
    result
  }

  /// Full update of the host file at `path`: read the metadata block, generate, splice
  /// the result in and stamp `last_updated`.
  pub async fn update_config_file(
    &self,
    path: &Path,
    cancel: &CancellationToken,
    progress: Progress<'_>,
  ) -> Result<GeneratedOutbounds> {
    let result = self.update(path, cancel, &mut *progress).await;
    if let Err(err) = &result {
      progress(-1.0, &format!("Error: {:#}", err));
    }
    result
  }

  async fn update(
    &self,
    path: &Path,
    cancel: &CancellationToken,
    progress: Progress<'_>,
  ) -> Result<GeneratedOutbounds> {
    info!("Updating {}", path.display());
    let mut config = config::load_file(path).await?;
    let generated = self.run(&config, cancel, &mut *progress).await?;

    progress(90.0, "Writing to config file...");
    config.normalize(true);
    splice::write_to_config(path, &generated.content(), Some(&config))
      .await
      .context("failed to write config")?;

    info!("{} updated, last_updated = {}", path.display(), config.parser.last_updated);
    progress(100.0, "Configuration updated successfully");
    Ok(generated)
  }

  async fn load_nodes(
    &self,
    config: &ParserConfig,
    cancel: &CancellationToken,
    progress: Progress<'_>,
  ) -> Result<Vec<Vec<ParsedNode>>> {
    let total = config.proxies.len();
    let mut tags = TagCounter::new();
    let mut nodes = Vec::with_capacity(total);

    for (i, proxy) in config.proxies.iter().enumerate() {
      if cancel.is_cancelled() {
        bail!("update cancelled");
      }
      progress(
        10.0 + (i as f64) * 30.0 / (total as f64),
        &format!("Processing source {}/{}", i + 1, total),
      );
      match source::load_source(&self.fetcher, proxy, &mut tags, cancel).await {
        Ok(loaded) => nodes.push(loaded),
        Err(err) => {
          warn!("Skipping source {}/{}: {:#}", i + 1, total, err);
          nodes.push(Vec::new());
        }
      }
    }
    if cancel.is_cancelled() {
      bail!("update cancelled");
    }

    tags.log_duplicates();
    Ok(nodes)
  }

  async fn run(
    &self,
    config: &ParserConfig,
    cancel: &CancellationToken,
    progress: Progress<'_>,
  ) -> Result<GeneratedOutbounds> {
    progress(10.0, "Processing sources...");
    let nodes = self.load_nodes(config, cancel, &mut *progress).await?;
    let nodes_count: usize = nodes.iter().map(Vec::len).sum();
    if nodes_count == 0 {
      bail!("no nodes parsed from any source");
    }
    info!("Loaded {} node(s) from {} source(s)", nodes_count, nodes.len());

    progress(40.0, "Generating node outbounds...");
    let mut generated = GeneratedOutbounds {
      nodes_count,
      ..Default::default()
    };
    for node in nodes.iter().flatten() {
      match emit::node_fragment(node) {
        Ok(fragment) => generated.fragments.push(fragment),
        Err(err) => warn!("Skipping node '{}': {:#}", node.tag, err),
      }
    }
    if generated.fragments.is_empty() {
      bail!("none of the {} node(s) could be serialized", nodes_count);
    }

    progress(60.0, "Collecting selectors...");
    let mut graph = SelectorGraph::collect(config, &nodes);
    progress(70.0, "Resolving selector references...");
    generated.unprocessed = graph.resolve();
    progress(80.0, "Generating selectors...");
    for selector in graph.emit() {
      let fragment = match emit::selector_fragment(&selector) {
        Ok(fragment) => fragment,
        Err(err) => {
          warn!("Skipping selector '{}': {:#}", selector.config.tag, err);
          continue;
        }
      };
      generated.fragments.push(fragment);
      match selector.scope {
        Scope::Local(_) => generated.local_selectors_count += 1,
        Scope::Global => generated.global_selectors_count += 1,
      }
    }

    info!(
      "Generated {} node(s), {} local selector(s), {} global selector(s)",
      generated.nodes_count, generated.local_selectors_count, generated.global_selectors_count
    );
    Ok(generated)
  }
}
