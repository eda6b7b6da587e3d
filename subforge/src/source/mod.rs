use crate::config::ProxySource;
use crate::link::tags::TagStyle;
use crate::link::{self, ParsedNode, TagCounter};
use crate::matching::Clause;
use crate::prelude::*;
use crate::utils::{decode_base64, repair_utf8};
use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;

mod http;
pub use http::HttpFetcher;

/// Nodes kept from one source; the rest is dropped with a single warning.
pub const MAX_NODES_PER_SOURCE: usize = 500;

#[async_trait]
pub trait SubscriptionFetcher: Send + Sync {
  /// Raw response body of `url`.
  async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>>;
}

/// Decodes a subscription body that is either plain text or base64 of plain text.
pub fn decode_subscription(body: &[u8]) -> Result<String> {
  if body.is_empty() {
    bail!("subscription content is empty");
  }
  let text = String::from_utf8_lossy(body);
  let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
  match decode_base64(&compact) {
    Ok(decoded) if decoded.is_empty() => bail!("decoded subscription content is empty"),
    Ok(decoded) => {
      let (decoded, repaired) = repair_utf8(decoded);
      if repaired {
        debug!("Dropped invalid UTF-8 from decoded subscription");
      }
      Ok(decoded)
    }
    Err(_) => {
      debug!("Subscription content is not base64, treating as plain text");
      Ok(text.into_owned())
    }
  }
}

/// Parses lines of one source into uniquely tagged nodes, honouring the per-source cap.
struct Collector<'a> {
  skip: &'a [Clause],
  style: TagStyle<'a>,
  tags: &'a mut TagCounter,
  nodes: Vec<ParsedNode>,
  over_cap: usize,
  failed: usize,
}

impl Collector<'_> {
  fn push(&mut self, line: &str, origin: &str) {
    let line = line.trim();
    if line.is_empty() {
      return;
    }
    if self.nodes.len() >= MAX_NODES_PER_SOURCE {
      self.over_cap += 1;
      return;
    }

    match link::parse_node(line, self.skip) {
      Ok(Some(mut node)) => {
        let styled = self.style.apply(&node, self.nodes.len() + 1);
        node.tag = self.tags.make_unique(&styled);
        self.nodes.push(node);
      }
      Ok(None) => {}
      Err(err) => {
        self.failed += 1;
        warn!("Failed to parse node from {}: {:#}", origin, err);
      }
    }
  }
}

/// Loads every node of `source`: the subscription (or legacy direct link) in `source`,
/// then `connections`. A failing download skips the whole source.
pub async fn load_source<F>(
  fetcher: &F,
  source: &ProxySource,
  tags: &mut TagCounter,
  cancel: &CancellationToken,
) -> Result<Vec<ParsedNode>>
where
  F: SubscriptionFetcher + ?Sized,
{
  let mut collector = Collector {
    skip: &source.skip,
    style: source.tag_style(),
    tags,
    nodes: Vec::new(),
    over_cap: 0,
    failed: 0,
  };

  let origin = source.source.trim();
  if link::is_subscription_url(origin) {
    let body = fetcher
      .fetch(origin, cancel)
      .await
      .with_context(|| format!("failed to fetch subscription {}", origin))?;
    let content = decode_subscription(&body)
      .with_context(|| format!("invalid subscription content from {}", origin))?;
    debug!("Fetched {} bytes from {}", body.len(), origin);
    for line in content.split('\n') {
      collector.push(line, origin);
    }
  } else if link::is_direct_link(origin) {
    collector.push(origin, "source link");
  } else if !origin.is_empty() {
    warn!("Ignoring unrecognised source '{}'", origin);
  }

  for connection in &source.connections {
    collector.push(connection, "connections");
  }

  if collector.over_cap > 0 {
    warn!(
      "Source '{}' exceeded {} nodes, {} more node(s) dropped",
      origin, MAX_NODES_PER_SOURCE, collector.over_cap
    );
  }
  debug!(
    "Source '{}': {} node(s) loaded, {} line(s) failed to parse",
    origin,
    collector.nodes.len(),
    collector.failed
  );
  Ok(collector.nodes)
}

/// In-memory fetcher for tests.
#[cfg(test)]
pub(crate) struct StaticFetcher {
  pub bodies: HashMap<String, Vec<u8>>,
}

#[cfg(test)]
#[async_trait]
impl SubscriptionFetcher for StaticFetcher {
  async fn fetch(&self, url: &str, _cancel: &CancellationToken) -> Result<Vec<u8>> {
    match self.bodies.get(url) {
      Some(body) => Ok(body.clone()),
      None => bail!("404 for {}", url),
    }
  }
}
