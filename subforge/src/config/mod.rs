use crate::link::tags::TagStyle;
use crate::matching::{Clause, Filter};
use crate::prelude::*;
use anyhow::{anyhow, bail, Context};
use chrono::{SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserializer, Serializer};
use std::fmt;
use std::path::Path;
use tokio::io::AsyncReadExt;

pub mod migrate;

pub const CURRENT_VERSION: u32 = 4;
pub const DEFAULT_RELOAD: &str = "4h";
/// Host files above this size are refused before parsing.
pub const MAX_CONFIG_SIZE: u64 = 50 * 1024 * 1024;

static BLOCK_REGEX: Lazy<Result<Regex, regex::Error>> =
  Lazy::new(|| Regex::new(r"(/\*\*\s*@ParserConfig\s*\n)([\s\S]*?)(\*/)"));

/// `/** @ParserConfig <json> */`, captured as (opening, body, closing).
pub fn block_regex() -> Result<&'static Regex> {
  BLOCK_REGEX
    .as_ref()
    .map_err(|err| anyhow!("invalid @ParserConfig pattern: {}", err))
}

/// The JSON stored in the metadata block: `{"ParserConfig": {...}}`.
#[derive(Debug, Deserialize)]
pub struct MetadataBlock {
  #[serde(rename = "ParserConfig")]
  pub parser_config: ParserConfig,
}

#[derive(Serialize)]
struct MetadataBlockRef<'a> {
  #[serde(rename = "ParserConfig")]
  parser_config: &'a ParserConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParserConfig {
  #[serde(default)]
  pub version: u32,
  #[serde(default)]
  pub proxies: Vec<ProxySource>,
  #[serde(default)]
  pub outbounds: Vec<OutboundConfig>,
  #[serde(default)]
  pub parser: ReloadSettings,
}

/// Scheduling metadata. Only `last_updated` is touched by a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReloadSettings {
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub reload: String,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub last_updated: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxySource {
  /// Subscription URL, or a single direct link in older configs.
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub source: String,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub connections: Vec<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub skip: Vec<Clause>,
  /// Selectors that only see this source's nodes.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub outbounds: Vec<OutboundConfig>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tag_prefix: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tag_postfix: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tag_mask: Option<String>,
}

impl ProxySource {
  pub fn tag_style(&self) -> TagStyle<'_> {
    TagStyle {
      prefix: self.tag_prefix.as_deref(),
      postfix: self.tag_postfix.as_deref(),
      mask: self.tag_mask.as_deref(),
    }
  }
}

/// A selector definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutboundConfig {
  pub tag: SmolStr,
  #[serde(rename = "type")]
  pub kind: SmolStr,
  #[serde(default, skip_serializing_if = "SelectorOptions::is_empty")]
  pub options: SelectorOptions,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub filters: Option<Filter>,
  #[serde(
    rename = "addOutbounds",
    default,
    skip_serializing_if = "Vec::is_empty"
  )]
  pub add_outbounds: Vec<SmolStr>,
  #[serde(
    rename = "preferredDefault",
    default,
    skip_serializing_if = "Option::is_none"
  )]
  pub preferred_default: Option<Filter>,
  #[serde(default, skip_serializing_if = "String::is_empty")]
  pub comment: String,
}

impl OutboundConfig {
  /// The preferred-default filter, if one with at least one condition is set.
  pub fn preferred_default(&self) -> Option<&Filter> {
    self.preferred_default.as_ref().filter(|f| !f.is_empty())
  }
}

/// Passthrough selector options, kept in the order they were written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectorOptions {
  entries: Vec<(String, serde_json::Value)>,
}

impl SelectorOptions {
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
    self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
    self.entries.iter().map(|(k, v)| (k.as_str(), v))
  }

  /// Replaces an existing key in place, or appends it.
  pub fn insert(&mut self, key: impl Into<String>, value: serde_json::Value) {
    let key = key.into();
    match self.entries.iter_mut().find(|(k, _)| *k == key) {
      Some(entry) => entry.1 = value,
      None => self.entries.push((key, value)),
    }
  }
}

impl Serialize for SelectorOptions {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(self.entries.len()))?;
    for (key, value) in &self.entries {
      map.serialize_entry(key, value)?;
    }
    map.end()
  }
}

impl<'de> Deserialize<'de> for SelectorOptions {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct OptionsVisitor;

    impl<'de> Visitor<'de> for OptionsVisitor {
      type Value = SelectorOptions;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of selector options")
      }

      fn visit_unit<E: serde::de::Error>(self) -> Result<SelectorOptions, E> {
        Ok(SelectorOptions::default())
      }

      fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<SelectorOptions, A::Error> {
        let mut options = SelectorOptions::default();
        while let Some((key, value)) = access.next_entry::<String, serde_json::Value>()? {
          options.insert(key, value);
        }
        Ok(options)
      }
    }

    deserializer.deserialize_any(OptionsVisitor)
  }
}

impl ParserConfig {
  /// Fills in defaults and, when `touch` is set, stamps `last_updated` with the current time.
  pub fn normalize(&mut self, touch: bool) {
    if self.version == 0 {
      self.version = CURRENT_VERSION;
    }
    if self.parser.reload.is_empty() {
      self.parser.reload = DEFAULT_RELOAD.to_string();
    }
    if touch {
      self.parser.last_updated = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    }
  }

  /// Pretty JSON body of the metadata block, safe to place inside a `/** */` comment.
  pub fn render_json(&self) -> Result<String> {
    let json = serde_json::to_string_pretty(&MetadataBlockRef {
      parser_config: self,
    })?;
    // `*/` inside a string would close the comment early
    Ok(json.replace("*/", "*\\/"))
  }

  /// Comment block text ready to be written back into the host file.
  pub fn render_block(&self) -> Result<String> {
    Ok(format!("/** @ParserConfig\n{}\n*/", self.render_json()?))
  }
}

/// Finds the metadata block in `content`, migrates it to the current version and normalizes it.
pub fn extract_parser_config(content: &str) -> Result<ParserConfig> {
  let captures = block_regex()?
    .captures(content)
    .ok_or_else(|| anyhow!("@ParserConfig block not found"))?;
  let body = captures.get(2).map(|m| m.as_str().trim()).unwrap_or("");
  if body.is_empty() {
    bail!("@ParserConfig block is empty");
  }

  let mut config = migrate::migrate(body)?;
  config.normalize(false);
  info!(
    "Loaded @ParserConfig (version {}) with {} proxy source(s) and {} global outbound(s)",
    config.version,
    config.proxies.len(),
    config.outbounds.len()
  );
  Ok(config)
}

/// Reads the host file, refusing anything above [`MAX_CONFIG_SIZE`].
pub async fn read_host_file(path: &Path) -> Result<String> {
  let mut file = tokio::fs::File::open(path)
    .await
    .with_context(|| format!("failed to open {}", path.display()))?;
  let size = file.metadata().await?.len();
  if size > MAX_CONFIG_SIZE {
    bail!(
      "config file {} is too large ({} bytes, limit {})",
      path.display(),
      size,
      MAX_CONFIG_SIZE
    );
  }
  let mut buffer = String::with_capacity(size as usize);
  file
    .read_to_string(&mut buffer)
    .await
    .with_context(|| format!("failed to read {}", path.display()))?;
  Ok(buffer)
}

pub async fn load_file(path: &Path) -> Result<ParserConfig> {
  let content = read_host_file(path).await?;
  extract_parser_config(&content).with_context(|| format!("invalid config {}", path.display()))
}
