//! Upgrades older `@ParserConfig` layouts step by step.
//!
//! * v1: `version` lives next to `ParserConfig` instead of inside it.
//! * v2: selectors nest their inclusion rules as `outbounds: {proxies, addOutbounds, preferredDefault}`.
//! * v3: flat selectors, no per-source selectors yet.
//! * v4: current layout.

use super::{MetadataBlock, ParserConfig, CURRENT_VERSION, DEFAULT_RELOAD};
use crate::prelude::*;
use anyhow::{anyhow, bail, Context};
use serde_json::{json, Map, Value};

/// Version recorded in the block, `0` if there is none.
pub fn detect_version(root: &Value) -> u32 {
  let read = |v: Option<&Value>| v.and_then(Value::as_u64).unwrap_or(0) as u32;
  match read(root.pointer("/ParserConfig/version")) {
    0 => read(root.get("version")),
    version => version,
  }
}

pub fn migrate(json_text: &str) -> Result<ParserConfig> {
  let mut root: Value =
    serde_json::from_str(json_text).context("failed to parse @ParserConfig JSON")?;

  let mut version = detect_version(&root);
  if version == 0 {
    debug!("@ParserConfig has no version, migrating from version 1");
    version = 1;
  }
  if version > CURRENT_VERSION {
    bail!(
      "config version {} is newer than supported version {}, please update the application",
      version,
      CURRENT_VERSION
    );
  }

  while version < CURRENT_VERSION {
    let step = match version {
      1 => v1_to_v2(&mut root),
      2 => v2_to_v3(&mut root),
      _ => set_version(&mut root, version + 1),
    };
    step.with_context(|| format!("failed to migrate from version {} to {}", version, version + 1))?;
    version += 1;
    info!("Migrated @ParserConfig to version {}", version);
  }

  let block: MetadataBlock =
    serde_json::from_value(root).context("failed to parse migrated @ParserConfig")?;
  Ok(block.parser_config)
}

fn parser_config(root: &mut Value) -> Result<&mut Map<String, Value>> {
  root
    .get_mut("ParserConfig")
    .and_then(Value::as_object_mut)
    .ok_or_else(|| anyhow!("missing ParserConfig object"))
}

fn set_version(root: &mut Value, version: u32) -> Result<()> {
  parser_config(root)?.insert("version".to_string(), json!(version));
  Ok(())
}

fn v1_to_v2(root: &mut Value) -> Result<()> {
  if let Some(top) = root.as_object_mut() {
    top.remove("version");
  }
  let config = parser_config(root)?;
  config.insert("version".to_string(), json!(2));

  let parser = config
    .entry("parser")
    .or_insert_with(|| Value::Object(Map::new()));
  if let Some(parser) = parser.as_object_mut() {
    let has_reload = parser
      .get("reload")
      .and_then(Value::as_str)
      .map_or(false, |r| !r.is_empty());
    if !has_reload {
      parser.insert("reload".to_string(), json!(DEFAULT_RELOAD));
    }
  }
  Ok(())
}

fn non_empty(value: &Value) -> bool {
  match value {
    Value::Null => false,
    Value::Object(map) => !map.is_empty(),
    Value::Array(items) => !items.is_empty(),
    _ => true,
  }
}

fn v2_to_v3(root: &mut Value) -> Result<()> {
  let config = parser_config(root)?;
  if let Some(outbounds) = config.get_mut("outbounds").and_then(Value::as_array_mut) {
    for outbound in outbounds.iter_mut().filter_map(Value::as_object_mut) {
      let tag = outbound
        .get("tag")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
      let mut nested = match outbound.remove("outbounds") {
        Some(Value::Object(nested)) => nested,
        Some(other) => {
          outbound.insert("outbounds".to_string(), other);
          continue;
        }
        None => continue,
      };

      if let Some(proxies) = nested.remove("proxies").filter(non_empty) {
        let filters = outbound.entry("filters").or_insert(Value::Null);
        if filters.is_null() {
          *filters = proxies;
        } else if let (Value::Object(filters), Value::Object(proxies)) = (filters, proxies) {
          filters.extend(proxies);
        } else {
          warn!("Outbound '{}': cannot merge 'outbounds.proxies' into 'filters'", tag);
        }
        debug!("Outbound '{}': moved 'outbounds.proxies' to 'filters'", tag);
      }
      for key in ["addOutbounds", "preferredDefault"] {
        if let Some(value) = nested.remove(key).filter(non_empty) {
          outbound.insert(key.to_string(), value);
          debug!("Outbound '{}': moved 'outbounds.{}' to top level", tag, key);
        }
      }
    }
  }
  config.insert("version".to_string(), json!(3));
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::matching::Filter;

  #[test]
  fn version_detection() {
    assert_eq!(detect_version(&json!({"ParserConfig": {"version": 3}})), 3);
    assert_eq!(detect_version(&json!({"version": 1, "ParserConfig": {}})), 1);
    assert_eq!(detect_version(&json!({"ParserConfig": {}})), 0);
  }

  #[test]
  fn v1_gets_reload_and_current_version() {
    let config = migrate(r#"{"version": 1, "ParserConfig": {"proxies": [{"source": "https://x"}]}}"#)
      .unwrap();
    assert_eq!(config.version, CURRENT_VERSION);
    assert_eq!(config.parser.reload, DEFAULT_RELOAD);
    assert_eq!(config.proxies[0].source, "https://x");
  }

  #[test]
  fn v2_nested_selector_flattened() {
    let config = migrate(
      r#"{"ParserConfig": {"version": 2, "outbounds": [{
        "tag": "auto", "type": "urltest",
        "filters": {"scheme": "vless"},
        "outbounds": {"proxies": {"tag": "/nl/i"}, "addOutbounds": ["direct-out"],
                      "preferredDefault": {"tag": "NL-1"}}
      }]}}"#,
    )
    .unwrap();
    let outbound = &config.outbounds[0];
    assert_eq!(outbound.add_outbounds, vec![SmolStr::from("direct-out")]);
    assert!(outbound.preferred_default().is_some());
    match &outbound.filters {
      Some(Filter::All(clause)) => {
        let encoded = serde_json::to_value(clause).unwrap();
        assert_eq!(encoded, json!({"scheme": "vless", "tag": "/nl/i"}));
      }
      other => panic!("unexpected filters {:?}", other),
    }
  }

  #[test]
  fn newer_version_rejected() {
    let err = migrate(r#"{"ParserConfig": {"version": 99}}"#).unwrap_err();
    assert!(err.to_string().contains("newer"));
  }

  #[test]
  fn current_version_untouched() {
    let config = migrate(r#"{"ParserConfig": {"version": 4, "parser": {"reload": "1h"}}}"#).unwrap();
    assert_eq!(config.parser.reload, "1h");
  }
}
