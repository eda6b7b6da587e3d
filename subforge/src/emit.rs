//! Outbound JSON fragments for the managed region of the host file.
//!
//! Each fragment is one compact JSON object followed by a comma, optionally preceded by a
//! `//` comment line, so fragments can be concatenated straight into an `outbounds` array.

use crate::graph::ResolvedSelector;
use crate::link::{Obfs, ParsedNode, Protocol, TlsOptions, Transport};
use crate::prelude::*;
use anyhow::Context;
use std::collections::BTreeMap;

/// Flow some providers publish for VLESS over UDP 443; the engine wants it spelled out.
const UDP443_FLOW: &str = "xtls-rprx-vision-udp443";
const VISION_FLOW: &str = "xtls-rprx-vision";

/// Keys a selector option may not override.
const RESERVED_KEYS: [&str; 4] = ["tag", "type", "default", "outbounds"];
const INTERRUPT_KEY: &str = "interrupt_exist_connections";

#[derive(Serialize)]
struct NodeOutbound<'a> {
  tag: &'a str,
  #[serde(rename = "type")]
  kind: &'static str,
  server: &'a str,
  server_port: u16,
  #[serde(skip_serializing_if = "Option::is_none")]
  uuid: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  user: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  method: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  password: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  flow: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  packet_encoding: Option<&'static str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  security: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  alter_id: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  server_ports: Option<&'a [String]>,
  #[serde(skip_serializing_if = "Option::is_none")]
  up_mbps: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  down_mbps: Option<u32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  obfs: Option<&'a Obfs>,
  #[serde(skip_serializing_if = "Option::is_none")]
  private_key: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  private_key_path: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  private_key_passphrase: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  host_key: Option<&'a [String]>,
  #[serde(skip_serializing_if = "Option::is_none")]
  host_key_algorithms: Option<&'a [String]>,
  #[serde(skip_serializing_if = "Option::is_none")]
  client_version: Option<&'a str>,
  #[serde(skip_serializing_if = "Option::is_none")]
  transport: Option<&'a Transport>,
  #[serde(skip_serializing_if = "Option::is_none")]
  tls: Option<&'a TlsOptions>,
}

fn non_empty(list: &[String]) -> Option<&[String]> {
  Some(list).filter(|l| !l.is_empty())
}

impl<'a> NodeOutbound<'a> {
  fn new(node: &'a ParsedNode) -> Self {
    let mut out = NodeOutbound {
      tag: &node.tag,
      kind: node.scheme().outbound_type(),
      server: &node.server,
      server_port: node.port,
      uuid: None,
      user: None,
      method: None,
      password: None,
      flow: None,
      packet_encoding: None,
      security: None,
      alter_id: None,
      server_ports: None,
      up_mbps: None,
      down_mbps: None,
      obfs: None,
      private_key: None,
      private_key_path: None,
      private_key_passphrase: None,
      host_key: None,
      host_key_algorithms: None,
      client_version: None,
      transport: None,
      tls: None,
    };

    match &node.protocol {
      Protocol::Vless(p) => {
        out.uuid = Some(&p.uuid);
        if node.flow == UDP443_FLOW {
          out.flow = Some(VISION_FLOW);
          out.packet_encoding = Some("xudp");
          out.server_port = 443;
        } else if !node.flow.is_empty() {
          out.flow = Some(&node.flow);
        }
        out.transport = p.transport.as_ref();
        out.tls = p.tls.as_ref();
      }
      Protocol::Vmess(p) => {
        out.uuid = Some(&p.uuid);
        out.security = Some(&p.security).filter(|s| !s.is_empty()).map(String::as_str);
        out.alter_id = p.alter_id;
        out.transport = p.transport.as_ref();
        out.tls = p.tls.as_ref();
      }
      Protocol::Trojan(p) => {
        out.password = Some(&p.password);
        out.transport = p.transport.as_ref();
        out.tls = Some(&p.tls);
      }
      Protocol::Shadowsocks(p) => {
        out.method = Some(&p.method);
        out.password = Some(&p.password);
      }
      Protocol::Hysteria2(p) => {
        out.password = Some(&p.password).filter(|s| !s.is_empty()).map(String::as_str);
        out.server_ports = non_empty(&p.server_ports);
        out.up_mbps = p.up_mbps.filter(|&v| v > 0);
        out.down_mbps = p.down_mbps.filter(|&v| v > 0);
        out.obfs = p.obfs.as_ref();
        out.tls = Some(&p.tls);
      }
      Protocol::Ssh(p) => {
        out.user = Some(&p.user);
        out.password = p.password.as_deref();
        out.private_key = p.private_key.as_deref();
        out.private_key_path = p.private_key_path.as_deref();
        out.private_key_passphrase = p.private_key_passphrase.as_deref();
        out.host_key = non_empty(&p.host_key);
        out.host_key_algorithms = non_empty(&p.host_key_algorithms);
        out.client_version = p.client_version.as_deref();
      }
    }
    out
  }
}

#[derive(Serialize)]
struct SelectorOutbound<'a> {
  tag: &'a str,
  #[serde(rename = "type")]
  kind: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  default: Option<&'a str>,
  outbounds: &'a [SmolStr],
  #[serde(skip_serializing_if = "Option::is_none")]
  interrupt_exist_connections: Option<&'a serde_json::Value>,
  #[serde(flatten)]
  options: BTreeMap<&'a str, &'a serde_json::Value>,
}

impl<'a> SelectorOutbound<'a> {
  fn new(selector: &'a ResolvedSelector<'_>) -> Self {
    let config = selector.config;
    let mut options = BTreeMap::new();
    let mut interrupt = None;
    for (key, value) in config.options.iter() {
      if key == INTERRUPT_KEY {
        interrupt = Some(value);
      } else if RESERVED_KEYS.contains(&key) {
        warn!(
          "Selector '{}': option '{}' conflicts with a generated field, ignored",
          config.tag, key
        );
      } else {
        options.insert(key, value);
      }
    }

    SelectorOutbound {
      tag: &config.tag,
      kind: &config.kind,
      default: selector.default.as_deref(),
      outbounds: &selector.members,
      interrupt_exist_connections: interrupt,
      options,
    }
  }
}

/// Compact JSON object for one node.
pub fn node_json(node: &ParsedNode) -> Result<String> {
  serde_json::to_string(&NodeOutbound::new(node))
    .with_context(|| format!("failed to serialize node '{}'", node.tag))
}

pub fn selector_json(selector: &ResolvedSelector) -> Result<String> {
  serde_json::to_string(&SelectorOutbound::new(selector))
    .with_context(|| format!("failed to serialize selector '{}'", selector.config.tag))
}

/// `json` as an array element, with `comment` on the line above when there is one.
///
/// Neither part can contain `*/` afterwards, so labels never forge the region markers.
/// `json` must be serializer output: a `/` there only occurs inside strings, where `\/`
/// is a valid escape.
pub fn fragment(comment: &str, json: &str) -> String {
  let json = json.replace("*/", "*\\/");
  let comment = comment.trim();
  if comment.is_empty() {
    format!("\t{},", json)
  } else {
    // a newline would end the line comment and leak the rest into the JSON
    let comment = comment
      .replace(|c: char| c == '\n' || c == '\r', " ")
      .replace("/*", "/ *")
      .replace("*/", "* /");
    format!("\t// {}\n\t{},", comment, json)
  }
}

/// Node fragment, commented with its label.
pub fn node_fragment(node: &ParsedNode) -> Result<String> {
  Ok(fragment(&node.label, &node_json(node)?))
}

/// Selector fragment, commented with the selector's `comment`.
pub fn selector_fragment(selector: &ResolvedSelector) -> Result<String> {
  Ok(fragment(&selector.config.comment, &selector_json(selector)?))
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::config::OutboundConfig;
  use crate::graph::Scope;
  use crate::link::parse_node;
  use serde_json::{json, Value};

  fn node(uri: &str) -> ParsedNode {
    parse_node(uri, &[]).unwrap().unwrap()
  }

  /// Keys of a compact object in written order.
  fn keys(json: &str) -> Vec<String> {
    let value: serde_json::Map<String, Value> = serde_json::from_str(json).unwrap();
    let mut keys: Vec<String> = value.keys().cloned().collect();
    keys.sort_by_key(|k| json.find(&format!("\"{}\":", k)));
    keys
  }

  #[test]
  fn vless_field_order() {
    let n = node(
      "vless://id@nl.example.com:8443?security=reality&pbk=KEY&sid=01&sni=sni.example.com\
      &fp=chrome&alpn=h2,http/1.1&type=ws&path=%2Fws&host=cdn.example.com&flow=xtls-rprx-vision#NL",
    );
    let out = node_json(&n).unwrap();
    assert!(out.starts_with(
      r#"{"tag":"NL","type":"vless","server":"nl.example.com","server_port":8443,"uuid":"id","flow":"xtls-rprx-vision","transport":"#
    ));
    assert!(out.ends_with(
      r#""tls":{"enabled":true,"server_name":"sni.example.com","alpn":["h2","http/1.1"],"utls":{"enabled":true,"fingerprint":"chrome"},"reality":{"enabled":true,"public_key":"KEY","short_id":"01"}}}"#
    ));
  }

  #[test]
  fn udp443_flow_rewritten_only_in_output() {
    let n = node("vless://id@h.com:8443?flow=xtls-rprx-vision-udp443&sni=h.com#x");
    let value: Value = serde_json::from_str(&node_json(&n).unwrap()).unwrap();
    assert_eq!(value["flow"], "xtls-rprx-vision");
    assert_eq!(value["packet_encoding"], "xudp");
    assert_eq!(value["server_port"], 443);
    assert_eq!(n.flow, UDP443_FLOW);
  }

  #[test]
  fn shadowsocks_credentials_are_escaped() {
    let mut n = node("ss://YWVzLTI1Ni1nY206cGFzcw@h.com:8388#ss");
    if let Protocol::Shadowsocks(p) = &mut n.protocol {
      p.password = "p\"a\u{1}s\\s".to_string();
    }
    let out = node_json(&n).unwrap();
    let value: Value = serde_json::from_str(&out).unwrap();
    assert_eq!(value["password"], "p\"a\u{1}s\\s");
    assert_eq!(keys(&out), vec!["tag", "type", "server", "server_port", "method", "password"]);
    assert_eq!(value["type"], "shadowsocks");
  }

  #[test]
  fn hysteria2_ports_and_obfs() {
    let n = node("hysteria2://pw@h.example.com:443?mport=27200-28000&obfs=salamander&obfs-password=o#hy");
    let value: Value = serde_json::from_str(&node_json(&n).unwrap()).unwrap();
    assert_eq!(value["server_ports"], json!(["27200:28000"]));
    assert_eq!(value["obfs"], json!({"type": "salamander", "password": "o"}));
    assert_eq!(value["tls"]["enabled"], true);
  }

  #[test]
  fn node_round_trip() {
    for uri in [
      "trojan://pw@t.example.com:443#T",
      "ssh://root:pw@s.example.com:2222#S",
      "vless://id@v.example.com#V",
    ] {
      let n = node(uri);
      let value: Value = serde_json::from_str(&node_json(&n).unwrap()).unwrap();
      assert_eq!(value["tag"], n.tag.as_str());
      assert_eq!(value["type"], n.scheme().outbound_type());
      assert_eq!(value["server"], n.server.as_str());
      assert_eq!(value["server_port"], n.port);
    }
  }

  #[test]
  fn fragment_layout() {
    assert_eq!(fragment("", "{}"), "\t{},");
    assert_eq!(fragment("NL\nAmsterdam", "{}"), "\t// NL Amsterdam\n\t{},");
  }

  #[test]
  fn labels_cannot_forge_region_markers() {
    let node = node("trojan://pw@x.example.com:443#x%20%2F**%20%40ParserEND%20*%2F");
    assert_eq!(node.tag, "x /** @ParserEND */");

    let fragment = node_fragment(&node).unwrap();
    assert!(!fragment.contains(crate::splice::END_MARKER));
    assert!(!fragment.contains(crate::splice::START_MARKER));
    assert!(!fragment.contains("*/"));
    assert!(fragment.starts_with("\t// x / ** @ParserEND * /\n"));

    let json = fragment.lines().last().unwrap().trim().trim_end_matches(',');
    let value: Value = serde_json::from_str(json).unwrap();
    assert_eq!(value["tag"], "x /** @ParserEND */");
  }

  #[test]
  fn selector_fields_in_fixed_then_sorted_order() {
    let config: OutboundConfig = serde_json::from_str(
      r#"{"tag": "auto", "type": "urltest", "comment": "fastest",
          "options": {"url": "https://cp.example.com", "interval": "5m",
                      "interrupt_exist_connections": true, "tag": "nope"}}"#,
    )
    .unwrap();
    let selector = ResolvedSelector {
      config: &config,
      scope: Scope::Global,
      default: Some("NL-1".into()),
      members: vec!["direct-out".into(), "NL-1".into()],
    };

    let out = selector_fragment(&selector).unwrap();
    assert_eq!(
      out,
      "\t// fastest\n\t{\"tag\":\"auto\",\"type\":\"urltest\",\"default\":\"NL-1\",\
      \"outbounds\":[\"direct-out\",\"NL-1\"],\"interrupt_exist_connections\":true,\
      \"interval\":\"5m\",\"url\":\"https://cp.example.com\"},"
    );
  }
}
