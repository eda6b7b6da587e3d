use super::label::{sanitize_for_display, Label};
use super::{ParsedNode, Protocol, Scheme, TlsOptions, Transport, Utls, Vmess};
use crate::prelude::*;
use crate::utils::{decode_base64, repair_utf8, QueryParams};
use anyhow::{anyhow, bail, Context};

/// A JSON scalar as found in the wild: numbers and strings are used interchangeably.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
  Num(f64),
  Str(String),
  Other(#[allow(dead_code)] serde_json::Value),
}

impl Scalar {
  fn as_str(&self) -> &str {
    match self {
      Scalar::Str(s) => s.as_str(),
      _ => "",
    }
  }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct VmessJson {
  add: Option<Scalar>,
  port: Option<Scalar>,
  id: Option<Scalar>,
  ps: Option<Scalar>,
  scy: Option<Scalar>,
  aid: Option<Scalar>,
  net: Option<Scalar>,
  path: Option<Scalar>,
  host: Option<Scalar>,
  tls: Option<Scalar>,
  sni: Option<Scalar>,
  alpn: Option<Scalar>,
  fp: Option<Scalar>,
  insecure: Option<Scalar>,
}

fn text(field: &Option<Scalar>) -> &str {
  field.as_ref().map(Scalar::as_str).unwrap_or("")
}

/// `1`, `"1"` and `"true"` all enable a flag.
fn flag(field: &Option<Scalar>) -> bool {
  match field {
    Some(Scalar::Num(n)) => *n == 1.0,
    Some(Scalar::Str(s)) => matches!(s.trim(), "1" | "true"),
    _ => false,
  }
}

fn non_empty(field: &Option<Scalar>) -> Option<&str> {
  Some(text(field)).filter(|s| !s.is_empty())
}

impl VmessJson {
  fn port(&self) -> Option<u16> {
    match self.port.as_ref()? {
      Scalar::Num(n) if n.fract() == 0.0 && (0.0..=65535.0).contains(n) => Some(*n as u16),
      Scalar::Str(s) => s.trim().parse().ok(),
      _ => None,
    }
  }

  fn alter_id(&self) -> Option<u32> {
    let aid = match self.aid.as_ref()? {
      Scalar::Num(n) if *n >= 0.0 => *n as u32,
      Scalar::Str(s) => s.trim().parse().ok()?,
      _ => return None,
    };
    Some(aid).filter(|&n| n != 0)
  }
}

/// `payload` is everything after `vmess://`: base64 of a JSON object.
pub(super) fn parse(payload: &str) -> Result<ParsedNode> {
  let decoded = decode_base64(payload.trim()).context("failed to decode VMess base64")?;
  if decoded.is_empty() {
    bail!("VMess decoded content is empty");
  }
  let (json, _) = repair_utf8(decoded);
  let config: VmessJson = serde_json::from_str(&json).context("failed to parse VMess JSON")?;

  let mut missing = Vec::new();
  let server = non_empty(&config.add).map(String::from);
  if server.is_none() {
    missing.push("add");
  }
  let port = config.port();
  if port.is_none() {
    missing.push("port");
  }
  let uuid = non_empty(&config.id).map(String::from);
  if uuid.is_none() {
    missing.push("id");
  }
  let (server, port, uuid) = match (server, port, uuid) {
    (Some(server), Some(port), Some(uuid)) => (server, port, uuid),
    _ => return Err(anyhow!("missing required fields: {:?}", missing)),
  };

  let mut params = QueryParams::new();
  let security = non_empty(&config.scy).unwrap_or("auto").to_string();
  params.push("security", security.as_str());

  let network = match non_empty(&config.net).unwrap_or("tcp") {
    "xhttp" => "ws",
    other => other,
  };
  params.push("network", network);
  let path = non_empty(&config.path);
  let host = non_empty(&config.host);
  if let Some(path) = path {
    params.push("path", path);
  }
  if let Some(host) = host {
    params.push("host", host);
  }

  let tls = if text(&config.tls) == "tls" {
    let sni = non_empty(&config.sni).or(host).unwrap_or(&server).to_string();
    params.push("sni", sni.as_str());
    let mut tls = TlsOptions::enabled(Some(sni));
    if let Some(alpn) = non_empty(&config.alpn) {
      tls.alpn = crate::utils::split_list(alpn);
    }
    tls.utls = non_empty(&config.fp).map(Utls::new);
    tls.insecure = flag(&config.insecure);
    Some(tls)
  } else {
    None
  };

  let label = sanitize_for_display(text(&config.ps));
  let label = Label::derive(label, Scheme::Vmess, &server, port);

  let vmess = Vmess {
    uuid,
    security,
    alter_id: config.alter_id(),
    transport: Transport::new(network, path, host),
    tls,
  };

  Ok(ParsedNode {
    tag: label.tag,
    server,
    port,
    label: label.text,
    comment: label.comment,
    flow: String::new(),
    params,
    protocol: Protocol::Vmess(vmess),
  })
}
