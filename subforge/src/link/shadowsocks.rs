use super::{ParsedNode, Protocol, Scheme, Shadowsocks, UriParts};
use crate::prelude::*;
use crate::utils::{decode_base64_string, percent_decode};
use anyhow::bail;

/// Ciphers the proxy engine accepts. Anything else would make it refuse the whole config.
pub const SUPPORTED_METHODS: [&str; 9] = [
  "2022-blake3-aes-128-gcm",
  "2022-blake3-aes-256-gcm",
  "2022-blake3-chacha20-poly1305",
  "none",
  "aes-128-gcm",
  "aes-192-gcm",
  "aes-256-gcm",
  "chacha20-ietf-poly1305",
  "xchacha20-ietf-poly1305",
];

pub fn is_supported_method(method: &str) -> bool {
  SUPPORTED_METHODS.contains(&method)
}

/// Splits `method:password`, accepting both base64 and plain userinfo.
fn credentials(userinfo: &str) -> Option<(String, String)> {
  let userinfo = percent_decode(userinfo);
  let plain = match decode_base64_string(&userinfo) {
    Ok(decoded) if decoded.contains(':') => decoded,
    _ => userinfo,
  };
  let (method, password) = plain.split_once(':')?;
  Some((method.to_string(), password.to_string()))
}

/// `body` is everything after `ss://`.
pub(super) fn parse(body: &str) -> Result<ParsedNode> {
  let (credentials, address) = match body.split_once('@') {
    Some((userinfo, rest)) if !userinfo.is_empty() => (credentials(userinfo), rest.to_string()),
    _ => legacy(body)?,
  };

  let (method, password) = match credentials {
    Some((method, password)) if !method.is_empty() && !password.is_empty() => {
      (method, password)
    }
    _ => bail!("SS link missing required method or password"),
  };
  if !is_supported_method(&method) {
    bail!("unsupported Shadowsocks encryption method: {}", method);
  }
  debug!(
    "Extracted SS credentials: method={}, password length={}",
    method,
    password.len()
  );

  let parts = UriParts::parse(&format!("ss://{}", address), Scheme::Shadowsocks)?;
  if parts.params.get("plugin").is_some() {
    warn!("Ignoring unsupported SS plugin on {}:{}", parts.server, parts.port);
  }
  Ok(parts.into_node(Protocol::Shadowsocks(Shadowsocks { method, password })))
}

/// Pre-SIP002 form: `ss://base64(method:password@host:port)#label`.
fn legacy(body: &str) -> Result<(Option<(String, String)>, String)> {
  let (main, fragment) = match body.split_once('#') {
    Some((main, fragment)) => (main, format!("#{}", fragment)),
    None => (body, String::new()),
  };
  let decoded = match decode_base64_string(main) {
    Ok(decoded) => decoded,
    Err(_) => bail!("SS link is neither SIP002 nor base64 encoded"),
  };
  match decoded.rsplit_once('@') {
    Some((creds, host)) => {
      let creds = creds
        .split_once(':')
        .map(|(m, p)| (m.to_string(), p.to_string()));
      Ok((creds, format!("{}{}", host, fragment)))
    }
    None => bail!("SS link is missing the server address"),
  }
}
