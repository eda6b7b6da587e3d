use super::{ParsedNode, Protocol, Reality, Scheme, TlsOptions, Transport, UriParts, Utls, Vless};
use crate::prelude::*;
use crate::utils::QueryParams;

pub(super) fn parse(uri: &str) -> Result<ParsedNode> {
  let parts = UriParts::parse(uri, Scheme::Vless)?;
  let vless = Vless {
    uuid: parts.user().to_string(),
    transport: Transport::from_params(&parts.params),
    tls: tls(&parts.params, &parts.server),
  };
  Ok(parts.into_node(Protocol::Vless(vless)))
}

fn tls(params: &QueryParams, server: &str) -> Option<TlsOptions> {
  if params.get("security") == Some("none") {
    return None;
  }
  let sni = params.get("sni").unwrap_or(server);
  let mut tls = TlsOptions::enabled(Some(sni.to_string())).with_alpn(params);
  tls.utls = Some(Utls::new(params.get("fp").unwrap_or("random")));
  tls.insecure = params.is_truthy("allowInsecure") || params.is_truthy("insecure");
  if let Some(public_key) = params.get("pbk") {
    tls.reality = Some(Reality {
      enabled: true,
      public_key: public_key.to_string(),
      short_id: params.get("sid").unwrap_or("").to_string(),
    });
  }
  Some(tls)
}

#[cfg(test)]
mod test {
  use crate::link::{parse_node, Protocol};

  #[test]
  fn reality_link() {
    let node = parse_node(
      "vless://4a3ecdd3-0000-4000-8000-000000000001@nl.example.com:443\
      ?security=reality&sni=www.microsoft.com&fp=chrome&pbk=PUBKEY&sid=ab12\
      &type=grpc&serviceName=grpc-svc&flow=xtls-rprx-vision#NL%20Amsterdam",
      &[],
    )
    .unwrap()
    .unwrap();

    assert_eq!(node.tag, "NL Amsterdam");
    assert_eq!(node.flow, "xtls-rprx-vision");
    let Protocol::Vless(vless) = &node.protocol else {
      panic!("expected vless, got {:?}", node.protocol);
    };
    assert_eq!(vless.uuid, "4a3ecdd3-0000-4000-8000-000000000001");

    let tls = vless.tls.as_ref().unwrap();
    assert_eq!(tls.server_name.as_deref(), Some("www.microsoft.com"));
    assert_eq!(tls.utls.as_ref().unwrap().fingerprint, "chrome");
    let reality = tls.reality.as_ref().unwrap();
    assert_eq!(reality.public_key, "PUBKEY");
    assert_eq!(reality.short_id, "ab12");

    let transport = vless.transport.as_ref().unwrap();
    assert_eq!(transport.kind, "grpc");
    assert_eq!(transport.service_name.as_deref(), Some("grpc-svc"));
  }

  #[test]
  fn defaults_to_server_name_and_random_fingerprint() {
    let node = parse_node("vless://id@de.example.com#DE", &[]).unwrap().unwrap();
    assert_eq!(node.port, 443);
    let Protocol::Vless(vless) = &node.protocol else {
      panic!("expected vless");
    };
    let tls = vless.tls.as_ref().unwrap();
    assert_eq!(tls.server_name.as_deref(), Some("de.example.com"));
    assert_eq!(tls.utls.as_ref().unwrap().fingerprint, "random");
    assert!(tls.reality.is_none());
    assert!(vless.transport.is_none());
  }

  #[test]
  fn security_none_disables_tls() {
    let node = parse_node("vless://id@h.com:80?security=none&type=ws&path=%2Fws#x", &[])
      .unwrap()
      .unwrap();
    let Protocol::Vless(vless) = &node.protocol else {
      panic!("expected vless");
    };
    assert!(vless.tls.is_none());
    assert_eq!(vless.transport.as_ref().unwrap().path.as_deref(), Some("/ws"));
  }
}
