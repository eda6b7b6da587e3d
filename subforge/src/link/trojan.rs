use super::{ParsedNode, Protocol, Scheme, TlsOptions, Transport, Trojan, UriParts, Utls};
use crate::prelude::*;

pub(super) fn parse(uri: &str) -> Result<ParsedNode> {
  let parts = UriParts::parse(uri, Scheme::Trojan)?;
  let params = &parts.params;

  let sni = params
    .get("sni")
    .or_else(|| params.get("peer"))
    .unwrap_or(&parts.server);
  let mut tls = TlsOptions::enabled(Some(sni.to_string())).with_alpn(params);
  tls.utls = params.get("fp").map(Utls::new);
  tls.insecure = params.is_truthy("allowInsecure") || params.is_truthy("insecure");

  let trojan = Trojan {
    password: parts.user().to_string(),
    transport: Transport::from_params(params),
    tls,
  };
  Ok(parts.into_node(Protocol::Trojan(trojan)))
}

#[cfg(test)]
mod test {
  use crate::link::{parse_node, Protocol};

  #[test]
  fn trojan_with_ws() {
    let node = parse_node(
      "trojan://pa%24%24@tr.example.com:443?type=ws&path=%2Ftr&host=cdn.example.com\
      &peer=front.example.com&allowInsecure=1#TR%20%7C%20backup",
      &[],
    )
    .unwrap()
    .unwrap();
    assert_eq!(node.tag, "TR");
    assert_eq!(node.comment, "backup");
    let Protocol::Trojan(trojan) = &node.protocol else {
      panic!("expected trojan");
    };
    assert_eq!(trojan.password, "pa$$");
    assert_eq!(trojan.tls.server_name.as_deref(), Some("front.example.com"));
    assert!(trojan.tls.insecure);
    assert!(trojan.tls.utls.is_none());
    let transport = trojan.transport.as_ref().unwrap();
    assert_eq!(transport.kind, "ws");
    assert_eq!(transport.path.as_deref(), Some("/tr"));
  }
}
