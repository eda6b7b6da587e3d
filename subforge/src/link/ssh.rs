use super::{ParsedNode, Protocol, Scheme, Ssh, UriParts};
use crate::prelude::*;
use crate::utils::split_list;

pub(super) fn parse(uri: &str) -> Result<ParsedNode> {
  let parts = UriParts::parse(uri, Scheme::Ssh)?;
  let params = &parts.params;
  let owned = |key: &str| params.get(key).map(String::from);

  let private_key = owned("private_key");
  // an inline key wins over a key path
  let private_key_path = match private_key {
    Some(_) => None,
    None => owned("private_key_path"),
  };

  let ssh = Ssh {
    user: parts.user().to_string(),
    password: parts.password.clone().filter(|p| !p.is_empty()),
    private_key,
    private_key_path,
    private_key_passphrase: owned("private_key_passphrase"),
    host_key: params.get("host_key").map(split_list).unwrap_or_default(),
    host_key_algorithms: params
      .get("host_key_algorithms")
      .map(split_list)
      .unwrap_or_default(),
    client_version: owned("client_version"),
  };
  Ok(parts.into_node(Protocol::Ssh(ssh)))
}
