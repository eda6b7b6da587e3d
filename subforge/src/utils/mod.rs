use anyhow::{anyhow, Result};
use percent_encoding::percent_decode_str;

/// Decoding order used for every base64 payload found in links and subscription bodies.
/// Publishers mix alphabets and padding freely, so the first config that decodes wins.
const BASE64_FALLBACKS: [base64::Config; 4] = [
  base64::URL_SAFE_NO_PAD,
  base64::STANDARD_NO_PAD,
  base64::URL_SAFE,
  base64::STANDARD,
];

pub fn decode_base64(input: &str) -> Result<Vec<u8>> {
  let mut last_err = None;
  for config in BASE64_FALLBACKS.iter() {
    match base64::decode_config(input, *config) {
      Ok(decoded) => return Ok(decoded),
      Err(err) => last_err = Some(err),
    }
  }
  match last_err {
    Some(err) => Err(anyhow!("invalid base64: {}", err)),
    None => Err(anyhow!("invalid base64")),
  }
}

pub fn decode_base64_string(input: &str) -> Result<String> {
  let decoded = decode_base64(input)?;
  Ok(repair_utf8(decoded).0)
}

/// Turns arbitrary bytes into a `String`, dropping invalid UTF-8 sequences.
/// The flag is true when something had to be dropped.
pub fn repair_utf8(bytes: Vec<u8>) -> (String, bool) {
  match String::from_utf8(bytes) {
    Ok(s) => (s, false),
    Err(err) => {
      let bytes = err.into_bytes();
      let mut fixed = String::with_capacity(bytes.len());
      let mut rest = &bytes[..];
      while !rest.is_empty() {
        match std::str::from_utf8(rest) {
          Ok(valid) => {
            fixed.push_str(valid);
            break;
          }
          Err(err) => {
            let (valid, tail) = rest.split_at(err.valid_up_to());
            // the prefix is valid, so this borrows without replacing anything
            fixed.push_str(&String::from_utf8_lossy(valid));
            let invalid = err.error_len().unwrap_or(tail.len());
            rest = &tail[invalid..];
          }
        }
      }
      (fixed, true)
    }
  }
}

/// Percent-decodes `input`, returning it untouched when the result is not valid UTF-8.
pub fn percent_decode(input: &str) -> String {
  match percent_decode_str(input).decode_utf8() {
    Ok(decoded) => decoded.into_owned(),
    Err(_) => input.to_string(),
  }
}

/// Query-string flavoured decoding: `+` means space.
pub fn query_unescape(input: &str) -> Vec<u8> {
  let plus_free = input.replace('+', " ");
  percent_decode_str(&plus_free).collect()
}

/// Ordered multi-valued query parameters, as they appeared in the link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParams {
  pairs: Vec<(String, String)>,
}

impl QueryParams {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn from_url(url: &url::Url) -> Self {
    Self {
      pairs: url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect(),
    }
  }

  /// First non-empty value for `key`.
  pub fn get(&self, key: &str) -> Option<&str> {
    self.pairs
      .iter()
      .find(|(k, v)| k == key && !v.is_empty())
      .map(|(_, v)| v.as_str())
  }

  pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    self.pairs
      .iter()
      .filter(move |(k, _)| k == key)
      .map(|(_, v)| v.as_str())
  }

  pub fn is_truthy(&self, key: &str) -> bool {
    matches!(self.get(key), Some("1") | Some("true"))
  }

  pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.pairs.push((key.into(), value.into()));
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
    self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
  }

  pub fn is_empty(&self) -> bool {
    self.pairs.is_empty()
  }
}

/// Splits a comma separated list, trimming entries and dropping empty ones.
pub fn split_list(input: &str) -> Vec<String> {
  input
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(String::from)
    .collect()
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn base64_fallbacks() {
    // url-safe alphabet, no padding
    assert_eq!(decode_base64("Pz8_").unwrap(), b"???");
    // standard alphabet, padded
    assert_eq!(decode_base64("Pz8/Pw==").unwrap(), b"????");
    assert_eq!(decode_base64("YWVzLTI1Ni1nY206cGFzcw").unwrap(), b"aes-256-gcm:pass");
    assert!(decode_base64("not base64 at all!").is_err());
  }

  #[test]
  fn repair_drops_invalid_sequences() {
    let (fixed, repaired) = repair_utf8(vec![b'a', 0xff, b'b']);
    assert_eq!(fixed, "ab");
    assert!(repaired);

    let mut mixed = "a\u{FFFD}".as_bytes().to_vec();
    mixed.extend_from_slice(&[0xe2, 0x82, b'z']);
    let (fixed, repaired) = repair_utf8(mixed);
    assert_eq!(fixed, "a\u{FFFD}z");
    assert!(repaired);

    let (kept, repaired) = repair_utf8("ünï".as_bytes().to_vec());
    assert_eq!(kept, "ünï");
    assert!(!repaired);
  }

  #[test]
  fn query_params_first_non_empty() {
    let url = url::Url::parse("vless://id@host:443?sni=&sni=a.com&fp=chrome").unwrap();
    let params = QueryParams::from_url(&url);
    assert_eq!(params.get("sni"), Some("a.com"));
    assert_eq!(params.get("fp"), Some("chrome"));
    assert_eq!(params.get("pbk"), None);
    assert_eq!(params.get_all("sni").count(), 2);
  }

  #[test]
  fn list_splitting() {
    assert_eq!(split_list(" a, ,b ,"), vec!["a".to_string(), "b".to_string()]);
  }
}
