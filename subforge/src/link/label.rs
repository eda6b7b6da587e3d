use super::Scheme;
use crate::prelude::*;
use crate::utils::{query_unescape, repair_utf8};

/// Flags published by providers that map to a different canonical flag.
const FLAG_REWRITES: [(&str, &str); 1] = [("\u{1F1EA}\u{1F1F3}", "\u{1F1EC}\u{1F1E7}")];

/// Decodes a raw (still escaped) URI fragment into display text.
pub fn decode_fragment(raw: &str) -> String {
  let (text, repaired) = repair_utf8(query_unescape(raw));
  if repaired {
    debug!("Dropped invalid UTF-8 from label {:?}", raw);
  }
  sanitize_for_display(&text)
}

/// Strips control characters except tab, CR and LF.
pub fn sanitize_for_display(input: &str) -> String {
  input
    .chars()
    .filter(|&c| !(c.is_control() && c as u32 <= 0x7f) || matches!(c, '\t' | '\r' | '\n'))
    .collect()
}

pub fn normalize_flag_tag(tag: &str) -> String {
  FLAG_REWRITES
    .iter()
    .fold(tag.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// `<scheme>-<server>-<port>`, used when a link carries no usable label.
pub fn default_tag(scheme: Scheme, server: &str, port: u16) -> String {
  format!("{}-{}-{}", scheme, server, port)
}

/// Display label plus the tag and comment derived from it.
#[derive(Debug, Clone, PartialEq)]
pub struct Label {
  pub text: String,
  pub tag: SmolStr,
  pub comment: String,
}

impl Label {
  /// `"<tag> | <comment>"` splits on the first `|`; without one, tag and comment
  /// are both the whole label.
  pub fn derive(text: String, scheme: Scheme, server: &str, port: u16) -> Self {
    let trimmed = text.trim();
    let (tag, comment) = match trimmed.split_once('|') {
      Some((tag, comment)) => (tag.trim().to_string(), comment.trim().to_string()),
      None => (trimmed.to_string(), trimmed.to_string()),
    };

    let (tag, comment) = if tag.is_empty() {
      let fallback = default_tag(scheme, server, port);
      let comment = if comment.is_empty() {
        fallback.clone()
      } else {
        comment
      };
      (fallback, comment)
    } else {
      (tag, comment)
    };

    Self {
      tag: SmolStr::from(normalize_flag_tag(&tag)),
      text,
      comment,
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn fragment_decoding() {
    assert_eq!(decode_fragment("DE%20Frankfurt"), "DE Frankfurt");
    assert_eq!(decode_fragment("a+b"), "a b");
    assert_eq!(decode_fragment("%F0%9F%87%A9%F0%9F%87%AA"), "🇩🇪");
    assert_eq!(decode_fragment("x%FFy"), "xy");
    assert_eq!(decode_fragment("a%07b%09c"), "ab\tc");
  }

  #[test]
  fn split_on_first_bar() {
    let l = Label::derive("NL-1 | fast | cheap".into(), Scheme::Vless, "h", 443);
    assert_eq!(l.tag, "NL-1");
    assert_eq!(l.comment, "fast | cheap");

    let l = Label::derive("  Plain  ".into(), Scheme::Vless, "h", 443);
    assert_eq!(l.tag, "Plain");
    assert_eq!(l.comment, "Plain");
  }

  #[test]
  fn empty_label_gets_synthetic_tag() {
    let l = Label::derive(String::new(), Scheme::Shadowsocks, "1.2.3.4", 8388);
    assert_eq!(l.tag, "ss-1.2.3.4-8388");
    assert_eq!(l.comment, "ss-1.2.3.4-8388");

    let l = Label::derive("| note".into(), Scheme::Trojan, "h", 443);
    assert_eq!(l.tag, "trojan-h-443");
    assert_eq!(l.comment, "note");
  }

  #[test]
  fn legacy_flag_rewritten() {
    let l = Label::derive("\u{1F1EA}\u{1F1F3} London".into(), Scheme::Vless, "h", 443);
    assert_eq!(l.tag, "\u{1F1EC}\u{1F1E7} London");
    assert_eq!(l.text, "\u{1F1EA}\u{1F1F3} London");
  }
}
