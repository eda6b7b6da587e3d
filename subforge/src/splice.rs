use crate::config::{block_regex, ParserConfig};
use crate::prelude::*;
use anyhow::{anyhow, bail, Context};
use std::path::{Path, PathBuf};

pub const START_MARKER: &str = "/** @ParserSTART */";
pub const END_MARKER: &str = "/** @ParserEND */";

/// Replaces the managed region of `content` with `generated` and, when `config` is given,
/// rewrites the `@ParserConfig` block. Everything else is kept byte for byte.
pub fn splice(content: &str, generated: &str, config: Option<&ParserConfig>) -> Result<String> {
  let start = content
    .find(START_MARKER)
    .ok_or_else(|| anyhow!("marker {} not found", START_MARKER))?;
  let region = start + START_MARKER.len();
  let end = match content[region..].find(END_MARKER) {
    Some(offset) => region + offset,
    None if content.contains(END_MARKER) => {
      bail!("marker {} appears before {}", END_MARKER, START_MARKER)
    }
    None => bail!("marker {} not found", END_MARKER),
  };

  let mut output = String::with_capacity(content.len() + generated.len());
  output.push_str(&content[..region]);
  output.push('\n');
  output.push_str(generated);
  output.push('\n');
  output.push_str(&content[end..]);

  match config {
    Some(config) => replace_block(&output, config),
    None => Ok(output),
  }
}

fn replace_block(content: &str, config: &ParserConfig) -> Result<String> {
  let captures = match block_regex()?.captures(content) {
    Some(captures) => captures,
    None => {
      warn!("@ParserConfig block not found, metadata left as is");
      return Ok(content.to_string());
    }
  };
  let (whole, opening, closing) = match (captures.get(0), captures.get(1), captures.get(3)) {
    (Some(whole), Some(opening), Some(closing)) => (whole, opening, closing),
    _ => bail!("malformed @ParserConfig block"),
  };

  let mut output = String::with_capacity(content.len());
  output.push_str(&content[..whole.start()]);
  output.push_str(opening.as_str());
  output.push_str(&config.render_json()?);
  output.push('\n');
  output.push_str(closing.as_str());
  output.push_str(&content[whole.end()..]);
  Ok(output)
}

fn temp_path(path: &Path) -> Result<PathBuf> {
  let name = path
    .file_name()
    .ok_or_else(|| anyhow!("{} is not a file path", path.display()))?;
  let mut temp = name.to_os_string();
  temp.push(".subforge-tmp");
  Ok(path.with_file_name(temp))
}

/// Writes through a sibling temporary file renamed over `path`, so readers never see
/// a half written file.
pub async fn write_atomic(path: &Path, content: &str) -> Result<()> {
  let temp = temp_path(path)?;
  tokio::fs::write(&temp, content)
    .await
    .with_context(|| format!("failed to write {}", temp.display()))?;

  if let Ok(metadata) = tokio::fs::metadata(path).await {
    if let Err(err) = tokio::fs::set_permissions(&temp, metadata.permissions()).await {
      debug!("Could not copy permissions to {}: {}", temp.display(), err);
    }
  }

  if let Err(err) = tokio::fs::rename(&temp, path).await {
    let _ = tokio::fs::remove_file(&temp).await;
    return Err(err).with_context(|| format!("failed to replace {}", path.display()));
  }
  Ok(())
}

/// Splices `generated` into the file at `path`. On any error the file is left untouched.
pub async fn write_to_config(
  path: &Path,
  generated: &str,
  config: Option<&ParserConfig>,
) -> Result<()> {
  let content = tokio::fs::read_to_string(path)
    .await
    .with_context(|| format!("failed to read {}", path.display()))?;
  let updated = splice(&content, generated, config)?;
  write_atomic(path, &updated).await?;
  debug!("Wrote {} bytes to {}", updated.len(), path.display());
  Ok(())
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::config::extract_parser_config;

  const HOST: &str = "{\n  /** @ParserConfig\n  {\"ParserConfig\": {\"version\": 4, \"parser\": {\"reload\": \"2h\"}}}\n  */\n  \"outbounds\": [\n    /** @ParserSTART */\n    {\"tag\": \"old\"},\n    /** @ParserEND */\n    {\"tag\": \"direct-out\", \"type\": \"direct\"}\n  ]\n}\n";

  #[test]
  fn replaces_region_only() {
    let out = splice(HOST, "\t{\"tag\":\"new\"},", None).unwrap();
    assert!(!out.contains("\"old\""));
    assert!(out.contains("/** @ParserSTART */\n\t{\"tag\":\"new\"},\n/** @ParserEND */"));
    let tail = &HOST[HOST.find(END_MARKER).unwrap()..];
    assert!(out.ends_with(tail));
    assert!(out.starts_with(&HOST[..HOST.find(START_MARKER).unwrap()]));
  }

  #[test]
  fn missing_or_swapped_markers() {
    assert!(splice("{}", "x", None).is_err());
    assert!(splice(&HOST.replace(END_MARKER, ""), "x", None).is_err());
    let swapped = format!("{} {}", END_MARKER, START_MARKER);
    assert!(splice(&swapped, "x", None).is_err());
  }

  #[test]
  fn end_marker_in_generated_label_is_inert() {
    let uri = "trojan://pw@x.example.com:443#x%20%2F**%20%40ParserEND%20*%2F";
    let node = crate::link::parse_node(uri, &[]).unwrap().unwrap();
    let generated = crate::emit::node_fragment(&node).unwrap();

    let once = splice(HOST, &generated, None).unwrap();
    let twice = splice(&once, "\t{\"tag\":\"new\"},", None).unwrap();
    assert_eq!(twice.matches(END_MARKER).count(), 1);
    assert!(!twice.contains("ParserEND *"));
    assert!(twice.contains("/** @ParserSTART */\n\t{\"tag\":\"new\"},\n/** @ParserEND */\n    {\"tag\": \"direct-out\""));
  }

  #[test]
  fn end_marker_searched_after_start() {
    let content = format!("{} {} x {}", END_MARKER, START_MARKER, END_MARKER);
    let out = splice(&content, "y", None).unwrap();
    assert_eq!(out, format!("{} {}\ny\n{}", END_MARKER, START_MARKER, END_MARKER));
  }

  #[test]
  fn rewrites_metadata_block() {
    let mut config = extract_parser_config(HOST).unwrap();
    config.parser.last_updated = "2024-01-01T00:00:00Z".to_string();
    config.proxies.push(Default::default());
    config.proxies[0].tag_postfix = Some(" {$num}".to_string());

    let out = splice(HOST, "", Some(&config)).unwrap();
    let reparsed = extract_parser_config(&out).unwrap();
    assert_eq!(reparsed, config);
    assert!(out.starts_with("{\n  /** @ParserConfig\n{\n  \"ParserConfig\""));
    assert!(out.contains("{$num}"));
  }

  #[tokio::test]
  async fn write_leaves_file_untouched_on_error() {
    let dir = std::env::temp_dir().join(format!("subforge-splice-{}", std::process::id()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join("config.json");

    tokio::fs::write(&path, "{\"outbounds\": []}").await.unwrap();
    assert!(write_to_config(&path, "x", None).await.is_err());
    assert_eq!(
      tokio::fs::read_to_string(&path).await.unwrap(),
      "{\"outbounds\": []}"
    );

    tokio::fs::write(&path, HOST).await.unwrap();
    write_to_config(&path, "\t{\"tag\":\"n\"},", None).await.unwrap();
    let written = tokio::fs::read_to_string(&path).await.unwrap();
    assert!(written.contains("{\"tag\":\"n\"}"));
    assert!(!temp_path(&path).unwrap().exists());

    tokio::fs::remove_dir_all(&dir).await.unwrap();
  }
}
