pub mod app;
pub mod config;
pub mod emit;
pub mod graph;
pub mod link;
pub mod matching;
pub mod source;
pub mod splice;
pub mod utils;

use crate::app::{Compiler, GeneratedOutbounds};
use crate::prelude::*;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Logs progress messages, used when the caller has no UI of its own.
fn log_progress(percent: f64, message: &str) {
  if percent < 0.0 {
    error!("{}", message);
  } else {
    info!("[{:>3.0}%] {}", percent, message);
  }
}

/// Regenerates the managed region of the config file at `path` over HTTP.
pub async fn run_update(path: &Path, cancel: &CancellationToken) -> Result<GeneratedOutbounds> {
  let compiler = Compiler::with_http()?;
  compiler
    .update_config_file(path, cancel, &mut log_progress)
    .await
}

/// Same as [`run_update`] without touching the file.
pub async fn run_preview(path: &Path, cancel: &CancellationToken) -> Result<GeneratedOutbounds> {
  let config = config::load_file(path).await?;
  let compiler = Compiler::with_http()?;
  compiler.generate(&config, cancel, &mut log_progress).await
}

pub mod prelude {
  pub use anyhow::Result;
  pub use async_trait::async_trait;
  pub use log::*;
  pub use serde::{Deserialize, Serialize};
  pub use smol_str::SmolStr;
  pub use std::collections::HashMap;
  pub use std::sync::Arc;
}
