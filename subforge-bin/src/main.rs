use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fern::colors::{Color, ColoredLevelConfig};
use log::{info, warn, LevelFilter};
use std::path::PathBuf;
use subforge::{emit, link};
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[clap(name = "subforge", version, about = "Compiles proxy subscriptions into outbound config")]
struct Cli {
  /// Debug logging
  #[clap(short, long, global = true)]
  verbose: bool,
  /// Log level (error, warn, info, debug, trace), overrides --verbose
  #[clap(long, global = true)]
  log_level: Option<LevelFilter>,
  #[clap(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Regenerate the managed region of a config file in place
  Update { config: PathBuf },
  /// Print the generated outbounds without writing
  Preview { config: PathBuf },
  /// Print the outbound JSON of individual links
  Parse {
    #[clap(required = true)]
    uris: Vec<String>,
  },
}

fn setup_logger(level: LevelFilter) -> Result<()> {
  let colors = ColoredLevelConfig::new()
    .info(Color::Green)
    .debug(Color::Blue)
    .trace(Color::BrightBlack);
  fern::Dispatch::new()
    .format(move |out, message, record| {
      out.finish(format_args!(
        "{} {:<5} [{}] {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        colors.color(record.level()),
        record.target(),
        message
      ))
    })
    .level(LevelFilter::Warn)
    .level_for("subforge", level)
    .level_for("subforge_bin", level)
    .chain(std::io::stderr())
    .apply()
    .context("failed to install logger")?;
  Ok(())
}

fn parse_links(uris: &[String]) -> Result<()> {
  for uri in uris {
    match link::parse_node(uri, &[]) {
      Ok(Some(node)) => println!("{}", emit::node_fragment(&node)?),
      Ok(None) => {}
      Err(err) => warn!("{}: {:#}", uri, err),
    }
  }
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let level = cli.log_level.unwrap_or(if cli.verbose {
    LevelFilter::Debug
  } else {
    LevelFilter::Info
  });
  setup_logger(level)?;

  let cancel = CancellationToken::new();
  let on_interrupt = cancel.clone();
  tokio::spawn(async move {
    if signal::ctrl_c().await.is_ok() {
      info!("Ctrl-C received, cancelling...");
      on_interrupt.cancel();
    }
  });

  match cli.command {
    Command::Update { config } => {
      let out = subforge::run_update(&config, &cancel).await?;
      if !out.unprocessed.is_empty() {
        warn!("{} selector(s) left out because of a cycle", out.unprocessed.len());
      }
    }
    Command::Preview { config } => {
      let out = subforge::run_preview(&config, &cancel).await?;
      println!("{}", out.content());
    }
    Command::Parse { uris } => parse_links(&uris)?,
  }
  Ok(())
}
