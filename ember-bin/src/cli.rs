use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt, reload};

use ember_config::{ConfigLoader, EmberConfig};
use ember_core::{EmberError, Event, IncomingMessage, Result};
use ember_plugin::Plugin;
use ember_runtime::AgentRuntime;

use crate::loopback::LoopbackPlugin;

const SOURCE: &str = "cli";
const CHANNEL: &str = "terminal";

/// Ember: a platform-agnostic agent runtime
#[derive(Parser)]
#[command(name = "ember", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to ember.toml config file
    #[arg(short, long, global = true, env = "EMBER_CONFIG")]
    config: Option<PathBuf>,

    /// Log level override (e.g. debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable verbose output (debug logging)
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Suppress all log output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read messages from stdin, one per line, and print the agent's replies
    Run {
        /// Platform user id the lines are attributed to
        #[arg(short, long, default_value = "local-user")]
        user: String,
    },
    /// Show the resolved configuration
    Config {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let loader = ConfigLoader::load(self.config.as_deref())?;
        let config = loader.get();

        // --verbose > --quiet > --log-level > config
        let override_level = if self.verbose {
            Some("debug")
        } else if self.quiet {
            Some("error")
        } else {
            self.log_level.as_deref()
        };
        let log_level = override_level.unwrap_or(&config.logging.level);
        let filter = init_logging(log_level, &config.logging.format);

        // A level from the config file follows edits to that file.
        if override_level.is_none() && std::env::var_os("RUST_LOG").is_none() {
            loader.on_reload(move |config| {
                let level = &config.logging.level;
                match filter.reload(EnvFilter::new(level)) {
                    Ok(()) => info!(level = %level, "log level updated"),
                    Err(e) => warn!(error = %e, "could not update log level"),
                }
            });
        }

        match self.command {
            Commands::Run { user } => cmd_run(&loader, user).await,
            Commands::Config { json } => cmd_config(&config, json),
        }
    }
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

fn init_logging(level: &str, format: &str) -> FilterHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (filter, handle) = reload::Layer::new(filter);
    // Logs go to stderr so stdout carries only replies.
    let output = match format {
        "json" => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        "compact" => fmt::layer()
            .compact()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
        _ => fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed(),
    };
    tracing_subscriber::registry().with(filter).with(output).init();
    handle
}

fn cmd_config(config: &EmberConfig, json: bool) -> Result<()> {
    let rendered = if json {
        serde_json::to_string_pretty(config)?
    } else {
        toml::to_string_pretty(config).map_err(|e| EmberError::Config(e.to_string()))?
    };
    println!("{rendered}");
    Ok(())
}

async fn cmd_run(loader: &ConfigLoader, user: String) -> Result<()> {
    let config = loader.get();
    let grace = config.agent.model_timeout();
    // Only logging follows file edits; everything else needs a restart.
    let _watcher = if loader.path().exists() {
        match loader.watch() {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(error = %e, "config hot-reload unavailable");
                None
            }
        }
    } else {
        None
    };
    let runtime = AgentRuntime::new(config).await?;

    let plugins: Vec<Arc<dyn Plugin>> = vec![Arc::new(LoopbackPlugin::new())];
    let report = runtime.load_plugins(&plugins).await;
    for skipped in &report.skipped {
        warn!(plugin = %skipped.name, reason = %skipped.reason, "plugin not loaded");
    }

    // Print replies for this adapter and count finished runs.
    let mut events = runtime.event_bus().subscribe();
    let (runs_tx, mut runs_rx) = watch::channel(0usize);
    let printer = tokio::spawn(async move {
        let mut finished = 0usize;
        loop {
            match events.recv().await {
                Ok(Event::MessageSent {
                    source, content, ..
                }) if source == SOURCE => {
                    if let Some(text) = content.text.filter(|t| !t.is_empty()) {
                        println!("{text}");
                    }
                }
                Ok(Event::RunEnded { .. }) => {
                    finished += 1;
                    let _ = runs_tx.send(finished);
                }
                Ok(Event::Shutdown) | Err(RecvError::Closed) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => warn!(skipped = n, "event printer lagged"),
            }
        }
    });

    runtime.start()?;
    info!(user = %user, "reading messages from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut submitted = 0usize;
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            // EOF: let in-flight runs finish before shutting down.
            let done = tokio::time::timeout(grace, runs_rx.wait_for(|n| *n >= submitted))
                .await
                .is_ok();
            if !done {
                let pending = submitted.saturating_sub(*runs_rx.borrow());
                warn!(pending, "gave up waiting for replies");
            }
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "exit" || text == "quit" {
            break;
        }
        runtime
            .submit(IncomingMessage::text(SOURCE, CHANNEL, &user, text))
            .await?;
        submitted += 1;
    }

    runtime.stop().await?;
    if let Err(e) = printer.await {
        warn!(error = %e, "event printer ended abnormally");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_user() {
        let cli = Cli::try_parse_from(["ember", "run", "--user", "ada", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Run { ref user } if user == "ada"));
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(Cli::try_parse_from(["ember", "config", "-v", "-q"]).is_err());
    }
}
