//! AMT gateway CLI
//!
//! Receives a multicast stream natively or through an AMT relay and writes
//! the payloads to a file or stdout.

mod config;
mod progress;

use amt_core::TimeSeededNonce;
use amt_gateway::{GatewayError, Mode, Session, StreamLocator, probe_relays};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use config::Config;
use progress::{StreamProgress, format_bytes, format_duration};

/// amt - receive multicast over AMT (RFC 7450)
#[derive(Parser)]
#[command(name = "amt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path (default: <config dir>/amt/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Relay host name or address, comma separated (overrides the config file)
    #[arg(short, long, global = true)]
    relay: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive a stream: amt://[source@]group[:port]
    Receive {
        /// Stream locator
        #[arg(required = true)]
        locator: String,

        /// Output file, `-` for stdout
        #[arg(short, long, default_value = "-")]
        output: String,

        /// Stop after this many payloads
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Native multicast timeout in seconds
        #[arg(long)]
        native_timeout: Option<u64>,

        /// AMT timeout in seconds
        #[arg(long)]
        amt_timeout: Option<u64>,
    },

    /// Run the relay handshake against every candidate and report the result
    Probe,

    /// Print the effective configuration
    Config {
        /// Also write it to the configuration file path
        #[arg(long)]
        save: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::resolve(cli.config.as_deref())?;
    if let Some(relay) = &cli.relay {
        config.gateway.relay.clone_from(relay);
    }
    if let Commands::Receive {
        native_timeout,
        amt_timeout,
        ..
    } = &cli.command
    {
        if let Some(secs) = native_timeout {
            config.gateway.native_timeout = *secs;
        }
        if let Some(secs) = amt_timeout {
            config.gateway.amt_timeout = *secs;
        }
    }

    config.validate()?;

    // Payloads may go to stdout, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(if cli.verbose {
            "debug"
        } else {
            config.logging.level.as_str()
        })
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Receive {
            locator,
            output,
            count,
            ..
        } => {
            receive(&locator, &output, count, &config).await?;
        }
        Commands::Probe => {
            probe(&config).await?;
        }
        Commands::Config { save } => {
            show_config(&config, save, cli.config)?;
        }
    }

    Ok(())
}

/// Receive a stream until it ends, `count` payloads arrived or Ctrl+C
async fn receive(
    locator: &str,
    output: &str,
    count: Option<u64>,
    config: &Config,
) -> anyhow::Result<()> {
    let locator: StreamLocator = locator.parse()?;
    let to_stdout = output == "-";

    let mut sink: Box<dyn AsyncWrite + Unpin + Send> = if to_stdout {
        Box::new(tokio::io::stdout())
    } else {
        Box::new(tokio::fs::File::create(output).await?)
    };

    tracing::info!("Receiving {} to {}", locator, output);
    let progress = StreamProgress::new(&locator.to_string(), !to_stdout);
    let started = Instant::now();

    let mut session = Session::open(config.to_gateway_config()?, locator).await?;
    let mut received = 0u64;
    let mut mode = session.mode();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let outcome: anyhow::Result<()> = loop {
        if count.is_some_and(|limit| received >= limit) {
            break Ok(());
        }

        let block = tokio::select! {
            block = session.recv() => block,
            _ = &mut ctrl_c => {
                tracing::info!("Interrupted");
                break Ok(());
            }
        };

        match block {
            Ok(block) => {
                if block.corrupted {
                    tracing::warn!("Payload {} truncated", received + 1);
                }
                if let Err(e) = sink.write_all(&block.data).await {
                    break Err(e.into());
                }
                received += 1;
                progress.inc(block.data.len() as u64);

                if session.mode() != mode {
                    mode = session.mode();
                    progress.set_message(describe(&session, &locator));
                }
            }
            Err(GatewayError::TunnelTimeout(wait)) => {
                tracing::info!("No data for {:?}, end of stream", wait);
                break Ok(());
            }
            Err(e) => break Err(anyhow::Error::from(e)),
        }
    };

    sink.flush().await?;
    let stats = session.close().await;
    progress.finish_with_message(format!("{locator} finished"));

    eprintln!("Stream:    {locator}");
    eprintln!("Mode:      {mode:?}");
    eprintln!("Payloads:  {}", stats.total_datagrams());
    eprintln!("Received:  {}", format_bytes(stats.total_bytes()));
    eprintln!("Truncated: {}", stats.truncated);
    if mode == Mode::Tunneled {
        eprintln!("Updates:   {}", stats.updates_sent);
        eprintln!("Re-queries: {}", stats.requeries);
    }
    eprintln!("Elapsed:   {}", format_duration(started.elapsed()));

    outcome
}

fn describe(session: &Session, locator: &StreamLocator) -> String {
    match (session.mode(), session.relay()) {
        (Mode::Tunneled, Some(relay)) => format!("{locator} via {relay}"),
        _ => format!("{locator} native"),
    }
}

/// Handshake with every relay candidate
async fn probe(config: &Config) -> anyhow::Result<()> {
    let gateway = config.to_gateway_config()?;
    println!("Relay: {}", gateway.relay);

    let reports = probe_relays(&gateway, Box::new(TimeSeededNonce::new())).await?;
    for report in &reports {
        match &report.result {
            Ok(outcome) => println!(
                "  {:<15} ok   relay {} mac {} interval {}",
                report.candidate,
                outcome.relay,
                hex::encode(outcome.mac.as_bytes()),
                format_duration(outcome.query_interval)
            ),
            Err(e) => println!("  {:<15} fail {e}", report.candidate),
        }
    }

    if !reports.iter().any(|r| r.is_ok()) {
        anyhow::bail!("No relay completed the handshake");
    }
    Ok(())
}

/// Print (and optionally save) the effective configuration
fn show_config(config: &Config, save: bool, path: Option<PathBuf>) -> anyhow::Result<()> {
    print!("{}", toml::to_string_pretty(config)?);

    if save {
        let path = path.unwrap_or_else(Config::default_path);
        config.save(&path)?;
        eprintln!("Saved to {}", path.display());
    }
    Ok(())
}
