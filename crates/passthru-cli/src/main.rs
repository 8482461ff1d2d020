//! Command-line shell for PC/SC pass-through readers
//!
//! Runs the driver core against simulated hardware so the register protocol, the text
//! control surface and the interrupt path can be exercised without a device.

use clap::{Parser, Subcommand};
use nexum_pcsc_passthru::{PassthruConfig, PayloadLimit};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod bench;
mod commands;
mod display;

use bench::{Bench, CardSpec};
use commands::*;

#[derive(Parser)]
#[command(version, about = "Exercise PC/SC pass-through readers on simulated hardware")]
struct Cli {
    /// Number of reader slots on the simulated device
    #[arg(short = 'n', long, default_value_t = 1)]
    readers: usize,

    /// Insert a card at startup, as SLOT=ATR (e.g. 0=3B8F8001)
    #[arg(short, long = "card", value_parser = bench::parse_card_spec)]
    cards: Vec<CardSpec>,

    /// Cards echo each command back before the status word
    #[arg(long)]
    echo: bool,

    /// Accept extended-length commands
    #[arg(long)]
    extended: bool,

    /// Trace level output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List readers and their state
    List,

    /// Show the state report of one reader
    State {
        /// Reader index
        #[arg(default_value_t = 0)]
        reader: u8,
    },

    /// Connect, print the ATR and disconnect
    Atr {
        /// Reader index
        #[arg(default_value_t = 0)]
        reader: u8,
    },

    /// Connect, send each command in turn and disconnect
    Transmit {
        /// Reader index
        #[arg(short, long, default_value_t = 0)]
        reader: u8,

        /// Commands as hex, either compact (00A40400) or in pairs ("00 A4 04 00")
        #[arg(required = true)]
        commands: Vec<String>,
    },

    /// Insert and remove cards and print the reader events that follow
    Monitor {
        /// Number of insert/remove cycles per slot
        #[arg(long, default_value_t = 1)]
        cycles: usize,
    },

    /// Read commands from standard input
    Shell,
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let limit = if cli.extended {
        PayloadLimit::Extended
    } else {
        PayloadLimit::Short
    };
    let config = PassthruConfig::default().with_payload_limit(limit);
    let bench = Bench::new(cli.readers, config, cli.echo)?;
    for card in &cli.cards {
        bench.insert(card.slot, &card.atr)?;
    }
    info!(readers = bench.device().reader_count(), "simulated device ready");

    match cli.command {
        Commands::List => list_command(&bench)?,
        Commands::State { reader } => state_command(&bench, reader)?,
        Commands::Atr { reader } => atr_command(&bench, reader)?,
        Commands::Transmit { reader, commands } => transmit_command(&bench, reader, &commands)?,
        Commands::Monitor { cycles } => monitor_command(&bench, cycles)?,
        Commands::Shell => shell_command(&bench)?,
    }

    Ok(())
}

/// `directives` in `RUST_LOG` syntax refine the level picked by `--verbose`
fn log_filter(level: tracing::Level, directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(level.into())
        .parse_lossy(directives)
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        tracing::Level::TRACE
    } else {
        tracing::Level::INFO
    };
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_default();

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(level, &directives))
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn test_verbose_sets_the_default_level() {
        let quiet = log_filter(tracing::Level::INFO, "");
        let verbose = log_filter(tracing::Level::TRACE, "");
        assert_eq!(quiet.max_level_hint(), Some(LevelFilter::INFO));
        assert_eq!(verbose.max_level_hint(), Some(LevelFilter::TRACE));
    }

    #[test]
    fn test_directives_refine_the_default() {
        let filter = log_filter(tracing::Level::INFO, "nexum_pcsc_passthru=trace");
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::TRACE));
    }
}
