mod analyser;
mod config;
mod error;
mod ui;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde::Serialize;

use analyser::containers::TraceScale;
use analyser::core;
use analyser::model::ModelSet;
use config::Config;
use ui::output;

/// ccaniff fingerprints the congestion control algorithm of TCP senders in packet captures
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long, global = true, value_parser)]
    config: Option<PathBuf>,

    /// Display output as formatted JSON
    #[arg(short = 'j', long, global = true, action = ArgAction::SetTrue)]
    json: bool,

    /// Write JSON output to this file instead of stdout
    #[arg(short = 'o', long, global = true, value_parser)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show per-flow statistics of a capture
    Flows {
        /// pcap/pcapng file or tshark CSV export
        #[arg(short = 'f', long, value_parser)]
        file: PathBuf,
    },
    /// Extract polynomial fingerprints from a capture
    Fingerprint {
        #[arg(short = 'f', long, value_parser)]
        file: PathBuf,
        #[command(flatten)]
        scale: ScaleArgs,
    },
    /// Train one Gaussian model per CCA from a directory of labeled traces
    Train {
        /// Directory of traces named cca-version-d1-d2-bandwidth-multiplier
        #[arg(short = 'd', long, value_parser)]
        dir: PathBuf,
        /// Where to store the trained models
        #[arg(short = 'm', long, default_value = "models.json")]
        models: PathBuf,
    },
    /// Rank the likely CCAs of every flow in a capture
    Classify {
        #[arg(short = 'f', long, value_parser)]
        file: PathBuf,
        /// Trained models produced by `train`
        #[arg(short = 'm', long, default_value = "models.json")]
        models: PathBuf,
        #[command(flatten)]
        scale: ScaleArgs,
    },
    /// Build a confusion matrix over a directory of labeled traces
    Evaluate {
        #[arg(short = 'd', long, value_parser)]
        dir: PathBuf,
        #[arg(short = 'm', long, default_value = "models.json")]
        models: PathBuf,
    },
    /// Print the default configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct ScaleArgs {
    /// Round-trip time in seconds, instead of deriving it from the file name
    #[arg(long, requires = "bdp")]
    rtt: Option<f64>,

    /// Bandwidth-delay product in bytes, instead of deriving it from the file name
    #[arg(long, requires = "rtt")]
    bdp: Option<f64>,
}

impl ScaleArgs {
    fn scale(&self) -> Result<Option<TraceScale>> {
        match (self.rtt, self.bdp) {
            (Some(rtt), Some(bdp)) if rtt > 0.0 && bdp > 0.0 => Ok(Some(TraceScale { rtt, bdp })),
            (Some(_), Some(_)) => anyhow::bail!("--rtt and --bdp must be positive"),
            _ => Ok(None),
        }
    }
}

fn main() {
    simple_logger::init_with_env().unwrap();

    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = Config::load_or_default(cli.config.as_deref())?;

    match &cli.command {
        Command::Flows { file } => {
            let records = analyser::utils::load_file(file)?;
            let tracked = analyser::tracker::track(&records, &config.tracker);
            let summaries = tracked.summaries();
            if cli.json {
                emit_json(&summaries, cli.output.as_deref())?;
            } else {
                output::print_flow_stats(&summaries);
            }
        }
        Command::Fingerprint { file, scale } => {
            let analysis = core::analyse_file(file, scale.scale()?, &config)?;
            if cli.json {
                emit_json(&analysis, cli.output.as_deref())?;
            } else {
                output::print_trace(&analysis);
                output::print_fingerprints(&analysis);
            }
        }
        Command::Train { dir, models } => {
            let traces = corpus(dir)?;
            let set = core::train(&traces, &config);
            if set.models.is_empty() {
                anyhow::bail!("No CCA had enough training samples");
            }
            output::data_to_file(output::data_as_json(&set)?, models)
                .with_context(|| format!("Failed to write {}", models.display()))?;
            if cli.json {
                emit_json(&set, cli.output.as_deref())?;
            } else {
                output::print_models(&set);
            }
        }
        Command::Classify { file, models, scale } => {
            let set = load_models(models)?;
            let analysis = core::analyse_file(file, scale.scale()?, &config)?;
            let rankings = core::classify_trace(&analysis, &set, &config);
            if cli.json {
                emit_json(&rankings, cli.output.as_deref())?;
            } else {
                output::print_trace(&analysis);
                output::print_rankings(&rankings);
            }
        }
        Command::Evaluate { dir, models } => {
            let set = load_models(models)?;
            let traces = corpus(dir)?;
            let evaluation = core::evaluate(&traces, &set, &config);
            if cli.json {
                emit_json(&evaluation, cli.output.as_deref())?;
            } else {
                output::print_confusion_matrix(&evaluation);
            }
        }
        Command::Config => println!("{}", Config::generate_default()),
    }
    Ok(())
}

fn corpus(dir: &Path) -> Result<Vec<(PathBuf, analyser::utils::TraceName)>> {
    let files = analyser::utils::trace_files(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?;
    let traces = core::labeled_traces(&files);
    if traces.is_empty() {
        anyhow::bail!("No labeled traces in {}", dir.display());
    }
    log::info!("Found {} labeled traces in {}", traces.len(), dir.display());
    Ok(traces)
}

fn load_models(path: &Path) -> Result<ModelSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read models: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse models: {}", path.display()))
}

fn emit_json<T: Serialize>(data: &T, out: Option<&Path>) -> Result<()> {
    let json = output::data_as_json(data)?;
    match out {
        Some(path) => output::data_to_file(json, path)?,
        None => println!("{json}"),
    }
    Ok(())
}
