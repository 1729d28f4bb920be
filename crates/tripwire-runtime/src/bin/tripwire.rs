//! Inspect how tripwire sees a source file: fingerprints and resolved points.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::debug;

use tripwire_runtime::{
    fingerprint, Entity, InstrumenterConfig, LocationDescriptor, LocationResolver, ProgramUnit,
    Trigger,
};

#[derive(Debug, Parser)]
#[command(
    name = "tripwire",
    version,
    about = "Resolve instrumentation points in a source file",
    after_help = "Examples:\n  tripwire fingerprint app.py\n  tripwire resolve app.py --at 'return'\n  tripwire resolve app.py --at 're:x\\s*=' --at '<start>'"
)]
struct Cli {
    /// Path to tripwire.toml.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Log at debug level.
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the source fingerprint of a file.
    Fingerprint {
        file: PathBuf,
    },
    /// Print the program points a set of descriptors resolves to.
    Resolve {
        file: PathBuf,
        /// Line number, `<start>`, `<return>`, `re:<regex>` or a line prefix.
        #[arg(long = "at", value_name = "DESCRIPTOR")]
        at: Vec<String>,
        /// Fail unless the file still has this fingerprint.
        #[arg(long, value_name = "HASH")]
        hash: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => InstrumenterConfig::load(path)?,
        None => InstrumenterConfig::default(),
    };
    init_logging(&config, cli.verbose);

    match cli.command {
        Command::Fingerprint { file } => {
            let unit = load_module(&file)?;
            println!("{}", fingerprint(&Entity::from(unit))?);
        }
        Command::Resolve { file, at, hash } => {
            let unit = load_module(&file)?;
            let descriptors = at
                .iter()
                .map(|text| parse_descriptor(text))
                .collect::<Result<Vec<_>, _>>()?;
            let resolver = Arc::new(LocationResolver::new(&config.caches));
            let trigger =
                Trigger::build_with(resolver, unit, &descriptors, None, hash.as_deref())?;
            if trigger.matches_nothing() {
                println!("no matching points");
            }
            for point in trigger.points() {
                println!("{point}");
            }
        }
    }
    Ok(())
}

fn init_logging(config: &InstrumenterConfig, verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.log_level.parse().unwrap_or(tracing::Level::INFO)
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn load_module(path: &Path) -> anyhow::Result<Arc<ProgramUnit>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let name = path
        .file_stem()
        .map_or_else(|| "<module>".to_string(), |stem| stem.to_string_lossy().into_owned());
    debug!(file = %path.display(), lines = text.lines().count(), "module loaded");
    Ok(ProgramUnit::flat_module(name, &text))
}

fn parse_descriptor(text: &str) -> anyhow::Result<LocationDescriptor> {
    if let Ok(line) = text.parse::<u32>() {
        return Ok(LocationDescriptor::Line(line));
    }
    if let Some(pattern) = text.strip_prefix("re:") {
        return Ok(LocationDescriptor::pattern(pattern)?);
    }
    Ok(LocationDescriptor::parse(text))
}
