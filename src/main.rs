//! nuclide-annotate: linear decode from an address until control flow diverts.
//!
//! Usage:
//!   nuclide-annotate <binary>                    Scan from the entry point
//!   nuclide-annotate <binary> -s 0x401020        Scan from an address
//!   nuclide-annotate <blob> --raw --base 0x1000  Treat the file as flat code
//!   nuclide-annotate --print-config              Show the effective scan config

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;

use nuclide_annotate::database::{Database, ImageDatabase};
use nuclide_annotate::format::OutputFormat;
use nuclide_annotate::loader::GoblinLoader;
use nuclide_annotate::plugin::{ActionList, AnnotateAction, Plugin};
use nuclide_annotate::scan::ScanConfig;
use nuclide_annotate::Architecture;

#[derive(Parser)]
#[command(name = "nuclide-annotate")]
#[command(about = "Linear x86 decode-and-annotate scanner", long_about = None)]
struct Cli {
    /// Path to the binary file
    #[arg(required_unless_present = "print_config")]
    binary: Option<PathBuf>,

    /// Start address in hex (defaults to the entry point, or the base for raw input)
    #[arg(short, long, value_parser = parse_hex)]
    start: Option<u64>,

    /// Treat the input as flat machine code instead of an executable image
    #[arg(long)]
    raw: bool,

    /// Load address (hex) for raw input
    #[arg(long, value_parser = parse_hex, default_value = "0")]
    base: u64,

    /// Bitness for raw input
    #[arg(long, default_value_t = 64, value_parser = clap::value_parser!(u8).range(32..=64))]
    bits: u8,

    /// JSON file with scan settings; flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bytes read per decode attempt
    #[arg(long)]
    window_size: Option<usize>,

    /// Scan span (hex) used when the start address has no enclosing region
    #[arg(long, value_parser = parse_hex)]
    safety_span: Option<u64>,

    /// Longest instruction text accepted
    #[arg(long)]
    max_text_len: Option<usize>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    print_config: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Write output to a file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    Builder::new()
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .filter(None, level)
        .parse_default_env()
        .init();
}

fn load_config(cli: &Cli) -> Result<ScanConfig> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            ScanConfig::from_json(&text)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        }
        None => ScanConfig::default(),
    };

    if let Some(window_size) = cli.window_size {
        config.window_size = window_size;
    }
    if let Some(safety_span) = cli.safety_span {
        config.safety_span = safety_span;
    }
    if let Some(max_text_len) = cli.max_text_len {
        config.max_text_len = max_text_len;
    }

    config.validate()?;
    Ok(config)
}

fn load_database(cli: &Cli, path: &Path) -> Result<ImageDatabase> {
    let data = fs::read(path).with_context(|| format!("Failed to read binary: {}", path.display()))?;
    let loader = GoblinLoader::new();

    let db = if cli.raw {
        let arch = match cli.bits {
            32 => Architecture::X86_32,
            64 => Architecture::X86_64,
            other => bail!("Raw input must be 32 or 64 bits, got {}", other),
        };
        loader.load_raw(&data, cli.base, arch)?
    } else {
        loader
            .load(&data)
            .with_context(|| format!("Failed to load binary: {}", path.display()))?
    };
    Ok(db)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli)?;
    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let Some(path) = cli.binary.as_ref() else {
        bail!("No input binary given");
    };
    let mut db = load_database(&cli, path)?;
    log::info!(
        "Loaded {} ({}, {} regions)",
        path.display(),
        db.architecture(),
        db.regions().len()
    );

    let mut registry = ActionList::default();
    let Some(plugin) = Plugin::init(&db, &mut registry, AnnotateAction::new(config)) else {
        bail!("Unsupported architecture: {}", db.architecture());
    };
    for action in &registry.actions {
        log::debug!("Registered action: {}", action);
    }

    if let Some(start) = cli.start {
        db.set_focus(start);
    }

    let report = plugin
        .action()
        .activate(&mut db)
        .with_context(|| format!("Scan from 0x{:x} failed", db.focus_address()))?;

    let listing: Vec<_> = db
        .listing()
        .into_iter()
        .filter(|e| e.address >= report.start && e.address < report.end)
        .collect();

    let rendered = cli.format.get_formatter().format(&report, &listing)?;
    match &cli.output {
        Some(out) => fs::write(out, rendered)
            .with_context(|| format!("Failed to write output: {}", out.display()))?,
        None => print!("{}", rendered),
    }

    Ok(())
}
