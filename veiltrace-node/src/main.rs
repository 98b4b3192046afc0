use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::EnvFilter;
use veiltrace_node::config::{load_config, ConfigFormat};
use veiltrace_node::journal::read_journal;
use veiltrace_node::service::{EntryResult, ReplayService};
use veiltrace_node::sink::TracingEventSink;
use veiltrace_telemetry::TelemetryHandle;

#[cfg(any(
    all(feature = "dev", feature = "test"),
    all(feature = "dev", feature = "prod"),
    all(feature = "test", feature = "prod")
))]
compile_error!(
    "Only one of the `dev`, `test`, or `prod` features may be enabled for veiltrace-node."
);

#[derive(Debug, Parser)]
#[command(
    name = "veiltrace-node",
    version,
    about = "Replays a veiltrace operation journal against a confidential registry"
)]
struct Cli {
    /// Path to configuration file (TOML or YAML).
    #[arg(long, default_value = "configs/veiltrace-node.toml")]
    config: PathBuf,
    /// Explicit configuration format override.
    #[arg(long, value_enum, default_value_t = ConfigFormat::Auto)]
    config_format: ConfigFormat,
    /// Journal to replay instead of the configured one.
    #[arg(long)]
    journal: Option<PathBuf>,
    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
    /// Print the full replay report as JSON.
    #[arg(long)]
    report_json: bool,
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env());
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli.config, cli.config_format)?;
    let journal = cli.journal.unwrap_or_else(|| config.node.journal.clone());
    let entries = read_journal(&journal)?;
    let telemetry = TelemetryHandle::from_config(config.telemetry.clone());
    let mut service = ReplayService::new(&config, telemetry, Arc::new(TracingEventSink))?;
    let report = service.replay(&entries);

    if cli.report_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }
    for record in &report.records {
        match &record.result {
            EntryResult::Applied { outcome } => println!(
                "line {:>3} {:<20} {} ok {}",
                record.line,
                record.operation,
                record.caller,
                serde_json::to_string(outcome)?
            ),
            EntryResult::Rejected { kind, message } => println!(
                "line {:>3} {:<20} {} rejected [{}] {}",
                record.line,
                record.operation,
                record.caller,
                kind.as_str(),
                message
            ),
        }
    }
    println!(
        "replayed {} entries from {}: {} applied, {} rejected, {} decryption(s) pending",
        entries.len(),
        journal.display(),
        report.applied,
        report.rejected.values().sum::<usize>(),
        report.pending_decryptions.len()
    );
    println!("{}", report.telemetry.to_json()?);
    Ok(())
}
