use std::fs;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use permdump_audit::CaptureReader;
use permdump_fault::{is_permission_fault, try_extract_fields};
use permdump_runtime::{replay_and_close, FaultRecorder, RecorderConfig};

#[derive(Clone, Debug, Parser)]
#[command(name = "permdump-cli")]
#[command(about = "Record vSphere NoPermissionFault responses from captured proxy traffic")]
struct Cli {
    #[arg(long = "config", global = true)]
    config_path: Option<PathBuf>,
    #[arg(long, default_value = "info", global = true)]
    log_level: String,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Clone, Debug, Subcommand)]
enum CliCommand {
    /// Replay a capture file (or `-` for stdin) through the fault recorder.
    Replay {
        #[arg(long)]
        input: PathBuf,
        #[command(flatten)]
        outputs: OutputArgs,
    },
    /// Classify a single response body.
    Scan {
        #[arg(long, default_value_t = 500)]
        status: u16,
        #[arg(long)]
        body: PathBuf,
    },
}

#[derive(Clone, Debug, Default, Args)]
struct OutputArgs {
    #[arg(long)]
    capture_output: Option<String>,
    #[arg(long)]
    tabular_output: Option<String>,
    #[arg(long)]
    show_duplicates: bool,
    #[arg(long)]
    client_header: Option<String>,
    /// Extra `key=value` options, e.g. `vs_dump_csv=faults.csv`.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,
}

fn init_tracing(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<RecorderConfig> {
    let Some(path) = path else {
        return Ok(RecorderConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_yml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

/// `--set` assignments first, then the dedicated flags.
fn apply_overrides(config: &mut RecorderConfig, outputs: &OutputArgs) -> anyhow::Result<()> {
    for assignment in &outputs.set {
        config
            .apply_assignment(assignment)
            .with_context(|| format!("invalid --set {assignment}"))?;
    }
    if let Some(path) = &outputs.capture_output {
        config.capture_output_path = path.clone();
    }
    if let Some(path) = &outputs.tabular_output {
        config.tabular_output_path = path.clone();
    }
    if outputs.show_duplicates {
        config.show_duplicates = true;
    }
    if let Some(header) = &outputs.client_header {
        config
            .set_option("client-identifier-header", header)
            .context("invalid --client-header")?;
    }
    Ok(())
}

fn open_input(input: &Path) -> anyhow::Result<CaptureReader<Box<dyn BufRead>>> {
    let reader: Box<dyn BufRead> = if input == Path::new("-") {
        Box::new(io::stdin().lock())
    } else {
        let file = fs::File::open(input)
            .with_context(|| format!("failed to open capture input {}", input.display()))?;
        Box::new(BufReader::new(file))
    };
    Ok(CaptureReader::new(reader))
}

fn run_replay(config: RecorderConfig, input: &Path) -> anyhow::Result<()> {
    // Output files are truncated on configure, so the input must open first.
    let reader = open_input(input)?;
    let recorder = FaultRecorder::new();
    recorder
        .configure(&config)
        .context("failed to initialize output sinks")?;

    tracing::info!(input = %input.display(), "replaying captured exchanges");
    let exchanges = reader.map(|entry| entry.map(|entry| entry.exchange));
    let report = replay_and_close(&recorder, exchanges).context("replay aborted")?;

    let report_json =
        serde_json::to_string_pretty(&report).context("failed to format replay report")?;
    println!("{report_json}");

    if !report.is_clean() {
        bail!(
            "replay finished with {} unreadable exchanges and {} failed writes",
            report.source_errors,
            report.processing_errors
        );
    }
    Ok(())
}

fn run_scan(status: u16, body_path: &Path) -> anyhow::Result<()> {
    let body = fs::read(body_path)
        .with_context(|| format!("failed to read body {}", body_path.display()))?;
    let fault = is_permission_fault(status, &body);
    println!("fault={fault}");

    if fault {
        match try_extract_fields(&body) {
            Ok(fields) => {
                let fields_json =
                    serde_json::to_string_pretty(&fields).context("failed to format fields")?;
                println!("{fields_json}");
            }
            Err(err) => println!("fields unavailable: {err}"),
        }
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        CliCommand::Replay { input, outputs } => {
            let mut config = load_config(cli.config_path.as_deref())?;
            apply_overrides(&mut config, &outputs)?;
            run_replay(config, &input)
        }
        CliCommand::Scan { status, body } => run_scan(status, &body),
    }
}
