mod cli_logger;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use std::path::PathBuf;
use std::process::ExitCode;

use cli_logger::CliLogger;
use jprof::{Config, ProfileCommand, ProfilerError, Reporter, profile_command};

#[derive(Debug, Parser)]
#[command(name = "jprof", version, about = "Inspect CPU profiler dumps and snapshots")]
struct Cli {
    /// Emit one JSON document per line.
    #[arg(long, global = true)]
    json: bool,

    #[arg(long, global = true)]
    no_color: bool,

    #[arg(long, global = true, default_value = "jprof.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: ProfileCommand,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load_optional(&cli.config);
    let json = cli.json || config.reporter == Reporter::Json;
    let logger = CliLogger::new(json, cli.no_color);

    match run(&cli, &config, &logger) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let code = err
                .downcast_ref::<ProfilerError>()
                .map(error_code)
                .unwrap_or("error");
            logger.print_error(code, &format!("{err:#}"));
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, config: &Config, logger: &CliLogger) -> Result<()> {
    let report = profile_command(config, &cli.command)?;
    logger.print_report(&report)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if let Err(err) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("failed to init logger: {err}");
    }
}

fn error_code(err: &ProfilerError) -> &'static str {
    match err {
        ProfilerError::AgentNotLoaded => "agent_not_loaded",
        ProfilerError::InvalidAgentVersion { .. } => "invalid_agent_version",
        ProfilerError::RemoteUnreachable(_) => "remote_unreachable",
        ProfilerError::MalformedDump { .. } => "malformed_dump",
        ProfilerError::RetransformRejected { .. } => "retransform_rejected",
        ProfilerError::IoFailure { .. } | ProfilerError::Io(_) => "io",
        ProfilerError::InvalidFilterSyntax(_) => "invalid_filter",
        ProfilerError::Cancelled => "cancelled",
        ProfilerError::InvalidArgument(_) => "invalid_argument",
        ProfilerError::Config(_) | ProfilerError::Toml(_) => "config",
        ProfilerError::Json(_) => "json",
    }
}
