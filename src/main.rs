mod config;
mod control;
mod filter;
mod launch;
mod notifier;
mod process;
mod restart;
mod runner;
mod signals;
mod supervisor;
mod watch_set;
mod watcher;

use clap::Parser;
use config::{ConfigError, RespawnConfig};
use filter::DepthLimit;
use std::path::{Path, PathBuf};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "respawn.toml";

/// Run a script and restart it whenever one of the files it loaded changes.
#[derive(Parser, Debug)]
#[command(name = "respawn", version, about)]
pub struct Cli {
    /// Script to run
    #[arg(value_name = "SCRIPT")]
    script: PathBuf,

    /// Arguments passed to the script
    #[arg(value_name = "ARGS", trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Config file path (default: respawn.toml, if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Never watch paths starting with this prefix (repeatable)
    #[arg(long, value_name = "PREFIX")]
    ignore: Vec<String>,

    /// Watch dependencies up to this nesting level, -1 for unlimited
    #[arg(long, allow_negative_numbers = true)]
    deps: Option<i64>,

    /// Force the polling file watcher
    #[arg(long)]
    poll: bool,

    /// Polling interval in milliseconds
    #[arg(long, value_name = "MS")]
    interval: Option<u64>,

    /// Quiet period a burst of changes must end with before it triggers a restart, in milliseconds
    #[arg(long, value_name = "MS")]
    debounce: Option<u64>,

    /// Keep running after the script exits, waiting for changes
    #[arg(long)]
    respawn: bool,

    /// Clear the screen on every restart
    #[arg(long)]
    clear: bool,

    /// JSON payload sent over the control channel instead of SIGTERM
    #[arg(long, value_name = "JSON")]
    graceful_shutdown: Option<String>,

    /// Interpreter used to run the script ("" runs the script directly)
    #[arg(long)]
    interpreter: Option<String>,

    /// Extra interpreter argument (repeatable)
    #[arg(long = "interpreter-arg", value_name = "ARG", allow_hyphen_values = true)]
    interpreter_args: Vec<String>,

    /// Prefix log lines with a local timestamp in this strftime format
    #[arg(long, value_name = "FORMAT")]
    timestamp: Option<String>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Extra logging (child lifecycle, watch decisions)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

/// Load the config file and layer the command-line overrides on top.
fn resolve_config(cli: &Cli) -> Result<RespawnConfig, ConfigError> {
    let (path, required) = match &cli.config {
        Some(path) => (path.as_path(), true),
        None => (Path::new(DEFAULT_CONFIG), false),
    };
    let mut config = RespawnConfig::load(path, required)?;

    config.watch.ignore.extend(cli.ignore.iter().cloned());
    if let Some(deps) = cli.deps {
        config.watch.deps = DepthLimit::from(deps);
    }
    if cli.poll {
        config.watch.poll = true;
    }
    if let Some(interval) = cli.interval {
        config.watch.interval_ms = interval;
    }
    if let Some(debounce) = cli.debounce {
        config.watch.debounce_ms = debounce;
    }
    if cli.respawn {
        config.child.respawn = true;
    }
    if cli.clear {
        config.notify.clear = true;
    }
    if let Some(payload) = &cli.graceful_shutdown {
        config.child.graceful_shutdown = Some(config::parse_graceful_payload(payload)?);
    }
    if let Some(interpreter) = &cli.interpreter {
        config.child.interpreter = interpreter.clone();
    }
    if !cli.interpreter_args.is_empty() {
        config.child.interpreter_args = cli.interpreter_args.clone();
    }
    if cli.timestamp.is_some() {
        config.notify.timestamp = cli.timestamp.clone();
    }
    Ok(config)
}

fn init_tracing(cli: &Cli, timestamp: Option<&str>) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr);

    match timestamp {
        Some(format) => builder
            .with_timer(ChronoLocal::new(format.to_string()))
            .init(),
        None => builder.without_time().init(),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let config = match resolve_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("respawn: {e}");
            std::process::exit(2);
        }
    };

    init_tracing(&cli, config.notify.timestamp.as_deref());
    tracing::debug!(?cli, "parsed CLI arguments");

    if cli.dry_run {
        match config.render() {
            Ok(text) => print!("{text}"),
            Err(e) => {
                tracing::error!(error = %e, "failed to render config");
                std::process::exit(1);
            }
        }
        return;
    }

    let code = match runner::run(&config, &cli.script, &cli.args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "supervisor failed");
            1
        }
    };
    std::process::exit(code);
}
