mod ca;
mod cli;
mod daemon;
mod logging;
mod platform;
mod stopfile;
mod truststore;

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use latch_config::{BaseConfig, LogLevel};

use cli::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let home = home_dir(&cli)?;

    match &cli.command {
        None | Some(Command::Run) => run_daemon(&cli, home),
        Some(Command::InstallRootCa { ensure_file }) => {
            init_command_logging(&cli);
            ca::install(&home, *ensure_file)
        }
        Some(Command::UninstallRootCa) => {
            init_command_logging(&cli);
            ca::uninstall(&home)
        }
        Some(Command::CreateCert {
            csr_file,
            domain_name,
        }) => {
            init_command_logging(&cli);
            let out_dir = std::env::current_dir().context("resolving working directory")?;
            ca::create_cert(&home, &out_dir, csr_file.as_deref(), domain_name.as_deref())
        }
    }
}

/// The directory holding `etc/`: `--home`, or the executable's directory.
fn home_dir(cli: &Cli) -> anyhow::Result<PathBuf> {
    if let Some(home) = &cli.home {
        return Ok(home.clone());
    }
    let exe = std::env::current_exe().context("locating the executable")?;
    exe.parent()
        .map(PathBuf::from)
        .context("executable has no parent directory")
}

fn run_daemon(cli: &Cli, home: PathBuf) -> anyhow::Result<()> {
    stopfile::clear_stale(&home);

    // Base config errors are fatal at startup; hot-reload failures later
    // keep the running state.
    let config_path = latch_config::base_config_path(&home);
    let config = BaseConfig::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let level = cli
        .log_level
        .map(LogLevel::from_numeric)
        .unwrap_or_else(|| config.log_level());
    let log_file = home.join("logs").join("latch.log");
    let (_guards, level_handle) = logging::init(level, Some(&log_file))?;

    // Best-effort: the proxy serves HTTPS-bound names, so browsers want
    // the root CA present; a failure only warns, exactly like a manual
    // install being pending.
    if let Err(e) = ca::install(&home, false) {
        tracing::warn!(error = %e, "root CA not installed; run `latch install-root-ca`");
    }

    let runtime = tokio::runtime::Runtime::new().context("starting runtime")?;
    runtime.block_on(daemon::run(home, config, level_handle))
}

fn init_command_logging(cli: &Cli) {
    let level = cli
        .log_level
        .map(LogLevel::from_numeric)
        .unwrap_or(LogLevel::Info);
    let filter = tracing_subscriber::EnvFilter::try_new(level.filter_directive())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
