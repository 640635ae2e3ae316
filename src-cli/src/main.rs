mod ci;
mod config;
mod console;
mod problems;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use tokio_util::sync::CancellationToken;

use change_tracker::GitCli;
use review_comments::Severity;

use ci::{CiOptions, Session};
use config::Config;

#[derive(Parser)]
#[command(
    name = "linemark",
    version,
    about = "Report linter problems on changed lines and keep review comments in sync"
)]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "linemark.toml")]
    config: PathBuf,

    /// Path to the git repository
    #[arg(long, global = true, default_value = ".")]
    workdir: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the files changed since the base branch as JSON
    Changes {
        #[arg(long)]
        base_branch: Option<String>,
    },
    /// Check problems found by the linter and report them to review platforms
    Ci {
        /// JSON file with the problems found by the linter
        #[arg(long)]
        problems: PathBuf,

        #[arg(long)]
        base_branch: Option<String>,

        /// Exit with an error when a problem has this severity or higher
        #[arg(long, default_value = "bug")]
        fail_on: Severity,

        /// Print problems without touching any review
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::Error,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Trace => LevelFilter::Trace,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level.into())
        .format_timestamp_millis()
        .target(env_logger::Target::Stderr)
        .init();

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let session = Session {
        git: GitCli::new(&cli.workdir),
        config: Config::load(&cli.workdir.join(&cli.config))?,
        cancel,
    };

    match cli.command {
        Command::Changes { base_branch } => {
            session.changes(base_branch.as_deref()).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ci {
            problems,
            base_branch,
            fail_on,
            dry_run,
        } => {
            let opts = CiOptions {
                problems,
                base_branch,
                fail_on,
                dry_run,
            };
            let code = session.ci(&opts).await?;
            log::info!("shutting down");
            Ok(code)
        }
    }
}
