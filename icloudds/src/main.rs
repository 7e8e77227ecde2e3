use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use icloud_core::{authenticate, ApiErrorClass, AuthConfig, DriveApi};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use icloudds::config::{expand_with_home, load_regex_file, SyncConfig};
use icloudds::lockfile::{default_lock_path, InstanceLock};
use icloudds::logging;
use icloudds::sync::filter::PathFilter;
use icloudds::sync::scheduler::{SchedulerConfig, SyncScheduler};

const EXIT_ALREADY_RUNNING: u8 = 1;
const EXIT_NOT_A_DIRECTORY: u8 = 2;
const EXIT_BAD_REGEX_FILE: u8 = 3;
const EXIT_LOGIN_FAILED: u8 = 4;

#[derive(Debug, Parser)]
#[command(
    name = "icloudds",
    version,
    about = "Bidirectional iCloud Drive sync daemon"
)]
struct Cli {
    /// Local directory that should be kept in sync
    #[arg(short = 'd', long, value_name = "directory")]
    directory: PathBuf,

    /// iCloud username or email address
    #[arg(short = 'u', long, value_name = "username")]
    username: String,

    /// iCloud password (default: keyring or prompt)
    #[arg(short = 'p', long, value_name = "password")]
    password: Option<String>,

    /// Directory to store session state for authentication
    #[arg(long, value_name = "directory", default_value = "~/.pyicloud")]
    cookie_directory: String,

    /// File with ignore regular expressions, one per line
    #[arg(long, value_name = "filename", default_value = ".ignore-regexes.txt")]
    ignore_regexes: PathBuf,

    /// File with include regular expressions, one per line
    #[arg(long, value_name = "filename", default_value = ".include-regexes.txt")]
    include_regexes: PathBuf,

    /// JSON logging config file
    #[arg(long, value_name = "filename")]
    logging_config: Option<PathBuf>,

    /// Period in seconds to look for iCloud changes
    #[arg(long, value_name = "seconds", default_value_t = 20,
          value_parser = clap::value_parser!(u64).range(20..))]
    icloud_check_period: u64,

    /// Period in seconds to perform a full iCloud refresh
    #[arg(long, value_name = "seconds", default_value_t = 90,
          value_parser = clap::value_parser!(u64).range(90..))]
    icloud_refresh_period: u64,

    /// Period in seconds to queue up filesystem events
    #[arg(long, value_name = "seconds", default_value_t = 10,
          value_parser = clap::value_parser!(u64).range(10..))]
    debounce_period: u64,

    /// Maximum number of concurrent workers
    #[arg(long, value_name = "workers", default_value_t = 32,
          value_parser = clap::value_parser!(u64).range(1..))]
    max_workers: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(err) = logging::init(cli.logging_config.as_deref()) {
        eprintln!("icloudds: {err:#}");
        return ExitCode::FAILURE;
    }
    info!(version = env!("CARGO_PKG_VERSION"), "icloudds starting");

    let config = match build_config(cli) {
        Ok(config) => config,
        Err(exit) => return exit,
    };

    let lock = match InstanceLock::acquire(default_lock_path()) {
        Ok(Some(lock)) => lock,
        Ok(None) => {
            eprintln!(
                "another instance of icloudds is running, check for {} file",
                default_lock_path().display()
            );
            return ExitCode::from(EXIT_ALREADY_RUNNING);
        }
        Err(err) => {
            error!(%err, "failed to take the instance lock");
            return ExitCode::FAILURE;
        }
    };
    info!(lock = %lock.path().display(), "instance lock taken");

    let code = run(config).await;
    drop(lock);
    code
}

fn build_config(cli: Cli) -> Result<SyncConfig, ExitCode> {
    if !cli.directory.is_dir() {
        error!(
            directory = %cli.directory.display(),
            "local directory does not exist or is not a directory"
        );
        return Err(ExitCode::from(EXIT_NOT_A_DIRECTORY));
    }
    let directory = cli
        .directory
        .canonicalize()
        .map_err(|_| ExitCode::from(EXIT_NOT_A_DIRECTORY))?;

    let ignore_regexes = match load_regex_file(&cli.ignore_regexes) {
        Ok(patterns) => patterns,
        Err(err) => {
            error!(file = %cli.ignore_regexes.display(), %err, "failed to read ignore regexes");
            return Err(ExitCode::from(EXIT_BAD_REGEX_FILE));
        }
    };
    let include_regexes = match load_regex_file(&cli.include_regexes) {
        Ok(patterns) => patterns,
        Err(err) => {
            error!(file = %cli.include_regexes.display(), %err, "failed to read include regexes");
            return Err(ExitCode::from(EXIT_BAD_REGEX_FILE));
        }
    };
    for pattern in &ignore_regexes {
        info!(pattern = %pattern, "ignore");
    }
    for pattern in &include_regexes {
        info!(pattern = %pattern, "include");
    }

    let home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
    Ok(SyncConfig {
        directory,
        username: cli.username,
        password: cli.password,
        cookie_directory: expand_with_home(&cli.cookie_directory, &home),
        ignore_regexes,
        include_regexes,
        icloud_check_period: Duration::from_secs(cli.icloud_check_period),
        icloud_refresh_period: Duration::from_secs(cli.icloud_refresh_period),
        debounce_period: Duration::from_secs(cli.debounce_period),
        max_workers: cli.max_workers as usize,
        state_dir: std::env::temp_dir().join("icloudds-state"),
    })
}

async fn run(config: SyncConfig) -> ExitCode {
    let filter = match PathFilter::new(&config.ignore_regexes, &config.include_regexes) {
        Ok(filter) => Arc::new(filter),
        Err(err) => {
            error!(%err, "invalid filter pattern");
            return ExitCode::from(EXIT_BAD_REGEX_FILE);
        }
    };

    let auth = AuthConfig {
        username: config.username.clone(),
        password: config.password.clone(),
        cookie_directory: config.cookie_directory.clone(),
    };
    let drive: Arc<dyn DriveApi> = match authenticate(&auth).await {
        Ok(client) => Arc::new(client),
        Err(err) => {
            if err.classification() == ApiErrorClass::Auth {
                error!(%err, "iCloud login failed");
            } else {
                error!(%err, "could not reach iCloud");
            }
            return ExitCode::from(EXIT_LOGIN_FAILED);
        }
    };

    let scheduler = match SyncScheduler::new(
        SchedulerConfig {
            root: config.directory.clone(),
            check_period: config.icloud_check_period,
            refresh_period: config.icloud_refresh_period,
            debounce_period: config.debounce_period,
            max_workers: config.max_workers,
            state_dir: config.state_dir.clone(),
        },
        drive,
        filter,
        CancellationToken::new(),
    ) {
        Ok(scheduler) => scheduler,
        Err(err) => {
            error!(%err, "failed to set up the sync scheduler");
            return ExitCode::FAILURE;
        }
    };

    match scheduler.run().await {
        Ok(()) => {
            info!("clean shutdown");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(err = %format!("{err:#}"), "sync daemon failed");
            if format!("{err:#}").contains("authentication") {
                ExitCode::from(EXIT_LOGIN_FAILED)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}
