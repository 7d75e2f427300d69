use clap::Parser;
use lift_common::session::SessionManager;
use log::*;
#[cfg(debug_assertions)]
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::{
    append::rolling_file::{
        RollingFileAppender,
        policy::compound::{
            CompoundPolicy, roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger,
        },
    },
    config::{Appender, Config as LogConfig, Logger, Root},
    encode::pattern::PatternEncoder,
};
use std::{error::Error, path::PathBuf, time::Duration};
use tokio::{net::TcpListener, time::Instant};

mod config;
mod server;
mod store;

use config::Config;
use server::{AppState, build_router};
use store::SnapshotStore;

const APP_NAME: &str = "relay";
const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
/// Receives snapshots pushed by liftbox and serves them to remote scoreboards
struct Cli {
    #[clap(long, short, action(clap::ArgAction::Count))]
    /// Increase the log verbosity
    verbose: u8,

    #[clap(long)]
    /// Port to listen on, overrides the one in the config
    port: Option<u16>,

    #[clap(long)]
    /// Config file to use instead of the one in the platform config directory
    config: Option<PathBuf>,

    #[clap(long)]
    /// Ignore snapshots older than the stored one
    reject_stale: bool,

    #[clap(long)]
    /// Directory within which log files will be placed, default is platform dependent
    log_location: Option<PathBuf>,

    #[clap(long, default_value = "5000000")]
    /// Max size in bytes that a log file is allowed to reach before being rolled over
    log_max_file_size: u64,

    #[clap(long, default_value = "3")]
    /// Number of archived logs to keep
    num_old_logs: u32,
}

fn init_logging(args: &Cli) -> Result<(), Box<dyn Error>> {
    let log_level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut log_base_path = match &args.log_location {
        Some(path) => path.clone(),
        None => directories::BaseDirs::new()
            .ok_or("Could not find a directory to store logs")?
            .data_local_dir()
            .join("liftbox-logs"),
    };
    log_base_path.push(APP_NAME);
    let log_path = log_base_path.join(format!("{APP_NAME}-log.txt"));
    let archived_log_path = log_base_path.join(format!("{APP_NAME}-log-{{}}.txt.gz"));

    #[cfg(debug_assertions)]
    println!("Log path: {}", log_path.display());

    #[cfg(debug_assertions)]
    let console = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new("[{d} {h({l:5})} {M}] {m}{n}")))
        .build();

    let roller = FixedWindowRoller::builder().build(
        archived_log_path
            .to_str()
            .ok_or("The log location is not valid unicode")?,
        args.num_old_logs,
    )?;
    let file_policy = CompoundPolicy::new(
        Box::new(SizeTrigger::new(args.log_max_file_size)),
        Box::new(roller),
    );
    let file_appender = RollingFileAppender::builder()
        .append(true)
        .encoder(Box::new(PatternEncoder::new("[{d} {l:5} {M}] {m}{n}")))
        .build(log_path, Box::new(file_policy))?;

    let root = Root::builder().appender("file_appender");
    #[cfg(debug_assertions)]
    let root = root.appender("console");
    let root = root.build(LevelFilter::Error);

    let log_config = LogConfig::builder()
        .appender(Appender::builder().build("file_appender", Box::new(file_appender)));

    #[cfg(debug_assertions)]
    let log_config = log_config.appender(Appender::builder().build("console", Box::new(console)));

    let log_config = log_config
        .logger(Logger::builder().build(APP_NAME, log_level))
        .logger(Logger::builder().build("lift_common", log_level))
        .build(root)?;

    log4rs::init_config(log_config)?;
    log_panics::init();
    Ok(())
}

fn load_config(args: &Cli) -> Result<Config, Box<dyn Error>> {
    let mut config: Config = match &args.config {
        Some(path) => {
            info!("Reading config file from {path:?}");
            confy::load_path(path)?
        }
        None => {
            info!(
                "Reading config file from {:?}",
                confy::get_configuration_file_path(APP_NAME, None)?
            );
            match confy::load(APP_NAME, None) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Failed to read config file, overwriting with default. Error: {e}");
                    let config = Config::default();
                    confy::store(APP_NAME, None, &config)?;
                    config
                }
            }
        }
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    config.reject_stale |= args.reject_stale;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();
    init_logging(&args)?;
    info!("Starting relay");

    let config = load_config(&args)?;
    let state = AppState {
        store: SnapshotStore::new(config.reject_stale),
        sessions: SessionManager::new(config.sessions),
    };

    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut idle_check = tokio::time::interval(IDLE_CHECK_PERIOD);
        loop {
            idle_check.tick().await;
            let expired = sessions.expire_idle(Instant::now());
            if !expired.is_empty() {
                info!("Expired idle display sessions {expired:?}");
            }
        }
    });

    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!("Relay listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Could not wait for Ctrl-C: {e}");
            }
            info!("Received Ctrl-C, shutting down");
        })
        .await?;

    Ok(())
}
