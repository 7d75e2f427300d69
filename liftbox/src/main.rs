use clap::Parser;
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
use std::{
    error::Error,
    path::{Path, PathBuf},
    sync::Arc,
};

mod command_server;
mod competition;
mod decision;
mod field_of_play;
mod jury;
mod registry;
mod relay_publisher;
mod snapshot_builder;
mod timer;

mod config;
use config::Config;

use command_server::CommandServer;
use competition::{FileCompetition, TranslationTable};
use lift_common::session::SessionManager;
use registry::Registry;
use relay_publisher::RelayPublisher;

const APP_NAME: &str = "liftbox";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(long, short, action(clap::ArgAction::Count))]
    /// Increase the log verbosity
    verbose: u8,

    #[clap(long, default_value = "8100")]
    /// Port to listen on for referee panels, consoles and displays
    port: u16,

    #[clap(long)]
    /// Config file to use instead of the one in the platform config directory
    config: Option<PathBuf>,

    #[clap(long)]
    /// Competition data file, overrides the one named in the config
    competition: Option<PathBuf>,

    #[clap(long)]
    /// Translations file, overrides the one named in the config
    translations: Option<PathBuf>,

    #[clap(long)]
    /// Base URL of the relay, overrides the one in the config
    relay_url: Option<String>,

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

    let log_base_path = match &args.log_location {
        Some(path) => path.clone(),
        None => {
            let mut path = directories::BaseDirs::new()
                .ok_or("Could not find a directory to store logs")?
                .data_local_dir()
                .to_path_buf();
            path.push("liftbox-logs");
            path
        }
    };
    let log_path = log_base_path.join(format!("{APP_NAME}-log.txt"));
    let archived_log_path = log_base_path.join(format!("{APP_NAME}-log-{{}}.txt.gz"));

    #[cfg(debug_assertions)]
    println!("Log path: {}", log_path.display());

    // Only log to the console in debug mode
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

    // Everything outside this app only logs errors
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

/// A broken file at an explicit path is an error. A broken file at the default
/// location is replaced with the defaults.
fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn Error>> {
    if let Some(path) = path {
        info!("Reading config file from {path:?}");
        return Ok(confy::load_path(path)?);
    }

    info!(
        "Reading config file from {:?}",
        confy::get_configuration_file_path(APP_NAME, None)?
    );
    let config = match confy::load(APP_NAME, None) {
        Ok(c) => c,
        Err(e) => {
            warn!("Failed to read config file, overwriting with default. Error: {e}");
            let config = Config::default();
            confy::store(APP_NAME, None, &config)?;
            config
        }
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();
    init_logging(&args)?;
    info!("Starting liftbox");

    let mut config = load_config(args.config.as_deref())?;
    if let Some(path) = args.competition.clone() {
        config.data.competition = Some(path);
    }
    if let Some(path) = args.translations.clone() {
        config.data.translations = Some(path);
    }
    if let Some(url) = args.relay_url.clone() {
        config.relay.url = url;
    }
    config.validate()?;

    let competition = match &config.data.competition {
        Some(path) => {
            info!("Loading competition data from {path:?}");
            FileCompetition::load(path)?
        }
        None => {
            warn!("No competition data configured, platforms will show no athletes");
            FileCompetition::empty()
        }
    };
    let translations = match &config.data.translations {
        Some(path) => {
            info!("Loading translations from {path:?}");
            TranslationTable::load(path)?
        }
        None => TranslationTable::default(),
    };

    let registry = Arc::new(Registry::start(
        &config,
        Arc::new(competition),
        Arc::new(translations),
    )?);
    info!(
        "Fields of play: {}",
        registry.names().collect::<Vec<_>>().join(", ")
    );
    let sessions = SessionManager::new(config.sessions);

    let mut publishers = vec![];
    if config.relay.enabled() {
        for fop in registry.handles() {
            let publisher = RelayPublisher::new(&config.relay, fop.clone())?;
            // Give the relay something to show before the first decision
            if let Err(e) = publisher.publish(fop.snapshot().await?) {
                warn!("Could not queue the initial snapshot of {}: {e}", fop.name());
            }
            publishers.push(publisher);
        }
    } else {
        info!("No relay configured, snapshots stay local");
    }

    let server = CommandServer::bind(("::", args.port), registry.clone(), sessions.clone()).await;
    let server = match server {
        Ok(server) => server,
        Err(e) => {
            warn!("Could not listen on IPv6 ({e}), falling back to IPv4");
            CommandServer::bind(("0.0.0.0", args.port), registry.clone(), sessions.clone())
                .await?
        }
    };

    tokio::select! {
        _ = server.run() => {}
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("Received Ctrl-C, shutting down");
        }
    }

    drop(publishers);
    registry.stop_all();
    Ok(())
}
