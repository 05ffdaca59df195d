use std::{error::Error, io, process};

use async_trait::async_trait;
use clap::{command, Parser, ValueHint};
use log::{debug, error, info, LevelFilter};

use playbot::{
    auth::OAuthSession,
    channel::{self, Channel},
    config::{Config, Credentials},
    events::EventBus,
    notifier::{Notifier, NotifierDriver},
    player::{self, Player, PlayerDriver},
    protocol::Song,
    queue::CommandQueue,
};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when built in release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Websocket URL of the orchestration server
    #[arg(value_hint = ValueHint::Url)]
    server: String,

    /// Secrets file
    ///
    /// Ensure that this file is kept secure and not shared publicly, as it
    /// contains the client credentials for your bot account.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("secrets.toml"))]
    secrets_file: String,

    /// Device name
    ///
    /// Set the name under which this client reports itself.
    ///
    /// [default: system hostname]
    #[arg(short, long, value_hint = ValueHint::Hostname)]
    name: Option<String>,

    /// Inbound topic to subscribe to
    #[arg(short, long, default_value_t = String::from("/topic/client"))]
    topic: String,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,
}

/// Initializes the logger facade.
///
/// Command line flags override `RUST_LOG`, which overrides the built-in
/// `info` default.
fn init_logger(args: &Args) {
    let mut logger = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if args.quiet || args.verbose > 0 {
        // `quiet` and `verbose` share a clap group, so at most one is set.
        let level = match args.verbose {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Only our own module; external crates keep the default filter.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the client credentials from a file.
fn load_credentials(secrets_file: &str) -> io::Result<Credentials> {
    let credentials = Credentials::from_file(secrets_file);

    if let Err(ref e) = credentials {
        if e.kind() == io::ErrorKind::NotFound {
            info!("read the documentation on how to set your credentials in {secrets_file}");
        }
    }

    credentials
}

/// Playback placeholder until a real audio backend is wired in: logs what
/// it would do.
#[derive(Default)]
struct ConsolePlayer;

#[async_trait]
impl Player for ConsolePlayer {
    async fn play(&mut self, song: &Song) -> player::Result<()> {
        info!("[player] play {song}");
        Ok(())
    }

    async fn pause(&mut self) -> player::Result<()> {
        info!("[player] pause");
        Ok(())
    }

    async fn stop(&mut self) -> player::Result<()> {
        info!("[player] stop");
        Ok(())
    }

    async fn set_volume(&mut self, volume: u8) -> player::Result<()> {
        info!("[player] volume {volume}%");
        Ok(())
    }
}

/// Presence placeholder: logs the presence line.
#[derive(Default)]
struct ConsoleNotifier;

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn now_playing(&mut self, title: Option<&str>) {
        match title {
            Some(title) => info!("[presence] listening to {title}"),
            None => info!("[presence] idle"),
        }
    }
}

/// Main application loop.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let credentials = load_credentials(&args.secrets_file)?;

    let mut config = Config::new(args.server.parse()?, credentials);
    config.topic = args.topic;
    config.device_name = args
        .name
        .or_else(sysinfo::System::host_name)
        .unwrap_or_else(|| config.app_name.clone());
    info!("reporting as {}", config.device_name);

    let session = OAuthSession::new(&config)?;
    let bus = EventBus::new();
    let queue = CommandQueue::new();
    let mut channel = Channel::new(&config, session, queue.clone(), bus.clone())?;
    let shutdown = channel.shutdown_handle();

    tokio::spawn(channel::forward_events(
        bus.clone(),
        queue.clone(),
        shutdown.clone(),
    ));
    tokio::spawn(PlayerDriver::new(ConsolePlayer, bus.clone(), shutdown.clone()).run());
    tokio::spawn(NotifierDriver::new(ConsoleNotifier, bus.clone(), shutdown.clone()).run());

    let run = channel.run();
    tokio::pin!(run);

    tokio::select! {
        // Prioritize shutdown signals.
        biased;

        _ = tokio::signal::ctrl_c() => {
            info!("shutting down gracefully");
            shutdown.cancel();
            run.await?;
        }

        result = &mut run => result?,
    }

    Ok(())
}

/// Main entry point of the application.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {args:#?}");

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    if let Err(e) = run(args).await {
        error!("{e}");
        process::exit(1);
    }
}
