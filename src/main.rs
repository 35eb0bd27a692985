//! # tether
//!
//! Wayland client windows parented across processes.
//!
//! - `export` shows a checkerboard window and prints its xdg-foreign handle
//! - `import` shows a window parented to the exported one
//! - `pair` shows a parent and a child toplevel from one process
//! - `lead` / `follow` keep two independent windows at the same size

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use tether::config::expand_home;
use tether::foreign::{read_handle_file, FilePublisher, StdoutPublisher};
use tether::handoff::LogListener;
use tether::{
    sync, Client, Connection, EventSource, Global, HeadlessServer, Mode, ShutdownFlag, StartupError,
    SyncTransport, TetherConfig, TetherError, WaylandClient,
};

/// Frames drawn by `--headless` when `--frames` is not given
const HEADLESS_FRAMES: u64 = 300;

#[derive(Parser)]
#[command(name = "tether")]
#[command(about = "Wayland windows that parent each other across processes via xdg-foreign")]
#[command(version)]
struct Cli {
    /// Path to configuration file [default: ~/.config/tether/tether.toml]
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Run against the in-process headless compositor instead of WAYLAND_DISPLAY
    #[arg(long, default_value_t = false)]
    headless: bool,

    /// Shut down after this many paced frames
    #[arg(long)]
    frames: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
enum Command {
    /// Checkerboard window whose handle is printed for an importer
    Export {
        /// Also write the handle to this file
        #[arg(long)]
        handle_file: Option<PathBuf>,
    },
    /// Window parented to an exported toplevel
    Import {
        /// Handle printed by `tether export`
        handle: Option<String>,
        /// Read the handle from this file instead
        #[arg(long)]
        handle_file: Option<PathBuf>,
    },
    /// Parent and child toplevel in one process
    Pair,
    /// Publish this window's size to a follower
    Lead {
        #[arg(long)]
        sync: Option<PathBuf>,
        #[arg(long, value_enum)]
        transport: Option<SyncTransport>,
    },
    /// Resize to the size a leader publishes
    Follow {
        #[arg(long)]
        sync: Option<PathBuf>,
        #[arg(long, value_enum)]
        transport: Option<SyncTransport>,
    },
}

impl Command {
    /// Resolve the client mode, reading the import handle if needed
    fn mode(&self, config: &TetherConfig) -> Result<Mode> {
        Ok(match self {
            Command::Export { .. } => Mode::Export,
            Command::Import {
                handle,
                handle_file,
            } => {
                let handle = match (handle, handle_file.as_ref().or(config.foreign.handle_file.as_ref())) {
                    (Some(handle), _) => handle.clone(),
                    (None, Some(path)) => read_handle_file(&expand_home(path)?)?,
                    (None, None) => return Err(StartupError::MissingHandle.into()),
                };
                Mode::Import { handle }
            }
            Command::Pair => Mode::Pair,
            Command::Lead { .. } => Mode::Lead,
            Command::Follow { .. } => Mode::Follow,
        })
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(()) => {
            info!("👋 tether shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    info!("🚀 Starting tether");
    info!(
        "📄 Version: {} (built {} for {})",
        env!("CARGO_PKG_VERSION"),
        env!("TETHER_BUILD_DATE"),
        env!("TETHER_TARGET")
    );
    let commit = env!("TETHER_GIT_COMMIT");
    if !commit.is_empty() {
        debug!("Git commit {}", commit);
    }

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(TetherConfig::default_path);
    let mut config = match TetherConfig::load(&config_path) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", config_path.display());
            config
        }
        Err(e) => {
            warn!("Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            TetherConfig::default()
        }
    };

    // Override config with CLI flags
    if let Command::Lead { sync, transport } | Command::Follow { sync, transport } = &cli.command {
        if let Some(path) = sync {
            config.sync.path = path.clone();
        }
        if let Some(transport) = transport {
            config.sync.transport = *transport;
        }
    }

    let mode = cli.command.mode(&config)?;

    let shutdown = ShutdownFlag::new();
    {
        let flag = shutdown.clone();
        ctrlc::set_handler(move || flag.request()).context("Failed to install signal handler")?;
    }

    let frames = match (cli.frames, cli.headless) {
        (Some(frames), _) => Some(frames),
        (None, true) => Some(HEADLESS_FRAMES),
        (None, false) => None,
    };

    let mut client = Client::new(mode.clone(), config.clone(), shutdown).with_frame_limit(frames);
    client.add_resize_listener(Box::new(LogListener::new(mode.name())));

    match &cli.command {
        Command::Export { handle_file } => {
            client.add_handle_publisher(Box::new(StdoutPublisher));
            if let Some(path) = handle_file.as_ref().or(config.foreign.handle_file.as_ref()) {
                client.add_handle_publisher(Box::new(FilePublisher::new(expand_home(path)?)));
            }
        }
        Command::Lead { .. } => {
            let path = expand_home(&config.sync.path)?;
            info!("📤 Publishing size over {:?} at {}", config.sync.transport, path.display());
            client.set_size_publisher(sync::publisher(config.sync.transport, &path));
        }
        Command::Follow { .. } => {
            let path = expand_home(&config.sync.path)?;
            info!("📥 Following size over {:?} at {}", config.sync.transport, path.display());
            client.set_size_source(sync::source(config.sync.transport, &path)?);
        }
        Command::Import { .. } | Command::Pair => {}
    }

    if cli.headless {
        info!("🖥️ Headless mode enabled - using the in-process compositor");
        let server = HeadlessServer::new();
        server.set_auto_present(true);
        let mut conn = server.connect();
        drive(&mut client, &mut conn, &server.globals())?;
    } else {
        let mut conn = WaylandClient::connect()?;
        let globals = conn.globals();
        drive(&mut client, &mut conn, &globals)?;
    }
    Ok(())
}

/// Bootstrap and run one client, tearing down on every exit path
fn drive<C: Connection>(client: &mut Client, conn: &mut C, globals: &[Global]) -> Result<(), TetherError> {
    if let Err(e) = client.bootstrap(conn, globals) {
        client.teardown(conn);
        if let Err(flush) = EventSource::flush(conn) {
            debug!("Final flush failed: {}", flush);
        }
        return Err(e);
    }
    client.run(conn)
}
