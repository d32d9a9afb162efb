//! headmore - A VNC viewer for the text terminal
//!
//! headmore connects to a remote framebuffer server and renders the desktop
//! into the terminal with half-block characters. The keyboard drives
//! everything: panning, zooming and a virtual mouse.
//!
//! # Quick Start
//!
//! ```text
//! headmore myhost          # Display 0 (port 5900)
//! headmore myhost:1        # Display 1 (port 5901)
//! headmore myhost::5999    # Explicit port
//! ```
//!
//! # Keys (input to viewer)
//!
//! | Key | Action |
//! |-----|--------|
//! | Esc | Quit |
//! | ` | Toggle input to viewer/remote |
//! | wasd | Pan |
//! | q/e | Zoom out/in |
//! | ijkl | Move mouse |
//! | u/o/0 | Click left/right/middle |
//! | h | Help |

mod config;
mod core;
mod ui;

use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::Context;
use tracing::{error, info, Dispatch};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::core::framebuffer::SharedFramebuffer;
use crate::core::rfb::RfbSession;
use crate::core::session::Connection;
use crate::ui::{TermCanvas, Viewer};

/// Command line arguments
#[derive(Debug, Default, PartialEq, Eq)]
struct Args {
    host: String,
    /// Display number from `HOST:N`
    display: Option<u16>,
    /// Literal port from `HOST::PORT` or `-p`
    port: Option<u16>,
    config: Option<PathBuf>,
    exclusive: bool,
}

impl Args {
    /// Port to connect to, given the configured base port
    fn port(&self, default_port: u16) -> Result<u16, String> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        let display = self.display.unwrap_or(0);
        default_port
            .checked_add(display)
            .ok_or_else(|| format!("Display number too large: {}", display))
    }
}

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_version() {
    eprintln!("headmore {}", VERSION);
}

fn print_help() {
    eprintln!("headmore {} - A VNC viewer for the text terminal", VERSION);
    eprintln!();
    eprintln!("Usage: headmore [OPTIONS] <HOST[:DISPLAY] | HOST::PORT>");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -p, --port <PORT>     Connect to PORT");
    eprintln!("  -c, --config <PATH>   Read configuration from PATH");
    eprintln!("  --exclusive           Ask the server to disconnect other viewers");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Keys (input to viewer):");
    eprintln!("  Esc                   Disconnect and quit");
    eprintln!("  `                     Toggle input to viewer/remote");
    eprintln!("  ~                     Click back-tick on remote");
    eprintln!("  w/a/s/d               Pan");
    eprintln!("  q/e                   Zoom out/in");
    eprintln!("  i/j/k/l               Move mouse pointer");
    eprintln!("  u/o/0                 Click left/right/middle button");
    eprintln!("  7/8/9                 Toggle hold left/middle/right button");
    eprintln!("  p                     Zoom to mouse pointer");
    eprintln!("  t                     Toggle pointer marker");
    eprintln!("  z/m x/n c/b v         Toggle hold Ctrl, Shift, Alt, Super");
    eprintln!("  h                     Toggle help");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  headmore myhost       Display 0 on myhost");
    eprintln!("  headmore myhost:2     Display 2 (port 5902)");
    eprintln!("  headmore myhost::5999 Port 5999");
    eprintln!();
    eprintln!("Configuration: ~/.headmore/config.toml");
}

/// Split `HOST`, `HOST:N` or `HOST::PORT`
fn parse_target(target: &str, args: &mut Args) -> Result<(), String> {
    if let Some((host, port)) = target.split_once("::") {
        args.host = host.to_string();
        args.port = Some(port.parse().map_err(|_| format!("Invalid port: {}", port))?);
    } else if let Some((host, display)) = target.rsplit_once(':') {
        args.host = host.to_string();
        args.display = Some(
            display
                .parse()
                .map_err(|_| format!("Invalid display number: {}", display))?,
        );
    } else {
        args.host = target.to_string();
    }
    if args.host.is_empty() {
        return Err("Missing host name".to_string());
    }
    Ok(())
}

fn parse_args_from(argv: &[String]) -> Result<Args, String> {
    let mut args = Args::default();
    let mut target: Option<&str> = None;
    let mut port: Option<u16> = None;
    let mut i = 1;

    while i < argv.len() {
        match argv[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-p" | "--port" => {
                i += 1;
                if i >= argv.len() {
                    return Err("Missing port argument".to_string());
                }
                port = Some(
                    argv[i]
                        .parse()
                        .map_err(|_| format!("Invalid port: {}", argv[i]))?,
                );
            }
            "-c" | "--config" => {
                i += 1;
                if i >= argv.len() {
                    return Err("Missing config path".to_string());
                }
                args.config = Some(PathBuf::from(&argv[i]));
            }
            "--exclusive" => {
                args.exclusive = true;
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            arg => {
                if target.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                target = Some(arg);
            }
        }
        i += 1;
    }

    let target = target.ok_or_else(|| "Missing host".to_string())?;
    parse_target(target, &mut args)?;
    // -p wins over the display number
    if port.is_some() {
        args.port = port;
    }
    Ok(args)
}

fn parse_args() -> Result<Args, String> {
    let argv: Vec<String> = env::args().collect();
    parse_args_from(&argv)
}

/// Build the log sink. It is handed around explicitly, never installed as
/// the global default.
fn init_logging(config: &Config) -> anyhow::Result<(Dispatch, PathBuf)> {
    let log_path = config.log_path();

    // Create log directory if needed
    if let Some(parent) = log_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    // Open log file (append mode)
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("Failed to open log file {}", log_path.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log.level))
        .context("Invalid log level")?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(Mutex::new(log_file))
        .with_ansi(false)
        .finish();
    Ok((Dispatch::new(subscriber), log_path))
}

fn run(args: &Args, config: &Config, dispatch: &Dispatch) -> anyhow::Result<()> {
    let port = args.port(config.connection.default_port).map_err(anyhow::Error::msg)?;
    let shared = config.viewer.shared && !args.exclusive;

    let session = RfbSession::connect(&args.host, port, shared)
        .with_context(|| format!("Failed to connect to {}:{}", args.host, port))?;

    // The terminal must be usable before any thread is started
    let canvas = TermCanvas::new().context("Failed to initialize the terminal")?;

    let framebuffer = SharedFramebuffer::new(session.info.width, session.info.height);
    let mut connection = Connection::spawn(
        session.reader,
        framebuffer,
        config.connection.poll_timeout(),
        dispatch.clone(),
    )
    .context("Failed to start the protocol thread")?;

    let result = Viewer::new(
        canvas,
        session.writer,
        session.info,
        connection.state().clone(),
        connection.framebuffer().clone(),
        config,
    )
    .and_then(|mut viewer| viewer.run());

    if !connection.is_connected() {
        info!("Remote side had already disconnected");
    }
    // The viewer and its terminal are gone by now. Stop the I/O thread
    // before the framebuffer is released.
    connection.shutdown();

    if let Err(e) = &result {
        error!("Viewer stopped: {}", e);
    }
    result.context("Viewer failed")
}

fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = match parse_args() {
        Ok(a) => a,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let (dispatch, log_path) = init_logging(&config)?;
    eprintln!("Logging to {}", log_path.display());

    tracing::dispatcher::with_default(&dispatch, || {
        info!("headmore {} starting", VERSION);
        let result = run(&args, &config, &dispatch);
        info!("headmore exiting");
        result
    })
}
