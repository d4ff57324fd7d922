//! # xcookie-proxy
//!
//! Serve a local X display to untrusted clients through a decoy
//! MIT-MAGIC-COOKIE-1.
//!
//! ## Overview
//!
//! The proxy reads the real cookie of the protected display, derives a decoy
//! and listens on a fresh display socket. Clients are given only the decoy.
//! Each client's setup packet is checked against it and forwarded to the
//! real X server with the real cookie substituted; afterwards all traffic
//! passes through unchanged.
//!
//! ## Usage
//!
//! ```bash
//! # Protect the current display, printing the proxy display and decoy entry
//! xcookie-proxy --display :0 --untrusted
//!
//! # In the untrusted environment
//! xauth add unix:10 MIT-MAGIC-COOKIE-1 <decoy>
//! DISPLAY=unix:10 xterm
//! ```
//!
//! ## Environment Variables
//!
//! - `DISPLAY`: Display to protect (overridden by `--display`)
//! - `XAUTHORITY`: Authority file holding the real cookie
//! - `RUST_LOG`: Log level (`error`, `warn`, `info`, `debug`, `trace`)

mod connection;

use connection::{CookiePair, ProxyConnection};

use std::collections::HashMap;
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::RawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use calloop::generic::Generic;
use calloop::signals::{Signal, Signals};
use calloop::{EventLoop, Interest, Mode, PostAction};
use clap::Parser;

use xcookie_proxy::display::{DEFAULT_DISPLAY_OFFSET, DEFAULT_MAX_DISPLAYS, DEFAULT_SOCKET_DIR};
use xcookie_proxy::{Display, DisplayRange, XAuthCommand, XAuthEntry, XAuthority};

// =============================================================================
// Constants
// =============================================================================

/// Event loop dispatch timeout in milliseconds
const EVENT_LOOP_TIMEOUT_MS: u64 = 10;

// =============================================================================
// Command Line
// =============================================================================

#[derive(Parser, Debug)]
#[command(name = "xcookie-proxy", version, about = "Proxy an X display behind a decoy MIT-MAGIC-COOKIE-1")]
struct Cli {
    /// Display to protect; must be served on the local Unix socket
    #[arg(long, env = "DISPLAY")]
    display: String,

    /// Authority file holding the real cookie
    #[arg(long, env = "XAUTHORITY")]
    xauthority: Option<PathBuf>,

    /// Directory holding X server sockets
    #[arg(long, default_value = DEFAULT_SOCKET_DIR)]
    socket_dir: PathBuf,

    /// First display number considered for the proxy display
    #[arg(long, default_value_t = DEFAULT_DISPLAY_OFFSET)]
    display_offset: u32,

    /// Number of display numbers above the offset to try
    #[arg(long, default_value_t = DEFAULT_MAX_DISPLAYS)]
    max_displays: u32,

    /// Forward a freshly generated untrusted cookie instead of the stored
    /// one; the authority file is left untouched
    #[arg(long)]
    untrusted: bool,

    /// Seconds to wait for the X server to generate the untrusted cookie
    #[arg(long, default_value_t = 10)]
    generate_timeout: u64,

    /// Lifetime of the generated cookie in seconds (0 = no expiry)
    #[arg(long, default_value_t = 0)]
    cookie_lifetime: u64,
}

// =============================================================================
// Application State
// =============================================================================

/// Global proxy state managed by the event loop.
struct ProxyState {
    /// Active proxy connections, keyed by client socket FD
    connections: HashMap<RawFd, ProxyConnection>,
    /// Path to the genuine X server socket
    upstream_path: PathBuf,
    /// Decoy handed to clients and the real cookie behind it
    cookies: Arc<CookiePair>,
    /// Cleared by SIGINT/SIGTERM to leave the main loop
    running: bool,
}

impl ProxyState {
    fn new(upstream_path: PathBuf, cookies: Arc<CookiePair>) -> Self {
        Self {
            connections: HashMap::new(),
            upstream_path,
            cookies,
            running: true,
        }
    }
}

/// Listening socket of the proxy display, unlinked on drop.
struct ProxySocket {
    path: PathBuf,
}

impl Drop for ProxySocket {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::debug!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

// =============================================================================
// Start-up
// =============================================================================

/// Read the entry stored for `display` in the user's authority file.
fn load_stored_entry(
    authority: &dyn XAuthority,
    display: &Display,
) -> xcookie_proxy::Result<XAuthEntry> {
    match authority.read_entry(display) {
        Err(e) if e.is_not_found() => {
            log::error!("No MIT-MAGIC-COOKIE-1 entry for {} in the authority file.", display);
            log::error!("Run with --untrusted, or `xauth generate {} MIT-MAGIC-COOKIE-1`.", display);
            Err(e)
        }
        other => other,
    }
}

/// Have the X server mint an untrusted entry into `scratch` and read it back.
///
/// `scratch` must not be the user's authority file: only the scratch store
/// is written, so a failed generation loses nothing.
fn load_untrusted_entry(
    scratch: &dyn XAuthority,
    display: &Display,
    timeout: Duration,
) -> xcookie_proxy::Result<XAuthEntry> {
    log::info!("[XAUTH] Generating untrusted cookie for {}", display);
    scratch.generate_untrusted_cookie(display, timeout)?;
    scratch.read_entry(display)
}

/// Obtain the cookie the proxy presents to the X server.
fn obtain_real_entry(cli: &Cli, display: &Display) -> Result<XAuthEntry, Box<dyn std::error::Error>> {
    let lifetime = Duration::from_secs(cli.cookie_lifetime);

    if !cli.untrusted {
        let user = XAuthCommand::new(cli.xauthority.clone()).with_cookie_lifetime(lifetime);
        return Ok(load_stored_entry(&user, display)?);
    }

    // Removed when dropped at the end of this function.
    let scratch_file = tempfile::Builder::new().prefix("xcookie-").tempfile()?;
    let mut scratch = XAuthCommand::new(Some(scratch_file.path().to_path_buf()))
        .with_cookie_lifetime(lifetime);
    if let Some(path) = &cli.xauthority {
        scratch = scratch.with_connect_authority(path.clone());
    }
    Ok(load_untrusted_entry(
        &scratch,
        display,
        Duration::from_secs(cli.generate_timeout),
    )?)
}

/// `true` if `path` is a socket nobody accepts connections on.
fn is_stale_socket(path: &Path) -> bool {
    let is_socket = fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_socket());
    is_socket
        && matches!(
            UnixStream::connect(path),
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused
        )
}

/// Bind the first free display socket in `range`.
fn bind_proxy_display(
    socket_dir: &Path,
    range: DisplayRange,
) -> io::Result<(UnixListener, ProxySocket, Display)> {
    fs::create_dir_all(socket_dir)?;

    for number in range.numbers() {
        let display = Display::unix(number);
        let path = display.unix_socket_path(socket_dir);
        if is_stale_socket(&path) {
            log::info!("Removing stale socket: {}", path.display());
            fs::remove_file(&path)?;
        } else if path.exists() {
            log::trace!("Display {} taken", number);
            continue;
        }

        match UnixListener::bind(&path) {
            Ok(listener) => {
                listener.set_nonblocking(true)?;
                return Ok((listener, ProxySocket { path }, display));
            }
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e),
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        format!(
            "no free display in {}..={}",
            range.offset(),
            range.max_display()
        ),
    ))
}

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let display = Display::parse(&cli.display)?;
    if !display.is_local() {
        log::error!("Only local displays can be proxied, got {}", display);
        std::process::exit(1);
    }

    let upstream_path = display.unix_socket_path(&cli.socket_dir);
    log::info!("Upstream X server: {}", upstream_path.display());
    if !upstream_path.exists() {
        log::error!("Upstream socket does not exist: {}", upstream_path.display());
        log::error!("Check that an X server is running on {}.", display);
        std::process::exit(1);
    }

    let real = match obtain_real_entry(&cli, &display) {
        Ok(entry) => entry,
        Err(e) => {
            log::error!("Cannot obtain the real cookie: {}", e);
            std::process::exit(1);
        }
    };

    let range = DisplayRange::forwarding(cli.display_offset, cli.max_displays)?;
    let (listener, socket, proxy_display) = bind_proxy_display(&cli.socket_dir, range)?;
    log::info!("Listening: {} ({})", socket.path.display(), proxy_display);

    let decoy = real.decoy();
    println!("DISPLAY={}", proxy_display);
    // Clients reach the decoy through the proxy display, not the real one.
    println!("{}", decoy.with_display(proxy_display.clone()).to_list_line());

    // Initialize event loop
    let mut event_loop: EventLoop<ProxyState> = EventLoop::try_new()?;
    let mut state = ProxyState::new(upstream_path, Arc::new(CookiePair { decoy, real }));

    event_loop.handle().insert_source(
        Generic::new(listener, Interest::READ, Mode::Level),
        |_, listener, state| handle_new_connection(listener, state),
    )?;

    event_loop.handle().insert_source(
        Signals::new(&[Signal::SIGINT, Signal::SIGTERM])?,
        |event, _, state: &mut ProxyState| {
            log::info!("Received {:?}, shutting down", event.signal());
            state.running = false;
        },
    )?;

    log::info!("Starting event loop (Ctrl+C to exit)");

    // Main loop
    while state.running {
        // Poll all active connections
        poll_connections(&mut state);

        // Process event loop (handles new connections and signals)
        event_loop.dispatch(Some(Duration::from_millis(EVENT_LOOP_TIMEOUT_MS)), &mut state)?;
    }

    log::info!(
        "Closing {} connections, removing {}",
        state.connections.len(),
        socket.path.display()
    );
    Ok(())
}

// =============================================================================
// Event Handlers
// =============================================================================

/// Handle a new client connection.
fn handle_new_connection(
    listener: &UnixListener,
    state: &mut ProxyState,
) -> Result<PostAction, std::io::Error> {
    match listener.accept() {
        Ok((stream, _addr)) => {
            log::info!("New client connection");

            match ProxyConnection::new(stream, &state.upstream_path, Arc::clone(&state.cookies)) {
                Ok(conn) => {
                    let fd = conn.client_fd();
                    state.connections.insert(fd, conn);
                    log::debug!("Connection registered (fd={})", fd);
                }
                Err(e) => {
                    log::error!("Failed to connect to upstream: {}", e);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            // No pending connections
        }
        Err(e) => {
            log::warn!("Accept failed: {}", e);
        }
    }

    Ok(PostAction::Continue)
}

/// Poll all active connections and remove closed ones.
fn poll_connections(state: &mut ProxyState) {
    state.connections.retain(|fd, conn| match conn.poll() {
        Ok(active) => {
            if !active {
                log::info!("Client disconnected (fd={})", fd);
            }
            active
        }
        Err(e) => {
            log::debug!("Connection error (fd={}): {}", fd, e);
            false
        }
    });
}

// =============================================================================
// Tests
// =============================================================================
