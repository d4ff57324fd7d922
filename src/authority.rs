//! Authority store boundary.
//!
//! The rewriter and generator never touch `.Xauthority` directly; they go
//! through [`XAuthority`]. Two adapters ship with the crate:
//!
//! - [`XAuthCommand`] drives the `xauth` utility, bounding every invocation
//!   with a deadline and an optional cancellation flag
//! - [`MemoryAuthority`] keeps entries in process
//!
//! Neither adapter ever sees a decoy entry: decoys are derived in memory per
//! session and handed to the untrusted peer out of band.

use std::collections::{HashMap, HashSet};
use std::env;
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::display::Display;
use crate::entry::{XAuthEntry, MIT_MAGIC_COOKIE_PROTO};
use crate::error::{Result, XAuthError};

// =============================================================================
// Port
// =============================================================================

/// Store of real authority entries.
///
/// All operations block. Implementations serialise writers against readers
/// for the same display; callers impose no ordering of their own.
pub trait XAuthority: Send + Sync {
    /// Read the entry for `display`.
    ///
    /// # Returns
    /// * `Ok(entry)` - The stored entry
    /// * `Err(XAuthError::NotFound)` - Nothing stored (expected, not an anomaly)
    fn read_entry(&self, display: &Display) -> Result<XAuthEntry>;

    /// Insert or replace the entry for the entry's display.
    fn add_entry(&self, entry: &XAuthEntry) -> Result<()>;

    /// Remove every entry for `display`.
    ///
    /// # Returns
    /// * `Ok(())` - Success (idempotent - succeeds even if nothing was stored)
    fn remove_entries(&self, display: &Display) -> Result<()>;

    /// Ask the genuine display to mint an untrusted cookie and store it.
    ///
    /// Bounded by `timeout`; a zero timeout is rejected.
    ///
    /// # Errors
    /// * `DisplayUnreachable` - The display could not be opened
    /// * `Timeout` / `Cancelled` - The request was abandoned; the store is
    ///   left as it was before the call
    fn generate_untrusted_cookie(&self, display: &Display, timeout: Duration) -> Result<()>;
}

fn require_timeout(timeout: Duration) -> Result<()> {
    if timeout.is_zero() {
        return Err(XAuthError::Validation(
            "cookie generation needs a non-zero timeout".into(),
        ));
    }
    Ok(())
}

// =============================================================================
// In-Memory Store
// =============================================================================

/// Entries are keyed by host and display number; the screen is irrelevant
/// to authorization, as with `xauth`.
type EntryKey = (String, u32);

fn entry_key(display: &Display) -> EntryKey {
    (display.host_name().to_string(), display.display_number())
}

/// In-process authority store.
///
/// One lock guards every display, so a writer never races a reader.
#[derive(Debug, Default)]
pub struct MemoryAuthority {
    entries: Mutex<HashMap<EntryKey, XAuthEntry>>,
    reachable: HashSet<EntryKey>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Treat `display` as having a live X server able to mint cookies.
    pub fn with_reachable(mut self, display: &Display) -> Self {
        self.reachable.insert(entry_key(display));
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<EntryKey, XAuthEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl XAuthority for MemoryAuthority {
    fn read_entry(&self, display: &Display) -> Result<XAuthEntry> {
        self.entries()
            .get(&entry_key(display))
            .cloned()
            .ok_or_else(|| XAuthError::NotFound(display.clone()))
    }

    fn add_entry(&self, entry: &XAuthEntry) -> Result<()> {
        entry.cookie_bytes()?;
        self.entries()
            .insert(entry_key(entry.display()), entry.clone());
        Ok(())
    }

    fn remove_entries(&self, display: &Display) -> Result<()> {
        self.entries().remove(&entry_key(display));
        Ok(())
    }

    fn generate_untrusted_cookie(&self, display: &Display, timeout: Duration) -> Result<()> {
        require_timeout(timeout)?;
        if !self.reachable.contains(&entry_key(display)) {
            return Err(XAuthError::DisplayUnreachable {
                display: display.clone(),
                detail: "unable to open display".into(),
            });
        }
        let entry = XAuthEntry::new_random(display.clone());
        self.entries().insert(entry_key(display), entry);
        Ok(())
    }
}

// =============================================================================
// xauth Command
// =============================================================================

/// Name of the authority utility looked up on `PATH`.
pub const XAUTH_PROGRAM: &str = "xauth";

/// Default bound on `list`, `add` and `remove` invocations.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a running child is checked for exit, deadline and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Marker xauth prints when it cannot reach the X server.
const UNREACHABLE_MARKER: &str = "unable to open display";

/// [`XAuthority`] backed by the `xauth` command.
///
/// `xauth` locks the authority file and replaces it atomically, so an
/// invocation killed at its deadline leaves the file untouched.
#[derive(Debug, Clone)]
pub struct XAuthCommand {
    program: PathBuf,
    leading_args: Vec<OsString>,
    authority_file: Option<PathBuf>,
    connect_authority: Option<PathBuf>,
    command_timeout: Duration,
    cookie_lifetime: Duration,
    cancel: Option<Arc<AtomicBool>>,
}

impl XAuthCommand {
    /// Use `xauth` from `PATH` on `authority_file` (or xauth's own default,
    /// `$XAUTHORITY` / `~/.Xauthority`, when `None`).
    pub fn new(authority_file: Option<PathBuf>) -> Self {
        Self {
            program: PathBuf::from(XAUTH_PROGRAM),
            leading_args: Vec::new(),
            authority_file,
            connect_authority: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            cookie_lifetime: Duration::ZERO,
            cancel: None,
        }
    }

    /// Run a different program, with `leading_args` placed before the xauth
    /// arguments (e.g. `sudo -u user xauth`).
    pub fn with_program<I, S>(mut self, program: impl Into<PathBuf>, leading_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program = program.into();
        self.leading_args = leading_args.into_iter().map(Into::into).collect();
        self
    }

    /// Authority file xauth uses to open the display when generating,
    /// passed as `XAUTHORITY`. Needed when `-f` names a scratch file.
    pub fn with_connect_authority(mut self, path: impl Into<PathBuf>) -> Self {
        self.connect_authority = Some(path.into());
        self
    }

    /// Bound for `list`, `add` and `remove`.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Lifetime xauth gives generated untrusted cookies; zero never expires.
    pub fn with_cookie_lifetime(mut self, lifetime: Duration) -> Self {
        self.cookie_lifetime = lifetime;
        self
    }

    /// Abandon running invocations once `flag` is set.
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    #[inline]
    pub fn authority_file(&self) -> Option<&Path> {
        self.authority_file.as_deref()
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    /// Full argument vector: leading args, `-f FILE`, then the operation.
    fn args(&self, op: &[String]) -> Vec<OsString> {
        let mut args = self.leading_args.clone();
        if let Some(file) = &self.authority_file {
            args.push("-f".into());
            args.push(file.clone().into_os_string());
        }
        args.extend(op.iter().map(OsString::from));
        args
    }

    /// Run one xauth operation and return its stdout.
    fn run(&self, op: &[String], timeout: Duration) -> Result<String> {
        log::debug!("[XAUTH] {} {}", XAUTH_PROGRAM, op.join(" "));

        if self.cancelled() {
            return Err(XAuthError::Cancelled);
        }

        let mut command = Command::new(&self.program);
        if let Some(path) = &self.connect_authority {
            command.env("XAUTHORITY", path);
        }
        let mut child = command
            .args(self.args(op))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                XAuthError::Command(format!("cannot run {}: {e}", self.program.display()))
            })?;

        // Drain pipes on their own threads so a chatty child cannot block on
        // a full pipe while we poll it.
        let stdout = spawn_pipe_reader(child.stdout.take());
        let stderr = spawn_pipe_reader(child.stderr.take());

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if self.cancelled() {
                kill_and_reap(&mut child);
                log::warn!("[XAUTH] {} cancelled", op.join(" "));
                return Err(XAuthError::Cancelled);
            }
            if started.elapsed() >= timeout {
                kill_and_reap(&mut child);
                log::warn!("[XAUTH] {} timed out after {:?}", op.join(" "), timeout);
                return Err(XAuthError::Timeout(timeout));
            }
            thread::sleep(POLL_INTERVAL);
        };

        // Descendants of the child may still hold the pipes open.
        let deadline = started + timeout;
        let (Some(stdout), Some(stderr)) = (
            collect_pipe(&stdout, deadline),
            collect_pipe(&stderr, deadline),
        ) else {
            log::warn!("[XAUTH] {} output still open after {:?}", op.join(" "), timeout);
            return Err(XAuthError::Timeout(timeout));
        };

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            let detail = if stderr.trim().is_empty() {
                format!("exited with {status}")
            } else {
                stderr.trim().to_string()
            };
            return Err(XAuthError::Command(detail));
        }

        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }
}

impl XAuthority for XAuthCommand {
    fn read_entry(&self, display: &Display) -> Result<XAuthEntry> {
        let out = self.run(
            &["list".into(), display.to_string()],
            self.command_timeout,
        )?;
        if out.trim().is_empty() {
            return Err(XAuthError::NotFound(display.clone()));
        }
        XAuthEntry::from_list_line(display.clone(), &out)
    }

    fn add_entry(&self, entry: &XAuthEntry) -> Result<()> {
        self.run(
            &[
                "add".into(),
                entry.display().to_string(),
                entry.proto().to_string(),
                entry.cookie().to_string(),
            ],
            self.command_timeout,
        )?;
        Ok(())
    }

    fn remove_entries(&self, display: &Display) -> Result<()> {
        self.run(
            &["remove".into(), display.to_string()],
            self.command_timeout,
        )?;
        Ok(())
    }

    fn generate_untrusted_cookie(&self, display: &Display, timeout: Duration) -> Result<()> {
        require_timeout(timeout)?;
        let op = [
            "generate".into(),
            display.to_string(),
            MIT_MAGIC_COOKIE_PROTO.into(),
            "untrusted".into(),
            "timeout".into(),
            self.cookie_lifetime.as_secs().to_string(),
        ];
        self.run(&op, timeout).map(drop).map_err(|e| match e {
            XAuthError::Command(detail) if detail.contains(UNREACHABLE_MARKER) => {
                XAuthError::DisplayUnreachable {
                    display: display.clone(),
                    detail,
                }
            }
            other => other,
        })
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(pipe: Option<R>) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

/// Wait for a pipe reader until `deadline`; `None` if it is still blocked.
fn collect_pipe(rx: &Receiver<Vec<u8>>, deadline: Instant) -> Option<Vec<u8>> {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(buf) => Some(buf),
        Err(RecvTimeoutError::Disconnected) => Some(Vec::new()),
        Err(RecvTimeoutError::Timeout) => None,
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Locate `xauth` on `PATH`.
pub fn check_xauth_available() -> Result<PathBuf> {
    let path = env::var_os("PATH").unwrap_or_default();
    env::split_paths(&path)
        .map(|dir| dir.join(XAUTH_PROGRAM))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| {
            XAuthError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "xauth not found on PATH",
            ))
        })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const COOKIE: &str = "00112233445566778899aabbccddeeff";

    fn entry(display: u32) -> XAuthEntry {
        XAuthEntry::new(Display::unix(display), MIT_MAGIC_COOKIE_PROTO, COOKIE).unwrap()
    }

    /// xauth stand-in: `sh -c SCRIPT xauth ARGS...`.
    fn fake_xauth(script: &str) -> XAuthCommand {
        XAuthCommand::new(Some(PathBuf::from("/tmp/test.xauth")))
            .with_program("sh", ["-c", script, "xauth"])
            .with_command_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_memory_round_trip() {
        let store = MemoryAuthority::new();
        let display = Display::unix(10);

        assert!(store.read_entry(&display).unwrap_err().is_not_found());

        let e = entry(10);
        store.add_entry(&e).unwrap();
        assert_eq!(store.read_entry(&display).unwrap(), e);

        store.remove_entries(&display).unwrap();
        assert!(store.read_entry(&display).unwrap_err().is_not_found());
        // Idempotent
        store.remove_entries(&display).unwrap();
    }

    #[test]
    fn test_memory_add_is_upsert() {
        let store = MemoryAuthority::new();
        let first = XAuthEntry::new_random(Display::unix(10));
        let second = XAuthEntry::new_random(Display::unix(10));
        store.add_entry(&first).unwrap();
        store.add_entry(&second).unwrap();
        assert_eq!(store.read_entry(&Display::unix(10)).unwrap(), second);
    }

    #[test]
    fn test_memory_keys_ignore_screen() {
        let store = MemoryAuthority::new();
        store.add_entry(&entry(10)).unwrap();
        let screen_one = Display::parse(":10.1").unwrap();
        assert_eq!(store.read_entry(&screen_one).unwrap(), entry(10));
        assert!(store.read_entry(&Display::unix(11)).is_err());
    }

    #[test]
    fn test_memory_generate() {
        let live = Display::unix(10);
        let store = MemoryAuthority::new().with_reachable(&live);

        store
            .generate_untrusted_cookie(&live, Duration::from_secs(1))
            .unwrap();
        assert_eq!(store.read_entry(&live).unwrap().display(), &live);

        let dead = Display::unix(11);
        match store.generate_untrusted_cookie(&dead, Duration::from_secs(1)) {
            Err(XAuthError::DisplayUnreachable { display, .. }) => assert_eq!(display, dead),
            other => panic!("expected unreachable, got {other:?}"),
        }
        assert!(store.read_entry(&dead).unwrap_err().is_not_found());

        assert!(matches!(
            store.generate_untrusted_cookie(&live, Duration::ZERO),
            Err(XAuthError::Validation(_))
        ));
    }

    #[test]
    fn test_memory_concurrent_sessions() {
        let store = Arc::new(MemoryAuthority::new());
        let handles: Vec<_> = (10..20)
            .map(|n| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    let e = XAuthEntry::new_random(Display::unix(n));
                    store.add_entry(&e).unwrap();
                    assert_eq!(store.read_entry(&Display::unix(n)).unwrap(), e);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_command_args() {
        let cmd = XAuthCommand::new(Some(PathBuf::from("/home/u/.Xauthority")));
        let args = cmd.args(&["list".into(), "unix:10".into()]);
        assert_eq!(args, ["-f", "/home/u/.Xauthority", "list", "unix:10"]);

        let cmd = XAuthCommand::new(None).with_program("sudo", ["-u", "alice", "xauth"]);
        let args = cmd.args(&["remove".into(), "unix:10".into()]);
        assert_eq!(args, ["-u", "alice", "xauth", "remove", "unix:10"]);
    }

    #[test]
    fn test_command_passes_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("args");
        let script = format!("printf '%s\\n' \"$@\" > '{}'", log.display());

        fake_xauth(&script).add_entry(&entry(10)).unwrap();
        let recorded = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            recorded.lines().collect::<Vec<_>>(),
            ["-f", "/tmp/test.xauth", "add", "unix:10", MIT_MAGIC_COOKIE_PROTO, COOKIE]
        );

        fake_xauth(&script)
            .with_cookie_lifetime(Duration::from_secs(60))
            .generate_untrusted_cookie(&Display::unix(10), Duration::from_secs(5))
            .unwrap();
        let recorded = std::fs::read_to_string(&log).unwrap();
        assert_eq!(
            recorded.lines().skip(2).collect::<Vec<_>>(),
            ["generate", "unix:10", MIT_MAGIC_COOKIE_PROTO, "untrusted", "timeout", "60"]
        );
    }

    #[test]
    fn test_command_read_entry() {
        let script = format!("echo 'myhost/unix:10  {MIT_MAGIC_COOKIE_PROTO}  {COOKIE}'");
        let read = fake_xauth(&script).read_entry(&Display::unix(10)).unwrap();
        assert_eq!(read, entry(10));

        let err = fake_xauth("true").read_entry(&Display::unix(10)).unwrap_err();
        assert!(err.is_not_found());

        let err = fake_xauth("echo garbage").read_entry(&Display::unix(10)).unwrap_err();
        assert!(matches!(err, XAuthError::Validation(_)));
    }

    #[test]
    fn test_command_failure() {
        let err = fake_xauth("echo 'xauth: bad file' >&2; exit 1")
            .remove_entries(&Display::unix(10))
            .unwrap_err();
        match err {
            XAuthError::Command(detail) => assert_eq!(detail, "xauth: bad file"),
            other => panic!("expected command error, got {other:?}"),
        }
    }

    #[test]
    fn test_generate_unreachable() {
        let err = fake_xauth("echo 'xauth:  unable to open display \"unix:10\".' >&2; exit 1")
            .generate_untrusted_cookie(&Display::unix(10), Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, XAuthError::DisplayUnreachable { .. }));
    }

    #[test]
    fn test_generate_timeout_kills_child() {
        let started = Instant::now();
        let err = fake_xauth("exec sleep 5")
            .generate_untrusted_cookie(&Display::unix(10), Duration::from_millis(100))
            .unwrap_err();
        assert!(matches!(err, XAuthError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_generate_bounded_when_descendant_holds_pipes() {
        let started = Instant::now();
        let err = fake_xauth("sleep 4 & echo 'unable to open display' >&2; exit 1")
            .generate_untrusted_cookie(&Display::unix(10), Duration::from_millis(200))
            .unwrap_err();
        assert!(matches!(err, XAuthError::Timeout(_)), "got {err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_connect_authority_sets_env() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("env");
        let script = format!("printf '%s' \"$XAUTHORITY\" > '{}'", log.display());

        fake_xauth(&script)
            .with_connect_authority("/home/u/.Xauthority")
            .generate_untrusted_cookie(&Display::unix(10), Duration::from_secs(5))
            .unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "/home/u/.Xauthority");
    }

    #[test]
    fn test_generate_cancelled() {
        let flag = Arc::new(AtomicBool::new(false));
        let cmd = fake_xauth("exec sleep 5").with_cancel(Arc::clone(&flag));

        let canceller = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                flag.store(true, Ordering::Relaxed);
            })
        };

        let started = Instant::now();
        let err = cmd
            .generate_untrusted_cookie(&Display::unix(10), Duration::from_secs(30))
            .unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, XAuthError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_command_zero_timeout_rejected() {
        let err = fake_xauth("true")
            .generate_untrusted_cookie(&Display::unix(10), Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, XAuthError::Validation(_)));
    }

    #[test]
    fn test_missing_program() {
        let err = XAuthCommand::new(None)
            .with_program("/nonexistent/xauth", Vec::<OsString>::new())
            .read_entry(&Display::unix(10))
            .unwrap_err();
        assert!(matches!(err, XAuthError::Command(_)));
    }

    /// Exercises the real utility; needs `xauth` installed.
    #[test]
    fn test_real_xauth_commands() {
        if env::var_os("XCOOKIE_XAUTH_TEST").is_none() {
            return;
        }
        check_xauth_available().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let xauth = XAuthCommand::new(Some(dir.path().join(".Xauthority")));
        let display = Display::unix(999);

        assert!(xauth.read_entry(&display).unwrap_err().is_not_found());

        let trusted = XAuthEntry::new_random(display.clone());
        xauth.add_entry(&trusted).unwrap();
        assert_eq!(xauth.read_entry(&display).unwrap(), trusted);

        xauth.remove_entries(&display).unwrap();
        assert!(xauth.read_entry(&display).unwrap_err().is_not_found());

        // No X server listens on display 999.
        let err = xauth
            .generate_untrusted_cookie(&display, Duration::from_secs(5))
            .unwrap_err();
        assert!(matches!(err, XAuthError::DisplayUnreachable { .. }));
    }
}
