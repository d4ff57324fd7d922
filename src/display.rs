//! X display addresses.
//!
//! A display is written `host:display.screen`. An empty host (or the literal
//! `unix`) names the local Unix socket `X<display>` inside the X11 socket
//! directory; any other host is reached over TCP at `6000 + display`.

use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, XAuthError};

// =============================================================================
// Constants
// =============================================================================

/// First display number handed out to forwarded sessions, leaving the low
/// numbers to real X servers.
pub const DEFAULT_DISPLAY_OFFSET: u32 = 10;

/// Number of displays above the offset that may be allocated.
pub const DEFAULT_MAX_DISPLAYS: u32 = 1000;

/// TCP port of display 0.
pub const X11_BASE_PORT: u16 = 6000;

/// Largest display number whose TCP port still fits in 16 bits.
pub const MAX_DISPLAY_NUMBER: u32 = u16::MAX as u32 - X11_BASE_PORT as u32;

/// Conventional directory holding local X server sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// Host spelling for the local Unix socket transport.
const UNIX_HOST: &str = "unix";

// =============================================================================
// Display Range
// =============================================================================

/// Inclusive range `[offset, max_display]` of acceptable display numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayRange {
    offset: u32,
    max_display: u32,
}

impl DisplayRange {
    /// Every display number with a representable TCP port.
    pub const FULL: DisplayRange = DisplayRange {
        offset: 0,
        max_display: MAX_DISPLAY_NUMBER,
    };

    /// Create a range, rejecting inverted bounds or bounds past
    /// [`MAX_DISPLAY_NUMBER`].
    pub fn new(offset: u32, max_display: u32) -> Result<Self> {
        if offset > max_display || max_display > MAX_DISPLAY_NUMBER {
            return Err(XAuthError::Validation(format!(
                "invalid display range {offset}..={max_display} (limit {MAX_DISPLAY_NUMBER})"
            )));
        }
        Ok(Self {
            offset,
            max_display,
        })
    }

    /// Range used when allocating proxy displays: `offset` through
    /// `offset + max_displays`.
    pub fn forwarding(offset: u32, max_displays: u32) -> Result<Self> {
        Self::new(offset, offset.saturating_add(max_displays))
    }

    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    pub fn max_display(&self) -> u32 {
        self.max_display
    }

    #[inline]
    pub fn contains(&self, number: u32) -> bool {
        (self.offset..=self.max_display).contains(&number)
    }

    /// Display numbers in allocation order.
    pub fn numbers(&self) -> RangeInclusive<u32> {
        self.offset..=self.max_display
    }
}

impl Default for DisplayRange {
    fn default() -> Self {
        Self::FULL
    }
}

// =============================================================================
// Display
// =============================================================================

/// Parsed X display address. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Display {
    host_name: String,
    display_number: u32,
    screen_number: u32,
}

impl Display {
    /// Local display reached through the Unix socket, screen 0.
    pub fn unix(display_number: u32) -> Self {
        Self {
            host_name: String::new(),
            display_number,
            screen_number: 0,
        }
    }

    /// Parse with the full display range.
    pub fn parse(input: &str) -> Result<Self> {
        Self::parse_in(input, DisplayRange::FULL)
    }

    /// Parse and require the display number to fall inside `range`.
    ///
    /// # Security
    /// The value ends up on an `xauth` command line, so anything outside
    /// `[A-Za-z0-9._:/-]` is rejected before parsing.
    pub fn parse_in(input: &str, range: DisplayRange) -> Result<Self> {
        let invalid = |reason| XAuthError::InvalidDisplay {
            input: input.to_string(),
            reason,
        };

        if input.is_empty() {
            return Err(invalid("display cannot be empty"));
        }
        if !input.chars().all(is_display_char) {
            return Err(invalid("display contains an illegal character"));
        }

        let (host, number) = input
            .rsplit_once(':')
            .ok_or_else(|| invalid("display is missing ':'"))?;
        let (display, screen) = match number.split_once('.') {
            Some((display, screen)) => (display, Some(screen)),
            None => (number, None),
        };

        let display_number: u32 = display
            .parse()
            .map_err(|_| invalid("display number is not a non-negative integer"))?;
        let screen_number: u32 = match screen {
            Some(screen) => screen
                .parse()
                .map_err(|_| invalid("screen number is not a non-negative integer"))?,
            None => 0,
        };

        if !range.contains(display_number) {
            return Err(XAuthError::DisplayOutOfRange {
                number: display_number,
                min: range.offset(),
                max: range.max_display(),
            });
        }

        let host_name = if host == UNIX_HOST { "" } else { host };

        Ok(Self {
            host_name: host_name.to_string(),
            display_number,
            screen_number,
        })
    }

    /// Read and parse `$DISPLAY`.
    pub fn from_env() -> Result<Self> {
        let value = env::var("DISPLAY").map_err(|_| XAuthError::InvalidDisplay {
            input: String::new(),
            reason: "DISPLAY is not set",
        })?;
        Self::parse(&value)
    }

    #[inline]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    #[inline]
    pub fn display_number(&self) -> u32 {
        self.display_number
    }

    #[inline]
    pub fn screen_number(&self) -> u32 {
        self.screen_number
    }

    /// `true` when the display is served over the local Unix socket.
    #[inline]
    pub fn is_local(&self) -> bool {
        self.host_name.is_empty()
    }

    /// Path of the display's Unix socket inside `socket_dir`.
    pub fn unix_socket_path(&self, socket_dir: &Path) -> PathBuf {
        socket_dir.join(format!("X{}", self.display_number))
    }

    /// TCP endpoint of a remote display, `None` for local ones.
    pub fn tcp_addr(&self) -> Option<(String, u16)> {
        if self.is_local() {
            return None;
        }
        let port = u16::try_from(u32::from(X11_BASE_PORT) + self.display_number).ok()?;
        Some((self.host_name.clone(), port))
    }
}

impl fmt::Display for Display {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_local() {
            write!(f, "{UNIX_HOST}:{}", self.display_number)?;
            if self.screen_number != 0 {
                write!(f, ".{}", self.screen_number)?;
            }
            Ok(())
        } else {
            write!(
                f,
                "{}:{}.{}",
                self.host_name, self.display_number, self.screen_number
            )
        }
    }
}

impl FromStr for Display {
    type Err = XAuthError;

    fn from_str(s: &str) -> Result<Self> {
        Display::parse(s)
    }
}

#[inline]
fn is_display_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '/' | '-')
}

// =============================================================================
// Tests
// =============================================================================
