//! Authority entries: a display bound to an MIT-MAGIC-COOKIE-1 secret.
//!
//! Entries are immutable values compared structurally. The real entry for a
//! display lives in the authority store; a decoy derived from it is held in
//! memory for one forwarding session and never persisted.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::display::Display;
use crate::error::{Result, XAuthError};

/// The only authentication protocol handed out and accepted.
pub const MIT_MAGIC_COOKIE_PROTO: &str = "MIT-MAGIC-COOKIE-1";

/// Secret length of an MIT-MAGIC-COOKIE-1 cookie in bytes.
pub const MIT_MAGIC_COOKIE_SIZE: usize = 16;

/// One authority entry: `display  proto  hex-cookie`.
#[derive(Clone, PartialEq, Eq)]
pub struct XAuthEntry {
    display: Display,
    proto: String,
    cookie: String,
}

impl XAuthEntry {
    /// Validate and build an entry.
    ///
    /// # Errors
    /// `Validation` if `proto` is not [`MIT_MAGIC_COOKIE_PROTO`] or `cookie`
    /// is not hex encoding exactly [`MIT_MAGIC_COOKIE_SIZE`] bytes.
    pub fn new(display: Display, proto: impl Into<String>, cookie: impl Into<String>) -> Result<Self> {
        let proto = proto.into();
        let cookie = cookie.into();

        if proto != MIT_MAGIC_COOKIE_PROTO {
            return Err(XAuthError::Validation(format!(
                "unsupported xauth protocol {proto:?}"
            )));
        }
        let secret = decode_cookie(&cookie)?;
        if secret.len() != MIT_MAGIC_COOKIE_SIZE {
            return Err(XAuthError::Validation(format!(
                "cookie is {} bytes, expected {MIT_MAGIC_COOKIE_SIZE}",
                secret.len()
            )));
        }

        Ok(Self {
            display,
            proto,
            cookie,
        })
    }

    /// Fresh entry for `display` with a cookie from the OS CSPRNG.
    pub fn new_random(display: Display) -> Self {
        Self {
            display,
            proto: MIT_MAGIC_COOKIE_PROTO.to_string(),
            cookie: random_cookie(MIT_MAGIC_COOKIE_SIZE),
        }
    }

    /// Decoy of this entry: same display and protocol, a different secret of
    /// the same length.
    pub fn decoy(&self) -> Self {
        let size = self.cookie.len() / 2;
        let mut cookie = random_cookie(size);
        while bool::from(cookie.as_bytes().ct_eq(self.cookie.as_bytes())) {
            cookie = random_cookie(size);
        }

        log::debug!("[XAUTH] Derived decoy entry for display {}", self.display);

        Self {
            display: self.display.clone(),
            proto: self.proto.clone(),
            cookie,
        }
    }

    /// The same credentials bound to another display, e.g. the proxy display
    /// a decoy is published under.
    pub fn with_display(&self, display: Display) -> Self {
        Self {
            display,
            proto: self.proto.clone(),
            cookie: self.cookie.clone(),
        }
    }

    /// Parse one line of `xauth list` output for `display`.
    ///
    /// The display column is xauth's own spelling (`host/unix:10`) and is
    /// not re-parsed; the entry is bound to the requested display.
    pub fn from_list_line(display: Display, line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            [_display, proto, cookie] => Self::new(display, *proto, *cookie),
            _ => Err(XAuthError::Validation(format!(
                "expected a single three-part xauth entry, got {} fields",
                fields.len()
            ))),
        }
    }

    /// Render as an authority line, `display  proto  cookie`.
    pub fn to_list_line(&self) -> String {
        format!("{}  {}  {}", self.display, self.proto, self.cookie)
    }

    #[inline]
    pub fn display(&self) -> &Display {
        &self.display
    }

    #[inline]
    pub fn proto(&self) -> &str {
        &self.proto
    }

    /// Hex-encoded secret.
    #[inline]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Decoded secret, wiped when dropped.
    pub fn cookie_bytes(&self) -> Result<Zeroizing<Vec<u8>>> {
        decode_cookie(&self.cookie)
    }

    /// Bypass validation so tests can build entries a store would reject.
    #[cfg(test)]
    pub(crate) fn from_parts_unchecked(display: Display, proto: &str, cookie: &str) -> Self {
        Self {
            display,
            proto: proto.to_string(),
            cookie: cookie.to_string(),
        }
    }
}

impl fmt::Debug for XAuthEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SECURITY: never print the cookie
        f.debug_struct("XAuthEntry")
            .field("display", &self.display)
            .field("proto", &self.proto)
            .field("cookie", &format_args!("<{} bytes>", self.cookie.len() / 2))
            .finish()
    }
}

fn random_cookie(size: usize) -> String {
    let mut bytes = Zeroizing::new(vec![0u8; size]);
    OsRng.fill_bytes(&mut bytes);
    hex::encode(&*bytes)
}

fn decode_cookie(cookie: &str) -> Result<Zeroizing<Vec<u8>>> {
    hex::decode(cookie)
        .map(Zeroizing::new)
        .map_err(|e| XAuthError::Validation(format!("cookie is not valid hex: {e}")))
}
