//! # xcookie-proxy
//!
//! Cookie spoofing for forwarded X11 displays.
//!
//! ## Overview
//!
//! An untrusted client must be able to draw on a display without ever
//! learning the cookie that makes a local client fully trusted. The client is
//! handed a decoy [`XAuthEntry`]; when it connects, its setup packet is read
//! by [`read_and_rewrite_setup`], checked against the decoy, and forwarded to
//! the genuine display server with the real cookie substituted.
//!
//! ```text
//! Client (decoy) -> read_and_rewrite_setup -> X server (real)
//! ```
//!
//! Real entries live behind the [`XAuthority`] trait, implemented by
//! [`XAuthCommand`] (the `xauth` utility) and [`MemoryAuthority`].
//!
//! ## Example
//!
//! ```
//! use xcookie_proxy::{
//!     encode_setup_packet, read_and_rewrite_setup, ByteOrder, Display, MemoryAuthority,
//!     XAuthEntry, XAuthority,
//! };
//!
//! let store = MemoryAuthority::new();
//! let display = Display::parse("unix:10").unwrap();
//! store.add_entry(&XAuthEntry::new_random(display.clone())).unwrap();
//!
//! let real = store.read_entry(&display).unwrap();
//! let decoy = real.decoy();
//!
//! let from_client = encode_setup_packet(&decoy, ByteOrder::LittleEndian).unwrap();
//! let to_server = read_and_rewrite_setup(&mut &from_client[..], &decoy, &real).unwrap();
//! assert_eq!(to_server, encode_setup_packet(&real, ByteOrder::LittleEndian).unwrap());
//! ```

pub mod authority;
pub mod display;
pub mod entry;
pub mod error;
pub mod handshake;

pub use authority::{check_xauth_available, MemoryAuthority, XAuthCommand, XAuthority};
pub use display::{Display, DisplayRange};
pub use entry::{XAuthEntry, MIT_MAGIC_COOKIE_PROTO, MIT_MAGIC_COOKIE_SIZE};
pub use error::{Result, XAuthError};
pub use handshake::{
    encode_setup_packet, read_and_rewrite_setup, setup_packet_len, ByteOrder, SetupHeader,
    SETUP_HEADER_LEN,
};
