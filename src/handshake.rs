//! X11 connection-setup packet inspection and cookie substitution.
//!
//! The first packet a client sends carries its authorization:
//!
//! ```text
//! ┌───────┬─────┬───────┬───────┬────────┬────────┬─────┬──────────────┬──────────────┐
//! │ order │ pad │ major │ minor │ name N │ data D │ pad │ name (pad 4) │ data (pad 4) │
//! │  1 B  │ 1 B │  2 B  │  2 B  │  2 B   │  2 B   │ 2 B │   N + pad    │   D + pad    │
//! └───────┴─────┴───────┴───────┴────────┴────────┴─────┴──────────────┴──────────────┘
//! ```
//!
//! Integers use the byte order announced by the first byte.
//!
//! # Security Model
//!
//! - **Clients are untrusted**: they only ever hold a decoy cookie
//! - **The display server is trusted**: it only ever sees the real cookie
//! - **Fail closed**: any parse failure or mismatch yields no output at all

use std::io::{self, Read};

use subtle::ConstantTimeEq;

use crate::entry::XAuthEntry;
use crate::error::{Result, XAuthError};

// =============================================================================
// Constants
// =============================================================================

/// Size of the fixed setup-packet header.
pub const SETUP_HEADER_LEN: usize = 12;

/// Protocol version clients announce.
const X_PROTOCOL_MAJOR: u16 = 11;
const X_PROTOCOL_MINOR: u16 = 0;

/// Header field offsets.
mod offsets {
    pub const MAJOR: usize = 2;
    pub const MINOR: usize = 4;
    pub const AUTH_NAME_LEN: usize = 6;
    pub const AUTH_DATA_LEN: usize = 8;
}

// =============================================================================
// Byte Order
// =============================================================================

/// Byte order announced by the client in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// `'B'`
    BigEndian,
    /// `'l'`
    LittleEndian,
}

impl ByteOrder {
    /// The header byte announcing this order.
    pub fn marker(self) -> u8 {
        match self {
            ByteOrder::BigEndian => b'B',
            ByteOrder::LittleEndian => b'l',
        }
    }

    #[inline]
    fn read_u16(self, bytes: [u8; 2]) -> u16 {
        match self {
            ByteOrder::BigEndian => u16::from_be_bytes(bytes),
            ByteOrder::LittleEndian => u16::from_le_bytes(bytes),
        }
    }

    #[inline]
    fn write_u16(self, value: u16) -> [u8; 2] {
        match self {
            ByteOrder::BigEndian => value.to_be_bytes(),
            ByteOrder::LittleEndian => value.to_le_bytes(),
        }
    }
}

impl TryFrom<u8> for ByteOrder {
    type Error = XAuthError;

    fn try_from(marker: u8) -> Result<Self> {
        match marker {
            b'B' => Ok(ByteOrder::BigEndian),
            b'l' => Ok(ByteOrder::LittleEndian),
            other => Err(XAuthError::MalformedPacket(format!(
                "invalid byte order marker 0x{other:02x}"
            ))),
        }
    }
}

// =============================================================================
// Header
// =============================================================================

/// Decoded fixed header of a setup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupHeader {
    pub order: ByteOrder,
    pub major: u16,
    pub minor: u16,
    pub auth_name_len: u16,
    pub auth_data_len: u16,
}

impl SetupHeader {
    pub fn parse(header: &[u8; SETUP_HEADER_LEN]) -> Result<Self> {
        let order = ByteOrder::try_from(header[0])?;
        let field = |at: usize| order.read_u16([header[at], header[at + 1]]);

        Ok(Self {
            order,
            major: field(offsets::MAJOR),
            minor: field(offsets::MINOR),
            auth_name_len: field(offsets::AUTH_NAME_LEN),
            auth_data_len: field(offsets::AUTH_DATA_LEN),
        })
    }

    /// Offset of the auth data within the variable part.
    #[inline]
    fn auth_data_start(&self) -> usize {
        padded(self.auth_name_len as usize)
    }

    /// Length of the padded name and data that follow the header.
    #[inline]
    pub fn body_len(&self) -> usize {
        self.auth_data_start() + padded(self.auth_data_len as usize)
    }

    /// Total length of the setup packet.
    #[inline]
    pub fn packet_len(&self) -> usize {
        SETUP_HEADER_LEN + self.body_len()
    }
}

/// Round up to the next multiple of 4.
#[inline]
fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Framing helper for non-blocking readers.
///
/// # Returns
/// - `Ok(None)` while fewer than [`SETUP_HEADER_LEN`] bytes are buffered
/// - `Ok(Some(len))` with the full packet length once the header is present
pub fn setup_packet_len(buf: &[u8]) -> Result<Option<usize>> {
    let Some(header) = buf.first_chunk::<SETUP_HEADER_LEN>() else {
        return Ok(None);
    };
    SetupHeader::parse(header).map(|h| Some(h.packet_len()))
}

// =============================================================================
// Rewrite
// =============================================================================

/// Read one setup packet from `reader`, check it presents `decoy`, and return
/// the packet with the secret replaced by `real`'s.
///
/// Every byte other than the secret itself (header, protocol name, padding)
/// is returned exactly as received.
///
/// # Errors
/// - `Truncated` if the stream ends inside the header, name or data
/// - `MalformedPacket` on an unknown byte order marker
/// - `AccessDenied` if the protocol name or secret differ from `decoy`
/// - `Validation` if `real`'s secret length differs from the packet's
///
/// The caller must close the connection on any error.
pub fn read_and_rewrite_setup<R: Read>(
    reader: &mut R,
    decoy: &XAuthEntry,
    real: &XAuthEntry,
) -> Result<Vec<u8>> {
    let mut header = [0u8; SETUP_HEADER_LEN];
    read_full(reader, &mut header, "setup header is shorter than 12 bytes")?;
    let parsed = SetupHeader::parse(&header)?;

    let mut body = vec![0u8; parsed.body_len()];
    read_full(reader, &mut body, "authorization name or data is incomplete")?;

    let name_len = parsed.auth_name_len as usize;
    let data_start = parsed.auth_data_start();
    let data_end = data_start + parsed.auth_data_len as usize;

    log::trace!(
        "[SETUP] order={:?} version={}.{} name_len={} data_len={}",
        parsed.order,
        parsed.major,
        parsed.minor,
        name_len,
        parsed.auth_data_len
    );

    let expected = decoy.cookie_bytes()?;
    let name_matches = body[..name_len].ct_eq(decoy.proto().as_bytes());
    let data_matches = body[data_start..data_end].ct_eq(&expected);
    if !bool::from(name_matches & data_matches) {
        return Err(XAuthError::AccessDenied(
            "X11 client did not present the issued cookie",
        ));
    }

    let replacement = real.cookie_bytes()?;
    if replacement.len() != data_end - data_start {
        return Err(XAuthError::Validation(format!(
            "real cookie is {} bytes but the issued cookie is {}",
            replacement.len(),
            data_end - data_start
        )));
    }
    body[data_start..data_end].copy_from_slice(&replacement);

    let mut packet = Vec::with_capacity(parsed.packet_len());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(&body);

    log::debug!("[SETUP] Substituted cookie for display {}", real.display());
    Ok(packet)
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => XAuthError::Truncated(what),
        _ => XAuthError::Io(e),
    })
}

// =============================================================================
// Encode
// =============================================================================

/// Build the setup packet a client holding `entry` sends (protocol 11.0),
/// with zeroed padding.
pub fn encode_setup_packet(entry: &XAuthEntry, order: ByteOrder) -> Result<Vec<u8>> {
    let name = entry.proto().as_bytes();
    let data = entry.cookie_bytes()?;
    let name_len = u16::try_from(name.len())
        .map_err(|_| XAuthError::Validation("authorization name too long".into()))?;
    let data_len = u16::try_from(data.len())
        .map_err(|_| XAuthError::Validation("authorization data too long".into()))?;

    let mut packet = vec![0u8; SETUP_HEADER_LEN];
    packet[0] = order.marker();
    packet[offsets::MAJOR..offsets::MAJOR + 2].copy_from_slice(&order.write_u16(X_PROTOCOL_MAJOR));
    packet[offsets::MINOR..offsets::MINOR + 2].copy_from_slice(&order.write_u16(X_PROTOCOL_MINOR));
    packet[offsets::AUTH_NAME_LEN..offsets::AUTH_NAME_LEN + 2]
        .copy_from_slice(&order.write_u16(name_len));
    packet[offsets::AUTH_DATA_LEN..offsets::AUTH_DATA_LEN + 2]
        .copy_from_slice(&order.write_u16(data_len));

    packet.extend_from_slice(name);
    packet.resize(SETUP_HEADER_LEN + padded(name.len()), 0);
    packet.extend_from_slice(&data);
    packet.resize(packet.len() + padded(data.len()) - data.len(), 0);

    Ok(packet)
}

// =============================================================================
// Tests
// =============================================================================
