//! Frame-unit framing shared by every payload kind
//!
//! ```text
//! +----------------------+-------------------+------------------+
//! | timestamp: i64 (BE)  | length: i32 (BE)  | payload (length) |
//! +----------------------+-------------------+------------------+
//! ```
//!
//! The one-time codec config unit carries [`CONFIG_TIMESTAMP`] instead of a
//! capture time.

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut};

pub const HEADER_LEN: usize = 12;

/// Sentinel timestamp marking the codec config unit.
pub const CONFIG_TIMESTAMP: i64 = -1;

pub const PING_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";
pub const TALLY_RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub timestamp_ms: i64,
    pub length: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        let mut buf = &mut out[..];
        buf.put_i64(self.timestamp_ms);
        buf.put_i32(self.length as i32);
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> io::Result<Self> {
        let mut buf = &raw[..];
        let timestamp_ms = buf.get_i64();
        let length = buf.get_i32();
        let length = u32::try_from(length).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, format!("negative payload length {length}"))
        })?;
        Ok(Self {
            timestamp_ms,
            length,
        })
    }

    pub fn is_config(&self) -> bool {
        self.timestamp_ms == CONFIG_TIMESTAMP
    }
}

/// Write header and payload, then flush. Returns the bytes written.
pub fn write_unit<W: Write>(writer: &mut W, timestamp_ms: i64, payload: &[u8]) -> io::Result<usize> {
    let length = i32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes exceeds the length field", payload.len()),
        )
    })?;
    let header = FrameHeader {
        timestamp_ms,
        length: length as u32,
    };
    writer.write_all(&header.encode())?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(HEADER_LEN + payload.len())
}

/// Read one unit back; the receiving half of [`write_unit`].
pub fn read_unit<R: Read>(reader: &mut R) -> io::Result<(FrameHeader, Vec<u8>)> {
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw)?;
    let header = FrameHeader::decode(&raw)?;
    let mut payload = vec![0u8; header.length as usize];
    reader.read_exact(&mut payload)?;
    Ok((header, payload))
}
