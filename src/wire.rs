//! Wire Protocol Primitives
//!
//! The three small framings the services speak over TCP:
//!
//! - **Frames**: a 4-byte big-endian length prefix followed by a UTF-8
//!   request line. Used on the detector's scoring socket.
//! - **Notices**: an 8-character ASCII decimal length (right-aligned,
//!   space-padded) followed by the payload. Used for coordinator-to-probe
//!   handoffs.
//! - **Reports**: a fixed 128-byte metadata block (`id;latency`,
//!   NUL-padded) followed by a newline-terminated payload. Used on the
//!   coordinator's report socket.

use std::io::{self, Read, Write};

use thiserror::Error;

/// Size of the metadata block that precedes a report payload.
pub const REPORT_METADATA_LEN: usize = 128;

/// Digits in a notice length prefix.
const NOTICE_LEN_DIGITS: usize = 8;

/// Upper bound on any framed payload; larger announcements are rejected
/// without allocating.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum WireError {
    /// The peer closed the connection mid-message.
    #[error("connection closed mid-message")]
    Truncated,
    /// A length prefix exceeded [`MAX_FRAME_LEN`].
    #[error("announced payload of {0} bytes exceeds the frame limit")]
    Oversized(usize),
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed report metadata")]
    BadMetadata,
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn read_exact_or_truncated<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), WireError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            WireError::Truncated
        } else {
            WireError::Io(e)
        }
    })
}

/// Read one length-prefixed frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<String, WireError> {
    let mut prefix = [0u8; 4];
    read_exact_or_truncated(reader, &mut prefix)?;
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireError::Oversized(len));
    }

    let mut payload = vec![0u8; len];
    read_exact_or_truncated(reader, &mut payload)?;
    String::from_utf8(payload).map_err(|_| WireError::InvalidUtf8)
}

/// Write one length-prefixed frame.
pub fn write_frame<W: Write>(writer: &mut W, payload: &str) -> Result<(), WireError> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload.as_bytes())?;
    Ok(())
}

/// Read one decimal-length-prefixed notice.
pub fn recv_notice<R: Read>(reader: &mut R) -> Result<String, WireError> {
    let mut prefix = [0u8; NOTICE_LEN_DIGITS];
    read_exact_or_truncated(reader, &mut prefix)?;
    let text = std::str::from_utf8(&prefix).map_err(|_| WireError::InvalidUtf8)?;
    let len: usize = text.trim().parse().map_err(|_| WireError::BadMetadata)?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::Oversized(len));
    }

    let mut payload = vec![0u8; len];
    read_exact_or_truncated(reader, &mut payload)?;
    String::from_utf8(payload).map_err(|_| WireError::InvalidUtf8)
}

/// Write one decimal-length-prefixed notice.
pub fn send_notice<W: Write>(writer: &mut W, payload: &str) -> Result<(), WireError> {
    write!(writer, "{:8}", payload.len())?;
    writer.write_all(payload.as_bytes())?;
    Ok(())
}

/// Metadata block preceding a report payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportHeader {
    /// Request id assigned by the proxy.
    pub id: u64,
    /// Observed handling latency, in microseconds.
    pub latency_us: u64,
}

impl ReportHeader {
    /// Read the fixed-size metadata block: `id;latency` NUL-padded to
    /// [`REPORT_METADATA_LEN`] bytes.
    pub fn read<R: Read>(reader: &mut R) -> Result<Self, WireError> {
        let mut buf = [0u8; REPORT_METADATA_LEN];
        read_exact_or_truncated(reader, &mut buf)?;

        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let text = std::str::from_utf8(&buf[..end]).map_err(|_| WireError::InvalidUtf8)?;
        let (id, latency) = text.split_once(';').ok_or(WireError::BadMetadata)?;
        Ok(ReportHeader {
            id: id.trim().parse().map_err(|_| WireError::BadMetadata)?,
            latency_us: latency.trim().parse().map_err(|_| WireError::BadMetadata)?,
        })
    }

    /// Write the metadata block.
    pub fn write<W: Write>(&self, writer: &mut W) -> Result<(), WireError> {
        let mut buf = [0u8; REPORT_METADATA_LEN];
        let text = format!("{};{}", self.id, self.latency_us);
        if text.len() > REPORT_METADATA_LEN {
            return Err(WireError::BadMetadata);
        }
        buf[..text.len()].copy_from_slice(text.as_bytes());
        writer.write_all(&buf)?;
        Ok(())
    }
}

/// Read a report payload: bytes up to and including the first newline.
pub fn read_report_payload<R: Read>(reader: &mut R) -> Result<Vec<u8>, WireError> {
    let mut payload = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        read_exact_or_truncated(reader, &mut byte)?;
        payload.push(byte[0]);
        if byte[0] == b'\n' {
            return Ok(payload);
        }
        if payload.len() > MAX_FRAME_LEN {
            return Err(WireError::Oversized(payload.len()));
        }
    }
}
