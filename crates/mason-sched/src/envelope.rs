//! Messages crossing the parent↔worker boundary.
//!
//! Every record is framed as a little-endian `u32` length prefix followed by
//! that many bytes of JSON. Payloads are self-describing
//! [`serde_json::Value`]s, so the scheduler never needs to know the shape of
//! a domain result. The worker writes one envelope per OS write and closes
//! its end of the channel as its last act before exiting.

use std::io::{self, Read, Write};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

use mason_core::error::ErrorDomain;
use mason_core::message::Message;

/// Upper bound on a single frame. Anything larger is a protocol violation.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// A typed record sent from a worker to the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// A structured log/status message, forwarded to the parent's bus.
    Message {
        /// The tagged message.
        message: Message,
    },
    /// The action's terminal success value. At most one per worker.
    Result {
        /// Serialized domain result.
        value: Value,
    },
    /// Updated workspace descriptor. At most one per worker, sent even when
    /// the action failed so user changes are preserved.
    Workspace {
        /// Serialized workspace descriptor.
        value: Value,
    },
    /// Structured failure metadata for a recognized domain error. At most one
    /// per worker; never sent for bugs.
    Error {
        /// Originating subsystem.
        domain: ErrorDomain,
        /// Machine-readable reason tag.
        reason: Option<String>,
    },
}

/// The single parent→worker frame, written to the worker's stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    /// Queue action to run ("track", "fetch", "build", ...).
    pub action: String,
    /// Stable id of the element, used to tag messages.
    pub item_id: u64,
    /// Element name, used for log file paths and message formatting.
    pub item_name: String,
    /// 1-based attempt number.
    pub tries: u32,
    /// Maximum automatic retries for this job.
    pub max_retries: u32,
    /// Whether non-unconditional messages should be withheld.
    pub silent: bool,
    /// Directory action log files are written under, if logging is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
    /// Serialized copy of the element the action operates on.
    pub payload: Value,
}

/// Serialize `record` into a complete frame (prefix + body).
pub fn encode_frame<T: Serialize>(record: &T) -> io::Result<Vec<u8>> {
    let body = serde_json::to_vec(record).map_err(io::Error::other)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the {} byte limit", body.len(), MAX_FRAME_LEN),
        ));
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one frame with a single `write_all`, then flush.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, record: &T) -> io::Result<()> {
    let frame = encode_frame(record)?;
    writer.write_all(&frame)?;
    writer.flush()
}

/// Blocking read of one frame. Returns `None` on a clean end-of-stream
/// (the peer closed the channel between frames).
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> io::Result<Option<T>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    let body = read_body(u32::from_le_bytes(prefix), |buf| reader.read_exact(buf))?;
    decode_body(&body)
}

/// Async read of one frame, used by the parent on a worker's stdout.
pub async fn read_frame_async<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    let len = u32::from_le_bytes(prefix);
    if len > MAX_FRAME_LEN {
        return Err(frame_too_large(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    decode_body(&body)
}

fn read_body(
    len: u32,
    read_exact: impl FnOnce(&mut [u8]) -> io::Result<()>,
) -> io::Result<Vec<u8>> {
    if len > MAX_FRAME_LEN {
        return Err(frame_too_large(len));
    }
    let mut body = vec![0u8; len as usize];
    read_exact(&mut body)?;
    Ok(body)
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> io::Result<Option<T>> {
    serde_json::from_slice(body)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn frame_too_large(len: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("frame length {len} exceeds the {MAX_FRAME_LEN} byte limit"),
    )
}
