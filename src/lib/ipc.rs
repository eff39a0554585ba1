//! # Inter-Process Communication over Pipes
//!
//! This module defines the wire protocol between the parent (the pool) and a
//! benchmark worker process. Each worker owns two one-way channels: requests
//! flow into the child's stdin and responses flow out of its stdout.
//!
//! ## Framing
//!
//! Every message is a little-endian `u32` byte length followed by a JSON body.
//! The body is self-describing (a tagged enum), so a worker can reject
//! anything that is not one of the known request kinds.
//!
//! ## ASCII Diagram
//!
//! ```text
//!     Parent Process                   Pipes                   Worker Process
//! +--------------------+                                   +--------------------+
//! |                    | --[len|Ping]----------- stdin --> |                    |
//! |   WorkerPool       | --[len|Benchmark(task)]-------->  |   serve() loop     |
//! |   Worker           |                                   |   task.benchmark() |
//! |                    | <--[len|Pong]----------- stdout-- |                    |
//! |                    | <--[len|Latency(ms)]------------  |                    |
//! +--------------------+                                   +--------------------+
//! ```

use std::io::{self, ErrorKind, Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::task::BenchmarkTask;

/// Upper bound on a single frame body.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Errors that can occur while reading or writing protocol frames.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("pipe error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),
    #[error("stream ended inside a frame")]
    Truncated,
}

/// Messages sent from the parent to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "task", rename_all = "snake_case")]
pub enum Request {
    /// Handshake marker; answered with `Response::Pong`.
    Ping,
    /// Ends the worker's loop.
    Stop,
    /// Benchmark a task; answered with `Response::Latency`.
    Benchmark(Box<BenchmarkTask>),
}

/// Messages sent from a worker to the parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ms", rename_all = "snake_case")]
pub enum Response {
    Pong,
    Latency(f64),
}

impl Response {
    pub fn describe(&self) -> String {
        match self {
            Response::Pong => "pong".to_string(),
            Response::Latency(ms) => format!("latency {:.4} ms", ms),
        }
    }
}

/// Write one length-prefixed frame and flush.
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
) -> Result<(), ProtocolError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame body. Returns `Ok(None)` on a clean end of stream at a
/// frame boundary.
pub fn read_frame_bytes<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(ProtocolError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => ProtocolError::Truncated,
        _ => ProtocolError::Io(e),
    })?;
    Ok(Some(body))
}

/// Read and decode one frame. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<Option<T>, ProtocolError> {
    match read_frame_bytes(reader)? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}
