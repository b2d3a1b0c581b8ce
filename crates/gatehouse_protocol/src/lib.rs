//! Runner Protocol v1: framed messages between the orchestrator and runner processes.
//!
//! Frames travel over the runner's stdin (orchestrator -> runner) and stdout
//! (runner -> orchestrator). Each frame is a fixed header followed by a JSON
//! payload.
//!
//! # Header
//!
//! Format: !BBHQI (16 bytes, Network Byte Order / Big Endian)
//! ```text
//! [VER:1][OP:1][RES:2][SEQ:8][LEN:4]
//! ```
//!
//! - VER (u8): Protocol version (0x01)
//! - OP (u8): OpCode
//! - RES (u16): Reserved for future use
//! - SEQ (u64): Sender-side frame sequence number
//! - LEN (u32): Payload length in bytes

pub mod config;
pub mod defaults;
pub mod error;
pub mod events;
pub mod pipeline;
pub mod types;

pub use gatehouse_ids::{RunnerId, SessionId};

pub use events::{
    CollectedRows, EventKind, FaultStage, OutputSummary, Progress, RunFailure, RunSummary,
    RunnerEvent, RunnerState,
};
pub use pipeline::{
    ConnectionSpec, EngineKind, ExportItem, PipelineDescriptor, PipelineOptions, RunnerTask,
    Script, ScriptStep, SinkSpec, SourceSpec, StartRequest,
};
pub use types::{ColumnInfo, DataType, Row, SchemaInfo, SinkMode, Value};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use error::{ProtocolError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Cursor, Read, Write};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Maximum payload size accepted from a peer (64 MiB).
/// Prevents OOM from a misbehaving runner process.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Runner protocol OpCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Unknown = 0,

    // Orchestrator -> Runner
    Start = 1, // "Execute this task."

    // Orchestrator -> Runner
    Cancel = 2, // "Stop cooperatively."

    // Runner -> Orchestrator
    Event = 3, // "Here is a life-cycle or progress event."
}

impl OpCode {
    /// Convert u8 to OpCode
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(OpCode::Unknown),
            1 => Ok(OpCode::Start),
            2 => Ok(OpCode::Cancel),
            3 => Ok(OpCode::Event),
            _ => Err(ProtocolError::InvalidOpCode(value)),
        }
    }

    /// Convert OpCode to u8
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Protocol header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub opcode: OpCode,
    pub reserved: u16,
    pub seq: u64,
    pub payload_len: u32,
}

impl Header {
    /// Create a new header
    pub fn new(opcode: OpCode, seq: u64, payload_len: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            opcode,
            reserved: 0,
            seq,
            payload_len,
        }
    }

    /// Pack header into 16-byte buffer
    pub fn pack(&self) -> Result<[u8; HEADER_SIZE]> {
        let mut buf = [0u8; HEADER_SIZE];
        let mut cursor = Cursor::new(&mut buf[..]);

        cursor.write_u8(self.version)?;
        cursor.write_u8(self.opcode.as_u8())?;
        cursor.write_u16::<BigEndian>(self.reserved)?;
        cursor.write_u64::<BigEndian>(self.seq)?;
        cursor.write_u32::<BigEndian>(self.payload_len)?;

        Ok(buf)
    }

    /// Unpack header from 16-byte buffer
    pub fn unpack(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTooShort {
                expected: HEADER_SIZE,
                got: data.len(),
            });
        }

        let mut cursor = Cursor::new(&data[..HEADER_SIZE]);

        let version = cursor.read_u8()?;
        let op_raw = cursor.read_u8()?;
        let reserved = cursor.read_u16::<BigEndian>()?;
        let seq = cursor.read_u64::<BigEndian>()?;
        let payload_len = cursor.read_u32::<BigEndian>()?;

        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        if payload_len as usize > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len as usize,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let opcode = OpCode::from_u8(op_raw)?;

        Ok(Self {
            version,
            opcode,
            reserved,
            seq,
            payload_len,
        })
    }
}

/// Protocol message (header + payload)
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message
    ///
    /// Returns an error if payload exceeds MAX_PAYLOAD_SIZE.
    pub fn new(opcode: OpCode, seq: u64, payload: Vec<u8>) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let header = Header::new(opcode, seq, payload.len() as u32);
        Ok(Self { header, payload })
    }

    /// Create a message with a JSON payload.
    pub fn json<T: Serialize>(opcode: OpCode, seq: u64, value: &T) -> Result<Self> {
        Self::new(opcode, seq, serde_json::to_vec(value)?)
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decode the JSON payload, requiring a specific opcode.
    pub fn decode_as<T: DeserializeOwned>(&self, expected: OpCode) -> Result<T> {
        if self.header.opcode != expected {
            return Err(ProtocolError::UnexpectedOpCode {
                expected,
                got: self.header.opcode,
            });
        }
        self.decode()
    }

    /// Header and payload as one contiguous frame.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header.pack()?);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Write one frame and flush.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.to_bytes()?)?;
        writer.flush()?;
        Ok(())
    }

    /// Read one frame. Returns `Ok(None)` on a clean end of stream.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let mut header_buf = [0u8; HEADER_SIZE];
        let read = read_full(reader, &mut header_buf)?;
        if read == 0 {
            return Ok(None);
        }
        if read < HEADER_SIZE {
            return Err(ProtocolError::Truncated {
                expected: HEADER_SIZE,
                read,
            });
        }
        let header = Header::unpack(&header_buf)?;

        let mut payload = vec![0u8; header.payload_len as usize];
        let read = read_full(reader, &mut payload)?;
        if read < payload.len() {
            return Err(ProtocolError::Truncated {
                expected: payload.len(),
                read,
            });
        }

        Ok(Some(Self { header, payload }))
    }
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
