use thiserror::Error;

/// Errors raised while encoding or decoding runner frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("Protocol version mismatch: expected {expected:#04x}, got {got:#04x}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("Invalid opcode: {0}")]
    InvalidOpCode(u8),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Unexpected end of stream after {read} of {expected} bytes")]
    Truncated { expected: usize, read: usize },

    #[error("Unexpected opcode: expected {expected:?}, got {got:?}")]
    UnexpectedOpCode {
        expected: crate::OpCode,
        got: crate::OpCode,
    },

    #[error("Invalid payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
