use thiserror::Error;

use crate::proto::frame::FrameError;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong between a caller and the controller,
/// grouped the way the status reporter counts it: transport and framing
/// problems are retried by the serial worker, protocol rejections and
/// contract violations go straight back to the caller, resource and state
/// problems carry a structured code.
#[derive(Debug, Error)]
pub enum Error {
    // Transport
    #[error("serial link is closed")]
    LinkClosed,

    #[error("serial write failed: {0}")]
    LinkWrite(String),

    #[error("serial read failed: {0}")]
    LinkRead(String),

    #[error("no response from controller within {0} ms")]
    Timeout(u64),

    // Framing
    #[error(transparent)]
    Frame(#[from] FrameError),

    // Protocol
    #[error("controller rejected command 0x{cmd:02X} with error code 0x{code:02X}")]
    Nack { cmd: u8, code: u8 },

    #[error("unexpected response command 0x{0:02X}")]
    UnexpectedCommand(u8),

    // Contract
    #[error("unknown register {0:?}")]
    UnknownRegister(String),

    #[error("value {value} for register {key} is outside [{min}, {max}]")]
    OutOfRange {
        key: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("register {0} is not writable")]
    NotWritable(&'static str),

    #[error("register {0} is not readable")]
    NotReadable(&'static str),

    #[error("block of {count} registers exceeds the limit of {limit}")]
    BlockTooLarge { count: usize, limit: usize },

    #[error("TLS is required but broker URI {0:?} uses a plaintext scheme")]
    InsecureUri(String),

    #[error("broker URI {0:?} is malformed")]
    MalformedUri(String),

    #[error("configuration error: {0}")]
    Config(String),

    // Resource
    #[error("request queue is full")]
    Busy,

    #[error("timed out waiting for the {0} lock")]
    MutexTimeout(&'static str),

    // State
    #[error("{0} has not been started")]
    NotStarted(&'static str),

    #[error("{0} is already running")]
    AlreadyRunning(&'static str),

    #[error("restart was requested {0} ms ago, throttled")]
    Throttled(u64),

    #[error("publish to {sink} failed: {reason}")]
    Publish { sink: &'static str, reason: String },
}

/// Maximum length of the last-error texts kept by the per-component
/// counters.
pub const LAST_ERROR_MAX: usize = 96;

/// Renders an error for a last-error buffer, truncated to [`LAST_ERROR_MAX`]
/// bytes on a character boundary.
pub fn last_error_text(err: &dyn std::fmt::Display) -> String {
    let mut text = err.to_string();
    if text.len() > LAST_ERROR_MAX {
        let mut end = LAST_ERROR_MAX;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}
