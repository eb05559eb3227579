//! The byte-level serial link, behind a small trait so the protocol engine
//! can run against a scripted fake in tests and a real port in production.

use std::io::{ErrorKind, Read, Write};
use std::path::PathBuf;
use std::time::Duration;

use serialport5::SerialPort;

use crate::error::{Error, Result};

/// Byte read/write with timeout. `read_some` returns `Ok(0)` when the read
/// timeout elapses with nothing received; that is the engine's polling
/// heartbeat, not an error.
pub trait SerialLink: Send {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()>;
    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Discards whatever the controller sent since the last request.
    fn drain(&mut self) -> Result<()> {
        let mut scratch = [0u8; 64];
        while self.read_some(&mut scratch)? > 0 {}
        Ok(())
    }
}

/// A real port: 115200 8N1 by default, no flow control, short read timeout
/// so the engine's response loop stays responsive to deadlines and stop
/// requests.
pub struct SerialPortLink {
    port: SerialPort,
}

impl SerialPortLink {
    pub const READ_TIMEOUT: Duration = Duration::from_millis(50);

    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = SerialPort::builder()
            .baud_rate(baud_rate)
            .read_timeout(Some(Self::READ_TIMEOUT))
            .open(PathBuf::from(path))
            .map_err(|e| Error::LinkWrite(format!("could not open {path}: {e}")))?;
        Ok(SerialPortLink { port })
    }
}

impl SerialLink for SerialPortLink {
    fn write_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.port
            .write_all(bytes)
            .and_then(|()| self.port.flush())
            .map_err(|e| Error::LinkWrite(e.to_string()))
    }

    fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(Error::LinkRead(e.to_string())),
        }
    }
}
