//! Frame layer for the controller's proprietary serial protocol.
//!
//! Every frame starts with 0xAA, carries a command byte, and ends with a
//! CRC-16/MODBUS over all preceding bytes, low byte first. The two frame
//! families disagree on byte order: the single-register commands
//! (0x09 read, 0x0D write) put addresses and data on the wire little-endian,
//! the MODBUS-style block commands (0x03, 0x10) big-endian. The CRC is
//! little-endian in all of them.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

use super::crc::{crc16, push_crc};

pub const START_BYTE: u8 = 0xAA;

pub const CMD_NACK: u8 = 0x00;
pub const CMD_ACK: u8 = 0x01;
pub const CMD_READ_BLOCK: u8 = 0x03;
pub const CMD_READ_ONE: u8 = 0x09;
pub const CMD_WRITE_ONE: u8 = 0x0D;
pub const CMD_WRITE_BLOCK: u8 = 0x10;

/// Most registers a single 0x03 request may ask for.
pub const MAX_READ_BLOCK: usize = 0x7F;
/// Most registers a single 0x10 request may carry.
pub const MAX_WRITE_BLOCK: usize = 0x64;

/// Upper bound on buffered unparsed bytes; anything beyond this without a
/// complete frame is garbage and gets discarded from the front.
const MAX_PENDING: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame shorter than the minimum for command 0x{0:02X}")]
    Short(u8),

    #[error("expected start byte 0xAA, got 0x{0:02X}")]
    BadStartByte(u8),

    #[error("CRC mismatch: computed 0x{computed:04X}, frame carries 0x{received:04X}")]
    CrcMismatch { computed: u16, received: u16 },

    #[error("inconsistent payload length {len} for command 0x{cmd:02X}")]
    BadLength { cmd: u8, len: u8 },

    #[error("unknown frame command 0x{0:02X}")]
    UnknownCommand(u8),
}

/// A request frame, one variant per wire command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// `AA 09 02 ADDR_LO ADDR_HI CRC_LO CRC_HI`
    ReadOne { addr: u16 },
    /// `AA 0D 04 ADDR_LO ADDR_HI DATA_LO DATA_HI CRC_LO CRC_HI`
    WriteOne { addr: u16, value: u16 },
    /// `AA 03 ADDR_HI ADDR_LO 00 COUNT CRC_LO CRC_HI`
    ReadBlock { start: u16, count: u8 },
    /// `AA 10 ADDR_HI ADDR_LO 00 COUNT DATA_HI DATA_LO ... CRC_LO CRC_HI`
    WriteBlock { start: u16, values: Vec<u16> },
}

impl Request {
    pub fn command(&self) -> u8 {
        match self {
            Request::ReadOne { .. } => CMD_READ_ONE,
            Request::WriteOne { .. } => CMD_WRITE_ONE,
            Request::ReadBlock { .. } => CMD_READ_BLOCK,
            Request::WriteBlock { .. } => CMD_WRITE_BLOCK,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut frame = match *self {
            Request::ReadOne { addr } => {
                let mut f = vec![START_BYTE, CMD_READ_ONE, 0x02, 0, 0];
                LittleEndian::write_u16(&mut f[3..5], addr);
                f
            }
            Request::WriteOne { addr, value } => {
                let mut f = vec![START_BYTE, CMD_WRITE_ONE, 0x04, 0, 0, 0, 0];
                LittleEndian::write_u16(&mut f[3..5], addr);
                LittleEndian::write_u16(&mut f[5..7], value);
                f
            }
            Request::ReadBlock { start, count } => {
                let mut f = vec![START_BYTE, CMD_READ_BLOCK, 0, 0, 0x00, count];
                BigEndian::write_u16(&mut f[2..4], start);
                f
            }
            Request::WriteBlock { start, ref values } => {
                let mut f = vec![START_BYTE, CMD_WRITE_BLOCK, 0, 0, 0x00, values.len() as u8];
                BigEndian::write_u16(&mut f[2..4], start);
                for &value in values {
                    let mut word = [0u8; 2];
                    BigEndian::write_u16(&mut word, value);
                    f.extend_from_slice(&word);
                }
                f
            }
        };
        push_crc(&mut frame);
        frame
    }
}

/// A validated response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `AA 09 PL ADDR_LO ADDR_HI DATA_LO DATA_HI CRC CRC`
    ReadOne { addr: u16, value: u16 },
    /// `AA 03 PL DATA1_HI DATA1_LO ... CRC CRC`
    ReadBlock { values: Vec<u16> },
    /// `AA 01 CMD CRC CRC`
    Ack { cmd: u8 },
    /// `AA 00 CMD ERROR_CODE CRC CRC`
    Nack { cmd: u8, code: u8 },
}

impl Response {
    /// The request command this response answers.
    pub fn answers(&self) -> u8 {
        match *self {
            Response::ReadOne { .. } => CMD_READ_ONE,
            Response::ReadBlock { .. } => CMD_READ_BLOCK,
            Response::Ack { cmd } | Response::Nack { cmd, .. } => cmd,
        }
    }
}

/// Streaming response decoder.
///
/// Feed it whatever the link hands back, in whatever chunking; it seeks to
/// the next 0xAA, waits until the frame is complete for its command byte,
/// validates the CRC and hands out a [`Response`]. After a CRC failure the
/// leading 0xAA is discarded and scanning resumes at the next one, so a
/// corrupt frame costs at most one resync, not the rest of the stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

/// Total frame length for a command once enough header bytes are visible,
/// or `None` if more bytes are needed to tell.
fn expected_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    debug_assert_eq!(buf[0], START_BYTE);
    if buf.len() < 2 {
        return Ok(None);
    }
    match buf[1] {
        CMD_ACK => Ok(Some(5)),
        CMD_NACK => Ok(Some(6)),
        CMD_READ_ONE | CMD_READ_BLOCK => {
            if buf.len() < 3 {
                return Ok(None);
            }
            let pl = buf[2] as usize;
            if buf[1] == CMD_READ_ONE && pl != 4 {
                return Err(FrameError::BadLength {
                    cmd: buf[1],
                    len: buf[2],
                });
            }
            if buf[1] == CMD_READ_BLOCK && (pl == 0 || pl % 2 != 0) {
                return Err(FrameError::BadLength {
                    cmd: buf[1],
                    len: buf[2],
                });
            }
            Ok(Some(3 + pl + 2))
        }
        other => Err(FrameError::UnknownCommand(other)),
    }
}

fn decode_body(frame: &[u8]) -> Response {
    match frame[1] {
        CMD_ACK => Response::Ack { cmd: frame[2] },
        CMD_NACK => Response::Nack {
            cmd: frame[2],
            code: frame[3],
        },
        CMD_READ_ONE => Response::ReadOne {
            addr: LittleEndian::read_u16(&frame[3..5]),
            value: LittleEndian::read_u16(&frame[5..7]),
        },
        CMD_READ_BLOCK => {
            let payload = &frame[3..frame.len() - 2];
            let values = payload
                .chunks_exact(2)
                .map(BigEndian::read_u16)
                .collect();
            Response::ReadBlock { values }
        }
        _ => unreachable!("expected_len admits only known commands"),
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        if self.buf.len() > MAX_PENDING {
            let excess = self.buf.len() - MAX_PENDING;
            self.buf.drain(..excess);
        }
    }

    /// Bytes currently buffered and not yet consumed by a frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Pulls the next complete frame out of the buffer.
    ///
    /// `Ok(None)` means "no complete frame yet, feed me more". An `Err`
    /// reports one recoverable framing problem; internal state has already
    /// resynced, so the caller can count the error and call again.
    pub fn next_frame(&mut self) -> Result<Option<Response>, FrameError> {
        // Seek to the next start byte.
        match self.buf.iter().position(|&b| b == START_BYTE) {
            Some(0) => {}
            Some(pos) => {
                self.buf.drain(..pos);
            }
            None => {
                self.buf.clear();
                return Ok(None);
            }
        }

        let total = match expected_len(&self.buf) {
            Ok(Some(total)) => total,
            Ok(None) => return Ok(None),
            Err(err) => {
                // Not a frame header after all. Skip this 0xAA and let the
                // caller know.
                self.buf.drain(..1);
                return Err(err);
            }
        };

        if self.buf.len() < total {
            return Ok(None);
        }

        let computed = crc16(&self.buf[..total - 2]);
        let received = LittleEndian::read_u16(&self.buf[total - 2..total]);
        if computed != received {
            self.buf.drain(..1);
            return Err(FrameError::CrcMismatch { computed, received });
        }

        let response = decode_body(&self.buf[..total]);
        self.buf.drain(..total);
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn framed(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        push_crc(&mut frame);
        frame
    }

    #[test]
    fn read_one_request_layout() {
        let frame = Request::ReadOne { addr: 0x012C }.encode();
        assert_eq!(frame.len(), 7);
        assert_eq!(&frame[..5], &[0xAA, 0x09, 0x02, 0x2C, 0x01]);
        assert_eq!(crc16(&frame[..5]), LittleEndian::read_u16(&frame[5..]));
    }

    #[test]
    fn write_one_request_layout() {
        // Scenario: write raw 4200 (0x1068) to 0x012C.
        let frame = Request::WriteOne {
            addr: 0x012C,
            value: 4200,
        }
        .encode();
        assert_eq!(frame.len(), 9);
        assert_eq!(&frame[..7], &[0xAA, 0x0D, 0x04, 0x2C, 0x01, 0x68, 0x10]);
        assert_eq!(LittleEndian::read_u16(&frame[7..]), 0x8B96);
    }

    #[test]
    fn read_block_request_is_big_endian() {
        let frame = Request::ReadBlock {
            start: 0x012C,
            count: 16,
        }
        .encode();
        assert_eq!(&frame[..6], &[0xAA, 0x03, 0x01, 0x2C, 0x00, 0x10]);
    }

    #[test]
    fn write_block_request_carries_big_endian_data() {
        let frame = Request::WriteBlock {
            start: 0x012C,
            values: vec![0x1068, 0x00FF],
        }
        .encode();
        assert_eq!(
            &frame[..10],
            &[0xAA, 0x10, 0x01, 0x2C, 0x00, 0x02, 0x10, 0x68, 0x00, 0xFF]
        );
    }

    #[test]
    fn decodes_read_one_response() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed(&[0xAA, 0x09, 0x04, 0x00, 0x00, 0x68, 0x10]));
        let response = decoder.next_frame().unwrap().unwrap();
        assert_eq!(
            response,
            Response::ReadOne {
                addr: 0,
                value: 0x1068
            }
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn decodes_ack_and_nack() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed(&[0xAA, 0x01, 0x0D]));
        decoder.push(&framed(&[0xAA, 0x00, 0x0D, 0x04]));
        assert_eq!(
            decoder.next_frame().unwrap().unwrap(),
            Response::Ack { cmd: 0x0D }
        );
        assert_eq!(
            decoder.next_frame().unwrap().unwrap(),
            Response::Nack {
                cmd: 0x0D,
                code: 0x04
            }
        );
    }

    #[test]
    fn decodes_block_read_response_big_endian() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed(&[0xAA, 0x03, 0x04, 0x10, 0x68, 0x0F, 0xA0]));
        assert_eq!(
            decoder.next_frame().unwrap().unwrap(),
            Response::ReadBlock {
                values: vec![0x1068, 0x0FA0]
            }
        );
    }

    #[test]
    fn frame_straddling_two_reads_is_accepted() {
        let frame = framed(&[0xAA, 0x09, 0x04, 0x2C, 0x01, 0x68, 0x10]);
        let mut decoder = FrameDecoder::new();
        decoder.push(&frame[..4]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&frame[4..]);
        assert_eq!(
            decoder.next_frame().unwrap().unwrap(),
            Response::ReadOne {
                addr: 0x012C,
                value: 0x1068
            }
        );
    }

    #[test]
    fn leading_garbage_is_skipped() {
        let mut bytes = vec![0x00, 0x13, 0x37];
        bytes.extend(framed(&[0xAA, 0x01, 0x0D]));
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert_eq!(
            decoder.next_frame().unwrap().unwrap(),
            Response::Ack { cmd: 0x0D }
        );
    }

    #[test]
    fn resyncs_on_second_start_byte_after_garbage() {
        // An 0xAA followed by garbage, then a genuine frame. The bogus
        // command byte costs one reported error, then decoding recovers.
        let mut bytes = vec![0xAA, 0x77];
        bytes.extend(framed(&[0xAA, 0x01, 0x0D]));
        let mut decoder = FrameDecoder::new();
        decoder.push(&bytes);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::UnknownCommand(0x77))
        ));
        assert_eq!(
            decoder.next_frame().unwrap().unwrap(),
            Response::Ack { cmd: 0x0D }
        );
    }

    #[test]
    fn crc_failure_resyncs_to_next_frame() {
        let mut corrupt = framed(&[0xAA, 0x09, 0x04, 0x00, 0x00, 0x68, 0x10]);
        let last = corrupt.len() - 1;
        corrupt[last] ^= 0xFF;
        corrupt.extend(framed(&[0xAA, 0x01, 0x0D]));
        let mut decoder = FrameDecoder::new();
        decoder.push(&corrupt);
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::CrcMismatch { .. })
        ));
        assert_eq!(
            decoder.next_frame().unwrap().unwrap(),
            Response::Ack { cmd: 0x0D }
        );
    }

    #[test]
    fn no_interpretation_before_length_complete() {
        // A read response whose PL byte promises more than was pushed.
        let mut decoder = FrameDecoder::new();
        decoder.push(&[0xAA, 0x03, 0x08, 0x10, 0x68]);
        assert_eq!(decoder.next_frame().unwrap(), None);
    }

    #[test]
    fn read_one_with_wrong_payload_length_is_rejected() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed(&[0xAA, 0x09, 0x03, 0x00, 0x00, 0x68]));
        assert!(matches!(
            decoder.next_frame(),
            Err(FrameError::BadLength { cmd: 0x09, len: 3 })
        ));
    }

    #[test]
    fn pending_garbage_is_bounded() {
        let mut decoder = FrameDecoder::new();
        // 0xAA then a long run with no further start byte: stays buffered
        // but capped.
        decoder.push(&[0xAA, 0x09, 0x04]);
        decoder.push(&vec![0x55; 4096]);
        assert!(decoder.pending() <= 512);
    }
}
