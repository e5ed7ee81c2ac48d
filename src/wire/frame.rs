//! Message framing: little-endian `u32` length + `u32` crc32c, then payload.
//!
//! All four reply surfaces (client, replication, election, registry) and the
//! publication stream speak this framing over TCP. The transport gives byte
//! streams; the header restores the message boundaries the protocol needs.

use std::io::{ErrorKind, Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single frame; a full-state snapshot fits comfortably.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {got} bytes exceeds limit of {limit}")]
    TooLarge { limit: usize, got: usize },
    #[error("empty frame")]
    Empty,
    #[error("crc mismatch: header {header:#010x}, payload {computed:#010x}")]
    CrcMismatch { header: u32, computed: u32 },
}

/// Reads frames off a stream; `Ok(None)` on a clean EOF between frames.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn read_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        // EOF exactly at a frame boundary is a clean close; EOF inside a
        // header is not.
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut filled = 0;
        while filled < FRAME_HEADER_LEN {
            let n = self.reader.read(&mut header[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "truncated frame header",
                )
                .into());
            }
            filled += n;
        }

        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if length == 0 {
            return Err(FrameError::Empty);
        }
        if length > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                limit: MAX_FRAME_BYTES,
                got: length,
            });
        }

        let mut payload = vec![0u8; length];
        self.reader.read_exact(&mut payload)?;

        let computed = crc32c(&payload);
        if computed != expected {
            return Err(FrameError::CrcMismatch {
                header: expected,
                computed,
            });
        }
        Ok(Some(payload))
    }
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        if payload.is_empty() {
            return Err(FrameError::Empty);
        }
        if payload.len() > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                limit: MAX_FRAME_BYTES,
                got: payload.len(),
            });
        }
        let length = payload.len() as u32;
        let crc = crc32c(payload);
        self.writer.write_all(&length.to_le_bytes())?;
        self.writer.write_all(&crc.to_le_bytes())?;
        self.writer.write_all(payload)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn round_trip() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(b"oi mural").unwrap();

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert_eq!(reader.read_frame().unwrap().unwrap(), b"oi mural");
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn several_frames_in_sequence() {
        let mut buf = Vec::new();
        {
            let mut writer = FrameWriter::new(&mut buf);
            writer.write_frame(b"one").unwrap();
            writer.write_frame(b"two").unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(buf));
        assert_eq!(reader.read_frame().unwrap().unwrap(), b"one");
        assert_eq!(reader.read_frame().unwrap().unwrap(), b"two");
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(b"payload").unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn truncated_header_is_clean_eof_only_at_boundary() {
        let mut buf = Vec::new();
        FrameWriter::new(&mut buf).write_frame(b"payload").unwrap();
        buf.truncate(4);

        let mut reader = FrameReader::new(Cursor::new(buf));
        assert!(matches!(reader.read_frame(), Err(FrameError::Io(_))));
    }

    #[test]
    fn empty_frame_is_rejected() {
        let mut buf = Vec::new();
        assert!(matches!(
            FrameWriter::new(&mut buf).write_frame(b""),
            Err(FrameError::Empty)
        ));
    }
}
