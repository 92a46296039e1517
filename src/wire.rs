//! # Wire Framing
//!
//! A frame is a fixed 16-byte little-endian header followed by `length`
//! bytes of payload. The header carries the sender's
//! rank, the message tag, the payload length, and a reserved field that
//! must be zeroed on send and is ignored on receive.
//!
//! This module has no knowledge of sockets: [`FrameHeader`] encodes and
//! decodes the 16-byte header, and [`FrameDecoder`] is a small
//! `{reading-header, reading-payload}` state machine that
//! [`transport`](crate::transport) drives with whatever bytes a read
//! syscall happened to return, so partial reads never lose data.

use crate::error::{CommunicationError, MpiError};

/// Size in bytes of the fixed frame header.
pub const HEADER_LEN: usize = 16;

/// Upper bound on a single frame's payload length, matching the header's
/// signed 32-bit length field: valid payload lengths are 0..=2^31-1.
pub const MAX_PAYLOAD_LEN: usize = i32::MAX as usize;

/// The 16-byte frame header: source rank, tag, payload length, reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub source: i32,
    pub tag: i32,
    pub length: i32,
    reserved: i32,
}

impl FrameHeader {
    pub fn new(source: i32, tag: i32, length: usize) -> Result<Self, MpiError> {
        if length > MAX_PAYLOAD_LEN {
            return Err(MpiError::Communication(CommunicationError::TransportFailure(
                format!("payload length {} exceeds frame limit", length),
            )));
        }
        Ok(Self {
            source,
            tag,
            length: length as i32,
            reserved: 0,
        })
    }

    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&self.source.to_le_bytes());
        buf[4..8].copy_from_slice(&self.tag.to_le_bytes());
        buf[8..12].copy_from_slice(&self.length.to_le_bytes());
        buf[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_LEN]) -> Result<Self, MpiError> {
        let source = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let tag = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        let length = i32::from_le_bytes(buf[8..12].try_into().unwrap());
        // Reserved bytes are ignored on receive.
        let reserved = 0;

        if length < 0 {
            return Err(MpiError::Communication(CommunicationError::TransportFailure(
                format!("negative frame length {}", length),
            )));
        }

        Ok(Self {
            source,
            tag,
            length,
            reserved,
        })
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize
    }
}

/// A fully decoded frame: header plus owned payload bytes.
#[derive(Debug, Clone)]
pub struct Frame {
    pub source: i32,
    pub tag: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(source: i32, tag: i32, payload: Vec<u8>) -> Result<Self, MpiError> {
        // Validate eagerly so callers get a synchronous error rather than
        // discovering the limit mid-write.
        FrameHeader::new(source, tag, payload.len())?;
        Ok(Self {
            source,
            tag,
            payload,
        })
    }

    /// Serialize header + payload into a single contiguous buffer so the
    /// peer transport can issue one write per frame (never interleaved,
    /// never interleaved).
    pub fn to_bytes(&self) -> Result<Vec<u8>, MpiError> {
        let header = FrameHeader::new(self.source, self.tag, self.payload.len())?;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.extend_from_slice(&header.to_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Per-stream decode state: either waiting for a full header, or waiting
/// for the declared number of payload bytes.
enum DecodeState {
    ReadingHeader { buf: Vec<u8> },
    ReadingPayload { header: FrameHeader, buf: Vec<u8> },
}

/// Incremental frame decoder fed with arbitrary-sized chunks from a
/// blocking or non-blocking read loop. Bytes supplied via [`feed`] that do
/// not complete a frame are buffered internally until they do.
pub struct FrameDecoder {
    state: DecodeState,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecodeState::ReadingHeader { buf: Vec::with_capacity(HEADER_LEN) },
        }
    }

    /// Feed newly read bytes into the decoder. Returns every frame that
    /// became complete as a result, in arrival order. Any leftover bytes
    /// (the start of the next header or payload) are retained internally.
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<Vec<Frame>, MpiError> {
        let mut completed = Vec::new();

        while !chunk.is_empty() {
            match &mut self.state {
                DecodeState::ReadingHeader { buf } => {
                    let need = HEADER_LEN - buf.len();
                    let take = need.min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if buf.len() == HEADER_LEN {
                        let mut header_bytes = [0u8; HEADER_LEN];
                        header_bytes.copy_from_slice(buf);
                        let header = FrameHeader::from_bytes(&header_bytes)?;
                        self.state = DecodeState::ReadingPayload {
                            header,
                            buf: Vec::with_capacity(header.payload_len()),
                        };
                    }
                }
                DecodeState::ReadingPayload { header, buf } => {
                    let need = header.payload_len() - buf.len();
                    let take = need.min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if buf.len() == header.payload_len() {
                        completed.push(Frame {
                            source: header.source,
                            tag: header.tag,
                            payload: std::mem::take(buf),
                        });
                        self.state = DecodeState::ReadingHeader { buf: Vec::with_capacity(HEADER_LEN) };
                    }
                }
            }
        }

        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new(3, 7, 42).unwrap();
        let bytes = header.to_bytes();
        let decoded = FrameHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn header_reserved_bytes_are_zeroed_on_send() {
        let header = FrameHeader::new(0, 0, 0).unwrap();
        let bytes = header.to_bytes();
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn header_rejects_negative_length() {
        let mut bytes = FrameHeader::new(0, 0, 0).unwrap().to_bytes();
        bytes[8..12].copy_from_slice(&(-1i32).to_le_bytes());
        assert!(FrameHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn decoder_handles_whole_frame_in_one_chunk() {
        let frame = Frame::new(1, 2, vec![9, 9, 9]).unwrap();
        let bytes = frame.to_bytes().unwrap();

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].source, 1);
        assert_eq!(frames[0].tag, 2);
        assert_eq!(frames[0].payload, vec![9, 9, 9]);
    }

    #[test]
    fn decoder_handles_byte_at_a_time() {
        let frame = Frame::new(5, 6, vec![1, 2, 3, 4, 5]).unwrap();
        let bytes = frame.to_bytes().unwrap();

        let mut decoder = FrameDecoder::new();
        let mut got = Vec::new();
        for b in &bytes {
            got.extend(decoder.feed(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn decoder_handles_multiple_frames_in_one_chunk() {
        let f1 = Frame::new(0, 0, vec![1]).unwrap();
        let f2 = Frame::new(0, 1, vec![2, 2]).unwrap();
        let mut bytes = f1.to_bytes().unwrap();
        bytes.extend(f2.to_bytes().unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&bytes).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].tag, 0);
        assert_eq!(frames[1].tag, 1);
    }

    #[test]
    fn decoder_handles_zero_length_payload() {
        let frame = Frame::new(0, 0, vec![]).unwrap();
        let bytes = frame.to_bytes().unwrap();

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&bytes).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }
}
