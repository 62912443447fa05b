//! Docker stdio multiplex framing.
//!
//! Each frame is an 8-byte header followed by the payload:
//!
//! ```text
//! [stream_id, 0, 0, 0, len_be32[0..4]] ++ payload
//! ```
//!
//! where `stream_id` is 1 for stdout and 2 for stderr. Frames are only
//! used on non-TTY bridges; a TTY session carries raw bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::ProtocolError;
use crate::message::StdStream;

/// Size of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 8;

/// One demultiplexed chunk of process output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioFrame {
    pub stream: StdStream,
    pub payload: Bytes,
}

impl StdioFrame {
    pub fn new(stream: StdStream, payload: impl Into<Bytes>) -> Self {
        Self {
            stream,
            payload: payload.into(),
        }
    }

    /// Encode the header for a payload of `len` bytes.
    pub fn header(stream: StdStream, len: usize) -> Result<[u8; FRAME_HEADER_LEN], ProtocolError> {
        let len = u32::try_from(len).map_err(|_| ProtocolError::FrameTooLarge(len))?;
        let mut header = [0u8; FRAME_HEADER_LEN];
        header[0] = stream.frame_id();
        header[4..].copy_from_slice(&len.to_be_bytes());
        Ok(header)
    }
}

/// Codec for a stream of [`StdioFrame`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioFrameCodec;

impl Encoder<StdioFrame> for StdioFrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: StdioFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let header = StdioFrame::header(frame.stream, frame.payload.len())?;
        dst.reserve(FRAME_HEADER_LEN + frame.payload.len());
        dst.put_slice(&header);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

impl Decoder for StdioFrameCodec {
    type Item = StdioFrame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let stream =
            StdStream::from_frame_id(src[0]).ok_or(ProtocolError::InvalidStream(src[0]))?;
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;

        if src.len() < FRAME_HEADER_LEN + len {
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(StdioFrame { stream, payload }))
    }
}
