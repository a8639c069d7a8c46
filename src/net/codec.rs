//! Framing for the replication protocol.
//!
//! Frames are length-prefixed postcard: a big-endian u32 length followed by
//! the serialized [`Frame`]. Both logical channels share one TLS stream;
//! the channel tag in each frame routes it.

use anyhow::{ensure, Result};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::entry::LogEntry;
use crate::log::StateVector;

/// Frames larger than this are rejected outright; a single delta exchange
/// should never come close.
const MAX_FRAME_SIZE: usize = 1024 * 1024 * 64;

/// Which logical log a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Lab,
    Admin,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Lab => "lab",
            Channel::Admin => "admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Opens a channel: everything this side already has.
    Hello { state: StateVector },
    /// A delta of log entries, initial or live.
    Entries(Vec<LogEntry>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: Channel,
    pub message: SyncMessage,
}

#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let bytes: [u8; 4] = src[..4].try_into().expect("just checked");
        let frame_len = u32::from_be_bytes(bytes) as usize;
        ensure!(
            frame_len <= MAX_FRAME_SIZE,
            "frame of length {frame_len} is too large"
        );
        if src.len() < 4 + frame_len {
            // Reserve so the next read has room for the full frame.
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        let frame: Frame = postcard::from_bytes(&src[4..4 + frame_len])?;
        src.advance(4 + frame_len);
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = anyhow::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let len = postcard::experimental::serialized_size(&frame)?;
        ensure!(
            len <= MAX_FRAME_SIZE,
            "frame of length {len} is too large"
        );
        dst.put_u32(u32::try_from(len).expect("just checked"));
        let start = dst.len();
        dst.resize(start + len, 0);
        let written = postcard::to_slice(&frame, &mut dst[start..])?.len();
        debug_assert_eq!(written, len);
        Ok(())
    }
}
