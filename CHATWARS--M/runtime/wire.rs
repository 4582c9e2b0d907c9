use bytes::{Buf, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::events::Transition;

/// Version written by this build; receivers reject anything else.
pub const WIRE_VERSION: u8 = 1;

/// Largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// One key edge sent to a remote input server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Protocol version.
    pub v: u8,
    /// Player slot on the remote device.
    pub player_index: u8,
    /// Device key.
    pub key: String,
    /// Press or release.
    pub transition: Transition,
    /// Per-connection sequence number.
    pub seq: u64,
}

impl WireMessage {
    /// Builds a message at the current version.
    #[must_use]
    pub fn new(player_index: u8, key: impl Into<String>, transition: Transition, seq: u64) -> Self {
        Self {
            v: WIRE_VERSION,
            player_index,
            key: key.into(),
            transition,
            seq,
        }
    }

    /// Encodes the JSON payload without the length prefix.
    pub fn to_payload(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a payload, rejecting unknown versions.
    pub fn from_payload(payload: &[u8]) -> Result<Self, WireError> {
        let message: Self = serde_json::from_slice(payload)?;
        if message.v != WIRE_VERSION {
            return Err(WireError::UnsupportedVersion(message.v));
        }
        Ok(message)
    }
}

/// Framing and decoding failures.
#[derive(Debug, Error)]
pub enum WireError {
    /// Socket error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    /// Payload is not a valid message.
    #[error("invalid payload: {0}")]
    Json(#[from] serde_json::Error),
    /// Version other than [`WIRE_VERSION`].
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),
    /// Declared length above [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    /// Stream ended inside a frame.
    #[error("stream ended mid-frame")]
    Truncated,
}

/// Reads `u32` big-endian length-prefixed messages.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(1024),
        }
    }

    /// Next message, or `None` on a clean end of stream.
    pub async fn read_message(&mut self) -> Result<Option<WireMessage>, WireError> {
        loop {
            if self.buf.len() >= 4 {
                let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
                if len > MAX_FRAME_LEN {
                    return Err(WireError::FrameTooLarge(len));
                }
                if self.buf.len() >= 4 + len {
                    self.buf.advance(4);
                    let payload = self.buf.split_to(len);
                    return WireMessage::from_payload(&payload).map(Some);
                }
            }
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                return if self.buf.is_empty() {
                    Ok(None)
                } else {
                    Err(WireError::Truncated)
                };
            }
        }
    }
}

/// Writes `u32` big-endian length-prefixed messages.
#[derive(Debug)]
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a writer.
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Underlying writer.
    pub const fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Writes and flushes one message.
    pub async fn write_message(&mut self, message: &WireMessage) -> Result<(), WireError> {
        let payload = message.to_payload()?;
        if payload.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(payload.len()));
        }
        let len = u32::try_from(payload.len()).map_err(|_| WireError::FrameTooLarge(payload.len()))?;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&payload);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_matches_documented_shape() {
        let message = WireMessage::new(0, "a", Transition::Press, 7);
        let json: serde_json::Value = serde_json::from_slice(&message.to_payload().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"v":1,"player_index":0,"key":"a","transition":"press","seq":7})
        );
    }

    #[test]
    fn rejects_unknown_version() {
        let payload = br#"{"v":2,"player_index":0,"key":"a","transition":"press","seq":1}"#;
        assert!(matches!(
            WireMessage::from_payload(payload),
            Err(WireError::UnsupportedVersion(2))
        ));
    }

    #[tokio::test]
    async fn frames_cross_a_duplex_pipe() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);
        let sent = [
            WireMessage::new(1, "dpad_left", Transition::Press, 0),
            WireMessage::new(1, "dpad_left", Transition::Release, 1),
        ];
        let send = async {
            for message in &sent {
                writer.write_message(message).await.unwrap();
            }
            drop(writer);
        };
        let receive = async {
            let mut got = Vec::new();
            while let Some(message) = reader.read_message().await.unwrap() {
                got.push(message);
            }
            got
        };
        let ((), got) = tokio::join!(send, receive);
        assert_eq!(got, sent);
    }

    #[tokio::test]
    async fn oversized_and_truncated_frames_fail() {
        let huge = u32::MAX.to_be_bytes();
        let mut reader = FrameReader::new(&huge[..]);
        assert!(matches!(reader.read_message().await, Err(WireError::FrameTooLarge(_))));

        let partial = [0u8, 0, 0, 9, b'{'];
        let mut reader = FrameReader::new(&partial[..]);
        assert!(matches!(reader.read_message().await, Err(WireError::Truncated)));
    }
}
