//! The link to the local game process.
//!
//! The two directions use different framing:
//! * game => relay: `<decimal length>>` followed by exactly that many bytes
//! * relay => game: raw bytes followed by a single `\n`

use crate::{
    compression::DECOMPRESSED_LIMIT,
    error::{FramingError, RelayError},
    message::Message,
    multiplexer::Multiplexer,
    state::ConnectionState,
};
use bytes::{Buf, BytesMut};
use futures::StreamExt;
use std::{io, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    select,
};
use tokio_util::{
    codec::{Decoder, FramedRead},
    sync::CancellationToken,
};

/// Maximum size of the `<length>>` header, delimiter included.
pub const MAX_HEADER_LEN: usize = 10;

/// Largest payload the game may announce.
pub const MAX_FRAME_LEN: usize = DECOMPRESSED_LIMIT;

/// Decoder for frames sent by the game.
#[derive(Debug, Default)]
pub struct GameFrameCodec {
    /// Payload length of the frame whose header has been consumed.
    payload_len: Option<usize>,
}

impl GameFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for GameFrameCodec {
    type Item = Message;
    type Error = RelayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, RelayError> {
        let len = match self.payload_len {
            Some(len) => len,
            None => {
                let header = &src[..src.len().min(MAX_HEADER_LEN)];
                let Some(delimiter) = header.iter().position(|&b| b == b'>') else {
                    if header.len() == MAX_HEADER_LEN {
                        return Err(FramingError::HeaderTooLong(MAX_HEADER_LEN).into());
                    }
                    return Ok(None);
                };
                let len = parse_length(&header[..delimiter])?;
                src.advance(delimiter + 1);
                self.payload_len = Some(len);
                len
            }
        };

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        self.payload_len = None;
        Ok(Some(Message::new(src.split_to(len).freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Message>, RelayError> {
        // A frame cut short by the game closing is dropped, not an error.
        self.decode(src)
    }
}

fn parse_length(digits: &[u8]) -> Result<usize, FramingError> {
    let invalid = || FramingError::InvalidLength(String::from_utf8_lossy(digits).into_owned());
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    let len: usize = std::str::from_utf8(digits)
        .map_err(|_| invalid())?
        .parse()
        .map_err(|_| invalid())?;
    if len > MAX_FRAME_LEN {
        return Err(FramingError::FrameTooLarge(len));
    }
    Ok(len)
}

/// Encodes a payload in the game => relay framing.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = format!("{}>", payload.len()).into_bytes();
    buf.extend_from_slice(payload);
    buf
}

/// Handle for talking to the currently connected game.
#[derive(Clone)]
pub struct GameLink {
    state: Arc<ConnectionState>,
}

impl GameLink {
    pub fn new(state: Arc<ConnectionState>) -> Self {
        Self { state }
    }

    /// Writes a message followed by `\n` to the game.
    ///
    /// Writes from every caller are serialized, so each message and its
    /// newline reach the game contiguously. Messages are dropped silently
    /// if the relay is shutting down or no game is connected. Returns whether
    /// the message was written; failed writes are not retried.
    pub async fn send(&self, message: &[u8]) -> bool {
        let mut game = self.state.lock_game().await;
        if !self.state.is_relay_active() || !self.state.is_game_connected() {
            return false;
        }
        let Some(writer) = game.as_mut() else {
            return false;
        };
        if message.len() > 1000 {
            tracing::debug!("Relay => game ({} bytes)", message.len());
        }

        let closed = self.state.game_token();
        let result = select! {
            _ = closed.cancelled() => Err(io::Error::from(io::ErrorKind::NotConnected)),
            result = write_message(writer, message) => result,
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Write to game failed: {e}");
                false
            }
        }
    }

    /// Reads frames from the game and hands each to the multiplexer,
    /// until the game disconnects, `stop` fires or the relay goes inactive.
    ///
    /// Returns `Ok(())` when stopped by the relay, otherwise the reason the
    /// connection ended.
    pub async fn read_frames<R>(
        &self,
        reader: R,
        multiplexer: &Multiplexer,
        stop: &CancellationToken,
    ) -> Result<(), RelayError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, GameFrameCodec::new());
        while self.state.is_relay_active() {
            let frame = select! {
                _ = stop.cancelled() => return Ok(()),
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(message)) => {
                    if !self.state.is_relay_active() {
                        break;
                    }
                    multiplexer.send_to_server(&message, false).await;
                }
                Some(Err(e)) => return Err(e),
                None => return Err(RelayError::ConnectionClosed),
            }
        }
        Ok(())
    }
}

/// Writes the message, then the newline as a separate write.
async fn write_message<W>(writer: &mut W, message: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(message).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
