//! The remote side's stream transport.
//!
//! Connecting to the server and reading its stream are the job of a
//! [`RemoteBringup`] collaborator. The relay only ever writes to the stream
//! through the [`RemoteStream`] it installs.
//!
//! [`TcpBringup`] is the stock collaborator used by the binary. It frames
//! both directions with a 4-byte little-endian length prefix and expects the
//! server to assign the client session id with a `P<id>` message before
//! anything else is relayed.

use crate::{compression::DECOMPRESSED_LIMIT, relay::Relay};
use anyhow::{anyhow, Context};
use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use std::{future::Future, io, sync::Arc, time::Duration};
use tokio::{io::AsyncWrite, net::TcpStream, select, sync::Mutex, time::timeout};
use tokio_util::{
    codec::{FramedRead, FramedWrite, LengthDelimitedCodec},
    sync::CancellationToken,
};

/// Write side of the remote stream transport.
pub trait RemoteStream: Send + Sync {
    /// Writes one payload, completing once all of it has been handed to the transport.
    fn send<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, io::Result<()>>;

    /// Closes the stream. Pending and future sends fail.
    fn close(&self) -> BoxFuture<'_, io::Result<()>>;
}

/// Brings up a remote session.
///
/// The returned future connects to `relay.config().remote_address`, assigns the
/// client session id, installs its stream with
/// [`ConnectionState::install_remote_stream`](crate::state::ConnectionState::install_remote_stream)
/// (which completes the bring-up) and then delivers every inbound payload to
/// [`Dispatcher::on_remote_payload`](crate::dispatcher::Dispatcher::on_remote_payload)
/// until the server disconnects.
pub trait RemoteBringup: Send + Sync + 'static {
    fn bring_up(&self, relay: Relay) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Time the server has to assign a session id.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .little_endian()
        .max_frame_length(DECOMPRESSED_LIMIT)
        .new_codec()
}

/// `RemoteStream` over any byte sink, using the length-prefixed framing.
pub struct FramedStream<W> {
    sink: Mutex<FramedWrite<W, LengthDelimitedCodec>>,
    closed: CancellationToken,
}

impl<W> FramedStream<W>
where
    W: AsyncWrite + Send + Unpin,
{
    pub fn new(writer: W) -> Self {
        Self {
            sink: Mutex::new(FramedWrite::new(writer, codec())),
            closed: CancellationToken::new(),
        }
    }
}

impl<W> RemoteStream for FramedStream<W>
where
    W: AsyncWrite + Send + Unpin,
{
    fn send<'a>(&'a self, payload: &'a [u8]) -> BoxFuture<'a, io::Result<()>> {
        async move {
            let mut sink = select! {
                _ = self.closed.cancelled() => return Err(closed()),
                sink = self.sink.lock() => sink,
            };
            select! {
                _ = self.closed.cancelled() => Err(closed()),
                result = sink.send(Bytes::copy_from_slice(payload)) => result,
            }
        }
        .boxed()
    }

    fn close(&self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            self.closed.cancel();
            let mut sink = self.sink.lock().await;
            SinkExt::<Bytes>::close(&mut *sink).await
        }
        .boxed()
    }
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "remote stream closed")
}

/// Parses a `P<id>` session assignment.
pub fn parse_session_assignment(message: &[u8]) -> Option<i32> {
    let digits = message.strip_prefix(b"P")?;
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Stock bring-up over plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpBringup;

impl RemoteBringup for TcpBringup {
    fn bring_up(&self, relay: Relay) -> impl Future<Output = anyhow::Result<()>> + Send {
        async move {
            let address = relay.config().remote_address;
            let stream = TcpStream::connect(address)
                .await
                .with_context(|| format!("failed to connect to {address}"))?;
            stream.set_nodelay(true)?;
            tracing::info!("Connected to server {address}");

            let (reader, writer) = stream.into_split();
            let mut frames = FramedRead::new(reader, codec());

            let id = timeout(HANDSHAKE_TIMEOUT, async {
                while let Some(frame) = frames.next().await {
                    let frame = frame?.freeze();
                    if let Some(id) = parse_session_assignment(&frame) {
                        return Ok::<_, anyhow::Error>(id);
                    }
                    relay.dispatcher().on_remote_payload(frame).await;
                }
                Err(anyhow!("server closed the connection during the handshake"))
            })
            .await
            .context("server did not assign a session id in time")??;

            if relay.state().assign_session_id(id) {
                tracing::info!("Assigned client session id {id}");
            }
            relay
                .state()
                .install_remote_stream(Arc::new(FramedStream::new(writer)));

            while let Some(frame) = frames.next().await {
                relay.dispatcher().on_remote_payload(frame?.freeze()).await;
            }
            tracing::info!("Server closed the connection");
            Ok(())
        }
    }
}
