//! Handling of messages arriving from the server.

use crate::{
    compression,
    game_link::GameLink,
    message::{Message, MAP_STATUS, PING},
    state::ConnectionState,
};
use bytes::Bytes;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{net::UdpSocket, select, time::sleep};
use tokio_util::sync::CancellationToken;

/// Size of the datagram receive buffer.
pub const MAX_DATAGRAM_LEN: usize = 10240;

/// Pause after a failed receive before trying again.
pub const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Routes inbound server traffic: control codes update relay state,
/// everything else goes to the game.
#[derive(Clone)]
pub struct Dispatcher {
    state: Arc<ConnectionState>,
    game: GameLink,
}

impl Dispatcher {
    pub fn new(state: Arc<ConnectionState>, game: GameLink) -> Self {
        Self { state, game }
    }

    /// Handles one payload from either remote transport, inflating it first
    /// if it carries the compression tag.
    pub async fn on_remote_payload(&self, payload: Bytes) {
        match compression::decode_payload(payload) {
            Ok(message) => self.on_remote_message(Message::new(message)).await,
            Err(e) => tracing::warn!("Dropping undecodable payload from server: {e:#}"),
        }
    }

    pub async fn on_remote_message(&self, message: Message) {
        match message.code() {
            None => {}
            Some(PING) => match self.state.complete_ping(Instant::now()) {
                Some(rtt) => tracing::trace!("Ping: {rtt} ms"),
                None => tracing::debug!("Ping reply without an outstanding ping"),
            },
            Some(MAP_STATUS) => {
                let status = String::from_utf8_lossy(&message).into_owned();
                self.state.set_map_status(status);
            }
            Some(_) => {
                self.game.send(&message).await;
            }
        }
    }

    /// Receives datagrams from the server until `stop` fires
    /// or the relay or remote link goes inactive.
    ///
    /// Datagrams are handled in arrival order, which need not be send order.
    pub async fn run_datagram_loop(&self, socket: &UdpSocket, stop: &CancellationToken) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];
        while self.state.is_relay_active() && self.state.is_remote_link_active() {
            let received = select! {
                _ = stop.cancelled() => break,
                received = socket.recv_from(&mut buffer) => received,
            };
            match received {
                Ok((len, _)) => {
                    self.on_remote_payload(Bytes::copy_from_slice(&buffer[..len]))
                        .await
                }
                Err(e) => {
                    tracing::debug!("Datagram receive failed: {e}");
                    select! {
                        _ = stop.cancelled() => break,
                        _ = sleep(RECEIVE_RETRY_DELAY) => {}
                    }
                }
            }
        }
    }
}
