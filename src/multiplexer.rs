//! Outbound routing of game messages to the server.
//!
//! Each message takes one of three paths, chosen from its routing code
//! and size:
//!
//! - **Bulk-reliable**: acknowledged codes (`O`, `T`) and reliable messages over
//!   1000 bytes. Sent on the stream, compressed above the threshold.
//! - **Reliable**: codes that must not be lost (`N W Y V E C`) and anything whose
//!   worst-case compressed size would not fit a safe datagram. Sent on the
//!   stream as-is.
//! - **Unreliable**: everything else. One datagram, compressed above the
//!   threshold, prefixed with the client slot byte and `:`.

use crate::{
    compression::{self, worst_case_compressed_size},
    error::RelayError,
    message::{outbound_code, ACKNOWLEDGED_CODES, RELIABLE_CODES},
    state::ConnectionState,
};
use anyhow::{anyhow, Context};
use std::{net::SocketAddr, sync::Arc};

/// Reliable messages longer than this take the bulk path.
pub const BULK_THRESHOLD: usize = 1000;

/// Largest worst-case compressed size allowed on the datagram path.
pub const MAX_DATAGRAM_PAYLOAD: usize = 1024;

/// Marker that, in a message longer than [`HARD_FAULT_MIN_LEN`], is a fatal protocol fault.
pub const HARD_FAULT_MARKER: &[u8; 2] = b"Zp";
pub const HARD_FAULT_MIN_LEN: usize = 500;

/// Separates the client slot byte from the payload in outbound datagrams.
pub const SLOT_SEPARATOR: u8 = b':';

/// How a message is delivered to the server.
#[derive(Copy, Clone, Debug, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum Delivery {
    BulkReliable,
    Reliable,
    Unreliable,
}

impl Delivery {
    /// Chooses the delivery path for an outbound message.
    pub fn classify(message: &[u8], force_reliable: bool) -> Self {
        let code = outbound_code(message);
        let must_acknowledge = ACKNOWLEDGED_CODES.contains(&code);
        let reliable = force_reliable
            || RELIABLE_CODES.contains(&code)
            || worst_case_compressed_size(message.len()) > MAX_DATAGRAM_PAYLOAD;

        if must_acknowledge || reliable {
            if must_acknowledge || message.len() > BULK_THRESHOLD {
                Delivery::BulkReliable
            } else {
                Delivery::Reliable
            }
        } else {
            Delivery::Unreliable
        }
    }
}

/// Checks the message against the hard-fault marker rule.
pub fn check_hard_fault(message: &[u8]) -> Result<(), RelayError> {
    if message.len() > HARD_FAULT_MIN_LEN
        && message
            .windows(HARD_FAULT_MARKER.len())
            .any(|window| window == HARD_FAULT_MARKER)
    {
        return Err(RelayError::ProtocolHardFault { len: message.len() });
    }
    Ok(())
}

/// Builds an outbound datagram: slot byte, separator, payload.
pub fn encode_datagram(session_id: i32, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let slot = session_id
        .checked_add(1)
        .and_then(|slot| u8::try_from(slot).ok())
        .with_context(|| format!("session id {session_id} does not fit a client slot"))?;
    let mut datagram = Vec::with_capacity(payload.len() + 2);
    datagram.push(slot);
    datagram.push(SLOT_SEPARATOR);
    datagram.extend_from_slice(payload);
    Ok(datagram)
}

/// Sends game messages to the server over the right transport.
#[derive(Clone)]
pub struct Multiplexer {
    state: Arc<ConnectionState>,
    remote_address: SocketAddr,
}

impl Multiplexer {
    pub fn new(state: Arc<ConnectionState>, remote_address: SocketAddr) -> Self {
        Self {
            state,
            remote_address,
        }
    }

    /// Sends a message to the server. Returns whether it was handed to a transport.
    ///
    /// Empty messages, and every message while the relay is terminating, are
    /// dropped. A message tripping [`check_hard_fault`] aborts the process.
    pub async fn send_to_server(&self, message: &[u8], force_reliable: bool) -> bool {
        if !self.state.is_relay_active() || message.is_empty() {
            return false;
        }
        if let Err(fault) = check_hard_fault(message) {
            tracing::error!("{fault}, aborting");
            std::process::abort();
        }

        let delivery = Delivery::classify(message, force_reliable);
        let result = match delivery {
            Delivery::BulkReliable => self.send_bulk(message).await,
            Delivery::Reliable => self.send_stream(message).await,
            Delivery::Unreliable => self.send_datagram(message).await,
        };

        if message.len() > BULK_THRESHOLD {
            let head = String::from_utf8_lossy(&message[..10]);
            let tail = String::from_utf8_lossy(&message[message.len() - 10..]);
            tracing::debug!(
                "Relay => server ({}): {} bytes sent : {head}{tail}",
                delivery.as_ref(),
                message.len()
            );
        }

        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Failed to send {} message: {e:#}", delivery.as_ref());
                false
            }
        }
    }

    /// Compresses above the threshold, then writes to the stream.
    pub async fn send_bulk(&self, message: &[u8]) -> anyhow::Result<()> {
        let payload = compression::encode_payload(message)?;
        self.send_stream(&payload).await
    }

    /// Writes the payload to the stream unchanged.
    pub async fn send_stream(&self, payload: &[u8]) -> anyhow::Result<()> {
        let stream = self
            .state
            .remote_stream()
            .ok_or_else(|| anyhow!("remote stream not connected"))?;
        stream.send(payload).await?;
        Ok(())
    }

    /// Compresses above the threshold, then sends one tagged datagram.
    pub async fn send_datagram(&self, message: &[u8]) -> anyhow::Result<()> {
        let session_id = self
            .state
            .client_session_id()
            .context("client session id not assigned")?;
        let socket = self
            .state
            .remote_datagram()
            .context("datagram socket not open")?;

        let payload = compression::encode_payload(message)?;
        let datagram = encode_datagram(session_id, &payload)?;
        socket.send_to(&datagram, self.remote_address).await?;
        Ok(())
    }
}
