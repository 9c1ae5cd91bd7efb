//! Connection lifecycle.
//!
//! The accept loop owns the local listener. Only one remote session (a set of
//! supervised tasks) exists at a time, and a new one is brought up only after
//! the previous one has ended on its own. The game reconnecting while the
//! remote session is still alive is fatal: the relay resets and exits.

use crate::{
    error::RelayError,
    heartbeat::Heartbeat,
    message::PING,
    relay::Relay,
    remote::RemoteBringup,
    state::ConnectionState,
};
use anyhow::Context;
use futures::future::join_all;
use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};
use tokio::{
    net::{TcpListener, TcpSocket, UdpSocket},
    select,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// The OS clamps this to its own maximum backlog.
const LISTEN_BACKLOG: u32 = i32::MAX as u32;

const DATAGRAM_FAILED_STATUS: &str = "UlConnection Failed!";

/// Runs the relay: accepts game connections and manages remote sessions.
pub struct Lifecycle<B> {
    relay: Relay,
    bringup: Arc<B>,
}

impl<B> Lifecycle<B>
where
    B: RemoteBringup,
{
    pub fn new(relay: Relay, bringup: B) -> Self {
        Self {
            relay,
            bringup: Arc::new(bringup),
        }
    }

    /// Binds the loopback listener and runs the accept loop.
    pub async fn run(&self) -> Result<(), RelayError> {
        let listener = bind_listener(self.relay.config().listen_address())?;
        tracing::info!("Game link listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Runs the accept loop on an already bound listener.
    ///
    /// Returns `Ok(())` once the listener is invalidated by
    /// [`ConnectionState::reset`], or [`RelayError::ReentrancyFault`]
    /// if the remote session was still alive when the game reconnected.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        let state = self.relay.state();
        let listener_token = state.rearm();
        let mut session: Option<RemoteSession> = None;

        let result = loop {
            state.set_game_connected(false);

            if let Some(previous) = session.take() {
                if previous.is_live() {
                    tracing::warn!("Remote session still alive, terminating relay");
                    session = Some(previous);
                    break Err(RelayError::ReentrancyFault);
                }
                previous.shut_down().await;
                state.close_remote().await;
                state.begin_remote_session();
            }
            let mut current = self.spawn_bringup(&listener_token);

            let accepted = select! {
                _ = listener_token.cancelled() => None,
                accepted = listener.accept() => Some(accepted),
            };
            let stream = match accepted {
                Some(Ok((stream, _))) => stream,
                Some(Err(e)) => {
                    tracing::debug!("Game link accept failed: {e}");
                    session = Some(current);
                    break Err(e.into());
                }
                None => {
                    session = Some(current);
                    break Ok(());
                }
            };
            tracing::info!("Game connected");

            let (reader, writer) = stream.into_split();
            state
                .install_game_writer(Box::new(writer), current.token.child_token())
                .await;
            state.set_game_connected(true);
            if current.is_live() {
                current.start_workers(&self.relay);
            }

            let stop = current.token.clone();
            session = Some(current);
            match self
                .relay
                .game()
                .read_frames(reader, self.relay.multiplexer(), &stop)
                .await
            {
                Ok(()) => tracing::debug!("Game link stopped by the relay"),
                Err(RelayError::ConnectionClosed) => tracing::debug!("Game connection closing"),
                Err(e) => tracing::debug!("Game connection lost: {e}"),
            }

            state.set_relay_active(false);
            state.set_game_connected(false);
            state.close_game().await;

            if listener_token.is_cancelled() {
                break Ok(());
            }
        };

        if matches!(result, Err(RelayError::ReentrancyFault)) {
            state.reset().await;
        }
        state.set_relay_active(false);
        state.set_remote_link_active(false);
        state.set_game_connected(false);
        if let Some(session) = session {
            session.shut_down().await;
        }
        state.close_game().await;
        state.close_remote().await;
        tracing::debug!("Game link accept loop ended");
        result
    }

    /// Spawns the remote bring-up for a new session.
    fn spawn_bringup(&self, listener_token: &CancellationToken) -> RemoteSession {
        let token = listener_token.child_token();
        let state = Arc::clone(self.relay.state());
        state.begin_bringup();

        let bringup = Arc::clone(&self.bringup);
        let relay = self.relay.clone();
        let stop = token.clone();
        let task = tokio::spawn(async move {
            let result = select! {
                _ = stop.cancelled() => None,
                result = bringup.bring_up(relay) => Some(result),
            };
            state.finish_bringup();
            match result {
                Some(Ok(())) => end_session(&state, &stop),
                Some(Err(e)) => {
                    tracing::warn!("Remote bring-up failed: {e:#}");
                    end_session(&state, &stop);
                }
                None => {}
            }
        });

        RemoteSession {
            token,
            tasks: vec![task],
        }
    }
}

/// Supervised tasks making up one remote session.
struct RemoteSession {
    /// Cancelled when the session ends, for whatever reason.
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RemoteSession {
    /// Whether the session has not ended yet. A pending bring-up counts as alive.
    fn is_live(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Starts the heartbeat and the datagram side of the remote link.
    fn start_workers(&mut self, relay: &Relay) {
        let heartbeat = Heartbeat::new(Arc::clone(relay.state()), relay.multiplexer().clone());
        let stop = self.token.clone();
        self.tasks
            .push(tokio::spawn(async move { heartbeat.run(&stop).await }));

        let relay = relay.clone();
        let stop = self.token.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(e) = drive_remote_link(&relay, &stop).await {
                tracing::warn!("Remote link failed: {e:#}");
                relay.state().set_upload_status(DATAGRAM_FAILED_STATUS);
            }
            if !stop.is_cancelled() {
                end_session(relay.state(), &stop);
            }
        }));
    }

    /// Ends the session and waits for all of its tasks to finish.
    async fn shut_down(self) {
        self.token.cancel();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                tracing::error!("Remote session task failed: {e}");
            }
        }
    }
}

fn end_session(state: &ConnectionState, token: &CancellationToken) {
    if token.is_cancelled() {
        return;
    }
    state.set_remote_link_active(false);
    state.set_relay_active(false);
    tracing::info!("Connection terminated");
    token.cancel();
}

/// Opens the datagram socket, greets the server once the bring-up has completed,
/// then receives datagrams until the session ends.
async fn drive_remote_link(relay: &Relay, stop: &CancellationToken) -> anyhow::Result<()> {
    let local_address: SocketAddr = if relay.config().remote_address.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(local_address)
        .await
        .context("failed to open datagram socket")?;
    let socket = Arc::new(socket);
    relay.state().install_remote_datagram(Arc::clone(&socket));

    let mut pending = relay.state().subscribe_bringup_pending();
    let completed = select! {
        _ = stop.cancelled() => false,
        result = pending.wait_for(|pending| !pending) => result.is_ok(),
    };
    if !completed {
        return Ok(());
    }

    greet(relay).await;
    relay.dispatcher().run_datagram_loop(&socket, stop).await;
    Ok(())
}

/// Announces the session id to the game and opens both server transports.
async fn greet(relay: &Relay) {
    if let Some(id) = relay.state().client_session_id() {
        relay.game().send(format!("P{id}").as_bytes()).await;
    }
    if let Err(e) = relay.multiplexer().send_stream(b"H").await {
        tracing::debug!("Failed to greet server over stream: {e:#}");
    }
    if let Err(e) = relay.multiplexer().send_datagram(&[PING]).await {
        tracing::debug!("Failed to greet server over datagrams: {e:#}");
    }
}

fn bind_listener(address: SocketAddr) -> io::Result<TcpListener> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.bind(address)?;
    socket.listen(LISTEN_BACKLOG)
}
