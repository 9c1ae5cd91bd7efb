use crate::{message::PING, multiplexer::Multiplexer, state::ConnectionState};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{select, time::sleep};
use tokio_util::sync::CancellationToken;

pub const PING_INTERVAL: Duration = Duration::from_secs(1);

/// Periodically pings the server. The reply is timed by the dispatcher.
pub struct Heartbeat {
    state: Arc<ConnectionState>,
    multiplexer: Multiplexer,
}

impl Heartbeat {
    pub fn new(state: Arc<ConnectionState>, multiplexer: Multiplexer) -> Self {
        Self { state, multiplexer }
    }

    /// Pings once per interval while the relay is active.
    pub async fn run(&self, stop: &CancellationToken) {
        while self.state.is_relay_active() {
            self.multiplexer.send_to_server(&[PING], false).await;
            self.state.record_ping_start(Instant::now());
            select! {
                _ = stop.cancelled() => break,
                _ = sleep(PING_INTERVAL) => {}
            }
        }
        tracing::debug!("Heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UdpSocket;

    #[tokio::test]
    async fn pings_over_datagrams_until_the_relay_stops() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let state = Arc::new(ConnectionState::new());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        state.install_remote_datagram(Arc::new(client));
        assert!(state.assign_session_id(0));

        let multiplexer = Multiplexer::new(Arc::clone(&state), server.local_addr().unwrap());
        let heartbeat = Heartbeat::new(Arc::clone(&state), multiplexer);
        let task = tokio::spawn(async move { heartbeat.run(&CancellationToken::new()).await });

        let mut buf = [0u8; 16];
        for _ in 0..2 {
            let len = tokio::time::timeout(Duration::from_secs(5), server.recv(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(&buf[..len], b"\x01:p");
        }
        assert!(state.complete_ping(Instant::now()).is_some());

        // The flag alone ends the loop within one interval.
        state.set_relay_active(false);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
