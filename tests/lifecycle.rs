use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use game_relay::{
    config::RelayConfig,
    game_link::encode_frame,
    remote::{FramedStream, RemoteBringup, TcpBringup},
    Lifecycle, Relay, RelayError,
};
use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, UdpSocket},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

async fn within<F: Future>(future: F) -> F::Output {
    timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn start<B: RemoteBringup>(
    relay: Relay,
    bringup: B,
) -> (SocketAddr, JoinHandle<Result<(), RelayError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let lifecycle = Lifecycle::new(relay, bringup);
    let task = tokio::spawn(async move { lifecycle.serve(listener).await });
    (address, task)
}

/// Counts calls and never completes.
struct HangingBringup {
    calls: Arc<AtomicUsize>,
}

impl RemoteBringup for HangingBringup {
    fn bring_up(&self, _relay: Relay) -> impl Future<Output = anyhow::Result<()>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        futures::future::pending()
    }
}

#[tokio::test]
async fn reconnecting_during_a_pending_bringup_is_fatal() {
    init_tracing();
    let relay = Relay::new(RelayConfig::new("127.0.0.1:9".parse().unwrap()));
    let calls = Arc::new(AtomicUsize::new(0));
    let (address, task) = start(
        relay.clone(),
        HangingBringup {
            calls: Arc::clone(&calls),
        },
    )
    .await;

    let game = within(TcpStream::connect(address)).await.unwrap();
    drop(game);

    let result = within(task).await.unwrap();
    assert!(matches!(result, Err(RelayError::ReentrancyFault)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!relay.state().is_relay_active());
    assert!(!relay.state().is_remote_link_active());
    assert!(!relay.state().is_bringup_pending());
}

/// Stream and datagram sides of a multiplayer server on one port.
struct FakeServer {
    listener: TcpListener,
    udp: UdpSocket,
}

impl FakeServer {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let udp = UdpSocket::bind(listener.local_addr().unwrap())
            .await
            .unwrap();
        Self { listener, udp }
    }

    fn address(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    async fn accept(&self) -> Framed<TcpStream, LengthDelimitedCodec> {
        let (stream, _) = within(self.listener.accept()).await.unwrap();
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(4)
            .little_endian()
            .new_codec();
        Framed::new(stream, codec)
    }

    /// Next datagram that is not a heartbeat.
    async fn next_datagram(&self, heartbeat: &[u8]) -> (Vec<u8>, SocketAddr) {
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = within(self.udp.recv_from(&mut buf)).await.unwrap();
            if &buf[..len] != heartbeat {
                return (buf[..len].to_vec(), from);
            }
        }
    }
}

async fn next_frame(stream: &mut Framed<TcpStream, LengthDelimitedCodec>) -> Vec<u8> {
    within(stream.next()).await.unwrap().unwrap().to_vec()
}

#[tokio::test]
async fn relays_in_both_directions() {
    init_tracing();
    let server = FakeServer::bind().await;
    let relay = Relay::new(RelayConfig::new(server.address()));
    let (address, task) = start(relay.clone(), TcpBringup).await;

    let mut remote = server.accept().await;
    remote.send(Bytes::from_static(b"P3")).await.unwrap();

    let game = within(TcpStream::connect(address)).await.unwrap();
    let (reader, mut writer) = game.into_split();
    let mut lines = BufReader::new(reader).lines();
    assert_eq!(
        within(lines.next_line()).await.unwrap().as_deref(),
        Some("P3")
    );
    assert_eq!(relay.state().client_session_id(), Some(3));

    writer.write_all(&encode_frame(b"Ohello")).await.unwrap();
    let mut frames = vec![next_frame(&mut remote).await, next_frame(&mut remote).await];
    frames.sort();
    assert_eq!(frames, vec![b"H".to_vec(), b"Ohello".to_vec()]);

    // Short messages carry no code and travel unreliably.
    writer.write_all(&encode_frame(b"Vhi")).await.unwrap();
    let (datagram, relay_udp) = server.next_datagram(b"\x04:p").await;
    assert_eq!(datagram, b"\x04:Vhi");

    remote
        .send(Bytes::from_static(b"Zhello game"))
        .await
        .unwrap();
    assert_eq!(
        within(lines.next_line()).await.unwrap().as_deref(),
        Some("Zhello game")
    );

    let mut map_status = relay.state().subscribe_map_status();
    let mut upload_status = relay.state().subscribe_upload_status();
    assert_eq!(*upload_status.borrow_and_update(), "Ulstart");
    server
        .udp
        .send_to(b"Mlevels/gridmap/info.json", relay_udp)
        .await
        .unwrap();
    within(map_status.wait_for(|status| status == "Mlevels/gridmap/info.json"))
        .await
        .unwrap();
    within(upload_status.changed()).await.unwrap();
    assert_eq!(*upload_status.borrow(), "Uldone");

    relay.state().reset().await;
    assert!(within(task).await.unwrap().is_ok());
}

/// Completes the bring-up, then stays connected until cancelled.
struct LiveBringup {
    calls: Arc<AtomicUsize>,
}

impl RemoteBringup for LiveBringup {
    fn bring_up(&self, relay: Relay) -> impl Future<Output = anyhow::Result<()>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        async move {
            let (writer, _server) = tokio::io::duplex(4096);
            relay.state().assign_session_id(1);
            relay
                .state()
                .install_remote_stream(Arc::new(FramedStream::new(writer)));
            futures::future::pending::<()>().await;
            Ok(())
        }
    }
}

#[tokio::test]
async fn reconnecting_during_a_live_remote_session_is_fatal() {
    init_tracing();
    let relay = Relay::new(RelayConfig::new("127.0.0.1:9".parse().unwrap()));
    let calls = Arc::new(AtomicUsize::new(0));
    let (address, task) = start(
        relay.clone(),
        LiveBringup {
            calls: Arc::clone(&calls),
        },
    )
    .await;

    let game = within(TcpStream::connect(address)).await.unwrap();
    let mut lines = BufReader::new(game).lines();
    assert_eq!(
        within(lines.next_line()).await.unwrap().as_deref(),
        Some("P1")
    );
    assert!(!relay.state().is_bringup_pending());
    drop(lines);

    let result = within(task).await.unwrap();
    assert!(matches!(result, Err(RelayError::ReentrancyFault)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!relay.state().is_relay_active());
    assert_eq!(relay.state().client_session_id(), None);
    assert!(TcpStream::connect(address).await.is_err());
}

#[tokio::test]
async fn game_disconnect_with_a_live_server_session_terminates_the_relay() {
    init_tracing();
    let server = FakeServer::bind().await;
    let relay = Relay::new(RelayConfig::new(server.address()));
    let (address, task) = start(relay.clone(), TcpBringup).await;

    let mut remote = server.accept().await;
    remote.send(Bytes::from_static(b"P2")).await.unwrap();
    let game = within(TcpStream::connect(address)).await.unwrap();
    let mut lines = BufReader::new(game).lines();
    assert_eq!(
        within(lines.next_line()).await.unwrap().as_deref(),
        Some("P2")
    );
    assert_eq!(next_frame(&mut remote).await, b"H");
    drop(lines);

    let result = within(task).await.unwrap();
    assert!(matches!(result, Err(RelayError::ReentrancyFault)));
    assert!(within(remote.next()).await.is_none());
    assert!(timeout(Duration::from_millis(200), server.listener.accept())
        .await
        .is_err());
}

#[tokio::test]
async fn server_disconnect_ends_the_game_connection() {
    init_tracing();
    let server = FakeServer::bind().await;
    let relay = Relay::new(RelayConfig::new(server.address()));
    let (address, task) = start(relay.clone(), TcpBringup).await;

    let mut remote = server.accept().await;
    remote.send(Bytes::from_static(b"P0")).await.unwrap();
    let game = within(TcpStream::connect(address)).await.unwrap();
    let mut lines = BufReader::new(game).lines();
    assert_eq!(
        within(lines.next_line()).await.unwrap().as_deref(),
        Some("P0")
    );

    drop(remote);
    assert!(within(lines.next_line()).await.unwrap().is_none());

    // The session ended on its own, so a fresh one is brought up for the next game.
    let mut next = server.accept().await;
    next.send(Bytes::from_static(b"P4")).await.unwrap();
    let game = within(TcpStream::connect(address)).await.unwrap();
    let mut lines = BufReader::new(game).lines();
    assert_eq!(
        within(lines.next_line()).await.unwrap().as_deref(),
        Some("P4")
    );

    relay.state().reset().await;
    assert!(within(task).await.unwrap().is_ok());
}
