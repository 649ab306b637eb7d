//! Async driver tests over in-memory tokio streams.

use std::sync::Arc;
use std::time::Duration;

use strand_platform::{DisconnectReason, StrandError};
use strand_proto::ssh::{
    run_connection, AcceptAnyHostKey, ChannelId, ChannelKind, Connection, Ed25519HostKey, Handler,
    OpenDecision, Session, TransportConfig,
};
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

/// Opens a session once connected, sends a greeting and EOF, and hangs up
/// when the channel closes.
#[derive(Default)]
struct EchoClient {
    echoed: Vec<u8>,
    closed: bool,
}

impl Handler for EchoClient {
    fn on_established(&mut self, session: &mut Session) {
        session.set_authenticated().unwrap();
        session.open_session().unwrap();
    }

    fn on_open_confirmed(&mut self, session: &mut Session, id: ChannelId) {
        session.send_channel_data(id, &b"ping"[..]).unwrap();
        session.send_eof(id).unwrap();
    }

    fn on_receive(&mut self, session: &mut Session, id: ChannelId, data: &[u8], _extended: Option<u32>) {
        self.echoed.extend_from_slice(data);
        session.consume(id, data.len());
    }

    fn on_close(&mut self, session: &mut Session, _id: ChannelId) {
        self.closed = true;
        session.disconnect(DisconnectReason::ByApplication, "done");
    }
}

/// Echoes channel data back and mirrors EOF.
#[derive(Default)]
struct EchoServer {
    disconnect: Option<DisconnectReason>,
}

impl Handler for EchoServer {
    fn on_established(&mut self, session: &mut Session) {
        session.set_authenticated().unwrap();
    }

    fn on_channel_open(&mut self, _session: &mut Session, _id: ChannelId, kind: &ChannelKind) -> OpenDecision {
        assert_eq!(kind, &ChannelKind::Session);
        OpenDecision::Accept
    }

    fn on_receive(&mut self, session: &mut Session, id: ChannelId, data: &[u8], _extended: Option<u32>) {
        session.send_channel_data(id, data.to_vec()).unwrap();
        session.consume(id, data.len());
    }

    fn on_eof(&mut self, session: &mut Session, id: ChannelId) {
        session.send_eof(id).unwrap();
    }

    fn on_disconnect(&mut self, reason: DisconnectReason, _description: &str) {
        self.disconnect = Some(reason);
    }
}

#[tokio::test]
async fn test_echo_over_duplex() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let (a, b) = tokio::io::duplex(16 * 1024);
    let key = Arc::new(Ed25519HostKey::generate(&mut rand::thread_rng()));
    let mut client = Connection::client(TransportConfig::default(), AcceptAnyHostKey, EchoClient::default())?;
    let mut server = Connection::server(TransportConfig::default(), key, EchoServer::default())?;

    let (client_result, server_result) = timeout(
        Duration::from_secs(10),
        async { tokio::join!(run_connection(a, &mut client), run_connection(b, &mut server)) },
    )
    .await?;
    client_result?;
    server_result?;

    assert_eq!(client.handler().echoed, b"ping");
    assert!(client.handler().closed);
    assert_eq!(server.handler().disconnect, Some(DisconnectReason::ByApplication));
    assert!(client.is_closed() && server.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_handshake_timeout() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    // The peer end stays open but never answers.
    let (a, _silent) = tokio::io::duplex(16 * 1024);
    let config = TransportConfig::default().with_handshake_timeout(Duration::from_millis(100));
    let mut client = Connection::client(config, AcceptAnyHostKey, EchoClient::default())?;

    let result = timeout(Duration::from_secs(5), run_connection(a, &mut client)).await?;
    assert!(matches!(result, Err(StrandError::Timeout(_))));
    assert!(client.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_peer_eof_tears_down() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let (a, b) = tokio::io::duplex(16 * 1024);
    drop(b);
    let mut client = Connection::client(TransportConfig::default(), AcceptAnyHostKey, EchoClient::default())?;

    let result = timeout(Duration::from_secs(5), run_connection(a, &mut client)).await?;
    assert!(matches!(result, Err(StrandError::Io(_))));
    assert!(client.is_closed());
    Ok(())
}
