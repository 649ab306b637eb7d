//! Loopback SSH transport example
//!
//! This example demonstrates how to:
//! - Run a server and a client `Connection` over an in-memory pipe with the
//!   async driver
//! - Open a session channel and exchange data
//! - Close the channel and disconnect
//!
//! The user authentication service is skipped: both sides mark themselves
//! authenticated once the first key exchange completes.
//!
//! Usage:
//!   RUST_LOG=debug cargo run --example loopback [message]

use std::env;
use std::sync::Arc;

use strand_platform::DisconnectReason;
use strand_proto::ssh::{
    run_connection, AcceptAnyHostKey, ChannelId, ChannelKind, Connection, Ed25519HostKey, Handler,
    HostKey, OpenDecision, Session, TransportConfig,
};

struct Client {
    message: String,
    reply: Vec<u8>,
}

impl Handler for Client {
    fn on_established(&mut self, session: &mut Session) {
        if let Some(n) = session.negotiated() {
            println!(
                "client: negotiated {} / {} / {}",
                n.kex.name(),
                n.host_key.name(),
                n.cipher_c2s.name()
            );
        }
        if session.set_authenticated().and_then(|()| session.open_session()).is_err() {
            session.disconnect(DisconnectReason::ByApplication, "setup failed");
        }
    }

    fn on_open_confirmed(&mut self, session: &mut Session, id: ChannelId) {
        println!("client: channel {} open, sending {:?}", id, self.message);
        let sent = session
            .send_channel_data(id, self.message.clone().into_bytes())
            .and_then(|()| session.send_eof(id));
        if let Err(e) = sent {
            eprintln!("client: send failed: {}", e);
        }
    }

    fn on_receive(&mut self, session: &mut Session, id: ChannelId, data: &[u8], _extended: Option<u32>) {
        self.reply.extend_from_slice(data);
        session.consume(id, data.len());
    }

    fn on_close(&mut self, session: &mut Session, id: ChannelId) {
        println!("client: channel {} closed", id);
        session.disconnect(DisconnectReason::ByApplication, "bye");
    }
}

/// Replies with the received bytes reversed.
struct Server;

impl Handler for Server {
    fn on_established(&mut self, session: &mut Session) {
        if session.set_authenticated().is_err() {
            session.disconnect(DisconnectReason::ByApplication, "setup failed");
        }
    }

    fn on_channel_open(&mut self, _session: &mut Session, id: ChannelId, kind: &ChannelKind) -> OpenDecision {
        println!("server: {} channel {} requested", kind.name(), id);
        OpenDecision::Accept
    }

    fn on_receive(&mut self, session: &mut Session, id: ChannelId, data: &[u8], _extended: Option<u32>) {
        let reversed: Vec<u8> = data.iter().rev().copied().collect();
        if let Err(e) = session.send_channel_data(id, reversed) {
            eprintln!("server: send failed: {}", e);
        }
        session.consume(id, data.len());
    }

    fn on_eof(&mut self, session: &mut Session, id: ChannelId) {
        let _ = session.send_eof(id);
    }

    fn on_disconnect(&mut self, reason: DisconnectReason, description: &str) {
        println!("server: client disconnected ({}: {})", reason, description);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let message = env::args().nth(1).unwrap_or_else(|| "hello over ssh".to_string());

    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let key: Arc<dyn HostKey> = Arc::new(Ed25519HostKey::generate(&mut rand::thread_rng()));
    println!("server: using {} host key", key.algorithm_name());

    let server = tokio::spawn(async move {
        let mut conn = Connection::server(TransportConfig::default(), key, Server)?;
        run_connection(server_end, &mut conn).await
    });

    let mut client = Connection::client(
        TransportConfig::default(),
        AcceptAnyHostKey,
        Client {
            message,
            reply: Vec::new(),
        },
    )?;
    run_connection(client_end, &mut client).await?;
    server.await??;

    println!("client: reply {:?}", String::from_utf8_lossy(&client.handler().reply));
    Ok(())
}
