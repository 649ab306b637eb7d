//! SSH-2 transport and connection protocol (RFC 4251-4254).
//!
//! # Architecture
//!
//! The implementation is layered bottom-up:
//!
//! 1. **Wire** ([`wire`], [`message`], [`messages`]) - SSH data types and
//!    message encodings
//! 2. **Packets** ([`packet`], [`codec`], [`crypto`], [`compression`]) -
//!    binary packet protocol with the negotiated cipher, MAC and zlib
//! 3. **Key exchange** ([`kex`], [`kex_dh`], [`hostkey`]) - negotiation,
//!    curve25519 / group14, exchange hash and key derivation
//! 4. **Connection** ([`connection`], [`dispatch`], [`channel_table`],
//!    [`channel`]) - dispatch, phase control and channel multiplexing
//! 5. **Driver** ([`driver`]) - runs a connection over a tokio stream
//!
//! The core is sans-I/O: [`Connection::feed`] takes received bytes and the
//! [`OutputQueue`] collects bytes to send. User authentication is not part
//! of the core; an authentication service plugs in through
//! [`Handler::on_service_message`] and calls
//! [`Session::set_authenticated`] when done.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use strand_proto::ssh::{AcceptAnyHostKey, Connection, Ed25519HostKey, Handler, TransportConfig};
//!
//! struct Quiet;
//! impl Handler for Quiet {}
//!
//! let key = Arc::new(Ed25519HostKey::generate(&mut rand::thread_rng()));
//! let mut client = Connection::client(TransportConfig::default(), AcceptAnyHostKey, Quiet).unwrap();
//! let mut server = Connection::server(TransportConfig::default(), key, Quiet).unwrap();
//!
//! for _ in 0..8 {
//!     let mut to_server = Vec::new();
//!     client.output_mut().drain(&mut to_server, usize::MAX).unwrap();
//!     let mut to_client = Vec::new();
//!     server.output_mut().drain(&mut to_client, usize::MAX).unwrap();
//!     server.feed(&to_server).unwrap();
//!     client.feed(&to_client).unwrap();
//! }
//! assert!(client.is_established() && server.is_established());
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod channel;
pub mod channel_table;
pub mod codec;
pub mod compression;
pub mod connection;
pub mod crypto;
pub mod dispatch;
pub mod driver;
pub mod handler;
pub mod hostkey;
pub mod kex;
pub mod kex_dh;
pub mod message;
pub mod messages;
pub mod output;
pub mod packet;
pub mod requests;
pub mod transport;
pub mod version;
pub mod wire;

// Re-export main types
pub use channel::{Channel, ChannelFlags, ChannelState};
pub use channel_table::{ChannelId, ChannelTable, ForwardedPort, SlotState};
pub use codec::{PacketDecoder, PacketEncoder};
pub use compression::CompressionAlgorithm;
pub use connection::{Connection, Session};
pub use crypto::{CipherAlgorithm, MacAlgorithm};
pub use dispatch::{DispatchTable, HandlerKind};
pub use driver::run_connection;
pub use handler::{Handler, OpenDecision, RequestReply};
pub use hostkey::{
    AcceptAnyHostKey, Ed25519HostKey, HostKey, HostKeyAlgorithm, HostKeyVerifier, PinnedHostKey,
};
pub use kex::{KexInit, KexMethod, KexState, NegotiatedAlgorithms};
pub use message::MessageType;
pub use messages::{
    ChannelKind, ChannelOpenFailureReason, ChannelRequestType, GlobalRequestType,
    EXTENDED_DATA_STDERR,
};
pub use output::OutputQueue;
pub use packet::Packet;
pub use requests::RequestToken;
pub use transport::{Role, TransportConfig};
pub use version::Version;
