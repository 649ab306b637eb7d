//! SSH-2 transport and connection core.
//!
//! This crate implements the protocol machinery under an SSH client or
//! server: version exchange, the binary packet protocol, key exchange and
//! rekeying, message dispatch, and channel multiplexing with flow control.
//! User authentication, shells and forwarding policy are left to a
//! [`ssh::Handler`] supplied by the embedding application.
//!
//! # Features
//!
//! - `ssh` (default) - SSH transport and connection protocol
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::{Connection, AcceptAnyHostKey, Handler, TransportConfig};
//!
//! struct Client;
//! impl Handler for Client {}
//!
//! let mut conn = Connection::client(TransportConfig::default(), AcceptAnyHostKey, Client).unwrap();
//! let mut wire = Vec::new();
//! conn.output_mut().drain(&mut wire, usize::MAX).unwrap();
//! assert!(wire.starts_with(b"SSH-2.0-"));
//! ```
//!
//! # Security
//!
//! - Cryptographic primitives come from vetted crates (`ring`, `ed25519-dalek`, RustCrypto)
//! - MACs are compared in constant time
//! - Session keys are zeroized on drop
//! - The packet decoder is fuzzed (`fuzz/`)

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
