//! # Strand Platform
//!
//! Shared types for the strand SSH transport.
//!
//! This crate provides:
//! - The unified error taxonomy (`StrandError`, `StrandResult`)
//! - SSH disconnect reason codes (`DisconnectReason`)
//!
//! # Examples
//!
//! ```
//! use strand_platform::{DisconnectReason, StrandError, StrandResult};
//!
//! fn check_padding(len: u8) -> StrandResult<u8> {
//!     if len < 4 {
//!         return Err(StrandError::malformed("padding too short"));
//!     }
//!     Ok(len)
//! }
//!
//! # fn main() {
//! let err = check_padding(2).unwrap_err();
//! assert!(err.is_fatal());
//! assert_eq!(err.disconnect_reason(), Some(DisconnectReason::ProtocolError));
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod error;

pub use error::{DisconnectReason, StrandError, StrandResult};

/// Platform version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
