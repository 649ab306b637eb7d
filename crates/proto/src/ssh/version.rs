//! SSH protocol version exchange (RFC 4253 Section 4.2).
//!
//! Both sides open with an identification line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! A server may send other lines before its identification; the client skips
//! them. `1.99` is accepted as a compatibility alias for `2.0`.
//!
//! # Example
//!
//! ```rust
//! use strand_proto::ssh::version::Version;
//!
//! let version = Version::new("strand_0.1.0", Some("test"));
//! assert_eq!(version.to_string(), "SSH-2.0-strand_0.1.0 test");
//!
//! let parsed = Version::parse("SSH-1.99-OpenSSH_8.9").unwrap();
//! assert_eq!(parsed.software(), "OpenSSH_8.9");
//! ```

use bytes::BytesMut;
use strand_platform::{DisconnectReason, StrandError, StrandResult};
use tracing::{debug, trace};

/// Maximum length of an identification line, CR LF included.
pub const MAX_VERSION_LENGTH: usize = 255;

/// Number of non-identification lines tolerated before the version line.
pub const MAX_PREAMBLE_LINES: usize = 50;

fn version_error(message: String) -> StrandError {
    StrandError::protocol(DisconnectReason::ProtocolVersionNotSupported, message)
}

/// Parsed identification string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    proto_version: String,
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates a protocol 2.0 identification.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Identification used when the configuration does not override it.
    pub fn default_strand() -> Self {
        Self::new(&format!("strand_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line, with or without the trailing CR LF.
    ///
    /// # Errors
    ///
    /// Fails with `PROTOCOL_VERSION_NOT_SUPPORTED` when the line is too long,
    /// contains NUL, does not start with `SSH-`, or names a protocol other
    /// than `2.0`/`1.99`.
    pub fn parse(line: &str) -> StrandResult<Self> {
        let line = line.trim_end_matches('\n').trim_end_matches('\r');

        if line.len() + 2 > MAX_VERSION_LENGTH {
            return Err(version_error(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(version_error("Version string contains null byte".into()));
        }

        let rest = line.strip_prefix("SSH-").ok_or_else(|| {
            version_error(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            ))
        })?;
        let (proto_version, rest) = rest
            .split_once('-')
            .ok_or_else(|| version_error(format!("Invalid version string format: '{}'", line)))?;

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(version_error(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software, Some(comments.trim().to_string())),
            None => (rest, None),
        };
        if software_version.is_empty() {
            return Err(version_error("Empty software version".into()));
        }

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version: software_version.to_string(),
            comments,
        })
    }

    /// Protocol version as sent (`2.0` or `1.99`).
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Software version field.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Trailing comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Line as written on the wire, CR LF included.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Incremental reader for the peer's identification line.
///
/// Bytes are fed as they arrive; once the line is complete the reader returns
/// the parsed version together with the exact line (without CR LF), which is
/// needed verbatim for the exchange hash. Anything after the line stays in
/// the buffer for the packet decoder.
#[derive(Debug, Default)]
pub struct VersionReader {
    allow_preamble: bool,
    skipped: usize,
}

impl VersionReader {
    /// Creates a reader. Clients set `allow_preamble` to skip banner lines.
    pub fn new(allow_preamble: bool) -> Self {
        Self {
            allow_preamble,
            skipped: 0,
        }
    }

    /// Tries to take the identification line off the front of `buf`.
    ///
    /// Returns `Ok(None)` while more bytes are needed.
    pub fn read(&mut self, buf: &mut BytesMut) -> StrandResult<Option<(Version, String)>> {
        loop {
            let newline = match buf.iter().position(|&b| b == b'\n') {
                Some(pos) => pos,
                None if buf.len() >= MAX_VERSION_LENGTH => {
                    return Err(version_error(format!(
                        "No line terminator within {} bytes",
                        MAX_VERSION_LENGTH
                    )));
                }
                None => return Ok(None),
            };

            let line = buf.split_to(newline + 1);
            let mut text = &line[..newline];
            if text.last() == Some(&b'\r') {
                text = &text[..text.len() - 1];
            }

            if !text.starts_with(b"SSH-") {
                self.skipped += 1;
                if !self.allow_preamble || self.skipped > MAX_PREAMBLE_LINES {
                    return Err(version_error(format!(
                        "Unexpected line before identification: {:?}",
                        String::from_utf8_lossy(text)
                    )));
                }
                trace!(line = %String::from_utf8_lossy(text), "skipping pre-banner line");
                continue;
            }

            let text = std::str::from_utf8(text)
                .map_err(|_| version_error("Version string is not UTF-8".into()))?;
            let version = Version::parse(text)?;
            debug!(peer = %version, "received identification");
            return Ok(Some((version, text.to_string())));
        }
    }

    /// Number of pre-banner lines skipped so far.
    pub fn skipped_lines(&self) -> usize {
        self.skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        let version = Version::new("strand_0.1.0", None);
        assert_eq!(version.to_string(), "SSH-2.0-strand_0.1.0");
        assert_eq!(version.to_wire_format(), b"SSH-2.0-strand_0.1.0\r\n");
    }

    #[test]
    fn test_version_parse_with_comments() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_version_parse_compat_199() {
        let version = Version::parse("SSH-1.99-Legacy").unwrap();
        assert_eq!(version.proto_version(), "1.99");
    }

    #[test]
    fn test_version_parse_unsupported_protocol() {
        match Version::parse("SSH-1.5-OldClient") {
            Err(StrandError::Protocol { reason, message }) => {
                assert_eq!(reason, DisconnectReason::ProtocolVersionNotSupported);
                assert!(message.contains("Unsupported protocol version"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[test]
    fn test_version_parse_rejects_garbage() {
        assert!(Version::parse("INVALID-2.0-Test").is_err());
        assert!(Version::parse(&format!("SSH-2.0-{}", "A".repeat(300))).is_err());
        assert!(Version::parse("SSH-2.0-Test\0Bad").is_err());
        assert!(Version::parse("SSH-2.0-").is_err());
    }

    #[test]
    fn test_reader_needs_more_bytes() {
        let mut reader = VersionReader::new(false);
        let mut buf = BytesMut::from(&b"SSH-2.0-Open"[..]);
        assert!(reader.read(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"SSH_9.0\r\n\x00\x00\x00\x0c");
        let (version, line) = reader.read(&mut buf).unwrap().unwrap();
        assert_eq!(version.software(), "OpenSSH_9.0");
        assert_eq!(line, "SSH-2.0-OpenSSH_9.0");
        // Packet bytes that followed the line stay buffered.
        assert_eq!(&buf[..], &[0, 0, 0, 12]);
    }

    #[test]
    fn test_reader_skips_preamble_for_clients() {
        let mut reader = VersionReader::new(true);
        let mut buf = BytesMut::from(&b"Welcome\r\nto the host\nSSH-2.0-srv\r\n"[..]);
        let (version, _) = reader.read(&mut buf).unwrap().unwrap();
        assert_eq!(version.software(), "srv");
        assert_eq!(reader.skipped_lines(), 2);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_reader_rejects_preamble_for_servers() {
        let mut reader = VersionReader::new(false);
        let mut buf = BytesMut::from(&b"hello\r\nSSH-2.0-cli\r\n"[..]);
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn test_reader_line_too_long() {
        let mut reader = VersionReader::new(false);
        let mut buf = BytesMut::from(vec![b'A'; MAX_VERSION_LENGTH].as_slice());
        assert!(reader.read(&mut buf).is_err());
    }
}
