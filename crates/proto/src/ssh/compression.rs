//! Payload compression (RFC 4253 Section 6.2).
//!
//! `zlib` runs from the first NEWKEYS. `zlib@openssh.com` is negotiated the
//! same way but stays dormant until user authentication succeeds. Both keep
//! one deflate stream per direction for the lifetime of the keys, flushing
//! with a partial flush on every packet.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use strand_platform::{DisconnectReason, StrandError, StrandResult};

/// Upper bound on a single inflated payload.
pub const MAX_DECOMPRESSED_SIZE: usize = 256 * 1024;

/// Compression algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// zlib from the first NEWKEYS
    Zlib,
    /// zlib started after authentication
    ZlibOpenssh,
}

impl CompressionAlgorithm {
    /// Returns the algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibOpenssh => "zlib@openssh.com",
        }
    }

    /// Parses from name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibOpenssh),
            _ => None,
        }
    }

    /// Whether activation waits for user authentication.
    pub fn is_delayed(&self) -> bool {
        matches!(self, CompressionAlgorithm::ZlibOpenssh)
    }

    /// Builds the outbound stream. `authenticated` activates delayed zlib
    /// immediately (rekey after login).
    pub fn compressor(&self, authenticated: bool) -> Compressor {
        Compressor {
            algorithm: *self,
            stream: match self {
                CompressionAlgorithm::None => None,
                _ => Some(Compress::new(Compression::default(), true)),
            },
            active: !self.is_delayed() || authenticated,
        }
    }

    /// Builds the inbound stream.
    pub fn decompressor(&self, authenticated: bool) -> Decompressor {
        Decompressor {
            algorithm: *self,
            stream: match self {
                CompressionAlgorithm::None => None,
                _ => Some(Decompress::new(true)),
            },
            active: !self.is_delayed() || authenticated,
        }
    }
}

fn compression_error(message: String) -> StrandError {
    StrandError::protocol(DisconnectReason::CompressionError, message)
}

/// Outbound compression stream.
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    stream: Option<Compress>,
    active: bool,
}

impl std::fmt::Debug for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compressor")
            .field("algorithm", &self.algorithm)
            .field("active", &self.active)
            .finish()
    }
}

impl Default for Compressor {
    fn default() -> Self {
        CompressionAlgorithm::None.compressor(false)
    }
}

impl Compressor {
    /// Negotiated algorithm.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Whether payloads are currently being compressed.
    pub fn is_active(&self) -> bool {
        self.active && self.stream.is_some()
    }

    /// Turns on delayed compression.
    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Compresses one payload. Returns `None` when compression is inactive
    /// and the payload should be sent as is.
    pub fn compress(&mut self, input: &[u8]) -> StrandResult<Option<Vec<u8>>> {
        let stream = match (&mut self.stream, self.active) {
            (Some(stream), true) => stream,
            _ => return Ok(None),
        };

        let mut output = Vec::with_capacity(input.len() + 64);
        let mut consumed = 0;
        loop {
            let before = stream.total_in();
            let status = stream
                .compress_vec(&input[consumed..], &mut output, FlushCompress::Partial)
                .map_err(|e| compression_error(format!("deflate failed: {}", e)))?;
            consumed += (stream.total_in() - before) as usize;

            if consumed == input.len() && output.len() < output.capacity() {
                break;
            }
            if status == Status::StreamEnd {
                return Err(compression_error("deflate stream ended early".into()));
            }
            output.reserve(output.capacity().max(64));
        }
        Ok(Some(output))
    }
}

/// Inbound decompression stream.
pub struct Decompressor {
    algorithm: CompressionAlgorithm,
    stream: Option<Decompress>,
    active: bool,
}

impl std::fmt::Debug for Decompressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decompressor")
            .field("algorithm", &self.algorithm)
            .field("active", &self.active)
            .finish()
    }
}

impl Default for Decompressor {
    fn default() -> Self {
        CompressionAlgorithm::None.decompressor(false)
    }
}

impl Decompressor {
    /// Negotiated algorithm.
    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    /// Whether payloads are currently being inflated.
    pub fn is_active(&self) -> bool {
        self.active && self.stream.is_some()
    }

    /// Turns on delayed compression.
    pub fn activate(&mut self) {
        self.active = true;
    }

    /// Inflates one payload. Returns `None` when decompression is inactive.
    ///
    /// # Errors
    ///
    /// Corrupt input or output beyond [`MAX_DECOMPRESSED_SIZE`] fails with
    /// `COMPRESSION_ERROR`.
    pub fn decompress(&mut self, input: &[u8]) -> StrandResult<Option<Vec<u8>>> {
        let stream = match (&mut self.stream, self.active) {
            (Some(stream), true) => stream,
            _ => return Ok(None),
        };

        let mut output = Vec::with_capacity((input.len() * 4).max(256));
        let mut consumed = 0;
        loop {
            let before_in = stream.total_in();
            let before_out = output.len();
            let status = stream
                .decompress_vec(&input[consumed..], &mut output, FlushDecompress::Sync)
                .map_err(|e| compression_error(format!("inflate failed: {}", e)))?;
            consumed += (stream.total_in() - before_in) as usize;

            if output.len() > MAX_DECOMPRESSED_SIZE {
                return Err(compression_error(format!(
                    "Decompressed payload exceeds {} bytes",
                    MAX_DECOMPRESSED_SIZE
                )));
            }
            if status == Status::StreamEnd {
                return Err(compression_error("Unexpected end of zlib stream".into()));
            }
            let room = output.len() < output.capacity();
            if consumed == input.len() && room {
                break;
            }
            if room && output.len() == before_out && stream.total_in() == before_in {
                return Err(compression_error("zlib stream made no progress".into()));
            }
            output.reserve(output.capacity().max(256));
        }
        Ok(Some(output))
    }
}
