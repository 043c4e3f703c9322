//! Response body compression, selected by the `Content-Encoding` a handler sets.

use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};
use std::io::{self, Write};
use std::str::FromStr;
use thiserror::Error;
use zstd::stream::write::Encoder as ZstdEncoder;

const BROTLI_BUFFER_SIZE: usize = 32 * 1024;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LGWIN: u32 = 22;
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum CompressError {
    #[error("unsupported content encoding: {encoding}")]
    Unsupported { encoding: String },

    #[error("compression failed: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl CompressError {
    pub fn unsupported<S: ToString>(encoding: S) -> Self {
        Self::Unsupported { encoding: encoding.to_string() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Deflate,
    Br,
    Zstd,
}

impl FromStr for Encoding {
    type Err = CompressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let encoding = if s.eq_ignore_ascii_case("gzip") || s.eq_ignore_ascii_case("x-gzip") {
            Self::Gzip
        } else if s.eq_ignore_ascii_case("deflate") {
            Self::Deflate
        } else if s.eq_ignore_ascii_case("br") {
            Self::Br
        } else if s.eq_ignore_ascii_case("zstd") {
            Self::Zstd
        } else if s.eq_ignore_ascii_case("identity") {
            Self::Identity
        } else {
            return Err(CompressError::unsupported(s));
        };
        Ok(encoding)
    }
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
            Self::Br => "br",
            Self::Zstd => "zstd",
        }
    }

    pub fn compress(self, body: &[u8]) -> Result<Bytes, CompressError> {
        let compressed = match self {
            Self::Identity => return Ok(Bytes::copy_from_slice(body)),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()?
            }
            Self::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
                encoder.write_all(body)?;
                encoder.finish()?
            }
            Self::Br => {
                let mut encoder =
                    brotli::CompressorWriter::new(Vec::with_capacity(body.len() / 2), BROTLI_BUFFER_SIZE, BROTLI_QUALITY, BROTLI_LGWIN);
                encoder.write_all(body)?;
                encoder.flush()?;
                encoder.into_inner()
            }
            Self::Zstd => {
                let mut encoder = ZstdEncoder::new(Vec::with_capacity(body.len() / 2), ZSTD_LEVEL)?;
                encoder.write_all(body)?;
                encoder.finish()?
            }
        };
        Ok(Bytes::from(compressed))
    }
}

/// Compresses `body` with the named `encoding`.
pub fn compress(encoding: &str, body: &[u8]) -> Result<Bytes, CompressError> {
    encoding.parse::<Encoding>()?.compress(body)
}
