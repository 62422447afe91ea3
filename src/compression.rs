//! Content coding for both legs of the proxy.
//!
//! The client-facing leg negotiates gzip/deflate from each request's
//! `Accept-Encoding` and compresses the matching response. The upstream leg
//! decodes gzip/deflate bodies so the client-facing leg sees plain content.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
};

use bytes::Bytes;
use flate2::{
    read::{DeflateDecoder, GzDecoder, ZlibDecoder},
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use serde::Deserialize;
use strum::{Display, IntoStaticStr};
use tracing::trace;

use crate::{
    error::CodecError,
    http::{is_bodiless, HttpRequest, HttpResponse},
};

const ACCEPT_ENCODING: &str = "Accept-Encoding";
const CONTENT_ENCODING: &str = "Content-Encoding";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompressionConfig {
    pub enabled: bool,
    /// flate2 level, 0-9.
    pub level: u32,
    /// Bodies shorter than this are sent as-is.
    pub min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: 6,
            min_size: 0,
        }
    }
}

impl CompressionConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Encoding {
    Gzip,
    Deflate,
    Identity,
}

impl Encoding {
    /// Maps a `Content-Encoding` value to a coding we can decode.
    pub fn from_content_encoding(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "deflate" | "x-deflate" => Some(Self::Deflate),
            "identity" | "" => Some(Self::Identity),
            _ => None,
        }
    }
}

/// Picks the best coding from an `Accept-Encoding` value. Codings with
/// `q=0` are refused; gzip wins ties with deflate.
pub fn negotiate(accept_encoding: Option<&str>) -> Encoding {
    let Some(value) = accept_encoding else {
        return Encoding::Identity;
    };

    let mut best = (Encoding::Identity, 0.0_f32);
    for part in value.split(',') {
        let mut params = part.split(';');
        let coding = params.next().unwrap_or_default().trim().to_ascii_lowercase();
        let quality = params
            .filter_map(|p| p.trim().strip_prefix("q="))
            .find_map(|q| q.trim().parse::<f32>().ok())
            .unwrap_or(1.0);
        if quality <= 0.0 {
            continue;
        }
        let encoding = match coding.as_str() {
            "gzip" | "x-gzip" | "*" => Encoding::Gzip,
            "deflate" => Encoding::Deflate,
            _ => continue,
        };
        let better = quality > best.1
            || (quality == best.1 && encoding == Encoding::Gzip && best.0 == Encoding::Deflate);
        if better {
            best = (encoding, quality);
        }
    }
    best.0
}

pub fn compress(data: &[u8], encoding: Encoding, level: u32) -> io::Result<Vec<u8>> {
    let level = Compression::new(level.min(9));
    match encoding {
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), level);
            encoder.write_all(data)?;
            encoder.finish()
        }
        // "deflate" on the wire is the zlib format.
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), level);
            encoder.write_all(data)?;
            encoder.finish()
        }
        Encoding::Identity => Ok(data.to_vec()),
    }
}

pub fn decompress(data: &[u8], encoding: Encoding) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    match encoding {
        Encoding::Gzip => {
            GzDecoder::new(data).read_to_end(&mut out)?;
        }
        Encoding::Deflate => {
            // Some servers send raw deflate without the zlib wrapper.
            if ZlibDecoder::new(data).read_to_end(&mut out).is_err() {
                out.clear();
                DeflateDecoder::new(data).read_to_end(&mut out)?;
            }
        }
        Encoding::Identity => out.extend_from_slice(data),
    }
    Ok(out)
}

/// Remembers the negotiated coding of every decoded request so that each
/// response is compressed for the request it answers.
#[derive(Debug)]
pub struct ContentCompressor {
    config: CompressionConfig,
    accepted: VecDeque<Encoding>,
}

impl ContentCompressor {
    pub fn new(config: CompressionConfig) -> Self {
        Self {
            config,
            accepted: VecDeque::new(),
        }
    }

    pub fn on_request(&mut self, request: &HttpRequest) {
        if self.config.enabled {
            self.accepted
                .push_back(negotiate(request.headers.get_str(ACCEPT_ENCODING)));
        }
    }

    pub fn on_response(&mut self, response: &mut HttpResponse) -> Result<(), CodecError> {
        // Interim responses precede the final one for the same request.
        if !self.config.enabled || response.status.is_informational() {
            return Ok(());
        }
        let encoding = self.accepted.pop_front().unwrap_or(Encoding::Identity);
        if encoding == Encoding::Identity
            || is_bodiless(response.status)
            || response.body.is_empty()
            || response.body.len() < self.config.min_size
            || response.headers.contains(CONTENT_ENCODING)
        {
            return Ok(());
        }

        let compressed = compress(&response.body, encoding, self.config.level)
            .map_err(|source| CodecError::ContentCoding {
                encoding: encoding.into(),
                source,
            })?;
        trace!(%encoding, from = response.body.len(), to = compressed.len(), "compressed response");
        response.body = Bytes::from(compressed);
        response
            .headers
            .set(CONTENT_ENCODING, http::HeaderValue::from_static(encoding.into()));
        response.headers.set_content_length(response.body.len());
        Ok(())
    }
}

/// Replaces a gzip/deflate response body with its decoded content.
/// Unknown codings are passed through untouched.
pub fn decode_response_body(response: &mut HttpResponse) -> Result<(), CodecError> {
    let Some(encoding) = response
        .headers
        .get_str(CONTENT_ENCODING)
        .and_then(Encoding::from_content_encoding)
    else {
        return Ok(());
    };
    if encoding == Encoding::Identity || response.body.is_empty() {
        return Ok(());
    }

    let decoded = decompress(&response.body, encoding).map_err(|source| {
        CodecError::ContentCoding {
            encoding: encoding.into(),
            source,
        }
    })?;
    response.body = Bytes::from(decoded);
    response.headers.remove(CONTENT_ENCODING);
    response.headers.set_content_length(response.body.len());
    Ok(())
}
