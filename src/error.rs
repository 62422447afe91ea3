use std::{io, net::SocketAddr};

use thiserror::Error;

use crate::upstream::PoolKey;

/// Errors raised while building the routing tables or relaying traffic.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("upstream pool `{0}` is already registered")]
    DuplicatePool(PoolKey),
    #[error("upstream pool `{0}` is not registered")]
    UnknownPool(PoolKey),
    #[error("no location matches `{0}`")]
    RouteNotFound(String),
    #[error("failed to connect to upstream {backend}: {source}")]
    UpstreamConnect {
        backend: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to upstream {0} timed out")]
    UpstreamConnectTimeout(String),
    #[error("malformed configuration: {0}")]
    ConfigurationMalformed(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to set up logging: {0}")]
    Logging(String),
    #[error("An I/O error occurred: {0}")]
    Io(#[from] io::Error),
    #[error("An HTTP framing error occurred: {0}")]
    Codec(#[from] CodecError),
    #[error("A yaml parsing error occurred: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors produced by the HTTP/1.1 codecs.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed http message: {0}")]
    Parse(#[from] httparse::Error),
    #[error("message body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("invalid chunked transfer coding")]
    InvalidChunk,
    #[error("invalid content-length header")]
    InvalidContentLength,
    #[error("message head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },
    #[error("connection closed before the message was complete")]
    Incomplete,
    #[error("failed to apply {encoding} content coding: {source}")]
    ContentCoding {
        encoding: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("An I/O error occurred: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T, E = ProxyError> = std::result::Result<T, E>;
