use std::collections::VecDeque;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{HeaderValue, Method, StatusCode, Version};
use httparse::Status;
use tokio_util::codec::{Decoder, Encoder};

use super::{
    is_bodiless, Headers, HttpRequest, HttpResponse, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING,
};
use crate::{
    compression::{self, CompressionConfig, ContentCompressor},
    error::CodecError,
};

/// Largest aggregated body accepted on either leg (1 MiB).
pub const DEFAULT_MAX_CONTENT_LENGTH: usize = 1024 * 1024;

const MAX_HEADERS: usize = 100;
const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 4096;

/// How the body of the message being decoded is delimited.
#[derive(Debug)]
enum Framing {
    Length(usize),
    Chunked(ChunkState),
    UntilEof,
}

#[derive(Debug, Clone, Copy)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

/// Collects a message body until its framing says it is complete.
#[derive(Debug)]
struct BodyAggregator {
    framing: Framing,
    body: BytesMut,
    limit: usize,
}

impl BodyAggregator {
    fn new(framing: Framing, limit: usize) -> Result<Self, CodecError> {
        let capacity = match framing {
            Framing::Length(len) if len > limit => return Err(CodecError::TooLarge { limit }),
            Framing::Length(len) => len,
            _ => 0,
        };
        Ok(Self {
            framing,
            body: BytesMut::with_capacity(capacity),
            limit,
        })
    }

    fn is_until_eof(&self) -> bool {
        matches!(self.framing, Framing::UntilEof)
    }

    /// Moves body bytes out of `src`; returns true once the body is complete.
    fn poll(&mut self, src: &mut BytesMut) -> Result<bool, CodecError> {
        loop {
            match &mut self.framing {
                Framing::Length(remaining) => {
                    let n = (*remaining).min(src.len());
                    self.body.put(src.split_to(n));
                    *remaining -= n;
                    return Ok(*remaining == 0);
                }
                Framing::UntilEof => {
                    if self.body.len() + src.len() > self.limit {
                        return Err(CodecError::TooLarge { limit: self.limit });
                    }
                    self.body.put(src.split());
                    return Ok(false);
                }
                Framing::Chunked(state) => match *state {
                    ChunkState::Size => {
                        let Some(line) = take_line(src, MAX_CHUNK_LINE)? else {
                            return Ok(false);
                        };
                        let size = parse_chunk_size(&line)?;
                        if size == 0 {
                            *state = ChunkState::Trailers;
                        } else if self.body.len() + size > self.limit {
                            return Err(CodecError::TooLarge { limit: self.limit });
                        } else {
                            *state = ChunkState::Data(size);
                        }
                    }
                    ChunkState::Data(remaining) => {
                        if src.is_empty() {
                            return Ok(false);
                        }
                        let n = remaining.min(src.len());
                        self.body.put(src.split_to(n));
                        if remaining == n {
                            *state = ChunkState::DataEnd;
                        } else {
                            *state = ChunkState::Data(remaining - n);
                            return Ok(false);
                        }
                    }
                    ChunkState::DataEnd => {
                        if src.len() < 2 {
                            return Ok(false);
                        }
                        if &src[..2] != b"\r\n" {
                            return Err(CodecError::InvalidChunk);
                        }
                        src.advance(2);
                        *state = ChunkState::Size;
                    }
                    ChunkState::Trailers => {
                        // Trailer fields are dropped; the empty line ends the message.
                        let Some(line) = take_line(src, MAX_HEAD_SIZE)? else {
                            return Ok(false);
                        };
                        if line.is_empty() {
                            return Ok(true);
                        }
                    }
                },
            }
        }
    }

    /// Hands back the aggregated body. Messages that were not sent with a
    /// plain `Content-Length` get one, and lose their `Transfer-Encoding`.
    fn finish(self, headers: &mut Headers) -> Bytes {
        if !matches!(self.framing, Framing::Length(_)) {
            headers.remove(TRANSFER_ENCODING);
            headers.set_content_length(self.body.len());
        }
        self.body.freeze()
    }
}

/// Splits one line (without its line ending) off the front of `src`.
fn take_line(src: &mut BytesMut, limit: usize) -> Result<Option<BytesMut>, CodecError> {
    let Some(pos) = src.iter().position(|b| *b == b'\n') else {
        if src.len() > limit {
            return Err(CodecError::InvalidChunk);
        }
        return Ok(None);
    };
    let mut line = src.split_to(pos + 1);
    line.truncate(pos);
    if line.last() == Some(&b'\r') {
        line.truncate(pos - 1);
    }
    Ok(Some(line))
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, CodecError> {
    let line = std::str::from_utf8(line).map_err(|_| CodecError::InvalidChunk)?;
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16).map_err(|_| CodecError::InvalidChunk)
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case(TRANSFER_ENCODING))
        .filter_map(|(_, value)| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .last()
        .is_some_and(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
}

/// The declared `Content-Length`; repeated headers must agree.
fn content_length(headers: &Headers) -> Result<Option<usize>, CodecError> {
    let mut length = None;
    for (_, value) in headers
        .iter()
        .filter(|(name, _)| name.eq_ignore_ascii_case(CONTENT_LENGTH))
    {
        let value = value
            .to_str()
            .map_err(|_| CodecError::InvalidContentLength)?;
        for part in value.split(',') {
            let parsed = part
                .trim()
                .parse::<usize>()
                .map_err(|_| CodecError::InvalidContentLength)?;
            match length {
                Some(existing) if existing != parsed => {
                    return Err(CodecError::InvalidContentLength)
                }
                _ => length = Some(parsed),
            }
        }
    }
    Ok(length)
}

fn collect_headers(raw: &[httparse::Header<'_>]) -> Result<Headers, CodecError> {
    let mut headers = Headers::new();
    for header in raw {
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| CodecError::Parse(httparse::Error::HeaderValue))?;
        headers.append(header.name, value);
    }
    Ok(headers)
}

fn version_of(minor: Option<u8>) -> Version {
    match minor {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn version_str(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

fn check_partial(src: &BytesMut) -> Result<(), CodecError> {
    if src.len() > MAX_HEAD_SIZE {
        return Err(CodecError::HeadTooLarge {
            limit: MAX_HEAD_SIZE,
        });
    }
    Ok(())
}

fn parse_request_head(src: &mut BytesMut) -> Result<Option<HttpRequest>, CodecError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut storage);
    let len = match parsed.parse(&src[..])? {
        Status::Partial => {
            check_partial(src)?;
            return Ok(None);
        }
        Status::Complete(len) => len,
    };

    let method = Method::from_bytes(parsed.method.unwrap_or_default().as_bytes())
        .map_err(|_| CodecError::Parse(httparse::Error::Token))?;
    let request = HttpRequest {
        method,
        uri: parsed.path.unwrap_or("/").to_string(),
        version: version_of(parsed.version),
        headers: collect_headers(parsed.headers)?,
        body: Bytes::new(),
    };
    src.advance(len);
    Ok(Some(request))
}

fn parse_response_head(src: &mut BytesMut) -> Result<Option<HttpResponse>, CodecError> {
    let mut storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut storage);
    let len = match parsed.parse(&src[..])? {
        Status::Partial => {
            check_partial(src)?;
            return Ok(None);
        }
        Status::Complete(len) => len,
    };

    let status = StatusCode::from_u16(parsed.code.unwrap_or_default())
        .map_err(|_| CodecError::Parse(httparse::Error::Status))?;
    let response = HttpResponse {
        version: version_of(parsed.version),
        status,
        reason: parsed
            .reason
            .filter(|r| !r.is_empty())
            .map(str::to_string),
        headers: collect_headers(parsed.headers)?,
        body: Bytes::new(),
    };
    src.advance(len);
    Ok(Some(response))
}

fn request_framing(headers: &Headers) -> Result<Framing, CodecError> {
    if headers.contains(TRANSFER_ENCODING) {
        return if is_chunked(headers) {
            Ok(Framing::Chunked(ChunkState::Size))
        } else {
            Err(CodecError::InvalidChunk)
        };
    }
    Ok(Framing::Length(content_length(headers)?.unwrap_or(0)))
}

fn response_framing(
    request_method: Option<&Method>,
    response: &HttpResponse,
) -> Result<Framing, CodecError> {
    if request_method == Some(&Method::HEAD) || is_bodiless(response.status) {
        return Ok(Framing::Length(0));
    }
    if is_chunked(&response.headers) {
        return Ok(Framing::Chunked(ChunkState::Size));
    }
    Ok(match content_length(&response.headers)? {
        Some(len) => Framing::Length(len),
        None => Framing::UntilEof,
    })
}

fn encode_headers(headers: &Headers, body: &[u8], dst: &mut BytesMut) {
    for (name, value) in headers.iter() {
        dst.put_slice(name.as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
    dst.put_slice(body);
}

/// What the client-facing codec yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The client sent `Expect: 100-continue` and waits for `100 Continue`
    /// before sending the body.
    Continue,
    Request(HttpRequest),
}

impl Inbound {
    pub fn into_request(self) -> Option<HttpRequest> {
        match self {
            Inbound::Request(request) => Some(request),
            Inbound::Continue => None,
        }
    }
}

/// True when the head asks for `100 Continue`; the expectation is consumed.
fn take_continue_expectation(request: &mut HttpRequest) -> bool {
    let expects = request
        .headers
        .get_str(EXPECT)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"));
    if expects {
        request.headers.remove(EXPECT);
    }
    expects && request.version == Version::HTTP_11
}

/// Client-facing codec: decodes complete requests, encodes responses and
/// compresses them according to the request they answer.
#[derive(Debug)]
pub struct ServerCodec {
    max_content_length: usize,
    pending: Option<(HttpRequest, BodyAggregator)>,
    compressor: ContentCompressor,
}

impl ServerCodec {
    pub fn new(max_content_length: usize, compression: CompressionConfig) -> Self {
        Self {
            max_content_length,
            pending: None,
            compressor: ContentCompressor::new(compression),
        }
    }
}

impl Default for ServerCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTENT_LENGTH, CompressionConfig::default())
    }
}

impl Decoder for ServerCodec {
    type Item = Inbound;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, CodecError> {
        if self.pending.is_none() {
            let Some(mut head) = parse_request_head(src)? else {
                return Ok(None);
            };
            let expects_continue = take_continue_expectation(&mut head);
            let framing = request_framing(&head.headers)?;
            let awaits_body = !matches!(framing, Framing::Length(0));
            let aggregator = BodyAggregator::new(framing, self.max_content_length)?;
            self.pending = Some((head, aggregator));
            if expects_continue && awaits_body && src.is_empty() {
                return Ok(Some(Inbound::Continue));
            }
        }

        let done = match self.pending.as_mut() {
            Some((_, aggregator)) => aggregator.poll(src)?,
            None => false,
        };
        if !done {
            return Ok(None);
        }
        let Some((mut request, aggregator)) = self.pending.take() else {
            return Ok(None);
        };
        request.body = aggregator.finish(&mut request.headers);
        self.compressor.on_request(&request);
        Ok(Some(Inbound::Request(request)))
    }
}

impl Encoder<HttpResponse> for ServerCodec {
    type Error = CodecError;

    fn encode(&mut self, mut item: HttpResponse, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.compressor.on_response(&mut item)?;

        let reason = item
            .reason
            .as_deref()
            .or(item.status.canonical_reason())
            .unwrap_or_default();
        dst.reserve(128 + item.body.len());
        dst.put_slice(version_str(item.version).as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(item.status.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(reason.as_bytes());
        dst.put_slice(b"\r\n");
        encode_headers(&item.headers, &item.body, dst);
        Ok(())
    }
}

/// Backend-facing codec: encodes requests, decodes complete responses and
/// strips gzip/deflate content coding from them.
#[derive(Debug)]
pub struct ClientCodec {
    max_content_length: usize,
    in_flight: VecDeque<Method>,
    pending: Option<(HttpResponse, BodyAggregator)>,
    decompress: bool,
}

impl ClientCodec {
    pub fn new(max_content_length: usize) -> Self {
        Self {
            max_content_length,
            in_flight: VecDeque::new(),
            pending: None,
            decompress: true,
        }
    }

    /// Leaves response bodies exactly as received.
    pub fn raw(max_content_length: usize) -> Self {
        Self {
            decompress: false,
            ..Self::new(max_content_length)
        }
    }

    fn complete(
        &self,
        mut response: HttpResponse,
        aggregator: BodyAggregator,
    ) -> Result<HttpResponse, CodecError> {
        response.body = aggregator.finish(&mut response.headers);
        if self.decompress {
            compression::decode_response_body(&mut response)?;
        }
        Ok(response)
    }
}

impl Default for ClientCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONTENT_LENGTH)
    }
}

impl Decoder for ClientCodec {
    type Item = HttpResponse;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<HttpResponse>, CodecError> {
        while self.pending.is_none() {
            let Some(head) = parse_response_head(src)? else {
                return Ok(None);
            };
            // Interim responses (100 Continue and friends) are not relayed.
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                continue;
            }
            let method = self.in_flight.pop_front();
            let framing = response_framing(method.as_ref(), &head)?;
            let aggregator = BodyAggregator::new(framing, self.max_content_length)?;
            self.pending = Some((head, aggregator));
        }

        let done = match self.pending.as_mut() {
            Some((_, aggregator)) => aggregator.poll(src)?,
            None => false,
        };
        if !done {
            return Ok(None);
        }
        match self.pending.take() {
            Some((response, aggregator)) => self.complete(response, aggregator).map(Some),
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<HttpResponse>, CodecError> {
        if let Some(response) = self.decode(src)? {
            return Ok(Some(response));
        }
        match self.pending.take() {
            Some((response, aggregator)) if aggregator.is_until_eof() => {
                self.complete(response, aggregator).map(Some)
            }
            Some(_) => Err(CodecError::Incomplete),
            None if src.is_empty() => Ok(None),
            None => Err(CodecError::Incomplete),
        }
    }
}

impl Encoder<HttpRequest> for ClientCodec {
    type Error = CodecError;

    fn encode(&mut self, item: HttpRequest, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.reserve(128 + item.uri.len() + item.body.len());
        dst.put_slice(item.method.as_str().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(item.uri.as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(version_str(item.version).as_bytes());
        dst.put_slice(b"\r\n");
        encode_headers(&item.headers, &item.body, dst);
        self.in_flight.push_back(item.method);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_request(codec: &mut ServerCodec, raw: &[u8]) -> Option<HttpRequest> {
        let mut buf = BytesMut::from(raw);
        next_request(codec, &mut buf)
    }

    fn next_request(codec: &mut ServerCodec, buf: &mut BytesMut) -> Option<HttpRequest> {
        codec.decode(buf).unwrap().and_then(Inbound::into_request)
    }

    #[test]
    fn request_with_content_length_waits_for_the_whole_body() {
        let mut codec = ServerCodec::default();
        let mut buf = BytesMut::from(&b"POST /api/x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhe"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"llo");
        let request = next_request(&mut codec, &mut buf).unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.uri, "/api/x");
        assert_eq!(request.body, Bytes::from_static(b"hello"));
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_request_is_aggregated() {
        let mut codec = ServerCodec::default();
        let request = decode_request(
            &mut codec,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\nX-Trailer: t\r\n\r\n",
        )
        .unwrap();
        assert_eq!(request.body, Bytes::from_static(b"Wikipedia"));
        assert!(!request.headers.contains(TRANSFER_ENCODING));
        assert_eq!(request.headers.get_str(CONTENT_LENGTH), Some("9"));
    }

    #[test]
    fn pipelined_requests_decode_one_at_a_time() {
        let mut codec = ServerCodec::default();
        let mut buf = BytesMut::from(&b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n"[..]);
        assert_eq!(next_request(&mut codec, &mut buf).unwrap().uri, "/a");
        assert_eq!(next_request(&mut codec, &mut buf).unwrap().uri, "/b");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_body_is_rejected() {
        let mut codec = ServerCodec::new(4, CompressionConfig::disabled());
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello"[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLarge { limit: 4 })
        ));
    }

    #[test]
    fn expect_continue_is_announced_before_the_body() {
        let mut codec = ServerCodec::default();
        let mut buf = BytesMut::from(
            &b"POST /up HTTP/1.1\r\nContent-Length: 5\r\nExpect: 100-continue\r\n\r\n"[..],
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Continue));
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"hello");
        let request = next_request(&mut codec, &mut buf).unwrap();
        assert_eq!(request.body, Bytes::from_static(b"hello"));
        assert!(!request.headers.contains(EXPECT));
    }

    #[test]
    fn expect_continue_is_skipped_when_the_body_is_already_here() {
        let mut codec = ServerCodec::default();
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nContent-Length: 2\r\nExpect: 100-continue\r\n\r\nhi"[..],
        );
        assert_eq!(next_request(&mut codec, &mut buf).unwrap().body, Bytes::from_static(b"hi"));
    }

    #[test]
    fn oversized_expect_continue_is_rejected_before_the_body() {
        let mut codec = ServerCodec::new(4, CompressionConfig::disabled());
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nContent-Length: 50\r\nExpect: 100-continue\r\n\r\n"[..],
        );
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::TooLarge { limit: 4 })
        ));
    }

    #[test]
    fn interim_continue_is_encoded_without_headers() {
        let mut codec = ServerCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(HttpResponse::new(StatusCode::CONTINUE), &mut dst)
            .unwrap();
        assert_eq!(&dst[..], b"HTTP/1.1 100 Continue\r\n\r\n");
    }

    #[test]
    fn response_is_encoded_with_headers_in_order() {
        let mut codec = ServerCodec::new(DEFAULT_MAX_CONTENT_LENGTH, CompressionConfig::disabled());
        let mut response = HttpResponse::with_body(StatusCode::OK, "hi");
        response
            .headers
            .append("X-Test", HeaderValue::from_static("1"));
        let mut dst = BytesMut::new();
        codec.encode(response, &mut dst).unwrap();
        assert_eq!(
            &dst[..],
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Test: 1\r\n\r\nhi"
        );
    }

    #[test]
    fn response_until_eof_completes_on_close() {
        let mut codec = ClientCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(HttpRequest::new(Method::GET, "/"), &mut dst)
            .unwrap();

        let mut buf = BytesMut::from(&b"HTTP/1.0 200 OK\r\n\r\nstream"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        let response = codec.decode_eof(&mut buf).unwrap().unwrap();
        assert_eq!(response.body, Bytes::from_static(b"stream"));
        assert_eq!(response.content_length(), Some(6));
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn head_response_has_no_body_and_interim_responses_are_dropped() {
        let mut codec = ClientCodec::default();
        let mut dst = BytesMut::new();
        codec
            .encode(HttpRequest::new(Method::HEAD, "/"), &mut dst)
            .unwrap();
        codec
            .encode(HttpRequest::new(Method::GET, "/"), &mut dst)
            .unwrap();
        assert_eq!(&dst[..21], b"HEAD / HTTP/1.1\r\n\r\nGE");

        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nHTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n"[..],
        );
        let head = codec.decode(&mut buf).unwrap().unwrap();
        assert!(head.body.is_empty());
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.status, StatusCode::NO_CONTENT);
        assert!(buf.is_empty());
    }

    #[test]
    fn truncated_response_is_an_error() {
        let mut codec = ClientCodec::default();
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(CodecError::Incomplete)
        ));
    }
}
