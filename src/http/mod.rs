//! Fully aggregated HTTP/1.1 messages and the codecs that frame them.

use bytes::Bytes;
use http::{HeaderValue, Method, StatusCode, Uri, Version};

mod codec;

pub use codec::{ClientCodec, Inbound, ServerCodec, DEFAULT_MAX_CONTENT_LENGTH};

pub(crate) const CONTENT_LENGTH: &str = "Content-Length";
pub(crate) const TRANSFER_ENCODING: &str = "Transfer-Encoding";
pub(crate) const HOST: &str = "Host";
pub(crate) const EXPECT: &str = "Expect";

/// Header fields in wire order with their original name spelling.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, HeaderValue)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, keeping any existing fields with the same name.
    pub fn append(&mut self, name: impl Into<String>, value: HeaderValue) {
        self.0.push((name.into(), value));
    }

    /// Replaces every field named `name` with a single trailing field.
    pub fn set(&mut self, name: impl Into<String>, value: HeaderValue) {
        let name = name.into();
        self.remove(&name);
        self.0.push((name, value));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// First value of `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn set_content_length(&mut self, len: usize) {
        self.set(CONTENT_LENGTH, HeaderValue::from(len));
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for Headers {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name, value);
            }
        }
        headers
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub uri: String,
    pub version: Version,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: Version::HTTP_11,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Path component of the request target, without the query string.
    /// Absolute-form targets (`http://host/path`) yield their path.
    pub fn path(&self) -> String {
        if !self.uri.starts_with('/') {
            if let Ok(uri) = self.uri.parse::<Uri>() {
                return uri.path().to_string();
            }
        }
        self.uri
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub version: Version,
    pub status: StatusCode,
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// A proxy-generated response with an empty body and `Content-Length: 0`.
    pub fn empty(status: StatusCode) -> Self {
        let mut response = Self::new(status);
        response.headers.set_content_length(0);
        response
    }

    pub fn with_body(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut response = Self::new(status);
        response.body = body.into();
        response.headers.set_content_length(response.body.len());
        response
    }

    pub fn content_length(&self) -> Option<usize> {
        self.headers
            .get_str(CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Statuses that never carry a body.
pub(crate) fn is_bodiless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_keep_order_and_spelling() {
        let mut headers: Headers = [("X-One", "1"), ("Host", "a"), ("x-two", "2")]
            .into_iter()
            .collect();
        headers.remove("host");
        headers.append("Host", HeaderValue::from_static("b"));
        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["X-One", "x-two", "Host"]);
        assert_eq!(headers.get_str("HOST"), Some("b"));
    }

    #[test]
    fn path_drops_query_and_scheme() {
        assert_eq!(HttpRequest::new(Method::GET, "/api/x?y=1").path(), "/api/x");
        assert_eq!(
            HttpRequest::new(Method::GET, "http://example.com/api/x?y=1").path(),
            "/api/x"
        );
        assert_eq!(HttpRequest::new(Method::GET, "/").path(), "/");
    }

    #[test]
    fn empty_response_has_zero_length() {
        let response = HttpResponse::empty(StatusCode::NOT_FOUND);
        assert_eq!(response.content_length(), Some(0));
        assert!(response.body.is_empty());
    }
}
