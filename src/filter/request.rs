//! Inbound request and its replayable, fully buffered form.

use std::fmt;
use std::io::{self, Cursor, Read};

use serde::de::DeserializeOwned;

use crate::filter::async_ctx::AsyncContext;

/// Network details of the client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnection {
    pub remote_addr: String,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_addr: String,
    pub local_port: u16,
}

impl Default for ClientConnection {
    fn default() -> Self {
        Self {
            remote_addr: "127.0.0.1".to_string(),
            remote_host: "localhost".to_string(),
            remote_port: 0,
            local_addr: "127.0.0.1".to_string(),
            local_port: 8080,
        }
    }
}

/// A request as it arrives: the body is a one-shot stream.
pub struct IncomingRequest {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    client: ClientConnection,
    body: Box<dyn Read + Send>,
    async_ctx: AsyncContext,
}

impl IncomingRequest {
    pub fn new(method: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers: Vec::new(),
            client: ClientConnection::default(),
            body: Box::new(io::empty()),
            async_ctx: AsyncContext::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Stream the body from a reader.
    pub fn body_reader(mut self, body: impl Read + Send + 'static) -> Self {
        self.body = Box::new(body);
        self
    }

    pub fn body(self, body: impl Into<Vec<u8>>) -> Self {
        self.body_reader(Cursor::new(body.into()))
    }

    pub fn client(mut self, client: ClientConnection) -> Self {
        self.client = client;
        self
    }

    /// Share an async context with the caller, so it can signal completion.
    pub fn async_context(mut self, async_ctx: AsyncContext) -> Self {
        self.async_ctx = async_ctx;
        self
    }
}

impl fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("headers", &self.headers)
            .field("client", &self.client)
            .finish()
    }
}

/// A request whose body was read once up front and can be read again on
/// every attempt.
#[derive(Debug)]
pub struct BufferedRequest {
    method: String,
    uri: String,
    headers: Vec<(String, String)>,
    client: ClientConnection,
    body: Vec<u8>,
    async_ctx: AsyncContext,
}

impl BufferedRequest {
    /// Drain the request body.
    pub fn read(request: IncomingRequest) -> io::Result<Self> {
        let IncomingRequest {
            method,
            uri,
            headers,
            client,
            mut body,
            async_ctx,
        } = request;

        let mut buf = Vec::new();
        body.read_to_end(&mut buf)?;

        Ok(Self {
            method,
            uri,
            headers,
            client,
            body: buf,
            async_ctx,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// First header with the given name, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn client(&self) -> &ClientConnection {
        &self.client
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// A fresh reader over the buffered body.
    pub fn body_reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.body.as_slice())
    }

    pub fn body_text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.body)
    }

    pub fn body_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    pub fn async_context(&self) -> &AsyncContext {
        &self.async_ctx
    }

    pub fn is_async_started(&self) -> bool {
        self.async_ctx.is_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    /// Reader that fails if read after EOF was reported.
    struct OneShot {
        data: Cursor<Vec<u8>>,
        drained: bool,
    }

    impl Read for OneShot {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.drained {
                return Err(io::Error::new(io::ErrorKind::Other, "stream consumed"));
            }
            let n = self.data.read(buf)?;
            if n == 0 {
                self.drained = true;
            }
            Ok(n)
        }
    }

    #[test]
    fn test_body_replayable() {
        let stream = OneShot {
            data: Cursor::new(br#"{"user":"alice"}"#.to_vec()),
            drained: false,
        };
        let request = IncomingRequest::new("POST", "/realms/master/login")
            .header("Content-Type", "application/json")
            .body_reader(stream);
        let buffered = BufferedRequest::read(request).unwrap();

        for _ in 0..3 {
            let mut text = String::new();
            buffered.body_reader().read_to_string(&mut text).unwrap();
            assert_eq!(text, r#"{"user":"alice"}"#);
        }
        let json: Value = buffered.body_json().unwrap();
        assert_eq!(json["user"], "alice");
    }

    #[test]
    fn test_header_lookup_ignores_case() {
        let buffered = BufferedRequest::read(
            IncomingRequest::new("GET", "/").header("X-Request-Id", "abc"),
        )
        .unwrap();
        assert_eq!(buffered.header("x-request-id"), Some("abc"));
        assert_eq!(buffered.header("missing"), None);
        assert_eq!(buffered.body_text().unwrap(), "");
    }

    #[test]
    fn test_read_error_surfaces() {
        let stream = OneShot {
            data: Cursor::new(Vec::new()),
            drained: true,
        };
        let request = IncomingRequest::new("POST", "/").body_reader(stream);
        assert!(BufferedRequest::read(request).is_err());
    }
}
