//! Response buffering.
//!
//! Handlers never write to the wire directly. Each attempt writes into a
//! [`ResponseBuffer`]; a failed attempt discards it and only the attempt that
//! commits gets flushed to the [`ResponseSink`].

use std::io::{self, Write};

/// Where a finished response goes.
pub trait ResponseSink {
    /// Write a complete response in one call.
    fn write_response(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> io::Result<()>;
}

/// Sink that keeps what it was given. Used by tests and the simulator.
#[derive(Debug, Default, Clone)]
pub struct CapturedResponse {
    pub status: Option<u16>,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    flushes: usize,
}

impl CapturedResponse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of responses written to this sink.
    pub fn flushes(&self) -> usize {
        self.flushes
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl ResponseSink for CapturedResponse {
    fn write_response(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> io::Result<()> {
        self.status = Some(status);
        self.headers = headers.to_vec();
        self.body = body.to_vec();
        self.flushes += 1;
        Ok(())
    }
}

/// Status, headers and body of the current attempt.
#[derive(Debug)]
pub struct ResponseBuffer {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    flushed: bool,
}

impl Default for ResponseBuffer {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body: Vec::new(),
            flushed: false,
        }
    }
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.push((name.into(), value.into()));
    }

    /// Replace every header with this name.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.headers.retain(|(key, _)| !key.eq_ignore_ascii_case(&name));
        self.headers.push((name, value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replace the body with an error message.
    pub fn send_error(&mut self, status: u16, message: &str) {
        self.status = status;
        self.body.clear();
        self.body.extend_from_slice(message.as_bytes());
        self.set_header("Content-Type", "text/plain");
    }

    /// Reset to an empty 200 for the next attempt.
    pub fn discard(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.body.clear();
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Write the buffered response through. Succeeds at most once.
    pub fn flush_to(&mut self, sink: &mut dyn ResponseSink) -> io::Result<()> {
        if self.flushed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "response already flushed",
            ));
        }
        sink.write_response(self.status, &self.headers, &self.body)?;
        self.flushed = true;
        Ok(())
    }
}

impl Write for ResponseBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.flushed {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "response already flushed",
            ));
        }
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    /// No-op: the body only leaves through [`ResponseBuffer::flush_to`].
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_drops_partial_attempt() {
        let mut buffer = ResponseBuffer::new();
        buffer.set_status(201);
        buffer.add_header("Location", "/users/1");
        write!(buffer, "partial").unwrap();

        buffer.discard();
        write!(buffer, "second attempt").unwrap();

        let mut sink = CapturedResponse::new();
        buffer.flush_to(&mut sink).unwrap();
        assert_eq!(sink.status, Some(200));
        assert!(sink.headers.is_empty());
        assert_eq!(sink.body_text(), "second attempt");
    }

    #[test]
    fn test_flush_at_most_once() {
        let mut buffer = ResponseBuffer::new();
        write!(buffer, "ok").unwrap();

        let mut sink = CapturedResponse::new();
        buffer.flush_to(&mut sink).unwrap();
        assert!(buffer.flush_to(&mut sink).is_err());
        assert!(buffer.write_all(b"late").is_err());
        assert_eq!(sink.flushes(), 1);
        assert!(buffer.is_flushed());
    }

    #[test]
    fn test_send_error_and_headers() {
        let mut buffer = ResponseBuffer::new();
        write!(buffer, "half a page").unwrap();
        buffer.set_header("content-type", "text/html");
        buffer.send_error(409, "conflict, please retry");

        assert_eq!(buffer.status(), 409);
        assert_eq!(buffer.body(), b"conflict, please retry");
        assert_eq!(buffer.header("Content-Type"), Some("text/plain"));
    }

    struct FailingSink;

    impl ResponseSink for FailingSink {
        fn write_response(&mut self, _: u16, _: &[(String, String)], _: &[u8]) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "client gone"))
        }
    }

    #[test]
    fn test_failed_flush_can_be_retried() {
        let mut buffer = ResponseBuffer::new();
        assert!(buffer.flush_to(&mut FailingSink).is_err());
        assert!(!buffer.is_flushed());

        let mut sink = CapturedResponse::new();
        buffer.flush_to(&mut sink).unwrap();
        assert_eq!(sink.flushes(), 1);
    }
}
