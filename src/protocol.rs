//! Line-echo protocol framing and response generation.
//!
//! Requests are `\n`-terminated lines of text. Each one is answered with
//! `Server received: <trimmed line>\n`. A line that trims to `quit` (any
//! case) is echoed and then the server closes the connection.

use crate::error::ProtocolError;
use bytes::{Bytes, BytesMut};

/// Longest line accepted without a terminator
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Prefix of every response
pub const RESPONSE_PREFIX: &str = "Server received: ";

/// Command that ends the session
pub const QUIT_COMMAND: &str = "quit";

/// Accumulates bytes from partial reads and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buffer: BytesMut,
    /// Bytes already scanned for a terminator
    scanned: usize,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            scanned: 0,
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Split off the next complete line, terminator included.
    ///
    /// Returns `Ok(None)` when more data is needed.
    pub fn next_line(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        match find_lf(&self.buffer[self.scanned..]) {
            Some(pos) => {
                let end = self.scanned + pos + 1;
                self.scanned = 0;
                Ok(Some(self.buffer.split_to(end).freeze()))
            }
            None if self.buffer.len() > MAX_LINE_LENGTH => Err(ProtocolError::LineTooLong {
                limit: MAX_LINE_LENGTH,
            }),
            None => {
                self.scanned = self.buffer.len();
                Ok(None)
            }
        }
    }

    /// Bytes buffered but not yet returned as a line
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Decode a raw line and trim surrounding whitespace (terminator included).
///
/// Invalid UTF-8 is replaced rather than rejected.
pub fn normalize(line: &[u8]) -> String {
    String::from_utf8_lossy(line).trim().to_string()
}

/// Build the response for a trimmed request
pub fn response(message: &str) -> Bytes {
    let mut out = BytesMut::with_capacity(RESPONSE_PREFIX.len() + message.len() + 1);
    out.extend_from_slice(RESPONSE_PREFIX.as_bytes());
    out.extend_from_slice(message.as_bytes());
    out.extend_from_slice(b"\n");
    out.freeze()
}

/// Whether a trimmed request asks to end the session
pub fn is_quit(message: &str) -> bool {
    message.eq_ignore_ascii_case(QUIT_COMMAND)
}

/// Find \n in buffer
fn find_lf(buffer: &[u8]) -> Option<usize> {
    buffer.iter().position(|&b| b == b'\n')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_line() {
        let mut lines = LineBuffer::new();
        lines.extend(b"hello\n");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some(&b"hello\n"[..]));
        assert_eq!(lines.next_line().unwrap(), None);
        assert!(lines.is_empty());
    }

    #[test]
    fn test_partial_reads() {
        let mut lines = LineBuffer::new();
        lines.extend(b"hel");
        assert_eq!(lines.next_line().unwrap(), None);
        lines.extend(b"lo wor");
        assert_eq!(lines.next_line().unwrap(), None);
        lines.extend(b"ld\nnext");
        assert_eq!(
            lines.next_line().unwrap().as_deref(),
            Some(&b"hello world\n"[..])
        );
        assert_eq!(lines.next_line().unwrap(), None);
        assert_eq!(lines.len(), 4);
    }

    #[test]
    fn test_pipelined_lines() {
        let mut lines = LineBuffer::new();
        lines.extend(b"one\ntwo\r\nthree\n");
        assert_eq!(lines.next_line().unwrap().as_deref(), Some(&b"one\n"[..]));
        assert_eq!(lines.next_line().unwrap().as_deref(), Some(&b"two\r\n"[..]));
        assert_eq!(lines.next_line().unwrap().as_deref(), Some(&b"three\n"[..]));
        assert_eq!(lines.next_line().unwrap(), None);
    }

    #[test]
    fn test_line_too_long() {
        let mut lines = LineBuffer::new();
        lines.extend(&vec![b'a'; MAX_LINE_LENGTH]);
        assert_eq!(lines.next_line().unwrap(), None);
        lines.extend(b"a");
        assert_eq!(
            lines.next_line(),
            Err(ProtocolError::LineTooLong {
                limit: MAX_LINE_LENGTH
            })
        );
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(b"hello\n"), "hello");
        assert_eq!(normalize(b"  QUIT  \r\n"), "QUIT");
        assert_eq!(normalize(b"\t\n"), "");
        assert_eq!(normalize(b"a\xffb\n"), "a\u{fffd}b");
    }

    #[test]
    fn test_response() {
        assert_eq!(&response("hello")[..], b"Server received: hello\n");
        assert_eq!(&response("")[..], b"Server received: \n");
    }

    #[test]
    fn test_is_quit() {
        assert!(is_quit("quit"));
        assert!(is_quit("QUIT"));
        assert!(is_quit("QuIt"));
        assert!(!is_quit("quit now"));
        assert!(!is_quit(""));
    }
}
