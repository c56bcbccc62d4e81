//! Line framing for the HAT serial stream.
//!
//! The HAT terminates every response and event with `\n` (usually preceded
//! by `\r`). [`HatLineCodec`] implements [`Decoder`] so the link can be read
//! through `tokio_util::codec::FramedRead`:
//!
//! ```text
//! serial bytes -> HatLineCodec -> String (trimmed line) -> parse_line
//! ```
//!
//! Decoding rules:
//! - bytes that are not valid UTF-8 are dropped, the rest of the line is kept
//! - surrounding whitespace is trimmed; blank lines are yielded as `""`
//! - the bootloader prompt `BHBL> ` is yielded as soon as it is buffered,
//!   since the bootloader does not terminate it with a newline
//! - a line longer than the configured limit is discarded up to its newline
//!
//! # Usage
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use hatlink_protocol::HatLineCodec;
//! use tokio_util::codec::FramedRead;
//!
//! # async fn example(stream: tokio::io::DuplexStream) {
//! let mut lines = FramedRead::new(stream, HatLineCodec::new());
//! while let Some(Ok(line)) = lines.next().await {
//!     println!("< {line}");
//! }
//! # }
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::warn;

use hatlink_core::{HatError, constants::PROMPT};

/// Default maximum line length in bytes (4 KiB).
const DEFAULT_MAX_LINE_LENGTH: usize = 4 * 1024;

/// Newline-delimited text decoder for the HAT link.
#[derive(Debug)]
pub struct HatLineCodec {
    max_line_length: usize,

    /// Set while skipping the tail of an over-long line.
    discarding: bool,
}

impl HatLineCodec {
    /// Create a codec with the default 4 KiB line limit.
    pub fn new() -> Self {
        Self::with_max_line_length(DEFAULT_MAX_LINE_LENGTH)
    }

    /// Create a codec with a custom line limit.
    pub fn with_max_line_length(max_line_length: usize) -> Self {
        Self {
            max_line_length,
            discarding: false,
        }
    }

    /// Current line limit.
    pub fn max_line_length(&self) -> usize {
        self.max_line_length
    }

    fn decode_text(raw: &[u8]) -> String {
        String::from_utf8_lossy(raw)
            .chars()
            .filter(|c| *c != char::REPLACEMENT_CHARACTER)
            .collect::<String>()
            .trim()
            .to_string()
    }

    /// Yield a bare prompt sitting at the front of the buffer.
    fn take_prompt(src: &mut BytesMut) -> Option<String> {
        let leading = src.iter().take_while(|b| b.is_ascii_whitespace()).count();
        if !src[leading..].starts_with(PROMPT.as_bytes()) {
            return None;
        }
        let mut end = leading + PROMPT.len();
        if src.get(end) == Some(&b' ') {
            end += 1;
        }
        src.advance(end);
        Some(PROMPT.to_string())
    }
}

impl Default for HatLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for HatLineCodec {
    type Item = String;
    type Error = HatError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(pos) = src.iter().position(|b| *b == b'\n') {
                let raw = src.split_to(pos + 1);
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                return Ok(Some(Self::decode_text(&raw)));
            }

            if self.discarding {
                src.clear();
                return Ok(None);
            }

            if let Some(prompt) = Self::take_prompt(src) {
                return Ok(Some(prompt));
            }

            if src.len() > self.max_line_length {
                warn!(
                    length = src.len(),
                    limit = self.max_line_length,
                    "Discarding over-long line"
                );
                src.clear();
                self.discarding = true;
            }
            return Ok(None);
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() || self.discarding {
            src.clear();
            return Ok(None);
        }
        let raw = src.split_to(src.len());
        Ok(Some(Self::decode_text(&raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut HatLineCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_decode_single_line() {
        let mut codec = HatLineCodec::new();
        let mut buf = BytesMut::from(&b"P0: ramp done\r\n"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("P0: ramp done".into()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_partial_line() {
        let mut codec = HatLineCodec::new();
        let mut buf = BytesMut::from(&b"P1C0: 12 "[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"-37 180\r\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some("P1C0: 12 -37 180".into())
        );
    }

    #[test]
    fn test_decode_multiple_lines_and_blank() {
        let mut codec = HatLineCodec::new();
        let mut buf = BytesMut::from(&b"version\r\n\r\n8.2 V\r\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), ["version", "", "8.2 V"]);
    }

    #[test]
    fn test_decode_drops_invalid_utf8() {
        let mut codec = HatLineCodec::new();
        let mut buf = BytesMut::from(&b"P2: dis\xffconnected\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some("P2: disconnected".into())
        );
    }

    #[test]
    fn test_decode_bare_prompt() {
        let mut codec = HatLineCodec::new();
        let mut buf = BytesMut::from(&b"BHBL> "[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("BHBL>".into()));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_split_prompt_waits() {
        let mut codec = HatLineCodec::new();
        let mut buf = BytesMut::from(&b"BHB"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"L> ");
        assert_eq!(codec.decode(&mut buf).unwrap(), Some("BHBL>".into()));
    }

    #[test]
    fn test_decode_discards_overlong_line() {
        let mut codec = HatLineCodec::with_max_line_length(16);
        let mut buf = BytesMut::from(&[b'x'; 32][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"tail of junk\nP0: disconnected\n");
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some("P0: disconnected".into())
        );
    }

    #[test]
    fn test_decode_eof_flushes_remainder() {
        let mut codec = HatLineCodec::new();
        let mut buf = BytesMut::from(&b"7.9 V"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("7.9 V".into()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }
}
