//! Newline-delimited framing for provider stdout.

use {
    bytes::{Buf, BytesMut},
    tokio_util::codec::Decoder,
    tracing::warn,
};

/// Longest line accepted from a provider before it is discarded.
pub const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// Splits the byte stream into lines.
///
/// Partial reads accumulate in the framed buffer until a `\n` arrives.
/// Invalid UTF-8 is replaced rather than reported, and a line longer than
/// the limit is skipped up to its terminating newline, so a misbehaving
/// provider can never end the stream through the codec.
#[derive(Debug)]
pub struct LineCodec {
    max_len: usize,
    /// Bytes already scanned for `\n` in the current buffer.
    scanned: usize,
    /// Currently skipping an over-long line.
    discarding: bool,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new(MAX_LINE_BYTES)
    }
}

impl LineCodec {
    pub fn new(max_len: usize) -> Self {
        Self {
            max_len,
            scanned: 0,
            discarding: false,
        }
    }

    fn take_line(buf: &mut BytesMut, newline_at: usize) -> String {
        let line = buf.split_to(newline_at + 1);
        let line = &line[..line.len() - 1];
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        String::from_utf8_lossy(line).into_owned()
    }
}

impl Decoder for LineCodec {
    type Error = std::io::Error;
    type Item = String;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        loop {
            let newline = buf[self.scanned..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|i| i + self.scanned);

            match (self.discarding, newline) {
                (true, Some(at)) => {
                    buf.advance(at + 1);
                    self.discarding = false;
                    self.scanned = 0;
                },
                (true, None) => {
                    buf.clear();
                    self.scanned = 0;
                    return Ok(None);
                },
                (false, Some(at)) => {
                    self.scanned = 0;
                    if at > self.max_len {
                        warn!(len = at, "discarding over-long provider line");
                        buf.advance(at + 1);
                        continue;
                    }
                    return Ok(Some(Self::take_line(buf, at)));
                },
                (false, None) => {
                    if buf.len() > self.max_len {
                        warn!(len = buf.len(), "discarding over-long provider line");
                        buf.clear();
                        self.discarding = true;
                        self.scanned = 0;
                    } else {
                        self.scanned = buf.len();
                    }
                    return Ok(None);
                },
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        if self.discarding || buf.is_empty() {
            buf.clear();
            return Ok(None);
        }
        // Final unterminated line.
        let rest = buf.split_to(buf.len());
        self.scanned = 0;
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut LineCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn splits_complete_lines() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("{\"a\":1}\n{\"b\":2}\r\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec![
            "{\"a\":1}",
            "{\"b\":2}"
        ]);
        assert!(buf.is_empty());
    }

    #[test]
    fn accumulates_partial_reads() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"{\"jsonrpc\":");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\"2.0\"}");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\n{\"x\"");
        assert_eq!(
            codec.decode(&mut buf).unwrap().as_deref(),
            Some("{\"jsonrpc\":\"2.0\"}")
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"{\"x\"");
    }

    #[test]
    fn invalid_utf8_is_replaced_not_fatal() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from(&b"ab\xffcd\nok\n"[..]);
        let lines = decode_all(&mut codec, &mut buf);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ab"));
        assert_eq!(lines[1], "ok");
    }

    #[test]
    fn over_long_line_is_skipped() {
        let mut codec = LineCodec::new(8);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"0123456789abc");
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"def\nshort\n");
        assert_eq!(decode_all(&mut codec, &mut buf), vec!["short"]);
    }

    #[test]
    fn eof_flushes_unterminated_line() {
        let mut codec = LineCodec::default();
        let mut buf = BytesMut::from("tail");
        assert_eq!(
            codec.decode_eof(&mut buf).unwrap().as_deref(),
            Some("tail")
        );
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }
}
