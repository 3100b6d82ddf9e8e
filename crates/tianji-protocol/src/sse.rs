//! Incremental server-sent-event decoding.
//!
//! The decoder is fed raw body chunks and yields complete frames. A frame is
//! a run of `field: value` lines ended by a blank line; only `event` and
//! `data` fields are retained, comments and `id`/`retry` lines are skipped.
//! Multiple `data` lines in one frame are joined with `\n` as the SSE
//! standard requires.

use bytes::Bytes;

pub const DONE_DATA: &str = "[DONE]";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data == DONE_DATA
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(nl) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=nl).collect();
            let mut line = String::from_utf8_lossy(&raw[..raw.len() - 1]).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            self.take_line(&line, &mut frames);
        }

        frames
    }

    /// Flush a trailing frame that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let mut line = String::from_utf8_lossy(&raw).into_owned();
            if line.ends_with('\r') {
                line.pop();
            }
            let mut frames = Vec::new();
            self.take_line(&line, &mut frames);
            if let Some(frame) = frames.into_iter().next() {
                return Some(frame);
            }
        }
        self.close_frame()
    }

    fn take_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            if let Some(frame) = self.close_frame() {
                frames.push(frame);
            }
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => {
                self.event = (!value.is_empty()).then(|| value.to_string());
            }
            "data" => self.data_lines.push(value.to_string()),
            _ => {}
        }
    }

    fn close_frame(&mut self) -> Option<SseFrame> {
        if self.event.is_none() && self.data_lines.is_empty() {
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        };
        self.data_lines.clear();
        Some(frame)
    }
}

/// Encode one downstream `data:` frame.
pub fn encode_data_frame(data: &str) -> Bytes {
    Bytes::from(format!("data: {data}\n\n"))
}

pub fn encode_done_frame() -> Bytes {
    encode_data_frame(DONE_DATA)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_str(dec: &mut SseDecoder, s: &str) -> Vec<SseFrame> {
        dec.feed(&Bytes::copy_from_slice(s.as_bytes()))
    }

    #[test]
    fn split_across_chunks() {
        let mut dec = SseDecoder::new();
        assert!(feed_str(&mut dec, "data: {\"a\":").is_empty());
        let frames = feed_str(&mut dec, "1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn event_and_multi_data_lines() {
        let mut dec = SseDecoder::new();
        let frames = feed_str(
            &mut dec,
            "event: message_start\ndata: line1\ndata: line2\n\n",
        );
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_start"));
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn comments_and_ids_are_skipped() {
        let mut dec = SseDecoder::new();
        let frames = feed_str(&mut dec, ": keep-alive\nid: 7\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn crlf_lines() {
        let mut dec = SseDecoder::new();
        let frames = feed_str(&mut dec, "data: [DONE]\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_done());
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut dec = SseDecoder::new();
        assert!(feed_str(&mut dec, "data: tail").is_empty());
        let frame = dec.finish().unwrap();
        assert_eq!(frame.data, "tail");
        assert!(dec.finish().is_none());
    }
}
