//! Incremental wire decoder.
//!
//! Traffic is newline-terminated ASCII with an optional trailing `\r`, except
//! while a binary sub-channel chunk is in flight: a `data <chan> <len>` line
//! is followed by exactly `<len>` raw bytes, and line parsing suspends until
//! they have all arrived. `WireReader` owns the receive buffer, survives
//! arbitrary read fragmentation, and yields one `WireEvent` per protocol
//! element.
//!
//! Channel lifecycle: `binary <chan> <size> <type>` opens a channel and
//! declares its total size; the channel closes implicitly once `size` bytes
//! have been delivered across its `data` chunks. A malformed `binary`/`data`
//! header is unrecoverable (the byte stream can no longer be framed) and is
//! reported as an error the caller must treat as fatal for the connection.

use std::collections::HashMap;

use bytes::{Buf, Bytes, BytesMut};

use crate::error::ProtoError;
use crate::line::Params;

/// Hard cap on a single line; longer input is treated as protocol corruption.
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// One decoded protocol element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// An ordinary text line (command, completion, value traffic...).
    Line(String),
    /// A binary channel was opened with a declared total size and data type.
    BinaryOpen { chan: u16, size: u64, data_type: u16 },
    /// One complete `data` chunk arrived on an open channel.
    BinaryChunk { chan: u16, payload: Bytes },
    /// A channel received its full declared size and is now closed.
    BinaryClosed { chan: u16 },
}

#[derive(Debug)]
struct OpenChannel {
    remaining: u64,
    data_type: u16,
}

#[derive(Debug)]
enum Mode {
    /// Scanning for newline-terminated lines.
    Lines,
    /// Collecting `pending` more raw bytes for channel `chan`.
    Raw { chan: u16, pending: usize, collected: BytesMut },
}

/// Stateful decoder for one connection's inbound byte stream.
#[derive(Debug)]
pub struct WireReader {
    buf: BytesMut,
    mode: Mode,
    channels: HashMap<u16, OpenChannel>,
    /// Channel that just consumed its final byte; close event not yet emitted.
    pending_close: Option<u16>,
}

impl Default for WireReader {
    fn default() -> Self {
        Self::new()
    }
}

impl WireReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            mode: Mode::Lines,
            channels: HashMap::new(),
            pending_close: None,
        }
    }

    /// Append freshly read bytes to the buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet consumed by `next_event`.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Declared type of an open channel, if any.
    pub fn channel_type(&self, chan: u16) -> Option<u16> {
        self.channels.get(&chan).map(|c| c.data_type)
    }

    /// Decode the next protocol element, or `None` when more bytes are needed.
    pub fn next_event(&mut self) -> Result<Option<WireEvent>, ProtoError> {
        if let Some(chan) = self.pending_close.take() {
            return Ok(Some(WireEvent::BinaryClosed { chan }));
        }
        loop {
            match &mut self.mode {
                Mode::Raw { chan, pending, collected } => {
                    let take = (*pending).min(self.buf.len());
                    collected.extend_from_slice(&self.buf[..take]);
                    self.buf.advance(take);
                    *pending -= take;
                    if *pending > 0 {
                        return Ok(None);
                    }
                    let chan = *chan;
                    let payload = std::mem::take(collected).freeze();
                    self.mode = Mode::Lines;
                    return Ok(Some(self.account_chunk(chan, payload)?));
                }
                Mode::Lines => {
                    let Some(line) = self.take_line()? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        continue;
                    }
                    match self.inspect_framing(&line)? {
                        Framing::Plain => return Ok(Some(WireEvent::Line(line))),
                        Framing::Open { chan, size, data_type } => {
                            if size == 0 {
                                self.pending_close = Some(chan);
                            } else {
                                self.channels.insert(chan, OpenChannel { remaining: size, data_type });
                            }
                            return Ok(Some(WireEvent::BinaryOpen { chan, size, data_type }));
                        }
                        Framing::Data { chan, len } => {
                            self.mode = Mode::Raw {
                                chan,
                                pending: len,
                                collected: BytesMut::with_capacity(len),
                            };
                            // loop back to consume the raw bytes
                        }
                    }
                }
            }
        }
    }

    /// Pull one terminated line out of the buffer, or `None` if incomplete.
    fn take_line(&mut self) -> Result<Option<String>, ProtoError> {
        let Some(nl) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > MAX_LINE_LEN {
                return Err(ProtoError::LineTooLong(self.buf.len()));
            }
            return Ok(None);
        };
        let mut raw = self.buf.split_to(nl + 1);
        raw.truncate(nl);
        if raw.last() == Some(&b'\r') {
            raw.truncate(raw.len() - 1);
        }
        let line = String::from_utf8_lossy(&raw).into_owned();
        Ok(Some(line))
    }

    fn inspect_framing(&self, line: &str) -> Result<Framing, ProtoError> {
        let bad = || ProtoError::BadBinaryHeader(line.to_string());
        if let Some(rest) = line.strip_prefix("binary ") {
            let mut params = Params::new(rest.split_ascii_whitespace().map(String::from).collect());
            let chan = params.next_u16("channel").map_err(|_| bad())?;
            let size = params.next_i64("size").map_err(|_| bad())?;
            let data_type = params.next_u16("data type").map_err(|_| bad())?;
            params.end("binary").map_err(|_| bad())?;
            if size < 0 {
                return Err(bad());
            }
            return Ok(Framing::Open { chan, size: size as u64, data_type });
        }
        if let Some(rest) = line.strip_prefix("data ") {
            let mut params = Params::new(rest.split_ascii_whitespace().map(String::from).collect());
            let chan = params.next_u16("channel").map_err(|_| bad())?;
            let len = params.next_i64("length").map_err(|_| bad())?;
            params.end("data").map_err(|_| bad())?;
            if len < 0 {
                return Err(bad());
            }
            if !self.channels.contains_key(&chan) {
                return Err(ProtoError::UnknownChannel(chan));
            }
            return Ok(Framing::Data { chan, len: len as usize });
        }
        Ok(Framing::Plain)
    }

    fn account_chunk(&mut self, chan: u16, payload: Bytes) -> Result<WireEvent, ProtoError> {
        let open = self.channels.get_mut(&chan).ok_or(ProtoError::UnknownChannel(chan))?;
        open.remaining = open.remaining.saturating_sub(payload.len() as u64);
        if open.remaining == 0 {
            self.channels.remove(&chan);
            self.pending_close = Some(chan);
        }
        Ok(WireEvent::BinaryChunk { chan, payload })
    }

    /// True once the channel has received its declared size.
    pub fn channel_closed(&self, chan: u16) -> bool {
        !self.channels.contains_key(&chan)
    }
}

#[derive(Debug)]
enum Framing {
    Plain,
    Open { chan: u16, size: u64, data_type: u16 },
    Data { chan: u16, len: usize },
}

/// Build the `binary` channel-open header.
pub fn binary_open_line(chan: u16, size: u64, data_type: u16) -> String {
    format!("binary {chan} {size} {data_type}")
}

/// Build the `data` chunk header.
pub fn data_header_line(chan: u16, len: usize) -> String {
    format!("data {chan} {len}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn drain(reader: &mut WireReader) -> Vec<WireEvent> {
        let mut events = Vec::new();
        while let Some(ev) = reader.next_event().unwrap() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn lines_split_across_reads() {
        let mut r = WireReader::new();
        r.feed(b"status_in");
        assert_eq!(r.next_event().unwrap(), None);
        r.feed(b"fo\r\npriority 20\n");
        let events = drain(&mut r);
        assert_eq!(
            events,
            vec![
                WireEvent::Line("status_info".into()),
                WireEvent::Line("priority 20".into()),
            ]
        );
    }

    #[test]
    fn empty_lines_skipped() {
        let mut r = WireReader::new();
        r.feed(b"\n\nready\n");
        assert_eq!(drain(&mut r), vec![WireEvent::Line("ready".into())]);
    }

    #[test]
    fn binary_channel_suspends_line_parsing() {
        let mut r = WireReader::new();
        // An image payload containing bytes that look like line terminators.
        r.feed(b"binary 1 8 2\ndata 1 8\nAB\nCD\nE!value x 1\n");
        let events = drain(&mut r);
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], WireEvent::BinaryOpen { chan: 1, size: 8, data_type: 2 });
        assert_eq!(
            events[1],
            WireEvent::BinaryChunk { chan: 1, payload: Bytes::from_static(b"AB\nCD\nE!") }
        );
        assert_eq!(events[2], WireEvent::BinaryClosed { chan: 1 });
        assert_eq!(events[3], WireEvent::Line("value x 1".into()));
    }

    #[test]
    fn chunk_arriving_byte_by_byte() {
        let mut r = WireReader::new();
        r.feed(b"binary 3 4 1\ndata 3 4\n");
        assert!(matches!(r.next_event().unwrap(), Some(WireEvent::BinaryOpen { .. })));
        for b in [b'w', b'x', b'y'] {
            r.feed(&[b]);
            assert_eq!(r.next_event().unwrap(), None);
        }
        r.feed(b"z");
        assert_eq!(
            r.next_event().unwrap(),
            Some(WireEvent::BinaryChunk { chan: 3, payload: Bytes::from_static(b"wxyz") })
        );
        assert_eq!(r.next_event().unwrap(), Some(WireEvent::BinaryClosed { chan: 3 }));
    }

    #[test]
    fn channel_spanning_multiple_chunks() {
        let mut r = WireReader::new();
        r.feed(b"binary 2 6 1\ndata 2 4\nabcddata 2 2\nef");
        let events = drain(&mut r);
        assert_eq!(
            events,
            vec![
                WireEvent::BinaryOpen { chan: 2, size: 6, data_type: 1 },
                WireEvent::BinaryChunk { chan: 2, payload: Bytes::from_static(b"abcd") },
                WireEvent::BinaryChunk { chan: 2, payload: Bytes::from_static(b"ef") },
                WireEvent::BinaryClosed { chan: 2 },
            ]
        );
        assert!(r.channel_closed(2));
    }

    #[test]
    fn data_for_unopened_channel_is_fatal() {
        let mut r = WireReader::new();
        r.feed(b"data 9 4\nxxxx");
        assert!(matches!(r.next_event(), Err(ProtoError::UnknownChannel(9))));
    }

    #[test]
    fn malformed_binary_header_is_fatal() {
        let mut r = WireReader::new();
        r.feed(b"binary one 8 2\n");
        assert!(matches!(r.next_event(), Err(ProtoError::BadBinaryHeader(_))));
    }

    #[test]
    fn oversized_unterminated_line_is_fatal() {
        let mut r = WireReader::new();
        r.feed(&vec![b'a'; MAX_LINE_LEN + 1]);
        assert!(matches!(r.next_event(), Err(ProtoError::LineTooLong(_))));
    }
}
