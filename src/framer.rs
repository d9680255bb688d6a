//! Byte-to-line assembly shared by both protocol engines.
//!
//! Lines end with CRLF and nothing else: a bare LF is content, a bare CR
//! is held until the next byte decides.  A line that grows past the
//! configured limit trips an overflow latch; the rest of the line is
//! discarded and a single [`LineEvent::Overflow`] is emitted once its
//! CRLF finally arrives, so the engine can answer with one protocol
//! error per over-long line.

/// What the framer hands back for one completed line.
#[derive(Debug, PartialEq)]
pub enum LineEvent {
    /// The bytes of the line, CRLF not included.
    Line(Vec<u8>),
    /// The line exceeded the limit and was discarded.
    Overflow,
}

pub struct LineFramer {
    /// Maximum total line length including the CRLF; `None` is unbounded.
    limit: Option<usize>,
    buf: Vec<u8>,
    overflow: bool,
    /// In overflow mode the buffer is gone, so the trailing CR of the
    /// discarded line is remembered here.
    overflow_cr: bool,
}

impl LineFramer {
    pub fn new(limit: Option<usize>) -> LineFramer {
        LineFramer {
            limit,
            buf: Vec::new(),
            overflow: false,
            overflow_cr: false,
        }
    }

    /// Change the limit for the lines that follow.
    ///
    /// The SMTP engine calls this on the DATA transitions; the framer is
    /// between lines at that point, so no partial line is re-measured.
    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    /// Consume bytes from the front of `input` until one event is
    /// complete or `input` runs dry.
    ///
    /// Returning one event at a time lets the caller switch states (and
    /// limits) before the rest of the chunk is framed.  Feeding the same
    /// bytes in any chunking yields the same event sequence.
    pub fn next_line(&mut self, input: &mut &[u8]) -> Option<LineEvent> {
        while let Some((&byte, rest)) = input.split_first() {
            *input = rest;

            if self.overflow {
                if byte == b'\n' && self.overflow_cr {
                    self.overflow = false;
                    self.overflow_cr = false;
                    return Some(LineEvent::Overflow);
                }

                self.overflow_cr = byte == b'\r';
                continue;
            }

            if byte == b'\n' && self.buf.last() == Some(&b'\r') {
                self.buf.pop();
                return Some(LineEvent::Line(std::mem::take(&mut self.buf)));
            }

            self.buf.push(byte);

            if let Some(limit) = self.limit {
                if self.buf.len() >= limit {
                    self.overflow = true;
                    self.overflow_cr = self.buf.last() == Some(&b'\r');
                    self.buf.clear();
                }
            }
        }

        None
    }
}
