// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Input boundary: a positioned stream of raw record lines.

use std::io;

/// A line-oriented record stream the conductor can resume from.
///
/// `position` is an opaque byte offset; saving it alongside the engine state
/// lets a later session `seek` to just past the last processed line.
pub trait RecordSource {
    /// The next line, without its terminator, or `None` at end of input.
    fn next_line(&mut self) -> io::Result<Option<String>>;

    /// Byte position after the last line returned.
    fn position(&self) -> u64;

    /// Repositions the stream; unsupported sources (pipes) return an error.
    fn seek(&mut self, pos: u64) -> io::Result<()>;
}

/// An in-memory source over a fixed block of text.
#[derive(Debug, Clone)]
pub struct VecSource {
    data: String,
    pos: usize,
}

impl VecSource {
    /// Creates a source over `data`.
    #[must_use]
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }
}

impl RecordSource for VecSource {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }
        let rest = &self.data[self.pos..];
        let (line, used) = match rest.find('\n') {
            Some(i) => (&rest[..i], i + 1),
            None => (rest, rest.len()),
        };
        self.pos += used;
        Ok(Some(line.to_owned()))
    }

    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        if pos as usize > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "seek past end of buffer",
            ));
        }
        self.pos = pos as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_lines_and_positions() {
        let mut s = VecSource::new("a\nbb\nccc");
        assert_eq!(s.next_line().unwrap().as_deref(), Some("a"));
        let mark = s.position();
        assert_eq!(s.next_line().unwrap().as_deref(), Some("bb"));
        assert_eq!(s.next_line().unwrap().as_deref(), Some("ccc"));
        assert_eq!(s.next_line().unwrap(), None);
        s.seek(mark).unwrap();
        assert_eq!(s.next_line().unwrap().as_deref(), Some("bb"));
    }
}
