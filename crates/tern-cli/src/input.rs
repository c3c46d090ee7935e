// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! File and stdin record sources.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use tern_core::RecordSource;

/// Buffered line source over a regular file, with byte-accurate positions
/// for resume.
#[derive(Debug)]
pub struct FileLineSource {
    reader: BufReader<File>,
    pos: u64,
}

impl FileLineSource {
    /// Opens `path` for reading.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            pos: 0,
        })
    }
}

impl RecordSource for FileLineSource {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        self.pos += n as u64;
        while line.ends_with(['\n', '\r']) {
            line.pop();
        }
        Ok(Some(line))
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }
}

/// Line source over stdin. Positions advance but cannot be sought, so a
/// paused stdin session cannot be resumed.
#[derive(Debug)]
pub struct StdinSource {
    reader: BufReader<io::Stdin>,
    pos: u64,
}

impl StdinSource {
    /// Wraps the process's stdin.
    #[must_use]
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(io::stdin()),
            pos: 0,
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSource for StdinSource {
    fn next_line(&mut self) -> io::Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        self.pos += n as u64;
        while line.ends_with(['\n', '\r']) {
            line.pop();
        }
        Ok(Some(line))
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn seek(&mut self, _pos: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "stdin cannot be repositioned; resume requires a file input",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_source_positions_are_byte_accurate() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        writeln!(tmp, "p1,100.0,1.0,-40,-80").unwrap();
        writeln!(tmp, "p1,101.0,1.0,-40,-80").unwrap();
        tmp.flush().unwrap();

        let mut src = FileLineSource::open(tmp.path()).unwrap();
        let first = src.next_line().unwrap().unwrap();
        let mark = src.position();
        let second = src.next_line().unwrap().unwrap();
        assert!(src.next_line().unwrap().is_none());

        src.seek(mark).unwrap();
        assert_eq!(src.next_line().unwrap().unwrap(), second);
        assert_ne!(first, second);
    }
}
