//! Zero-copy reader for the one-record-per-line event stream.
//!
//! Each line starts with a one-character tag, followed by space-separated
//! hexadecimal tokens without prefix, or a literal string payload for a few
//! tags. Tokens never exceed 16 hex digits.

use std::io::{self, BufRead};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("failed to parse line: {0}")]
    MalformedRecord(String),
    #[error("unexpected end of file inside record: {0}")]
    TruncatedLine(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Tokenizer over a single record line. `next_line` advances to the next
/// non-empty record, the `read_*` accessors consume tokens left to right.
#[derive(Default)]
pub struct LineReader {
    line: String,
    pos: usize,
    mode: char,
}

impl LineReader {
    pub fn new() -> LineReader {
        LineReader::default()
    }

    /// Reads the next non-empty line. Returns `Ok(false)` at end of input.
    /// A final line without the mandatory trailing newline is an error.
    pub fn next_line<R: BufRead>(&mut self, input: &mut R) -> Result<bool, ReadError> {
        loop {
            self.line.clear();
            self.pos = 0;
            self.mode = '\0';

            let read = input.read_line(&mut self.line)?;
            if read == 0 {
                return Ok(false);
            }
            if !self.line.ends_with('\n') {
                return Err(ReadError::TruncatedLine(self.line.clone()));
            }
            self.line.pop();
            if self.line.is_empty() {
                continue;
            }

            self.mode = self.line.as_bytes()[0] as char;
            // skip the tag and the separating space
            self.pos = 2.min(self.line.len());
            return Ok(true);
        }
    }

    pub fn mode(&self) -> char {
        self.mode
    }

    pub fn line(&self) -> &str {
        &self.line
    }

    /// The remainder of the line, for payloads that may contain spaces.
    pub fn rest(&self) -> &str {
        &self.line[self.pos.min(self.line.len())..]
    }

    /// The next space-separated token, or `None` when the line is exhausted.
    pub fn read_token(&mut self) -> Option<&str> {
        if self.pos >= self.line.len() {
            return None;
        }
        let rest = &self.line[self.pos..];
        let end = rest.find(' ').unwrap_or(rest.len());
        if end == 0 {
            return None;
        }
        self.pos += end + 1.min(rest.len() - end);
        Some(&rest[..end])
    }

    /// The next token parsed as unprefixed hexadecimal. `None` when the
    /// token is missing, holds a non-hex digit, or exceeds 16 digits.
    pub fn read_hex(&mut self) -> Option<u64> {
        let start = self.pos;
        let token = self.read_token()?;
        if token.is_empty() || token.len() > 16 {
            self.pos = start;
            return None;
        }
        match u64::from_str_radix(token, 16) {
            Ok(value) => Some(value),
            Err(_) => {
                self.pos = start;
                None
            }
        }
    }

    /// Turns a missing required token into a fatal per-file error.
    pub fn malformed(&self) -> ReadError {
        ReadError::MalformedRecord(self.line.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn reader_over(input: &str) -> (LineReader, Cursor<Vec<u8>>) {
        (LineReader::new(), Cursor::new(input.as_bytes().to_vec()))
    }

    #[test]
    fn tokenizes_hex_records() -> Result<(), ReadError> {
        let (mut reader, mut input) = reader_over("+ 100 1 7f00\n- 7f00\n");

        assert!(reader.next_line(&mut input)?);
        assert_eq!(reader.mode(), '+');
        assert_eq!(reader.read_hex(), Some(0x100));
        assert_eq!(reader.read_hex(), Some(1));
        assert_eq!(reader.read_hex(), Some(0x7f00));
        assert_eq!(reader.read_hex(), None);

        assert!(reader.next_line(&mut input)?);
        assert_eq!(reader.mode(), '-');
        assert_eq!(reader.read_hex(), Some(0x7f00));

        assert!(!reader.next_line(&mut input)?);
        Ok(())
    }

    #[test]
    fn rest_keeps_spaces() -> Result<(), ReadError> {
        let (mut reader, mut input) = reader_over("s operator new(unsigned long)\n");
        assert!(reader.next_line(&mut input)?);
        assert_eq!(reader.mode(), 's');
        assert_eq!(reader.rest(), "operator new(unsigned long)");
        Ok(())
    }

    #[test]
    fn skips_blank_lines() -> Result<(), ReadError> {
        let (mut reader, mut input) = reader_over("\n\nc 1f4\n");
        assert!(reader.next_line(&mut input)?);
        assert_eq!(reader.mode(), 'c');
        assert_eq!(reader.read_hex(), Some(0x1f4));
        Ok(())
    }

    #[test]
    fn rejects_oversized_and_invalid_tokens() -> Result<(), ReadError> {
        let (mut reader, mut input) = reader_over("+ 11112222333344445 1 2\n+ xyz 1 2\n");
        assert!(reader.next_line(&mut input)?);
        // 17 hex digits exceed the 64 bit bound
        assert_eq!(reader.read_hex(), None);

        assert!(reader.next_line(&mut input)?);
        assert_eq!(reader.read_hex(), None);
        Ok(())
    }

    #[test]
    fn missing_trailing_newline_is_fatal() {
        let (mut reader, mut input) = reader_over("c 1f4");
        match reader.next_line(&mut input) {
            Err(ReadError::TruncatedLine(line)) => assert_eq!(line, "c 1f4"),
            other => panic!("expected truncated line error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn tag_only_line_has_empty_rest() -> Result<(), ReadError> {
        let (mut reader, mut input) = reader_over("X\n");
        assert!(reader.next_line(&mut input)?);
        assert_eq!(reader.mode(), 'X');
        assert_eq!(reader.rest(), "");
        assert_eq!(reader.read_token(), None);
        Ok(())
    }
}
