//! Bulk-load text format
//!
//! Rows are written in PostgreSQL's `COPY ... FROM STDIN` text format: fields
//! separated by a tab, rows terminated by a newline, NULL written as `\N`.
//! Inside a value, backslash, tab, newline and carriage return are
//! backslash-escaped. Encoding writes straight into the caller's buffer, one
//! byte at a time, and fails with [`BufferFull`] instead of writing past the
//! end. A failed encode leaves garbage after `offset`; the caller keeps its
//! old offset and flushes.

use std::fmt;

const NULL_SENTINEL: &[u8] = b"\\N";

/// The row did not fit in the remaining buffer space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferFull;

impl fmt::Display for BufferFull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("encode buffer full")
    }
}

impl std::error::Error for BufferFull {}

struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl ByteWriter<'_> {
    #[inline]
    fn put(&mut self, byte: u8) -> Result<(), BufferFull> {
        let slot = self.buf.get_mut(self.pos).ok_or(BufferFull)?;
        *slot = byte;
        self.pos += 1;
        Ok(())
    }

    #[inline]
    fn put_escaped(&mut self, byte: u8) -> Result<(), BufferFull> {
        self.put(b'\\')?;
        self.put(byte)
    }
}

/// Encode one row at `offset`, returning the offset just past its newline
pub fn encode_row<S: AsRef<str>>(
    fields: &[Option<S>],
    buf: &mut [u8],
    offset: usize,
) -> Result<usize, BufferFull> {
    let mut out = ByteWriter { buf, pos: offset };

    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            out.put(b'\t')?;
        }
        let Some(value) = field else {
            for &b in NULL_SENTINEL {
                out.put(b)?;
            }
            continue;
        };
        for &b in value.as_ref().as_bytes() {
            match b {
                b'\\' => out.put_escaped(b'\\')?,
                b'\t' => out.put_escaped(b't')?,
                b'\n' => out.put_escaped(b'n')?,
                b'\r' => out.put_escaped(b'r')?,
                _ => out.put(b)?,
            }
        }
    }

    out.put(b'\n')?;
    Ok(out.pos)
}

/// Decode a single field produced by [`encode_row`]
pub fn decode_field(raw: &[u8]) -> Result<Option<String>, String> {
    if raw == NULL_SENTINEL {
        return Ok(None);
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut bytes = raw.iter().copied();
    while let Some(b) = bytes.next() {
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match bytes.next() {
            Some(b'\\') => out.push(b'\\'),
            Some(b't') => out.push(b'\t'),
            Some(b'n') => out.push(b'\n'),
            Some(b'r') => out.push(b'\r'),
            // COPY treats any other escaped byte as itself
            Some(other) => out.push(other),
            None => return Err("dangling backslash at end of field".to_string()),
        }
    }

    String::from_utf8(out)
        .map(Some)
        .map_err(|e| format!("field is not UTF-8: {e}"))
}

/// Decode a filled buffer prefix back into rows
pub fn decode_rows(data: &[u8]) -> Result<Vec<Vec<Option<String>>>, String> {
    let Some(body) = data.strip_suffix(b"\n") else {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        return Err("buffer does not end with a row terminator".to_string());
    };

    body.split(|&b| b == b'\n')
        .map(|line| line.split(|&b| b == b'\t').map(decode_field).collect())
        .collect()
}
