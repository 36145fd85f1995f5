//! Source-line lookup for interpreted frames.
//!
//! The interpreter has shipped three encodings of its offset-to-line table.
//! Offsets passed in here are always byte offsets of the last executed
//! instruction; the location table of 3.11+ counts in two-byte code units and
//! the conversion happens internally. A malformed or truncated table never
//! panics: the line reached so far is returned.

use crate::runtime::RuntimeVersion;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineTableFormat {
    /// `co_lnotab`: (byte delta, signed line delta) pairs.
    Lnotab,
    /// 3.10 `co_linetable`: (byte length, signed line delta) pairs, -128 meaning no line.
    LineTable,
    /// 3.11+ location table with varint-encoded entries.
    LocationTable,
}

impl LineTableFormat {
    pub fn for_version(version: RuntimeVersion) -> Self {
        match (version.major, version.minor) {
            (3, minor) if minor >= 11 => LineTableFormat::LocationTable,
            (3, 10) => LineTableFormat::LineTable,
            (major, _) if major > 3 => LineTableFormat::LocationTable,
            _ => LineTableFormat::Lnotab,
        }
    }
}

pub fn line_for_offset(format: LineTableFormat, first_line: u32, table: &[u8], offset: u32) -> u32 {
    let line = match format {
        LineTableFormat::Lnotab => decode_lnotab(first_line, table, offset),
        LineTableFormat::LineTable => decode_linetable(first_line, table, offset),
        LineTableFormat::LocationTable => decode_location_table(first_line, table, offset / 2),
    };
    line.clamp(0, u32::MAX as i64) as u32
}

fn decode_lnotab(first_line: u32, table: &[u8], offset: u32) -> i64 {
    let mut line = first_line as i64;
    let mut address = 0u32;
    for pair in table.chunks_exact(2) {
        address = address.saturating_add(pair[0] as u32);
        if address > offset {
            break;
        }
        line += pair[1] as i8 as i64;
    }
    line
}

fn decode_linetable(first_line: u32, table: &[u8], offset: u32) -> i64 {
    let mut line = first_line as i64;
    let mut end = 0u32;
    for pair in table.chunks_exact(2) {
        let line_delta = pair[1] as i8;
        if line_delta != -128 {
            line += line_delta as i64;
        }
        end = end.saturating_add(pair[0] as u32);
        if end > offset {
            break;
        }
    }
    line
}

fn decode_location_table(first_line: u32, table: &[u8], unit: u32) -> i64 {
    let mut cursor = Cursor { table, position: 0 };
    let mut line = first_line as i64;
    let mut end = 0u32;

    while let Some(header) = cursor.next() {
        end = end.saturating_add((header & 7) as u32 + 1);
        let code = (header >> 3) & 15;
        let step = match code {
            // no location
            15 => Some(0),
            // long form: line delta, end line, column, end column
            14 => cursor.signed_varint().and_then(|delta| {
                cursor.varint()?;
                cursor.varint()?;
                cursor.varint()?;
                Some(delta)
            }),
            // line only
            13 => cursor.signed_varint(),
            // one-line forms carry the delta in the code, then two column bytes
            10..=12 => cursor.skip(2).map(|_| code as i64 - 10),
            // short form: one column byte, same line
            _ => cursor.skip(1).map(|_| 0),
        };
        let Some(delta) = step else {
            break;
        };
        line += delta;
        if end > unit {
            break;
        }
    }
    line
}

struct Cursor<'a> {
    table: &'a [u8],
    position: usize,
}

impl Cursor<'_> {
    fn next(&mut self) -> Option<u8> {
        let byte = *self.table.get(self.position)?;
        self.position += 1;
        Some(byte)
    }

    fn skip(&mut self, count: usize) -> Option<()> {
        if self.position + count > self.table.len() {
            return None;
        }
        self.position += count;
        Some(())
    }

    fn varint(&mut self) -> Option<u64> {
        let mut read = self.next()?;
        let mut value = (read & 63) as u64;
        let mut shift = 0;
        while read & 64 != 0 {
            read = self.next()?;
            shift += 6;
            if shift >= 64 {
                return None;
            }
            value |= ((read & 63) as u64) << shift;
        }
        Some(value)
    }

    fn signed_varint(&mut self) -> Option<i64> {
        let value = self.varint()?;
        if value & 1 != 0 {
            Some(-((value >> 1) as i64))
        } else {
            Some((value >> 1) as i64)
        }
    }
}
