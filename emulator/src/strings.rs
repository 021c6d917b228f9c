//! Human readable views of cached memory: C strings and hex dumps.

use crate::error::MemoryError;
use crate::memory::MemoryCache;
use itertools::Itertools;

const DUMP_LINE: usize = 16;

/// Whether `c` may appear inside extracted text.
fn is_text(c: u8) -> bool {
    matches!(c, b'\n' | b'\r' | 0x20..=0x7E)
}

fn push_escaped(out: &mut String, c: u8) {
    match c {
        b'\n' => out.push_str("\\n"),
        b'\r' => out.push_str("\\r"),
        b'"' => out.push_str("\\\""),
        b'\\' => out.push_str("\\\\"),
        _ => out.push(c as char),
    }
}

impl MemoryCache {
    /// Reads a zero terminated string of bytes, or of 2-byte units if `wide`.
    ///
    /// Only the low byte of a wide unit is looked at, so UTF-16 text keeps its
    /// ASCII subset. Any control byte other than CR/LF, and anything outside
    /// printable ASCII, rejects the whole string. An immediate terminator
    /// yields `""`.
    pub fn read_c_string(&mut self, addr: u64, wide: bool) -> Result<String, MemoryError> {
        let step = if wide { 2 } else { 1 };
        let mut out = String::new();
        let mut cur = addr;

        loop {
            let c = self.read_byte(cur)?;
            if c == 0 {
                return Ok(out);
            }
            if !is_text(c) {
                return Err(MemoryError::NotText { addr: cur, byte: c });
            }

            push_escaped(&mut out, c);
            cur = cur.wrapping_add(step);
        }
    }

    /// Formats the string at `addr` as `"..."`, or as `L"..."` if only the
    /// wide form is valid text.
    pub fn read_display_string(&mut self, addr: u64) -> Result<String, MemoryError> {
        self.read_c_string(addr, false)
            .map(|s| format!("\"{}\"", s))
            .or_else(|_| self.read_c_string(addr, true).map(|s| format!("L\"{}\"", s)))
    }

    /// Hex dump of `size` bytes at `addr`, sixteen per line.
    pub fn dump_buffer(&mut self, addr: u64, size: usize) -> Result<String, MemoryError> {
        let mut buf = vec![0u8; size];
        self.read_buffer(addr, &mut buf)?;

        let mut lines = buf.chunks(DUMP_LINE).enumerate().map(|(i, chunk)| {
            let hex = chunk.iter().map(|b| format!("{:02X}", b)).join(" ");
            let ascii: String = chunk
                .iter()
                .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '.' })
                .collect();
            format!(
                "{:016x}: {:<width$} {}",
                addr.wrapping_add((i * DUMP_LINE) as u64),
                hex,
                ascii,
                width = DUMP_LINE * 3 - 1
            )
        });
        Ok(lines.join("\n"))
    }
}
