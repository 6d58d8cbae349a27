//! Fixed-width and variable-length unsigned integer codecs.
//!
//! Page layouts use fixed-width big-endian fields whose width is decided at
//! store creation (1 to 8 bytes). The varint form is 7 bits per byte, least
//! significant group first, with the high bit marking continuation.

/// Largest width a fixed-width field may have.
pub const MAX_WIDTH: usize = 8;

/// Longest encoding of a `u64` varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Byte order of a fixed-width field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Number of bytes needed to store `value` (at least one).
#[must_use]
pub const fn byte_width(value: u64) -> usize {
    let bits = (u64::BITS - value.leading_zeros()) as usize;
    if bits == 0 { 1 } else { bits.div_ceil(8) }
}

/// Read an unsigned integer stored in `buf` (whose length is the field width).
///
/// # Panics
/// Panics if `buf` is empty or longer than [`MAX_WIDTH`].
#[must_use]
pub fn read_uint(buf: &[u8], endian: Endian) -> u64 {
    assert!(
        (1..=MAX_WIDTH).contains(&buf.len()),
        "field width must be 1..=8"
    );
    let mut bytes = [0u8; MAX_WIDTH];
    match endian {
        Endian::Big => {
            bytes[MAX_WIDTH - buf.len()..].copy_from_slice(buf);
            u64::from_be_bytes(bytes)
        }
        Endian::Little => {
            bytes[..buf.len()].copy_from_slice(buf);
            u64::from_le_bytes(bytes)
        }
    }
}

/// Write `value` into `buf` using all of its bytes as the field.
///
/// # Panics
/// Panics if `buf` has an invalid width or `value` does not fit in it.
pub fn write_uint(buf: &mut [u8], value: u64, endian: Endian) {
    let width = buf.len();
    assert!((1..=MAX_WIDTH).contains(&width), "field width must be 1..=8");
    assert!(
        byte_width(value) <= width,
        "value {value} does not fit in {width} bytes"
    );
    match endian {
        Endian::Big => buf.copy_from_slice(&value.to_be_bytes()[MAX_WIDTH - width..]),
        Endian::Little => buf.copy_from_slice(&value.to_le_bytes()[..width]),
    }
}

/// Big-endian read, the layout used by every on-disk field.
#[must_use]
pub fn read_be(buf: &[u8]) -> u64 {
    read_uint(buf, Endian::Big)
}

/// Big-endian write, the layout used by every on-disk field.
pub fn write_be(buf: &mut [u8], value: u64) {
    write_uint(buf, value, Endian::Big);
}

/// Number of bytes `value` takes as a varint.
#[must_use]
pub const fn varint_len(value: u64) -> usize {
    let bits = (u64::BITS - value.leading_zeros()) as usize;
    if bits == 0 { 1 } else { bits.div_ceil(7) }
}

/// Append `value` as a varint to `out`, returning the number of bytes written.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) -> usize {
    let start = out.len();
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out.len() - start
}

/// Decode a varint from the front of `buf`, returning `(value, bytes_read)`.
///
/// Returns `None` if `buf` ends mid-value or the value overflows a `u64`.
#[must_use]
pub fn read_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    for (i, &byte) in buf.iter().enumerate().take(MAX_VARINT_LEN) {
        let group = u64::from(byte & 0x7f);
        let shift = 7 * i as u32;
        if shift == 63 && group > 1 {
            return None;
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}
