//! Big-endian field helpers.
//!
//! Readers return `None` when the field runs past the buffer. Writers fail
//! with [`ProtocolError::BufferSize`] instead, since a short buffer on the
//! encode path is a programmer error.

use crate::error::ProtocolError;

type Result<T> = std::result::Result<T, ProtocolError>;

/// Width of a seconds-only timestamp field.
pub const TIMESTAMP_SECS_WIDTH: usize = 4;

/// Width of a seconds + milliseconds timestamp field.
pub const TIMESTAMP_MILLIS_WIDTH: usize = 6;

fn field<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    let slice = buf.get(offset..end)?;
    let mut out = [0u8; N];
    out.copy_from_slice(slice);
    Some(out)
}

fn field_mut<'a>(buf: &'a mut [u8], offset: usize, width: usize) -> Result<&'a mut [u8]> {
    let available = buf.len();
    match offset.checked_add(width) {
        Some(end) if end <= available => Ok(&mut buf[offset..end]),
        _ => Err(ProtocolError::BufferSize {
            expected: offset.saturating_add(width),
            actual: available,
        }),
    }
}

pub fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    field::<2>(buf, offset).map(u16::from_be_bytes)
}

pub fn read_i16(buf: &[u8], offset: usize) -> Option<i16> {
    field::<2>(buf, offset).map(i16::from_be_bytes)
}

pub fn read_u32(buf: &[u8], offset: usize) -> Option<u32> {
    field::<4>(buf, offset).map(u32::from_be_bytes)
}

pub fn read_i32(buf: &[u8], offset: usize) -> Option<i32> {
    field::<4>(buf, offset).map(i32::from_be_bytes)
}

pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) -> Result<()> {
    field_mut(buf, offset, 2)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn write_i16(buf: &mut [u8], offset: usize, value: i16) -> Result<()> {
    field_mut(buf, offset, 2)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    field_mut(buf, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

pub fn write_i32(buf: &mut [u8], offset: usize, value: i32) -> Result<()> {
    field_mut(buf, offset, 4)?.copy_from_slice(&value.to_be_bytes());
    Ok(())
}

/// Encode a Unix timestamp given in milliseconds.
///
/// A 4-byte field carries whole seconds; a 6-byte field carries seconds
/// followed by the millisecond remainder.
pub fn write_timestamp(buf: &mut [u8], offset: usize, width: usize, unix_millis: u64) -> Result<()> {
    if width != TIMESTAMP_SECS_WIDTH && width != TIMESTAMP_MILLIS_WIDTH {
        return Err(ProtocolError::UnsupportedWidth(width));
    }
    let secs = u32::try_from(unix_millis / 1000).map_err(|_| ProtocolError::OutOfRange {
        field: "timestamp seconds",
        value: i64::try_from(unix_millis / 1000).unwrap_or(i64::MAX),
        min: 0,
        max: i64::from(u32::MAX),
    })?;
    let dst = field_mut(buf, offset, width)?;
    dst[..4].copy_from_slice(&secs.to_be_bytes());
    if width == TIMESTAMP_MILLIS_WIDTH {
        dst[4..6].copy_from_slice(&((unix_millis % 1000) as u16).to_be_bytes());
    }
    Ok(())
}

/// Decode a timestamp written by [`write_timestamp`], in Unix milliseconds.
pub fn read_timestamp(buf: &[u8], offset: usize, width: usize) -> Option<u64> {
    let secs = u64::from(read_u32(buf, offset)?);
    match width {
        TIMESTAMP_SECS_WIDTH => Some(secs * 1000),
        TIMESTAMP_MILLIS_WIDTH => {
            let millis = u64::from(read_u16(buf, offset + 4)?);
            Some(secs * 1000 + millis)
        }
        _ => None,
    }
}
