//! Bounds-checked little-endian primitive reads.
//!
//! Every APFS on-disk integer is little-endian. These helpers read a
//! fixed-width value at an offset within a byte slice and fail with
//! `OutOfBounds` rather than panicking when the slice is too short —
//! callers are expected to validate a struct's total length once and then
//! trust these reads, the way the teacher's `Cursor` + `ReadBytesExt`
//! pattern trusted a length check performed up front.

use crate::error::{ApfsError, Result};

pub fn u16_at(data: &[u8], offset: usize, context: &'static str) -> Result<u16> {
    let end = offset + 2;
    let slice = data
        .get(offset..end)
        .ok_or_else(|| ApfsError::oob(context, format!("need {end} bytes, have {}", data.len())))?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

pub fn u32_at(data: &[u8], offset: usize, context: &'static str) -> Result<u32> {
    let end = offset + 4;
    let slice = data
        .get(offset..end)
        .ok_or_else(|| ApfsError::oob(context, format!("need {end} bytes, have {}", data.len())))?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

pub fn u64_at(data: &[u8], offset: usize, context: &'static str) -> Result<u64> {
    let end = offset + 8;
    let slice = data
        .get(offset..end)
        .ok_or_else(|| ApfsError::oob(context, format!("need {end} bytes, have {}", data.len())))?;
    Ok(u64::from_le_bytes([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ]))
}

pub fn i64_at(data: &[u8], offset: usize, context: &'static str) -> Result<i64> {
    Ok(u64_at(data, offset, context)? as i64)
}

pub fn i32_at(data: &[u8], offset: usize, context: &'static str) -> Result<i32> {
    Ok(u32_at(data, offset, context)? as i32)
}

pub fn bytes_at<'a>(
    data: &'a [u8],
    offset: usize,
    len: usize,
    context: &'static str,
) -> Result<&'a [u8]> {
    data.get(offset..offset + len).ok_or_else(|| {
        ApfsError::oob(
            context,
            format!("need {} bytes at {offset}, have {}", len, data.len()),
        )
    })
}

/// Require that `data` is at least `min_len` bytes, as a precondition for a
/// higher-level struct decoder before it touches any individual field.
pub fn require_len(data: &[u8], min_len: usize, context: &'static str) -> Result<()> {
    if data.len() < min_len {
        return Err(ApfsError::oob(
            context,
            format!("need at least {min_len} bytes, have {}", data.len()),
        ));
    }
    Ok(())
}

/// A NUL-terminated UTF-8 string read from a fixed-size field, lossily
/// decoded (forensic targets occasionally carry truncated or non-UTF-8
/// garbage past the terminator, which is not itself a parse failure).
pub fn nul_terminated_utf8(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_within_bounds() {
        let data = [0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0xAA];
        assert_eq!(u16_at(&data, 0, "t").unwrap(), 1);
        assert_eq!(u32_at(&data, 2, "t").unwrap(), 2);
    }

    #[test]
    fn rejects_out_of_bounds() {
        let data = [0u8; 4];
        assert!(u64_at(&data, 0, "t").is_err());
        assert!(u32_at(&data, 2, "t").is_err());
        assert!(u16_at(&data, 4, "t").is_err());
    }

    #[test]
    fn nul_terminated_strips_trailing_garbage() {
        let mut buf = b"TestVol".to_vec();
        buf.push(0);
        buf.extend_from_slice(b"\xFF\xFF garbage");
        assert_eq!(nul_terminated_utf8(&buf), "TestVol");
    }
}
