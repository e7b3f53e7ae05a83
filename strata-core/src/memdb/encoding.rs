//! Slot-bucketed field payloads
//!
//! Payload layout, little endian:
//!
//! ```text
//! [start slot u16][end slot u16][presence bitmap, 1 bit per slot][f64 per present slot]
//! ```

use crate::{Result, StrataError};
use bytes::{Buf, BufMut, BytesMut};
use std::collections::BTreeMap;

/// Encode the values of one field; no values yields an empty payload
pub fn encode_field(values: &BTreeMap<u16, f64>) -> Vec<u8> {
    let (start, end) = match (values.keys().next(), values.keys().next_back()) {
        (Some(start), Some(end)) => (*start, *end),
        _ => return Vec::new(),
    };

    let width = (end - start) as usize + 1;
    let mut bitmap = vec![0u8; (width + 7) / 8];
    for slot in values.keys() {
        let pos = (slot - start) as usize;
        bitmap[pos / 8] |= 1 << (pos % 8);
    }

    let mut buf = BytesMut::with_capacity(4 + bitmap.len() + values.len() * 8);
    buf.put_u16_le(start);
    buf.put_u16_le(end);
    buf.put_slice(&bitmap);
    for value in values.values() {
        buf.put_f64_le(*value);
    }
    buf.to_vec()
}

/// Decode a payload produced by [`encode_field`] into (slot, value) pairs
pub fn decode_field(mut data: &[u8]) -> Result<Vec<(u16, f64)>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < 4 {
        return Err(StrataError::InvalidFormat("field payload too short".into()));
    }
    let start = data.get_u16_le();
    let end = data.get_u16_le();
    if end < start {
        return Err(StrataError::InvalidFormat(format!(
            "field slot range {}..{} reversed",
            start, end
        )));
    }

    let width = (end - start) as usize + 1;
    let bitmap_len = (width + 7) / 8;
    if data.len() < bitmap_len {
        return Err(StrataError::InvalidFormat("field bitmap truncated".into()));
    }
    let (bitmap, mut values) = data.split_at(bitmap_len);

    let mut points = Vec::new();
    for pos in 0..width {
        if bitmap[pos / 8] & (1 << (pos % 8)) == 0 {
            continue;
        }
        if values.remaining() < 8 {
            return Err(StrataError::InvalidFormat("field values truncated".into()));
        }
        points.push((start + pos as u16, values.get_f64_le()));
    }
    if values.has_remaining() {
        return Err(StrataError::InvalidFormat("field payload has trailing bytes".into()));
    }
    Ok(points)
}
