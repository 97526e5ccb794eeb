// Key Layout
//
// All keys are memcomparable so that range scans visit rows in handle order
// and index entries in value order.
//
//   m...                                     meta (see `meta`)
//   t{table}_h{handle}                       row marker
//   t{table}_r{handle}{column}               one stored column value
//   t{table}_i{index}{values}[{handle}]      index entry (handle suffix for
//                                            non-unique indexes)

use byteorder::{BigEndian, ByteOrder};

use crate::common::{ColumnId, DataValue, Handle, IndexId, TableId};

pub const TABLE_PREFIX: &[u8] = b"t";
pub const ROW_MARKER_SEP: &[u8] = b"_h";
pub const RECORD_SEP: &[u8] = b"_r";
pub const INDEX_SEP: &[u8] = b"_i";

const SIGN_MASK: u64 = 1 << 63;

const NULL_FLAG: u8 = 0x00;
const TEXT_FLAG: u8 = 0x01;
const INT_FLAG: u8 = 0x03;
const BOOL_FLAG: u8 = 0x04;
const FLOAT_FLAG: u8 = 0x05;

/// Append `v` so that byte order matches signed integer order
pub fn encode_i64(buf: &mut Vec<u8>, v: i64) {
    let mut bytes = [0u8; 8];
    BigEndian::write_u64(&mut bytes, (v as u64) ^ SIGN_MASK);
    buf.extend_from_slice(&bytes);
}

pub fn decode_i64(bytes: &[u8]) -> Option<i64> {
    if bytes.len() < 8 {
        return None;
    }
    Some((BigEndian::read_u64(&bytes[..8]) ^ SIGN_MASK) as i64)
}

fn encode_f64(buf: &mut Vec<u8>, v: f64) {
    let bits = v.to_bits();
    let ordered = if bits & SIGN_MASK != 0 { !bits } else { bits | SIGN_MASK };
    let mut bytes = [0u8; 8];
    BigEndian::write_u64(&mut bytes, ordered);
    buf.extend_from_slice(&bytes);
}

fn encode_text(buf: &mut Vec<u8>, s: &str) {
    for &b in s.as_bytes() {
        buf.push(b);
        if b == 0x00 {
            buf.push(0xFF);
        }
    }
    buf.extend_from_slice(&[0x00, 0x01]);
}

/// Append a memcomparable encoding of `value`
pub fn encode_value(buf: &mut Vec<u8>, value: &DataValue) {
    match value {
        DataValue::Null => buf.push(NULL_FLAG),
        DataValue::Integer(i) => {
            buf.push(INT_FLAG);
            encode_i64(buf, *i);
        }
        DataValue::Float(f) => {
            buf.push(FLOAT_FLAG);
            encode_f64(buf, *f);
        }
        DataValue::Text(s) => {
            buf.push(TEXT_FLAG);
            encode_text(buf, s);
        }
        DataValue::Boolean(b) => {
            buf.push(BOOL_FLAG);
            buf.push(*b as u8);
        }
    }
}

pub fn table_prefix(table_id: TableId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.extend_from_slice(TABLE_PREFIX);
    encode_i64(&mut key, table_id);
    key
}

pub fn row_marker_prefix(table_id: TableId) -> Vec<u8> {
    let mut key = table_prefix(table_id);
    key.extend_from_slice(ROW_MARKER_SEP);
    key
}

pub fn row_marker_key(table_id: TableId, handle: Handle) -> Vec<u8> {
    let mut key = row_marker_prefix(table_id);
    encode_i64(&mut key, handle);
    key
}

/// Handle of a row marker key of `table_id`
pub fn decode_row_marker(table_id: TableId, key: &[u8]) -> Option<Handle> {
    let prefix = row_marker_prefix(table_id);
    key.strip_prefix(prefix.as_slice()).and_then(decode_i64)
}

pub fn row_columns_prefix(table_id: TableId, handle: Handle) -> Vec<u8> {
    let mut key = table_prefix(table_id);
    key.extend_from_slice(RECORD_SEP);
    encode_i64(&mut key, handle);
    key
}

pub fn column_key(table_id: TableId, handle: Handle, column_id: ColumnId) -> Vec<u8> {
    let mut key = row_columns_prefix(table_id, handle);
    encode_i64(&mut key, column_id);
    key
}

pub fn index_prefix(table_id: TableId, index_id: IndexId) -> Vec<u8> {
    let mut key = table_prefix(table_id);
    key.extend_from_slice(INDEX_SEP);
    encode_i64(&mut key, index_id);
    key
}

/// Index entry key. Unique indexes pass `None` and store the handle as the
/// value instead, so a second row with the same values collides.
pub fn index_key(table_id: TableId, index_id: IndexId, values: &[DataValue], handle: Option<Handle>) -> Vec<u8> {
    let mut key = index_prefix(table_id, index_id);
    for value in values {
        encode_value(&mut key, value);
    }
    if let Some(h) = handle {
        encode_i64(&mut key, h);
    }
    key
}

/// Smallest key strictly greater than every key starting with `prefix`
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return end;
        }
    }
    vec![0xFF; prefix.len() + 1]
}

/// Smallest key strictly greater than `key`
pub fn key_after(key: &[u8]) -> Vec<u8> {
    let mut next = key.to_vec();
    next.push(0x00);
    next
}

pub fn encode_handle_value(handle: Handle) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    encode_i64(&mut buf, handle);
    buf
}
