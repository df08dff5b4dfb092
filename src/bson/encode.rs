use crate::error::{EncodingError, Result};

use super::{Document, Value, element::*};

/// Serializes a single document.
pub fn encode(document: &Document) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    encode_into(&mut buf, document)?;
    Ok(buf)
}

/// Serializes documents back to back into one buffer.
pub fn encode_many(documents: &[Document]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for document in documents {
        encode_into(&mut buf, document)?;
    }
    Ok(buf)
}

/// Appends the serialized document to `buf`.
pub(crate) fn encode_into(buf: &mut Vec<u8>, document: &Document) -> Result<()> {
    write_elements(buf, document.iter())
}

fn write_elements<'a, I>(buf: &mut Vec<u8>, elements: I) -> Result<()>
where
    I: Iterator<Item = (&'a str, &'a Value)>,
{
    let start = buf.len();
    buf.extend_from_slice(&[0; 4]);

    for (key, value) in elements {
        write_element(buf, key, value)?;
    }

    buf.push(0);
    patch_length(buf, start);
    Ok(())
}

fn write_array(buf: &mut Vec<u8>, values: &[Value]) -> Result<()> {
    let start = buf.len();
    buf.extend_from_slice(&[0; 4]);

    for (i, value) in values.iter().enumerate() {
        write_element(buf, &i.to_string(), value)?;
    }

    buf.push(0);
    patch_length(buf, start);
    Ok(())
}

fn write_element(buf: &mut Vec<u8>, key: &str, value: &Value) -> Result<()> {
    buf.push(type_tag(value));
    write_cstring(buf, key)?;

    match value {
        Value::Double(d) => buf.extend_from_slice(&d.to_le_bytes()),
        Value::String(s) => write_string(buf, s),
        Value::Document(d) => write_elements(buf, d.iter())?,
        Value::Array(values) => write_array(buf, values)?,
        Value::Binary { subtype, bytes } => {
            if *subtype == BINARY_OLD {
                write_i32(buf, (bytes.len() + 4) as i32);
                buf.push(*subtype);
                write_i32(buf, bytes.len() as i32);
            } else {
                write_i32(buf, bytes.len() as i32);
                buf.push(*subtype);
            }
            buf.extend_from_slice(bytes);
        }
        Value::ObjectId(oid) => buf.extend_from_slice(&oid.bytes()),
        Value::Boolean(b) => buf.push(u8::from(*b)),
        Value::DateTime(ms) => write_i64(buf, *ms),
        Value::Null | Value::MinKey | Value::MaxKey => {}
        Value::Regex { pattern, flags } => {
            write_cstring(buf, pattern)?;
            write_cstring(buf, flags)?;
        }
        Value::Code {
            source,
            scope: None,
        } => write_string(buf, source),
        Value::Code {
            source,
            scope: Some(scope),
        } => {
            let start = buf.len();
            buf.extend_from_slice(&[0; 4]);
            write_string(buf, source);
            write_elements(buf, scope.iter())?;
            patch_length(buf, start);
        }
        Value::Int32(i) => write_i32(buf, *i),
        Value::Int64(i) => write_i64(buf, *i),
        Value::Timestamp { seconds, increment } => {
            buf.extend_from_slice(&increment.to_le_bytes());
            buf.extend_from_slice(&seconds.to_le_bytes());
        }
    }
    Ok(())
}

fn type_tag(value: &Value) -> u8 {
    match value {
        Value::Double(_) => DOUBLE,
        Value::String(_) => STRING,
        Value::Document(d) if d.is_array_like() => ARRAY,
        Value::Document(_) => DOCUMENT,
        Value::Array(_) => ARRAY,
        Value::Binary { .. } => BINARY,
        Value::ObjectId(_) => OBJECT_ID,
        Value::Boolean(_) => BOOLEAN,
        Value::DateTime(_) => DATE_TIME,
        Value::Null => NULL,
        Value::Regex { .. } => REGEX,
        Value::Code { scope: None, .. } => CODE,
        Value::Code { scope: Some(_), .. } => CODE_WITH_SCOPE,
        Value::Int32(_) => INT32,
        Value::Int64(_) => INT64,
        Value::Timestamp { .. } => TIMESTAMP,
        Value::MinKey => MIN_KEY,
        Value::MaxKey => MAX_KEY,
    }
}

fn write_cstring(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(EncodingError::KeyContainsNul(s.to_string()).into());
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_i32(buf, (s.len() + 1) as i32);
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

pub(crate) fn write_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// 64-bit integers go out as two 32-bit words, low word first.
pub(crate) fn write_i64(buf: &mut Vec<u8>, value: i64) {
    let bits = value as u64;
    buf.extend_from_slice(&(bits as u32).to_le_bytes());
    buf.extend_from_slice(&((bits >> 32) as u32).to_le_bytes());
}

fn patch_length(buf: &mut [u8], start: usize) {
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_le_bytes());
}
