use crate::error::{EncodingError, ProtocolError, Result};

use super::{Document, MAX_DOCUMENT_SIZE, ObjectId, Value, element::*};

/// Deepest nesting of documents, arrays and code scopes a decoded document may have.
pub const MAX_NESTING_DEPTH: usize = 100;

/// Deserializes exactly one document; the buffer must hold nothing else.
pub fn decode(bytes: &[u8]) -> Result<Document> {
    let mut reader = Reader::new(bytes);
    let document = reader.read_document()?;

    if reader.remaining() > 0 {
        let declared = bytes.len() - reader.remaining();
        return Err(ProtocolError::LengthMismatch {
            declared,
            consumed: bytes.len(),
        }
        .into());
    }
    Ok(document)
}

/// Splits a stream of back to back documents.
pub fn decode_many(bytes: &[u8]) -> Result<Vec<Document>> {
    let mut reader = Reader::new(bytes);
    let mut out = Vec::new();
    while reader.remaining() > 0 {
        out.push(reader.read_document()?);
    }
    Ok(out)
}

/// Cursor over a byte slice with little-endian primitive reads. Every read is bounds checked.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ProtocolError::Truncated(what).into());
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_array<const N: usize>(&mut self, what: &'static str) -> Result<[u8; N]> {
        let mut out = [0; N];
        out.copy_from_slice(self.take(N, what)?);
        Ok(out)
    }

    pub fn read_u8(&mut self, what: &'static str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    pub fn read_i32(&mut self, what: &'static str) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array(what)?))
    }

    pub fn read_u32(&mut self, what: &'static str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array(what)?))
    }

    /// Reassembles a 64-bit integer from its two 32-bit words, low word first.
    pub fn read_i64(&mut self, what: &'static str) -> Result<i64> {
        let low = u64::from(self.read_u32(what)?);
        let high = u64::from(self.read_u32(what)?);
        Ok(((high << 32) | low) as i64)
    }

    fn read_f64(&mut self, what: &'static str) -> Result<f64> {
        Ok(f64::from_le_bytes(self.read_array(what)?))
    }

    fn read_cstring(&mut self, what: &'static str) -> Result<String> {
        let rest = &self.bytes[self.pos..];
        let nul = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(ProtocolError::MissingTerminator(what))?;
        let s = std::str::from_utf8(&rest[..nul]).map_err(|_| EncodingError::NonUtf8String)?;
        self.pos += nul + 1;
        Ok(s.to_string())
    }

    fn read_string(&mut self, what: &'static str) -> Result<String> {
        let len = self.read_i32(what)?;
        if len < 1 {
            return Err(ProtocolError::InvalidField {
                field: what,
                reason: format!("string length {len}"),
            }
            .into());
        }
        let bytes = self.take(len as usize, what)?;
        let (body, nul) = bytes.split_at(bytes.len() - 1);
        if nul[0] != 0 {
            return Err(ProtocolError::MissingTerminator(what).into());
        }
        Ok(String::from_utf8(body.to_vec()).map_err(|_| EncodingError::NonUtf8String)?)
    }

    /// Reads one document, checking its declared length against the bytes its elements took.
    pub fn read_document(&mut self) -> Result<Document> {
        self.read_nested(0)
    }

    fn read_nested(&mut self, depth: usize) -> Result<Document> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ProtocolError::InvalidField {
                field: "document",
                reason: format!("nested deeper than {MAX_NESTING_DEPTH} levels"),
            }
            .into());
        }
        let start = self.pos;
        let declared = self.read_i32("document length")?;
        if declared < 5 {
            return Err(ProtocolError::InvalidField {
                field: "document length",
                reason: declared.to_string(),
            }
            .into());
        }
        let declared = declared as usize;
        if declared > MAX_DOCUMENT_SIZE {
            return Err(ProtocolError::TooLarge {
                size: declared,
                limit: MAX_DOCUMENT_SIZE,
            }
            .into());
        }
        if start + declared > self.bytes.len() {
            return Err(ProtocolError::Truncated("document").into());
        }

        let mut document = Document::new();
        loop {
            let tag = self.read_u8("element type")?;
            if tag == 0 {
                break;
            }
            let key = self.read_cstring("element key")?;
            let value = self.read_value(tag, depth + 1)?;
            document.push(key, value);
        }

        let consumed = self.pos - start;
        if consumed != declared {
            return Err(ProtocolError::LengthMismatch { declared, consumed }.into());
        }
        Ok(document)
    }

    fn read_value(&mut self, tag: u8, depth: usize) -> Result<Value> {
        let value = match tag {
            DOUBLE => Value::Double(self.read_f64("double")?),
            STRING => Value::String(self.read_string("string")?),
            DOCUMENT => Value::Document(self.read_nested(depth)?),
            ARRAY => Value::Array(
                self.read_nested(depth)?
                    .into_iter()
                    .map(|(_, v)| v)
                    .collect(),
            ),
            BINARY => {
                let len = self.read_i32("binary length")?;
                if len < 0 {
                    return Err(ProtocolError::InvalidField {
                        field: "binary length",
                        reason: len.to_string(),
                    }
                    .into());
                }
                let subtype = self.read_u8("binary subtype")?;
                let mut len = len as usize;
                if subtype == BINARY_OLD {
                    let inner = self.read_i32("binary length")?;
                    if inner < 0 || inner as usize + 4 != len {
                        return Err(ProtocolError::InvalidField {
                            field: "binary length",
                            reason: format!("inner length {inner} in {len} bytes"),
                        }
                        .into());
                    }
                    len = inner as usize;
                }
                Value::Binary {
                    subtype,
                    bytes: self.take(len, "binary")?.to_vec(),
                }
            }
            OBJECT_ID => Value::ObjectId(ObjectId::from_bytes(self.read_array("object id")?)),
            BOOLEAN => match self.read_u8("boolean")? {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                b => {
                    return Err(ProtocolError::InvalidField {
                        field: "boolean",
                        reason: format!("byte 0x{b:02x}"),
                    }
                    .into());
                }
            },
            DATE_TIME => Value::DateTime(self.read_i64("date")?),
            NULL => Value::Null,
            REGEX => Value::Regex {
                pattern: self.read_cstring("regex pattern")?,
                flags: self.read_cstring("regex flags")?,
            },
            CODE => Value::Code {
                source: self.read_string("code")?,
                scope: None,
            },
            CODE_WITH_SCOPE => {
                let start = self.pos;
                let declared = self.read_i32("code with scope length")?;
                let source = self.read_string("code")?;
                let scope = self.read_nested(depth)?;
                let consumed = self.pos - start;
                if declared < 0 || declared as usize != consumed {
                    return Err(ProtocolError::LengthMismatch {
                        declared: declared.max(0) as usize,
                        consumed,
                    }
                    .into());
                }
                Value::Code {
                    source,
                    scope: Some(scope),
                }
            }
            INT32 => Value::Int32(self.read_i32("int32")?),
            TIMESTAMP => {
                let increment = self.read_u32("timestamp")?;
                let seconds = self.read_u32("timestamp")?;
                Value::Timestamp { seconds, increment }
            }
            INT64 => Value::Int64(self.read_i64("int64")?),
            MIN_KEY => Value::MinKey,
            MAX_KEY => Value::MaxKey,
            other => return Err(ProtocolError::UnknownType(other).into()),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        bson::encode,
        doc,
        error::{Error, ProtocolError},
    };

    use super::*;

    fn every_kind() -> Document {
        doc! {
            "double" => 3.25,
            "string" => "héllo",
            "document" => doc! { "nested" => true },
            "array" => vec![Value::from(1), Value::from("two"), Value::Null],
            "binary" => Value::Binary { subtype: 0x00, bytes: vec![1, 2, 3] },
            "old_binary" => Value::Binary { subtype: 0x02, bytes: vec![9, 8] },
            "oid" => "507f1f77bcf86cd799439011".parse::<ObjectId>().unwrap(),
            "bool" => false,
            "date" => Value::DateTime(1_700_000_000_000),
            "null" => Value::Null,
            "regex" => Value::Regex { pattern: "^a.*".into(), flags: "i".into() },
            "code" => Value::Code { source: "function() {}".into(), scope: None },
            "scoped" => Value::Code {
                source: "x + 1".into(),
                scope: Some(doc! { "x" => 1 }),
            },
            "int32" => -7,
            "int64" => i64::MIN,
            "timestamp" => Value::Timestamp { seconds: 1_700_000_000, increment: 4 },
            "min" => Value::MinKey,
            "max" => Value::MaxKey,
            "empty" => Document::new(),
        }
    }

    #[test]
    fn round_trip_every_kind() {
        let document = every_kind();
        let bytes = encode(&document).unwrap();
        assert_eq!(decode(&bytes).unwrap(), document);
    }

    #[test]
    fn decode_many_splits_stream() {
        let bytes = crate::bson::encode_many(&[doc! { "a" => 1 }, doc! { "b" => 2 }]).unwrap();
        let documents = decode_many(&bytes).unwrap();
        assert_eq!(documents, vec![doc! { "a" => 1 }, doc! { "b" => 2 }]);
    }

    #[test]
    fn declared_length_too_long() {
        let mut bytes = encode(&doc! { "hello" => "world" }).unwrap();
        bytes[0] += 1;
        bytes.push(0);

        match decode(&bytes) {
            Err(Error::Protocol(ProtocolError::LengthMismatch { declared, consumed })) => {
                assert_eq!(declared, 23);
                assert_eq!(consumed, 22);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn declared_length_too_short() {
        let mut bytes = encode(&doc! { "hello" => "world" }).unwrap();
        bytes[0] -= 1;

        assert!(matches!(
            decode(&bytes),
            Err(Error::Protocol(ProtocolError::LengthMismatch { .. }))
        ));
    }

    #[test]
    fn unknown_type_tag() {
        let mut bytes = encode(&doc! { "a" => 1 }).unwrap();
        bytes[4] = 0x42;

        assert!(matches!(
            decode(&bytes),
            Err(Error::Protocol(ProtocolError::UnknownType(0x42)))
        ));
    }

    #[test]
    fn truncated_input() {
        let bytes = encode(&doc! { "hello" => "world" }).unwrap();
        assert!(matches!(
            decode(&bytes[..10]),
            Err(Error::Protocol(ProtocolError::Truncated(_)))
        ));
    }

    #[test]
    fn invalid_utf8_string() {
        let mut bytes = encode(&doc! { "s" => "ab" }).unwrap();
        bytes[11] = 0xff;

        assert!(matches!(
            decode(&bytes),
            Err(Error::Encoding(EncodingError::NonUtf8String))
        ));
    }

    fn nested(levels: usize) -> Document {
        let mut document = doc! { "leaf" => 1 };
        for _ in 0..levels {
            document = doc! { "n" => document };
        }
        document
    }

    #[test]
    fn nesting_depth_is_bounded() {
        let shallow = nested(MAX_NESTING_DEPTH);
        assert_eq!(decode(&encode(&shallow).unwrap()).unwrap(), shallow);

        let bytes = encode(&nested(MAX_NESTING_DEPTH + 1)).unwrap();
        assert!(matches!(
            decode(&bytes),
            Err(Error::Protocol(ProtocolError::InvalidField { field: "document", .. }))
        ));
    }

    #[test]
    fn deeply_nested_reply_is_rejected_not_overflowed() {
        // 200,000 levels of `{"": {...}}`: far past the limit, well under the size cap.
        const LEVELS: usize = 200_000;
        let mut bytes = Vec::with_capacity(LEVELS * 7 + 5);
        for level in 0..LEVELS {
            let length = ((LEVELS - level) * 7 + 5) as i32;
            bytes.extend_from_slice(&length.to_le_bytes());
            bytes.extend_from_slice(&[DOCUMENT, 0]);
        }
        bytes.extend_from_slice(&5_i32.to_le_bytes());
        bytes.push(0);
        bytes.extend(std::iter::repeat_n(0, LEVELS));

        assert!(matches!(
            decode(&bytes),
            Err(Error::Protocol(ProtocolError::InvalidField { field: "document", .. }))
        ));
    }

    #[test]
    fn array_like_document_decodes_as_array() {
        let bytes = encode(&doc! { "x" => doc! { "0" => "a", "1" => "b" } }).unwrap();
        let document = decode(&bytes).unwrap();
        assert_eq!(
            document.get("x"),
            Some(&Value::Array(vec![Value::from("a"), Value::from("b")]))
        );
    }

    #[test]
    fn array_like_document_does_not_survive_a_round_trip() {
        let document = doc! { "x" => doc! { "0" => 1, "1" => 2 } };
        let decoded = decode(&encode(&document).unwrap()).unwrap();

        assert_ne!(decoded, document);
        assert_eq!(
            decoded,
            doc! { "x" => vec![Value::from(1), Value::from(2)] }
        );
    }
}
