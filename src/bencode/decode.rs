//! Bencode decoder
//!
//! Dictionary keys are accepted in any order and re-sorted on encode;
//! duplicate keys are rejected.

use std::collections::BTreeMap;

use super::error::DecodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decode exactly one value spanning the whole input
pub fn decode(data: &[u8]) -> Result<Value, DecodeError> {
    let (value, consumed) = decode_prefix(data)?;
    if consumed != data.len() {
        return Err(DecodeError::TrailingData { offset: consumed });
    }
    Ok(value)
}

/// Decode one value from the start of `data`, returning it together with the
/// number of bytes it occupied
pub fn decode_prefix(data: &[u8]) -> Result<(Value, usize), DecodeError> {
    let mut decoder = Decoder { data, pos: 0 };
    let value = decoder.value(0)?;
    Ok((value, decoder.pos))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Decoder<'_> {
    fn peek(&self) -> Result<u8, DecodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(DecodeError::UnexpectedEof)
    }

    /// Position of the next `needle` at or after the cursor
    fn find(&self, needle: u8) -> Result<usize, DecodeError> {
        self.data[self.pos..]
            .iter()
            .position(|&b| b == needle)
            .map(|p| self.pos + p)
            .ok_or(DecodeError::UnexpectedEof)
    }

    fn value(&mut self, depth: usize) -> Result<Value, DecodeError> {
        if depth > MAX_DEPTH {
            return Err(DecodeError::NestingTooDeep);
        }

        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.bytes().map(Value::Bytes),
            byte => Err(DecodeError::UnsupportedType {
                byte,
                offset: self.pos,
            }),
        }
    }

    fn integer(&mut self) -> Result<Value, DecodeError> {
        self.pos += 1;
        let end = self.find(b'e')?;
        let value = parse_integer(&self.data[self.pos..end])?;
        self.pos = end + 1;
        Ok(Value::Int(value))
    }

    fn bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let colon = self.find(b':')?;
        let digits = &self.data[self.pos..colon];
        if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
            return Err(DecodeError::InvalidStringLength);
        }
        let len: usize = std::str::from_utf8(digits)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(DecodeError::InvalidStringLength)?;

        let start = colon + 1;
        let remaining = self.data.len() - start;
        if len > remaining {
            return Err(DecodeError::TruncatedString {
                expected: len,
                remaining,
            });
        }

        self.pos = start + len;
        Ok(self.data[start..self.pos].to_vec())
    }

    fn list(&mut self, depth: usize) -> Result<Value, DecodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            if self.peek()? == b'e' {
                self.pos += 1;
                return Ok(Value::List(items));
            }
            items.push(self.value(depth + 1)?);
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Value, DecodeError> {
        self.pos += 1;
        let mut entries = BTreeMap::new();
        loop {
            let byte = self.peek()?;
            if byte == b'e' {
                self.pos += 1;
                return Ok(Value::Dict(entries));
            }
            if !byte.is_ascii_digit() {
                return Err(DecodeError::BadKeyType { offset: self.pos });
            }

            let key_offset = self.pos;
            let key = self.bytes()?;
            let value = self.value(depth + 1)?;
            if entries.insert(key, value).is_some() {
                return Err(DecodeError::DuplicateKey { offset: key_offset });
            }
        }
    }
}

fn parse_integer(raw: &[u8]) -> Result<i64, DecodeError> {
    let invalid = || DecodeError::InvalidInteger(String::from_utf8_lossy(raw).into_owned());

    let (negative, digits) = match raw.split_first() {
        Some((b'-', rest)) => (true, rest),
        _ => (false, raw),
    };

    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid());
    }
    // rejects "00", "012", "-0" and "-012"
    if digits[0] == b'0' && (digits.len() > 1 || negative) {
        return Err(invalid());
    }

    std::str::from_utf8(raw)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(invalid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_integers() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(decode(b"i0e").unwrap(), Value::Int(0));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Int(-7));
        assert_eq!(
            decode(b"i-9223372036854775808e").unwrap(),
            Value::Int(i64::MIN)
        );
    }

    #[test]
    fn test_decode_rejects_bad_integers() {
        for input in [&b"i00e"[..], b"i-042e", b"i-0e", b"ie", b"i-e", b"i1.5e", b"i99999999999999999999e"] {
            assert!(
                matches!(decode(input), Err(DecodeError::InvalidInteger(_))),
                "input {:?}",
                String::from_utf8_lossy(input)
            );
        }
        assert_eq!(decode(b"i12"), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_decode_strings() {
        assert_eq!(decode(b"4:spam").unwrap(), Value::from("spam"));
        assert_eq!(decode(b"0:").unwrap(), Value::Bytes(Vec::new()));
    }

    #[test]
    fn test_decode_truncated_string() {
        assert_eq!(
            decode(b"5:hi"),
            Err(DecodeError::TruncatedString {
                expected: 5,
                remaining: 2
            })
        );
    }

    #[test]
    fn test_decode_unterminated_list() {
        assert_eq!(decode(b"l1:a"), Err(DecodeError::UnexpectedEof));
        assert_eq!(decode(b"d1:ai1e"), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_decode_list_and_dict() {
        let value = decode(b"l4:spami42ee").unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::from("spam"), Value::Int(42)])
        );

        let value = decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(value.get(b"cow").and_then(Value::as_str), Some("moo"));
        assert_eq!(value.get(b"spam").and_then(Value::as_str), Some("eggs"));
    }

    #[test]
    fn test_decode_rejects_non_string_key() {
        assert_eq!(
            decode(b"di1ei2ee"),
            Err(DecodeError::BadKeyType { offset: 1 })
        );
    }

    #[test]
    fn test_decode_rejects_duplicate_key() {
        assert!(matches!(
            decode(b"d1:ai1e1:ai2ee"),
            Err(DecodeError::DuplicateKey { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_trailing_data() {
        assert_eq!(
            decode(b"i1ei2e"),
            Err(DecodeError::TrailingData { offset: 3 })
        );
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let (value, consumed) = decode_prefix(b"le<rest>").unwrap();
        assert_eq!(value, Value::List(Vec::new()));
        assert_eq!(consumed, 2);
    }

    #[test]
    fn test_decode_rejects_unknown_marker() {
        assert!(matches!(
            decode(b"x"),
            Err(DecodeError::UnsupportedType { byte: b'x', .. })
        ));
        assert_eq!(decode(b""), Err(DecodeError::UnexpectedEof));
    }

    #[test]
    fn test_decode_nesting_limit() {
        let mut input = vec![b'l'; MAX_DEPTH + 2];
        input.extend(std::iter::repeat(b'e').take(MAX_DEPTH + 2));
        assert_eq!(decode(&input), Err(DecodeError::NestingTooDeep));
    }
}
