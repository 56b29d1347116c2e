//! Bencode value tree

use std::collections::BTreeMap;

/// A decoded bencode value.
///
/// Dictionary keys live in a `BTreeMap`, so iteration (and therefore
/// encoding) always visits keys in ascending byte order no matter how the
/// map was filled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Signed 64-bit integer
    Int(i64),
    /// Raw byte string, not necessarily UTF-8
    Bytes(Vec<u8>),
    /// Ordered list
    List(Vec<Value>),
    /// Dictionary keyed by byte strings
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    /// Build a byte string from UTF-8 text
    pub fn string(s: &str) -> Self {
        Value::Bytes(s.as_bytes().to_vec())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Byte string as UTF-8, `None` if it is not a string or not valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Look up `key` when this value is a dictionary
    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.as_dict()?.get(key)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<Vec<u8>, Value>> for Value {
    fn from(entries: BTreeMap<Vec<u8>, Value>) -> Self {
        Value::Dict(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors() {
        assert_eq!(Value::Int(7).as_int(), Some(7));
        assert_eq!(Value::from("abc").as_str(), Some("abc"));
        assert_eq!(Value::Bytes(vec![0xff]).as_str(), None);
        assert_eq!(Value::Int(7).as_bytes(), None);
        assert!(Value::List(vec![]).as_list().unwrap().is_empty());
    }

    #[test]
    fn test_get_on_dict_and_non_dict() {
        let mut entries = BTreeMap::new();
        entries.insert(b"key".to_vec(), Value::Int(1));
        let dict = Value::Dict(entries);

        assert_eq!(dict.get(b"key"), Some(&Value::Int(1)));
        assert_eq!(dict.get(b"missing"), None);
        assert_eq!(Value::Int(1).get(b"key"), None);
    }
}
