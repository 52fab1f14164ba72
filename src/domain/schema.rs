//! Declarative packet schemas
//!
//! A `Schema` describes how to match bytes inside a packet body, how to
//! extract a value from it, and how to encode a command value back into a
//! byte template. Offsets are body-relative (header already stripped).
//!
//! Entity `state_*` / `command_*` fields are either a `Schema` or an
//! expression string; `Matcher` is that discriminated value.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Byte decode applied when extracting a numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decode {
    #[default]
    None,
    /// Two decimal digits per byte.
    Bcd,
    /// Bytes are a UTF-8 string.
    Ascii,
    /// Low 7 bits are whole degrees, bit 7 adds 0.5 (Samsung SDS climate).
    SignedByteHalfDegree,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endian {
    #[default]
    Big,
    Little,
}

/// Mask for the match window: a single byte applied to every position, or
/// one byte per data position (missing positions default to 0xFF).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Mask {
    Byte(u8),
    Bytes(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("schema has no value_offset, cannot encode a value")]
    NoValueOffset,
    #[error("value {0} is not representable for this schema")]
    BadValue(String),
    #[error("no mapping entry for label {0:?}")]
    UnmappedLabel(String),
}

/// Declarative match / extract / encode record.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Schema {
    /// Body-relative byte offset the match/extract window starts at.
    pub offset: usize,
    /// Expected bytes for matching, and the template for command bodies.
    pub data: Vec<u8>,
    pub mask: Option<Mask>,
    /// Match succeeds iff the masked bytes differ.
    pub inverted: bool,
    /// Extract window length in bytes (default 1).
    pub length: Option<usize>,
    pub decode: Decode,
    pub endian: Endian,
    pub signed: bool,
    /// Decimal places: raw value is divided by 10^precision.
    pub precision: u32,
    /// Engineering-unit scale applied after decode.
    pub multiply: Option<f64>,
    /// Raw byte (after mask) to enum label.
    pub mapping: Option<BTreeMap<u8, String>>,
    /// Expression evaluated only after the byte match passes.
    pub guard: Option<String>,
    /// Match fails if any of these sub-schemas matches.
    pub except: Vec<Schema>,
    /// Where a command value is written into the `data` template.
    pub value_offset: Option<usize>,
    pub value_encode: Decode,
    /// Command value width in bytes (default 1).
    pub value_length: Option<usize>,
    /// Scale applied to the command value before writing it.
    pub value_multiply: Option<f64>,
    /// Expected acknowledgement pattern for a command schema.
    pub ack: Option<Box<Schema>>,
}

impl Schema {
    fn mask_at(&self, i: usize) -> u8 {
        match &self.mask {
            None => 0xFF,
            Some(Mask::Byte(b)) => *b,
            Some(Mask::Bytes(bytes)) => bytes.get(i).copied().unwrap_or(0xFF),
        }
    }

    /// Byte-level match against a packet body. Guards are evaluated by the
    /// caller, which owns the expression context.
    pub fn matches(&self, body: &[u8]) -> bool {
        let end = self.offset + self.data.len();
        if end > body.len() {
            return false;
        }
        let equal = self
            .data
            .iter()
            .enumerate()
            .all(|(i, &expected)| {
                let mask = self.mask_at(i);
                body[self.offset + i] & mask == expected & mask
            });
        let matched = if self.inverted { !equal } else { equal };
        if !matched {
            return false;
        }
        !self.except.iter().any(|ex| ex.matches(body))
    }

    /// Extract a value from the packet body. Out-of-range windows, invalid
    /// BCD digits and unmapped bytes all yield `None`.
    pub fn extract(&self, body: &[u8]) -> Option<Value> {
        let len = self.length.unwrap_or(1).max(1);
        let end = self.offset.checked_add(len)?;
        if end > body.len() {
            return None;
        }
        let window = &body[self.offset..end];

        if let Some(mapping) = &self.mapping {
            let raw = window[0] & self.mask_at(0);
            return mapping.get(&raw).map(|label| Value::String(label.clone()));
        }

        match self.decode {
            Decode::Ascii => {
                let text = std::str::from_utf8(window).ok()?;
                Some(Value::String(text.trim_end_matches('\0').to_string()))
            }
            Decode::SignedByteHalfDegree => {
                let b = window[0];
                let value = (b & 0x7F) as f64 + if b & 0x80 != 0 { 0.5 } else { 0.0 };
                Some(self.scale(value))
            }
            Decode::Bcd => {
                let mut raw: i64 = 0;
                let ordered: Vec<u8> = match self.endian {
                    Endian::Big => window.to_vec(),
                    Endian::Little => window.iter().rev().copied().collect(),
                };
                for b in ordered {
                    let hi = b >> 4;
                    let lo = b & 0x0F;
                    if hi > 9 || lo > 9 {
                        return None;
                    }
                    raw = raw * 100 + (hi as i64) * 10 + lo as i64;
                }
                Some(self.scale(raw as f64))
            }
            Decode::None => {
                let mut raw: u64 = 0;
                let ordered: Vec<u8> = match self.endian {
                    Endian::Big => window.to_vec(),
                    Endian::Little => window.iter().rev().copied().collect(),
                };
                for b in &ordered {
                    let b = if len == 1 { b & self.mask_at(0) } else { *b };
                    raw = (raw << 8) | b as u64;
                }
                let value = if self.signed {
                    sign_extend(raw, len) as f64
                } else {
                    raw as f64
                };
                Some(self.scale(value))
            }
        }
    }

    fn scale(&self, raw: f64) -> Value {
        let mut value = raw;
        if self.precision > 0 {
            value /= 10f64.powi(self.precision as i32);
        }
        if let Some(m) = self.multiply {
            value *= m;
        }
        number(value)
    }

    /// Write a command value into `body` (a clone of the `data` template)
    /// at `value_offset`, growing the body with zeros if the window extends
    /// past the template.
    pub fn encode(&self, body: &mut Vec<u8>, value: &Value) -> Result<(), EncodeError> {
        let offset = self.value_offset.ok_or(EncodeError::NoValueOffset)?;
        let len = self.value_length.unwrap_or(1).clamp(1, 8);
        if body.len() < offset + len {
            body.resize(offset + len, 0);
        }

        // Enum labels go through the reverse mapping.
        if let Value::String(label) = value {
            if let Some(mapping) = &self.mapping {
                let raw = mapping
                    .iter()
                    .find(|(_, v)| v.as_str() == label)
                    .map(|(k, _)| *k)
                    .ok_or_else(|| EncodeError::UnmappedLabel(label.clone()))?;
                body[offset] = raw;
                return Ok(());
            }
            if self.value_encode == Decode::Ascii {
                let bytes = label.as_bytes();
                if bytes.len() > len {
                    return Err(EncodeError::BadValue(label.clone()));
                }
                body[offset..offset + bytes.len()].copy_from_slice(bytes);
                for b in &mut body[offset + bytes.len()..offset + len] {
                    *b = 0;
                }
                return Ok(());
            }
        }

        let numeric = match value {
            Value::Number(n) => n.as_f64().ok_or_else(|| EncodeError::BadValue(n.to_string()))?,
            Value::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| EncodeError::BadValue(s.clone()))?,
            other => return Err(EncodeError::BadValue(other.to_string())),
        };
        let scaled = numeric * self.value_multiply.unwrap_or(1.0);

        let raw: i64 = match self.value_encode {
            Decode::SignedByteHalfDegree => {
                let whole = scaled.floor();
                let half = if (scaled - whole) >= 0.5 { 0x80i64 } else { 0 };
                (whole as i64 & 0x7F) | half
            }
            Decode::Bcd => {
                let mut n = scaled.round() as i64;
                if n < 0 {
                    return Err(EncodeError::BadValue(scaled.to_string()));
                }
                let mut bcd: i64 = 0;
                for i in 0..len {
                    let lo = n % 10;
                    n /= 10;
                    let hi = n % 10;
                    n /= 10;
                    bcd |= ((hi << 4) | lo) << (8 * i as i64);
                }
                bcd
            }
            _ => scaled.round() as i64,
        };

        let bytes = raw.to_be_bytes();
        let window = &bytes[bytes.len() - len..];
        match self.endian {
            Endian::Big => body[offset..offset + len].copy_from_slice(window),
            Endian::Little => {
                for (i, b) in window.iter().rev().enumerate() {
                    body[offset + i] = *b;
                }
            }
        }
        Ok(())
    }
}

/// A `state_*` / `command_*` field: structured schema or expression string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Matcher {
    Expr(String),
    Schema(Box<Schema>),
}

impl Matcher {
    pub fn as_schema(&self) -> Option<&Schema> {
        match self {
            Matcher::Schema(s) => Some(s),
            Matcher::Expr(_) => None,
        }
    }

    pub fn as_expr(&self) -> Option<&str> {
        match self {
            Matcher::Expr(e) => Some(e),
            Matcher::Schema(_) => None,
        }
    }
}

fn sign_extend(raw: u64, len: usize) -> i64 {
    let bits = (len * 8).min(64) as u32;
    if bits == 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

/// Collapse a float that holds an integral value back into a JSON integer.
pub fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9e15 {
        Value::Number((value as i64).into())
    } else {
        serde_json::Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema(offset: usize, data: Vec<u8>) -> Schema {
        Schema { offset, data, ..Default::default() }
    }

    #[test]
    fn test_match_with_mask() {
        // Ezville light ON: offset 0, data [0x30, 0x01], mask [0xFF, 0x01]
        let s = Schema {
            mask: Some(Mask::Bytes(vec![0xFF, 0x01])),
            ..schema(0, vec![0x30, 0x01])
        };
        assert!(s.matches(&[0x30, 0x01, 0x00, 0x25]));
        assert!(s.matches(&[0x30, 0xFF, 0x00, 0x25])); // masked low bit only
        assert!(!s.matches(&[0x31, 0x01, 0x00, 0x25]));
        assert!(!s.matches(&[0x30])); // out of range
    }

    #[test]
    fn test_inverted_match() {
        let s = Schema { inverted: true, ..schema(1, vec![0x00]) };
        assert!(s.matches(&[0x30, 0x01]));
        assert!(!s.matches(&[0x30, 0x00]));
        // Out of range is still no-match, inverted or not.
        assert!(!s.matches(&[0x30]));
    }

    #[test]
    fn test_except_rejects() {
        let s = Schema {
            except: vec![schema(1, vec![0xFF])],
            ..schema(0, vec![0x30])
        };
        assert!(s.matches(&[0x30, 0x01]));
        assert!(!s.matches(&[0x30, 0xFF]));
    }

    #[test]
    fn test_extract_single_byte() {
        let s = Schema { length: Some(1), ..schema(1, vec![]) };
        assert_eq!(s.extract(&[0x50, 0x32, 0x01]), Some(json!(0x32)));
        assert_eq!(s.extract(&[0x50]), None);
    }

    #[test]
    fn test_extract_multi_byte_endian() {
        let big = Schema { length: Some(2), ..schema(0, vec![]) };
        assert_eq!(big.extract(&[0x01, 0x02]), Some(json!(0x0102)));
        let little = Schema { length: Some(2), endian: Endian::Little, ..schema(0, vec![]) };
        assert_eq!(little.extract(&[0x01, 0x02]), Some(json!(0x0201)));
    }

    #[test]
    fn test_extract_signed_and_precision() {
        let s = Schema { length: Some(1), signed: true, precision: 1, ..schema(0, vec![]) };
        assert_eq!(s.extract(&[0xFF]), Some(json!(-0.1)));
        assert_eq!(s.extract(&[0x19]), Some(json!(2.5)));
    }

    #[test]
    fn test_extract_bcd() {
        let s = Schema { length: Some(2), decode: Decode::Bcd, ..schema(0, vec![]) };
        assert_eq!(s.extract(&[0x12, 0x34]), Some(json!(1234)));
        // 0xAB is not valid BCD
        assert_eq!(s.extract(&[0xAB, 0x34]), None);
    }

    #[test]
    fn test_extract_half_degree() {
        let s = Schema { decode: Decode::SignedByteHalfDegree, ..schema(0, vec![]) };
        assert_eq!(s.extract(&[0x18]), Some(json!(24)));
        assert_eq!(s.extract(&[0x98]), Some(json!(24.5)));
    }

    #[test]
    fn test_extract_mapping() {
        let mut mapping = BTreeMap::new();
        mapping.insert(0x01u8, "heat".to_string());
        mapping.insert(0x02u8, "cool".to_string());
        let s = Schema { mapping: Some(mapping), ..schema(0, vec![]) };
        assert_eq!(s.extract(&[0x01]), Some(json!("heat")));
        assert_eq!(s.extract(&[0x03]), None);
    }

    #[test]
    fn test_extract_ascii() {
        let s = Schema { length: Some(3), decode: Decode::Ascii, ..schema(0, vec![]) };
        assert_eq!(s.extract(&[b'A', b'B', 0x00]), Some(json!("AB")));
    }

    #[test]
    fn test_encode_value_at_offset() {
        // Fan speed: data [30 71 01 12 00], value_offset 4, value 50 -> 0x32
        let s = Schema {
            value_offset: Some(4),
            ..schema(0, vec![0x30, 0x71, 0x01, 0x12, 0x00])
        };
        let mut body = s.data.clone();
        s.encode(&mut body, &json!(50)).unwrap();
        assert_eq!(body, vec![0x30, 0x71, 0x01, 0x12, 0x32]);
    }

    #[test]
    fn test_encode_multiply_and_mapping() {
        let s = Schema {
            value_offset: Some(0),
            value_multiply: Some(2.0),
            ..schema(0, vec![0x00])
        };
        let mut body = s.data.clone();
        s.encode(&mut body, &json!(21.5)).unwrap();
        assert_eq!(body, vec![43]);

        let mut mapping = BTreeMap::new();
        mapping.insert(0x04u8, "heat".to_string());
        let s = Schema { value_offset: Some(0), mapping: Some(mapping), ..schema(0, vec![0x00]) };
        let mut body = s.data.clone();
        s.encode(&mut body, &json!("heat")).unwrap();
        assert_eq!(body, vec![0x04]);
        let mut body = s.data.clone();
        assert!(s.encode(&mut body, &json!("dry")).is_err());
    }

    #[test]
    fn test_encode_grows_body() {
        let s = Schema {
            value_offset: Some(3),
            value_length: Some(2),
            ..schema(0, vec![0x10])
        };
        let mut body = s.data.clone();
        s.encode(&mut body, &json!(0x0102)).unwrap();
        assert_eq!(body, vec![0x10, 0x00, 0x00, 0x01, 0x02]);
    }

    #[test]
    fn test_encode_without_offset_fails() {
        let s = schema(0, vec![0x10]);
        let mut body = s.data.clone();
        assert!(s.encode(&mut body, &json!(1)).is_err());
    }

    #[test]
    fn test_matcher_yaml_shapes() {
        let m: Matcher = serde_yaml::from_str("data[1] == 0x30").unwrap();
        assert!(matches!(m, Matcher::Expr(_)));
        let m: Matcher = serde_yaml::from_str("{offset: 0, data: [0x30, 0x01]}").unwrap();
        let schema = m.as_schema().unwrap();
        assert_eq!(schema.data, vec![0x30, 0x01]);
    }

    #[test]
    fn test_parse_idempotent() {
        let s = Schema { length: Some(1), ..schema(1, vec![]) };
        let body = [0x50, 0x32, 0x01];
        assert_eq!(s.extract(&body), s.extract(&body));
    }
}
