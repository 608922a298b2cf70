//! Order-preserving tuple-key codec.
//!
//! Keys are sequences of typed parts encoded so that byte order equals
//! part-wise order. Text parts are zero-terminated with embedded zeros
//! escaped, so a key built from complete parts is never a byte-prefix of a
//! key with a longer final part - prefix scans match whole parts only.

use trellis_core::Value;

const TAG_NULL: u8 = 0x01;
const TAG_FALSE: u8 = 0x02;
const TAG_TRUE: u8 = 0x03;
const TAG_FLOAT: u8 = 0x08;
const TAG_TEXT: u8 = 0x10;
const TAG_U64: u8 = 0x20;

const TEXT_TERM: u8 = 0x00;
const TEXT_ESCAPE: u8 = 0xFF;

/// One typed part of a tuple key.
#[derive(Clone, Debug, PartialEq)]
pub enum KeyPart {
    Null,
    Bool(bool),
    Float(f64),
    Text(String),
    U64(u64),
}

impl KeyPart {
    pub fn text(s: impl Into<String>) -> Self {
        KeyPart::Text(s.into())
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            KeyPart::Null => out.push(TAG_NULL),
            KeyPart::Bool(false) => out.push(TAG_FALSE),
            KeyPart::Bool(true) => out.push(TAG_TRUE),
            KeyPart::Float(f) => {
                out.push(TAG_FLOAT);
                out.extend_from_slice(&order_preserving_f64(*f));
            }
            KeyPart::Text(s) => {
                out.push(TAG_TEXT);
                for byte in s.as_bytes() {
                    if *byte == TEXT_TERM {
                        out.push(TEXT_TERM);
                        out.push(TEXT_ESCAPE);
                    } else {
                        out.push(*byte);
                    }
                }
                out.push(TEXT_TERM);
            }
            KeyPart::U64(n) => {
                out.push(TAG_U64);
                out.extend_from_slice(&n.to_be_bytes());
            }
        }
    }
}

impl From<&Value> for KeyPart {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => KeyPart::Null,
            Value::Boolean(b) => KeyPart::Bool(*b),
            Value::Number(n) => KeyPart::Float(*n),
            Value::String(s) => KeyPart::Text(s.clone()),
            // RFC 3339 in UTC sorts chronologically as text.
            Value::Date(_) => KeyPart::Text(value.segment()),
        }
    }
}

/// IEEE-754 bits remapped so unsigned byte comparison orders floats:
/// positive values get the sign bit set, negatives are fully inverted.
fn order_preserving_f64(f: f64) -> [u8; 8] {
    let bits = f.to_bits();
    let mapped = if bits & (1 << 63) == 0 {
        bits | (1 << 63)
    } else {
        !bits
    };
    mapped.to_be_bytes()
}

/// Encode a complete tuple key.
pub fn encode_key(parts: &[KeyPart]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.len() * 12);
    for part in parts {
        part.encode_into(&mut out);
    }
    out
}

/// Encode a key prefix for range scans; identical to `encode_key` because
/// parts are self-delimiting.
pub fn encode_prefix(parts: &[KeyPart]) -> Vec<u8> {
    encode_key(parts)
}
