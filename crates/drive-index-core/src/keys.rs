//! Order-preserving encoding of JSON values into secondary-index keys.
//!
//! An index entry key is `encode(value) + '\0' + record_url`. The encoded
//! value starts with a one-character type tag so values group by type
//! (null < bool < number < string) and sort naturally inside a type:
//!
//! ```text
//! null     "0"
//! bool     "1" + "0" | "1"
//! number   "2" + 16 hex digits of the sign-flipped IEEE-754 bits
//! string   "3" + escaped text   ('\0' -> "\x01\x01", '\x01' -> "\x01\x02")
//! ```
//!
//! Escaping keeps `'\0'` free for the separator while preserving byte order,
//! so `"ab" < "ab\0..." < "abc"` still holds after encoding.

use std::ops::Bound;

use serde_json::Value;

use crate::store::KeyRange;

pub const SEPARATOR: char = '\0';

const TAG_NULL: char = '0';
const TAG_BOOL: char = '1';
const TAG_NUMBER: char = '2';
const TAG_STRING: char = '3';

/// Encode a scalar JSON value. Arrays and objects are not indexable.
pub fn encode_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some(TAG_NULL.to_string()),
        Value::Bool(b) => Some(format!("{}{}", TAG_BOOL, if *b { '1' } else { '0' })),
        Value::Number(n) => n.as_f64().map(encode_number),
        Value::String(s) => Some(encode_string(s)),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn encode_number(f: f64) -> String {
    let bits = f.to_bits();
    let sortable = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
    format!("{}{:016x}", TAG_NUMBER, sortable)
}

fn encode_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 1);
    out.push(TAG_STRING);
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\u{1}\u{1}"),
            '\u{1}' => out.push_str("\u{1}\u{2}"),
            other => out.push(other),
        }
    }
    out
}

/// Decode a value produced by [`encode_value`].
pub fn decode_value(encoded: &str) -> Option<Value> {
    let mut chars = encoded.chars();
    let tag = chars.next()?;
    let rest = chars.as_str();
    match tag {
        TAG_NULL => Some(Value::Null),
        TAG_BOOL => Some(Value::Bool(rest == "1")),
        TAG_NUMBER => {
            let sortable = u64::from_str_radix(rest, 16).ok()?;
            let bits = if sortable >> 63 == 1 {
                sortable ^ (1 << 63)
            } else {
                !sortable
            };
            let f = f64::from_bits(bits);
            let number = if f.fract() == 0.0 && f.abs() < 9.0e15 {
                serde_json::Number::from(f as i64)
            } else {
                serde_json::Number::from_f64(f)?
            };
            Some(Value::Number(number))
        }
        TAG_STRING => {
            let mut out = String::with_capacity(rest.len());
            let mut it = rest.chars();
            while let Some(c) = it.next() {
                if c == '\u{1}' {
                    match it.next()? {
                        '\u{1}' => out.push('\0'),
                        '\u{2}' => out.push('\u{1}'),
                        _ => return None,
                    }
                } else {
                    out.push(c);
                }
            }
            Some(Value::String(out))
        }
        _ => None,
    }
}

/// Build the full index entry key for one value of one record.
pub fn entry_key(encoded_value: &str, url: &str) -> String {
    format!("{}{}{}", encoded_value, SEPARATOR, url)
}

/// Split an index entry key back into `(encoded value, record url)`.
pub fn split_entry_key(key: &str) -> Option<(&str, &str)> {
    key.split_once(SEPARATOR)
}

/// Every encoded key that an index field yields for a payload.
///
/// Single-value indexes yield at most one key. Multi-entry indexes yield one
/// key per distinct array element (or one for a scalar field).
pub fn index_values(value: Option<&Value>, multi: bool) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    match value {
        Value::Array(items) if multi => {
            let mut out: Vec<String> = items.iter().filter_map(encode_value).collect();
            out.sort();
            out.dedup();
            out
        }
        other => encode_value(other).into_iter().collect(),
    }
}

fn type_tag(encoded: &str) -> char {
    encoded.chars().next().unwrap_or(TAG_NULL)
}

fn next_tag(tag: char) -> String {
    char::from_u32(tag as u32 + 1)
        .map(|c| c.to_string())
        .unwrap_or_else(|| char::MAX.to_string())
}

/// Entries whose value equals `encoded`.
pub fn equals_range(encoded: &str) -> KeyRange {
    KeyRange::new(
        Bound::Included(format!("{}{}", encoded, SEPARATOR)),
        Bound::Excluded(format!("{}\u{1}", encoded)),
    )
}

/// Lower bound on entries with value `>` (or `>=`) `encoded`.
pub fn lower_bound(encoded: &str, inclusive: bool) -> Bound<String> {
    if inclusive {
        Bound::Included(format!("{}{}", encoded, SEPARATOR))
    } else {
        Bound::Included(format!("{}\u{1}", encoded))
    }
}

/// Upper bound on entries with value `<` (or `<=`) `encoded`.
pub fn upper_bound(encoded: &str, inclusive: bool) -> Bound<String> {
    if inclusive {
        Bound::Excluded(format!("{}\u{1}", encoded))
    } else {
        Bound::Excluded(format!("{}{}", encoded, SEPARATOR))
    }
}

/// Everything above `encoded` within the same type class.
pub fn above_range(encoded: &str, inclusive: bool) -> KeyRange {
    KeyRange::new(
        lower_bound(encoded, inclusive),
        Bound::Excluded(next_tag(type_tag(encoded))),
    )
}

/// Everything below `encoded` within the same type class.
pub fn below_range(encoded: &str, inclusive: bool) -> KeyRange {
    KeyRange::new(
        Bound::Included(type_tag(encoded).to_string()),
        upper_bound(encoded, inclusive),
    )
}

/// Strings starting with `prefix`.
pub fn starts_with_range(prefix: &str) -> KeyRange {
    let encoded = encode_string(prefix);
    KeyRange::new(
        Bound::Included(encoded.clone()),
        Bound::Excluded(format!("{}{}", encoded, char::MAX)),
    )
}

/// All entries holding a value of the same type class as `encoded`.
pub fn type_range(encoded: &str) -> KeyRange {
    let tag = type_tag(encoded);
    KeyRange::new(Bound::Included(tag.to_string()), Bound::Excluded(next_tag(tag)))
}
