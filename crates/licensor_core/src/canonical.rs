//! Canonical JSON: keys sorted at every depth, no whitespace, integers only,
//! and everything outside printable ASCII escaped as `\uXXXX`.
//!
//! These bytes are what gets signed, so every implementation has to produce
//! them identically.

use std::io;

use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::{Map, Value};

use crate::error::LicenseError;

/// Canonical bytes of any serializable value.
pub fn to_canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, LicenseError> {
    let value = serde_json::to_value(value)?;
    canonical_value_bytes(&value)
}

/// Canonical bytes of an already-parsed JSON value.
pub fn canonical_value_bytes(value: &Value) -> Result<Vec<u8>, LicenseError> {
    let sorted = canonicalize(value)?;
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    sorted.serialize(&mut ser)?;
    Ok(out)
}

/// Compact output that escapes non-ASCII and DEL as lowercase `\uXXXX`,
/// using UTF-16 surrogate pairs above the BMP.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut start = 0;
        for (i, c) in fragment.char_indices() {
            if (' '..='~').contains(&c) {
                continue;
            }
            writer.write_all(&fragment.as_bytes()[start..i])?;
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                write!(writer, "\\u{:04x}", unit)?;
            }
            start = i + c.len_utf8();
        }
        writer.write_all(&fragment.as_bytes()[start..])
    }
}

fn canonicalize(value: &Value) -> Result<Value, LicenseError> {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key])?);
            }
            Ok(Value::Object(sorted))
        }
        Value::Array(items) => items
            .iter()
            .map(canonicalize)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Number(n) if n.is_f64() => Err(LicenseError::Canonicalization(format!(
            "non-integer number {}",
            n
        ))),
        other => Ok(other.clone()),
    }
}
