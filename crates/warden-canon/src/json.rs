//! Canonical JSON encoding.
//!
//! Rules (version [`CANONICAL_VERSION`]):
//!
//! 1. Object keys are sorted by Unicode code point (byte order of their UTF-8 form).
//! 2. No whitespace between tokens.
//! 3. Integers print as plain decimal; floats with an integral value below `1e21` print as
//!    integers, everything else uses the shortest round-trip form. `-0` prints as `0`.
//! 4. Strings are emitted as UTF-8. Only `"`, `\` and control characters (U+0000..U+001F) are
//!    escaped; control characters always use the `\u00xx` form.
//! 5. Duplicate object keys in textual input are rejected.
//!
//! Changing any rule changes hashes and requires a new [`CANONICAL_VERSION`].

use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Serialize;
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Number, Value};

use crate::CanonError;

/// Identifier of the canonicalization rule set baked into every hash.
pub const CANONICAL_VERSION: &str = "warden-canon/1";

/// Nesting limit for canonical input.
pub const MAX_DEPTH: usize = 128;

/// Canonicalize any serializable value.
pub fn to_canonical_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CanonError> {
    let value = serde_json::to_value(value).map_err(|err| CanonError::Serialize(err.to_string()))?;
    canonicalize(&value)
}

/// Canonicalize an already-built JSON value.
pub fn canonicalize(value: &Value) -> Result<Vec<u8>, CanonError> {
    let mut out = String::with_capacity(256);
    emit_value(value, &mut out, 0)?;
    Ok(out.into_bytes())
}

/// Canonicalize raw JSON text. Fails with [`CanonError::InvalidEncoding`] when the bytes are not
/// UTF-8 and with [`CanonError::DuplicateKey`] when an object repeats a key.
pub fn canonicalize_slice(input: &[u8]) -> Result<Vec<u8>, CanonError> {
    let text = std::str::from_utf8(input).map_err(|err| CanonError::InvalidEncoding {
        valid_up_to: err.valid_up_to(),
    })?;
    let value = parse_strict(text)?;
    canonicalize(&value)
}

/// Parse JSON text, rejecting duplicate keys after escape decoding.
pub fn parse_strict(input: &str) -> Result<Value, CanonError> {
    let mut deserializer = serde_json::Deserializer::from_str(input);
    let parsed = StrictValue::deserialize(&mut deserializer).map_err(|err| {
        let msg = err.to_string();
        match msg.strip_prefix(DUPLICATE_PREFIX) {
            Some(rest) => CanonError::DuplicateKey {
                key: rest.split(" at line ").next().unwrap_or(rest).to_string(),
            },
            None => CanonError::Parse(msg),
        }
    })?;
    deserializer
        .end()
        .map_err(|err| CanonError::Parse(err.to_string()))?;
    Ok(parsed.0)
}

const DUPLICATE_PREFIX: &str = "duplicate key: ";

struct StrictValue(Value);

impl<'de> Deserialize<'de> for StrictValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct StrictVisitor;

        impl<'de> Visitor<'de> for StrictVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("any JSON value")
            }

            fn visit_bool<E>(self, v: bool) -> Result<Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_u64<E>(self, v: u64) -> Result<Value, E> {
                Ok(Value::Number(v.into()))
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
                Number::from_f64(v)
                    .map(Value::Number)
                    .ok_or_else(|| de::Error::custom("non-finite number"))
            }

            fn visit_str<E>(self, v: &str) -> Result<Value, E> {
                Ok(Value::String(v.to_owned()))
            }

            fn visit_string<E>(self, v: String) -> Result<Value, E> {
                Ok(Value::String(v))
            }

            fn visit_unit<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element::<StrictValue>()? {
                    items.push(item.0);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
                let mut seen = BTreeSet::new();
                let mut obj = Map::new();
                while let Some(key) = map.next_key::<String>()? {
                    if !seen.insert(key.clone()) {
                        return Err(de::Error::custom(format!("{DUPLICATE_PREFIX}{key}")));
                    }
                    let value = map.next_value::<StrictValue>()?;
                    obj.insert(key, value.0);
                }
                Ok(Value::Object(obj))
            }
        }

        deserializer.deserialize_any(StrictVisitor).map(StrictValue)
    }
}

fn emit_value(value: &Value, out: &mut String, depth: usize) -> Result<(), CanonError> {
    if depth > MAX_DEPTH {
        return Err(CanonError::MaxDepthExceeded { max_depth: MAX_DEPTH });
    }
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => emit_number(n, out)?,
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                emit_value(item, out, depth + 1)?;
            }
            out.push(']');
        }
        Value::Object(obj) => {
            let mut keys: Vec<&String> = obj.keys().collect();
            keys.sort();
            out.push('{');
            for (idx, key) in keys.into_iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                emit_string(key, out);
                out.push(':');
                emit_value(&obj[key.as_str()], out, depth + 1)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn emit_number(n: &Number, out: &mut String) -> Result<(), CanonError> {
    if let Some(i) = n.as_i64() {
        let _ = write!(out, "{i}");
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        let _ = write!(out, "{u}");
        return Ok(());
    }
    let f = n.as_f64().ok_or(CanonError::NonFiniteNumber)?;
    if !f.is_finite() {
        return Err(CanonError::NonFiniteNumber);
    }
    if f == 0.0 {
        out.push('0');
    } else if f.fract() == 0.0 && f.abs() < 1e21 {
        let _ = write!(out, "{f:.0}");
    } else {
        // serde_json prints floats in shortest round-trip form with no `+` in exponents.
        let rendered =
            serde_json::to_string(n).map_err(|err| CanonError::Serialize(err.to_string()))?;
        out.push_str(&rendered);
    }
    Ok(())
}

fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
