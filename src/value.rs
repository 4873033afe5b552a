/*
 * Copyright 2020 Joyent, Inc.
 */

//! Untyped call arguments and results.

use std::collections::BTreeMap;
use std::fmt;

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    #[serde(with = "float")]
    Float(f64),
    Str(String),
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn bytes<B: Into<Vec<u8>>>(b: B) -> Value {
        Value::Bytes(b.into())
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l.as_slice()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    /// Convert a plain JSON document, as typed on a command line.  Integers
    /// that do not fit an `i64` become floats.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(a) => {
                Value::List(a.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(o) => Value::Map(
                o.into_iter().map(|(k, v)| (k, Value::from_json(v))).collect(),
            ),
        }
    }

    /// The inverse of `from_json`.  Blobs are rendered as hex strings.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) if !f.is_finite() => {
                serde_json::Value::String(float::special_name(*f).to_string())
            }
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
            Value::List(l) => {
                serde_json::Value::Array(l.iter().map(Value::to_json).collect())
            }
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// JSON has no literal for NaN or the infinities, so those travel as the
/// strings `"NaN"`, `"inf"` and `"-inf"`.
mod float {
    use serde::de::{self, Deserializer};
    use serde::ser::Serializer;
    use serde_derive::Deserialize;

    pub(super) fn special_name(f: f64) -> &'static str {
        if f.is_nan() {
            "NaN"
        } else if f > 0.0 {
            "inf"
        } else {
            "-inf"
        }
    }

    pub fn serialize<S: Serializer>(f: &f64, s: S) -> Result<S::Ok, S::Error> {
        if f.is_finite() {
            s.serialize_f64(*f)
        } else {
            s.serialize_str(special_name(*f))
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Special(String),
    }

    pub fn deserialize<'de, D>(d: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match <Repr as de::Deserialize>::deserialize(d)? {
            Repr::Number(f) => Ok(f),
            Repr::Special(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(de::Error::custom(format!(
                    "invalid float {:?}",
                    other
                ))),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(m: BTreeMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

/// A declared positional argument type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    Any,
    Null,
    Bool,
    Int,
    Float,
    Number,
    Str,
    Bytes,
    List,
    Map,
}

impl ArgType {
    pub fn accepts(self, v: &Value) -> bool {
        match (self, v) {
            (ArgType::Any, _) => true,
            (ArgType::Null, Value::Null) => true,
            (ArgType::Bool, Value::Bool(_)) => true,
            (ArgType::Int, Value::Int(_)) => true,
            (ArgType::Float, Value::Float(_)) => true,
            (ArgType::Number, Value::Int(_)) => true,
            (ArgType::Number, Value::Float(_)) => true,
            (ArgType::Str, Value::Str(_)) => true,
            (ArgType::Bytes, Value::Bytes(_)) => true,
            (ArgType::List, Value::List(_)) => true,
            (ArgType::Map, Value::Map(_)) => true,
            _ => false,
        }
    }
}

/// Check positional arguments against a declared signature, returning a
/// description of the first mismatch.
pub fn check_signature(
    signature: &[ArgType],
    args: &[Value],
) -> Result<(), String> {
    if signature.len() != args.len() {
        return Err(format!(
            "expected {} arguments, got {}",
            signature.len(),
            args.len()
        ));
    }

    for (i, (expected, actual)) in signature.iter().zip(args).enumerate() {
        if !expected.accepts(actual) {
            return Err(format!(
                "argument {} should be {:?}, got {}",
                i,
                expected,
                actual.type_name()
            ));
        }
    }

    Ok(())
}
