//! Message codec (C1): frames a dictionary of typed values to/from the
//! wire's JSON envelope, tagging byte blobs with a `_base64` key suffix.
//!
//! `Frame` is a single dynamic `map<string, Value>` (see the data-model
//! design note): the protocol's reserved-key set is stable but every stage
//! only ever touches a handful of the keys any given message carries, and
//! several stages pass whole nested `audio_config` frames through
//! untouched. A fixed struct-per-shape would need one type per row of the
//! wire-shape table for no benefit over typed accessors.

use crate::error::{PipelineError, Result};
use base64::Engine;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;

/// One value a [`Frame`] key can hold.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Bytes(Vec<u8>),
    Nested(Frame),
}

impl Value {
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b.as_slice()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Value::Nested(f) => Some(f),
            _ => None,
        }
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
impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
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
impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}
impl From<Frame> for Value {
    fn from(f: Frame) -> Self {
        Value::Nested(f)
    }
}

/// A message on the wire: a dictionary of typed values. See the data-model
/// section for the reserved key set (`id`, `status`, `action`, `audio`,
/// `audio_config`/`config`, `text`, `save_path`, `topic`, `chat_mode`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame(BTreeMap<String, Value>);

impl Frame {
    #[must_use]
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Builder-style insert, for constructing a frame in one expression.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Merge `other`'s keys into `self`, overwriting on conflict. Used by
    /// stages that re-tag a forwarded frame with a local key (e.g. STT
    /// attaching `save_path` to a chat-forwarded reply before relaying it
    /// to the client).
    pub fn merge(&mut self, other: Frame) {
        self.0.extend(other.0);
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.get("id").and_then(Value::as_str)
    }

    #[must_use]
    pub fn status(&self) -> Option<&str> {
        self.get("status").and_then(Value::as_str)
    }

    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.get("action").and_then(Value::as_str)
    }

    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.get("text").and_then(Value::as_str)
    }

    #[must_use]
    pub fn audio(&self) -> Option<&[u8]> {
        self.get("audio").and_then(Value::as_bytes)
    }

    #[must_use]
    pub fn save_path(&self) -> Option<&str> {
        self.get("save_path").and_then(Value::as_str)
    }

    #[must_use]
    pub fn chat_mode(&self) -> bool {
        self.get("chat_mode").and_then(Value::as_bool).unwrap_or(false)
    }

    /// A `{id, status: RESET}` frame for the given id.
    #[must_use]
    pub fn reset(id: &str) -> Self {
        Frame::new().with("id", id).with("status", "RESET")
    }
}

impl FromIterator<(String, Value)> for Frame {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a Frame {
    type Item = (&'a String, &'a Value);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Encode a frame to its JSON wire form. Total: cannot fail on a well-typed
/// [`Frame`], since every [`Value`] variant has a lossless JSON rendering.
#[must_use]
pub fn encode(frame: &Frame) -> String {
    let json = frame_to_json(frame);
    // `Map<String, Value>` always serializes; this cannot fail.
    serde_json::to_string(&json).unwrap_or_else(|_| "{}".to_string())
}

/// Decode a frame from its JSON wire form.
///
/// # Errors
///
/// Returns [`PipelineError::BadFrame`] if `data` is not valid JSON, is not a
/// JSON object, contains an array (unsupported), or has a `_base64`-suffixed
/// key whose value is not valid base64.
pub fn decode(data: &str) -> Result<Frame> {
    let json: JsonValue =
        serde_json::from_str(data).map_err(|e| PipelineError::BadFrame(e.to_string()))?;
    json_to_frame(&json)
}

fn frame_to_json(frame: &Frame) -> JsonValue {
    let mut map = Map::new();
    for (key, value) in frame.iter() {
        match value {
            Value::Bytes(bytes) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
                map.insert(format!("{key}_base64"), JsonValue::String(encoded));
            }
            Value::Nested(inner) => {
                map.insert(key.clone(), frame_to_json(inner));
            }
            other => {
                map.insert(key.clone(), value_to_json(other));
            }
        }
    }
    JsonValue::Object(map)
}

fn value_to_json(value: &Value) -> JsonValue {
    match value {
        Value::Str(s) => JsonValue::String(s.clone()),
        Value::Int(i) => JsonValue::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Bool(b) => JsonValue::Bool(*b),
        Value::Null => JsonValue::Null,
        Value::Bytes(_) | Value::Nested(_) => {
            unreachable!("bytes and nested frames are tagged by the caller")
        }
    }
}

fn json_to_frame(json: &JsonValue) -> Result<Frame> {
    let obj = json
        .as_object()
        .ok_or_else(|| PipelineError::BadFrame("expected a JSON object".to_string()))?;
    let mut frame = Frame::new();
    for (key, value) in obj {
        if let Some(stem) = key.strip_suffix("_base64") {
            let encoded = value
                .as_str()
                .ok_or_else(|| PipelineError::BadFrame(format!("{key} must be a string")))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(encoded)
                .map_err(|e| PipelineError::BadFrame(e.to_string()))?;
            frame.insert(stem.to_string(), Value::Bytes(bytes));
        } else {
            frame.insert(key.clone(), json_to_value(value)?);
        }
    }
    Ok(frame)
}

fn json_to_value(value: &JsonValue) -> Result<Value> {
    match value {
        JsonValue::String(s) => Ok(Value::Str(s.clone())),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::Int(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::Float(f))
            } else {
                Err(PipelineError::BadFrame(format!("unrepresentable number: {n}")))
            }
        }
        JsonValue::Bool(b) => Ok(Value::Bool(*b)),
        JsonValue::Null => Ok(Value::Null),
        JsonValue::Object(_) => Ok(Value::Nested(json_to_frame(value)?)),
        JsonValue::Array(_) => Err(PipelineError::BadFrame(
            "arrays are not a supported frame value".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame::new()
            .with("id", "u1")
            .with("status", "RECORDING")
            .with("audio", vec![1u8, 2, 3, 255])
            .with(
                "audio_config",
                Frame::new().with("format", 8i64).with("channels", 1i64).with("rate", 16_000i64),
            )
    }

    #[test]
    fn round_trips_well_typed_frame() {
        let frame = sample_frame();
        let decoded = decode(&encode(&frame)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn blob_key_suffix_does_not_leak_into_decoded_frame() {
        let encoded = encode(&sample_frame());
        assert!(encoded.contains("audio_base64"));
        let decoded = decode(&encoded).unwrap();
        assert!(decoded.contains_key("audio"));
        assert!(!decoded.contains_key("audio_base64"));
    }

    #[test]
    fn nested_frame_blob_is_tagged_at_its_own_level() {
        let inner = Frame::new().with("payload", vec![9u8, 9]);
        let outer = Frame::new().with("id", "u1").with("audio_config", inner);
        let encoded = encode(&outer);
        assert!(encoded.contains("payload_base64"));
        let decoded = decode(&encoded).unwrap();
        let nested = decoded.get("audio_config").and_then(Value::as_frame).unwrap();
        assert_eq!(nested.get("payload").and_then(Value::as_bytes), Some([9u8, 9].as_slice()));
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(decode("not json").is_err());
    }

    #[test]
    fn decode_rejects_invalid_base64() {
        assert!(decode(r#"{"id":"u1","audio_base64":"not-base64!!"}"#).is_err());
    }

    #[test]
    fn decode_rejects_non_object_top_level() {
        assert!(decode("[1,2,3]").is_err());
    }

    #[test]
    fn reset_frame_has_no_id_other_than_target() {
        let frame = Frame::reset("u2");
        assert_eq!(frame.id(), Some("u2"));
        assert_eq!(frame.status(), Some("RESET"));
    }
}
