// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-sample typed key-value state shared by solvers and tools.
//!
//! Values are a closed union rather than raw JSON so stored data has a
//! stable, typed shape in logs.  Mutations through a [`StoreHandle`] are
//! recorded as `State` events on the sample transcript.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use base64::Engine;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::transcript::{EventBody, Transcript};

/// A stored value.
///
/// Bytes serialise as `{"bytes": "<base64>"}`; a map whose only key is
/// literally `bytes` with a string value would round-trip as `Bytes`, which
/// is the price of the untagged wire form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes { bytes: String },
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn bytes(data: &[u8]) -> Self {
        Self::Bytes { bytes: base64::engine::general_purpose::STANDARD.encode(data) }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Self::Bytes { bytes } => {
                base64::engine::general_purpose::STANDARD.decode(bytes).ok()
            }
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// One recorded store mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreChange {
    pub op: StoreOp,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreOp {
    Set,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Store {
    #[serde(default)]
    data: BTreeMap<String, Value>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> StoreChange {
        let key = key.into();
        self.data.insert(key.clone(), value.clone());
        StoreChange { op: StoreOp::Set, key, value: Some(value) }
    }

    pub fn delete(&mut self, key: &str) -> Option<StoreChange> {
        self.data.remove(key).map(|_| StoreChange {
            op: StoreOp::Delete,
            key: key.to_string(),
            value: None,
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Typed read: deserialise the stored value into `T` via its serde
    /// form.  The caller supplies the schema as the target type.
    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.data.get(key)?;
        let json = serde_json::to_value(value).ok()?;
        serde_json::from_value(json).ok()
    }

    /// Typed write; values that don't fit the [`Value`] union are rejected.
    pub fn set_typed<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<StoreChange, serde_json::Error> {
        let json = serde_json::to_value(value)?;
        let value: Value = serde_json::from_value(json)?;
        Ok(self.set(key, value))
    }
}

/// Shared, transcript-recording view of a sample's store.
///
/// Tools receive a clone at construction; solvers reach it through the task
/// state.  Every mutation is appended to the transcript as a `State` event.
#[derive(Clone, Default)]
pub struct StoreHandle {
    inner: Arc<Mutex<Store>>,
    transcript: Option<Transcript>,
}

impl StoreHandle {
    pub fn new(transcript: Option<Transcript>) -> Self {
        Self { inner: Arc::new(Mutex::new(Store::new())), transcript }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn get_typed<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.inner.lock().unwrap().get_typed(key)
    }

    pub fn set(&self, key: impl Into<String>, value: Value) {
        let change = self.inner.lock().unwrap().set(key, value);
        self.record(vec![change]);
    }

    pub fn set_typed<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let change = self.inner.lock().unwrap().set_typed(key, value)?;
        self.record(vec![change]);
        Ok(())
    }

    pub fn delete(&self, key: &str) {
        if let Some(change) = self.inner.lock().unwrap().delete(key) {
            self.record(vec![change]);
        }
    }

    /// Copy of the current store contents (for serialisation into the log).
    pub fn snapshot(&self) -> Store {
        self.inner.lock().unwrap().clone()
    }

    fn record(&self, changes: Vec<StoreChange>) {
        if let Some(t) = &self.transcript {
            t.record(EventBody::State { changes });
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Value union ───────────────────────────────────────────────────────────

    #[test]
    fn primitives_round_trip() {
        for v in [
            Value::Null,
            Value::Bool(true),
            Value::Int(-3),
            Value::Float(2.5),
            Value::Text("s".into()),
            Value::List(vec![Value::Int(1), Value::Text("x".into())]),
        ] {
            let json = serde_json::to_string(&v).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(back, v);
        }
    }

    #[test]
    fn integers_stay_integers_not_floats() {
        let v: Value = serde_json::from_str("7").unwrap();
        assert_eq!(v, Value::Int(7));
        let v: Value = serde_json::from_str("7.5").unwrap();
        assert_eq!(v, Value::Float(7.5));
    }

    #[test]
    fn bytes_round_trip_through_base64() {
        let v = Value::bytes(&[0, 1, 254, 255]);
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("bytes"));
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back.as_bytes().unwrap(), vec![0, 1, 254, 255]);
    }

    #[test]
    fn as_float_widens_ints() {
        assert_eq!(Value::Int(2).as_float(), Some(2.0));
        assert_eq!(Value::Text("2".into()).as_float(), None);
    }

    // ── Store ─────────────────────────────────────────────────────────────────

    #[test]
    fn set_get_delete() {
        let mut s = Store::new();
        s.set("k", Value::Int(1));
        assert_eq!(s.get("k"), Some(&Value::Int(1)));
        assert!(s.delete("k").is_some());
        assert!(s.get("k").is_none());
        assert!(s.delete("k").is_none());
    }

    #[test]
    fn typed_accessors_round_trip_structs() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Progress {
            step: i64,
            done: bool,
        }
        let mut s = Store::new();
        s.set_typed("progress", &Progress { step: 3, done: false }).unwrap();
        let p: Progress = s.get_typed("progress").unwrap();
        assert_eq!(p, Progress { step: 3, done: false });
    }

    // ── StoreHandle + transcript ──────────────────────────────────────────────

    #[test]
    fn handle_mutations_record_state_events() {
        let t = Transcript::new();
        let h = StoreHandle::new(Some(t.clone()));
        h.set("answer", Value::Int(42));
        h.delete("answer");

        let events = t.events();
        assert_eq!(events.len(), 2);
        match &events[0].body {
            EventBody::State { changes } => {
                assert_eq!(changes[0].op, StoreOp::Set);
                assert_eq!(changes[0].key, "answer");
                assert_eq!(changes[0].value, Some(Value::Int(42)));
            }
            other => panic!("wrong body: {other:?}"),
        }
        match &events[1].body {
            EventBody::State { changes } => assert_eq!(changes[0].op, StoreOp::Delete),
            other => panic!("wrong body: {other:?}"),
        }
    }

    #[test]
    fn handle_clones_share_state() {
        let h = StoreHandle::new(None);
        let h2 = h.clone();
        h.set("shared", Value::Bool(true));
        assert_eq!(h2.get("shared"), Some(Value::Bool(true)));
    }

    #[test]
    fn snapshot_is_a_copy() {
        let h = StoreHandle::new(None);
        h.set("k", Value::Int(1));
        let snap = h.snapshot();
        h.set("k", Value::Int(2));
        assert_eq!(snap.get("k"), Some(&Value::Int(1)));
    }
}
