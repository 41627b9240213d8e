//! Immutable state container derived by folding the log.

use std::collections::BTreeMap;

use crate::canonical::{sha256_hex, to_canonical_bytes, Value};

/// Derived state: `version` equals the number of events folded in, and
/// `aggregates` maps namespace → aggregate id → aggregate value.
///
/// The container is conceptually frozen: every mutator returns a new
/// `State` and leaves the receiver untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    version: u64,
    aggregates: BTreeMap<String, BTreeMap<String, Value>>,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn get_aggregate(&self, namespace: &str, id: &str) -> Option<&Value> {
        self.aggregates.get(namespace).and_then(|m| m.get(id))
    }

    pub fn namespace(&self, namespace: &str) -> Option<&BTreeMap<String, Value>> {
        self.aggregates.get(namespace)
    }

    pub fn namespaces(&self) -> impl Iterator<Item = (&String, &BTreeMap<String, Value>)> {
        self.aggregates.iter()
    }

    /// New state with the aggregate replaced. Does not advance `version`;
    /// the reducer bumps exactly once per folded event.
    #[must_use]
    pub fn set_aggregate(&self, namespace: &str, id: &str, value: Value) -> State {
        let mut aggregates = self.aggregates.clone();
        aggregates
            .entry(namespace.to_string())
            .or_default()
            .insert(id.to_string(), value);
        State {
            version: self.version,
            aggregates,
        }
    }

    #[must_use]
    pub fn bump_version(&self) -> State {
        State {
            version: self.version + 1,
            aggregates: self.aggregates.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut aggs = BTreeMap::new();
        for (ns, m) in &self.aggregates {
            let inner: BTreeMap<String, Value> =
                m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            aggs.insert(ns.clone(), Value::Map(inner));
        }
        let mut top = BTreeMap::new();
        top.insert("aggregates".to_string(), Value::Map(aggs));
        top.insert("version".to_string(), Value::Uint(self.version));
        Value::Map(top)
    }

    pub fn from_value(value: &Value) -> Option<State> {
        let map = value.as_map()?;
        let version = map.get("version")?.as_u64()?;
        let mut aggregates = BTreeMap::new();
        for (ns, inner) in map.get("aggregates")?.as_map()? {
            let mut out = BTreeMap::new();
            for (id, agg) in inner.as_map()? {
                out.insert(id.clone(), agg.clone());
            }
            aggregates.insert(ns.clone(), out);
        }
        Some(State {
            version,
            aggregates,
        })
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        to_canonical_bytes(&self.to_value())
    }

    /// SHA-256 of the canonical state bytes.
    pub fn state_hash(&self) -> String {
        sha256_hex(&self.canonical_bytes())
    }
}
