//! The key-value status map and its lock discipline.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;

/// A status scalar.  Typed getters perform the obvious widenings (an `Int`
/// can be read back as a `Real`) but never parse strings.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint(u64),
    Int(i64),
    Real(f64),
    Text(String),
}

/// Cloneable handle on the shared status map.
#[derive(Clone, Default)]
pub struct StatusStore {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the status lock.  Hold the guard only for a batch of gets and
    /// puts; drop it before any I/O or ring wait.
    pub fn lock(&self) -> StatusGuard<'_> {
        StatusGuard {
            map: self.inner.lock(),
        }
    }
}

pub struct StatusGuard<'a> {
    map: MutexGuard<'a, HashMap<String, Value>>,
}

impl StatusGuard<'_> {
    pub fn put_u64(&mut self, key: &str, v: u64) {
        self.map.insert(key.to_owned(), Value::Uint(v));
    }

    pub fn put_i64(&mut self, key: &str, v: i64) {
        self.map.insert(key.to_owned(), Value::Int(v));
    }

    pub fn put_f64(&mut self, key: &str, v: f64) {
        self.map.insert(key.to_owned(), Value::Real(v));
    }

    pub fn put_str(&mut self, key: &str, v: &str) {
        self.map.insert(key.to_owned(), Value::Text(v.to_owned()));
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.map.get(key)? {
            Value::Uint(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.map.get(key)? {
            Value::Int(v) => Some(*v),
            Value::Uint(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        match self.map.get(key)? {
            Value::Real(v) => Some(*v),
            Value::Uint(v) => Some(*v as f64),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.map.get(key)? {
            Value::Text(v) => Some(v.clone()),
            _ => None,
        }
    }

    /// Remove a key (used to retire hold-off flags once observed).
    pub fn del(&mut self, key: &str) {
        self.map.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_roundtrip() {
        let st = StatusStore::new();
        {
            let mut g = st.lock();
            g.put_u64("NETBCNT", 42);
            g.put_f64("DISKGBPS", 3.5);
            g.put_str("NETSTAT", "running");
        }
        let g = st.lock();
        assert_eq!(g.get_u64("NETBCNT"), Some(42));
        assert_eq!(g.get_f64("DISKGBPS"), Some(3.5));
        assert_eq!(g.get_str("NETSTAT").as_deref(), Some("running"));
        assert_eq!(g.get_u64("MISSING"), None);
    }

    #[test]
    fn widening_but_no_string_parsing() {
        let st = StatusStore::new();
        st.lock().put_i64("TIMEIDX", 1);
        assert_eq!(st.lock().get_u64("TIMEIDX"), Some(1));
        assert_eq!(st.lock().get_f64("TIMEIDX"), Some(1.0));

        st.lock().put_str("TRIGGER", "1");
        assert_eq!(st.lock().get_u64("TRIGGER"), None);
    }

    #[test]
    fn handles_share_one_map() {
        let a = StatusStore::new();
        let b = a.clone();
        a.lock().put_u64("NDONEFIL", 7);
        assert_eq!(b.lock().get_u64("NDONEFIL"), Some(7));
        b.lock().del("NDONEFIL");
        assert!(!a.lock().contains("NDONEFIL"));
    }
}
