//! Process-wide shared state
//!
//! A named-variable registry visible to every handler, whatever its
//! language. One [`SharedStateStore`] is created with the host and injected
//! into every runspace and delegate; nothing reaches it through statics.
//!
//! # Value model
//!
//! Only shared, mutably-aliasable values can be stored. Every
//! [`SharedValue`] variant is a handle (`Arc`) to interior-mutable data, so a
//! value fetched by one request and mutated is the same value every other
//! request sees. Plain JSON numbers, booleans and null are rejected: a stored
//! copy of `5` could never be mutated in place. Strings are accepted and
//! stored as a shared text cell.
//!
//! # Atomicity
//!
//! The store guarantees atomic get/set/remove of a named slot. Compound
//! updates on a value are the value's concern: [`SharedTable::increment`]
//! and [`SharedCounter::add`] are atomic, a get-then-set sequence is not.

use serde_json::{Map, Value};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kestrun_common::{KestrunError, Result};

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, mutable hashtable.
#[derive(Clone, Default)]
pub struct SharedTable(Arc<RwLock<Map<String, Value>>>);

impl SharedTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(Arc::new(RwLock::new(map)))
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        read(&self.0).get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        write(&self.0).insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        write(&self.0).remove(key)
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    /// Adds `delta` to the integer under `key` and returns the new value.
    ///
    /// A missing key starts from zero. The read-modify-write happens under
    /// the table's write lock, so concurrent increments never lose updates.
    pub fn increment(&self, key: &str, delta: i64) -> Result<i64> {
        let mut map = write(&self.0);
        let current = match map.get(key) {
            None | Some(Value::Null) => 0,
            Some(value) => value.as_i64().ok_or_else(|| {
                KestrunError::Validation(format!("value under '{}' is not an integer", key))
            })?,
        };
        let updated = current.checked_add(delta).ok_or_else(|| {
            KestrunError::Validation(format!("increment of '{}' overflowed", key))
        })?;
        map.insert(key.to_string(), Value::from(updated));
        Ok(updated)
    }

    pub fn to_json(&self) -> Value {
        Value::Object(read(&self.0).clone())
    }
}

/// Shared, mutable list.
#[derive(Clone, Default)]
pub struct SharedList(Arc<RwLock<Vec<Value>>>);

impl SharedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Self(Arc::new(RwLock::new(items)))
    }

    pub fn push(&self, value: Value) {
        write(&self.0).push(value);
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        read(&self.0).get(index).cloned()
    }

    pub fn len(&self) -> usize {
        read(&self.0).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.0).is_empty()
    }

    pub fn to_json(&self) -> Value {
        Value::Array(read(&self.0).clone())
    }
}

/// Shared, mutable string cell.
#[derive(Clone, Default)]
pub struct SharedText(Arc<RwLock<String>>);

impl SharedText {
    pub fn new(text: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(text.into())))
    }

    pub fn get(&self) -> String {
        read(&self.0).clone()
    }

    pub fn set(&self, text: impl Into<String>) {
        *write(&self.0) = text.into();
    }
}

/// Shared interlocked counter.
#[derive(Clone, Default)]
pub struct SharedCounter(Arc<AtomicI64>);

impl SharedCounter {
    pub fn new(initial: i64) -> Self {
        Self(Arc::new(AtomicI64::new(initial)))
    }

    /// Atomically adds `delta` and returns the new value.
    pub fn add(&self, delta: i64) -> i64 {
        self.0.fetch_add(delta, Ordering::SeqCst).wrapping_add(delta)
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// A value held by the shared state store.
#[derive(Clone)]
pub enum SharedValue {
    Table(SharedTable),
    List(SharedList),
    Text(SharedText),
    Counter(SharedCounter),
    Native(Arc<dyn Any + Send + Sync>),
}

impl SharedValue {
    /// Wraps a JSON value in the matching shared container.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for numbers, booleans and null. Wrap numbers
    /// that need shared mutation in a [`SharedCounter`] instead.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(SharedValue::Table(SharedTable::from_map(map))),
            Value::Array(items) => Ok(SharedValue::List(SharedList::from_vec(items))),
            Value::String(text) => Ok(SharedValue::Text(SharedText::new(text))),
            other => Err(KestrunError::Validation(format!(
                "shared state only holds reference types (object, array, string, counter); got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn native<T: Any + Send + Sync>(value: T) -> Self {
        SharedValue::Native(Arc::new(value))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SharedValue::Table(_) => "table",
            SharedValue::List(_) => "list",
            SharedValue::Text(_) => "text",
            SharedValue::Counter(_) => "counter",
            SharedValue::Native(_) => "native",
        }
    }

    /// JSON copy of the current contents. Native values render as null.
    pub fn to_json(&self) -> Value {
        match self {
            SharedValue::Table(table) => table.to_json(),
            SharedValue::List(list) => list.to_json(),
            SharedValue::Text(text) => Value::String(text.get()),
            SharedValue::Counter(counter) => Value::from(counter.get()),
            SharedValue::Native(_) => Value::Null,
        }
    }
}

impl fmt::Debug for SharedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SharedValue::Native(_) => write!(f, "Native(..)"),
            other => write!(f, "{}({})", other.kind(), other.to_json()),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl From<SharedTable> for SharedValue {
    fn from(value: SharedTable) -> Self {
        SharedValue::Table(value)
    }
}

impl From<SharedList> for SharedValue {
    fn from(value: SharedList) -> Self {
        SharedValue::List(value)
    }
}

impl From<SharedText> for SharedValue {
    fn from(value: SharedText) -> Self {
        SharedValue::Text(value)
    }
}

impl From<SharedCounter> for SharedValue {
    fn from(value: SharedCounter) -> Self {
        SharedValue::Counter(value)
    }
}

impl From<&str> for SharedValue {
    fn from(value: &str) -> Self {
        SharedValue::Text(SharedText::new(value))
    }
}

impl From<String> for SharedValue {
    fn from(value: String) -> Self {
        SharedValue::Text(SharedText::new(value))
    }
}

/// Typed extraction for [`SharedStateStore::try_get_as`].
pub trait FromSharedValue: Sized {
    fn from_shared(value: &SharedValue) -> Option<Self>;
}

impl FromSharedValue for SharedTable {
    fn from_shared(value: &SharedValue) -> Option<Self> {
        match value {
            SharedValue::Table(table) => Some(table.clone()),
            _ => None,
        }
    }
}

impl FromSharedValue for SharedList {
    fn from_shared(value: &SharedValue) -> Option<Self> {
        match value {
            SharedValue::List(list) => Some(list.clone()),
            _ => None,
        }
    }
}

impl FromSharedValue for SharedText {
    fn from_shared(value: &SharedValue) -> Option<Self> {
        match value {
            SharedValue::Text(text) => Some(text.clone()),
            _ => None,
        }
    }
}

impl FromSharedValue for SharedCounter {
    fn from_shared(value: &SharedValue) -> Option<Self> {
        match value {
            SharedValue::Counter(counter) => Some(counter.clone()),
            _ => None,
        }
    }
}

impl FromSharedValue for String {
    fn from_shared(value: &SharedValue) -> Option<Self> {
        match value {
            SharedValue::Text(text) => Some(text.get()),
            _ => None,
        }
    }
}

/// What `set` does when the name is already defined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinePolicy {
    /// Replace the existing value.
    #[default]
    Overwrite,
    /// Keep the existing value; `set` returns `Ok(false)`.
    RejectDuplicates,
}

struct Entry {
    name: String,
    value: SharedValue,
}

/// Process-wide named-value registry.
///
/// Lookups are case-insensitive; the name as first defined is kept for
/// snapshots.
#[derive(Default)]
pub struct SharedStateStore {
    entries: RwLock<HashMap<String, Entry>>,
    policy: DefinePolicy,
}

impl SharedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(policy: DefinePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> DefinePolicy {
        self.policy
    }

    /// Defines or replaces a named value.
    ///
    /// Returns `Ok(false)` when the name exists and the store rejects
    /// duplicates.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if `name` is not an identifier.
    pub fn set(&self, name: &str, value: impl Into<SharedValue>) -> Result<bool> {
        validate_name(name)?;
        let value = value.into();
        let key = name.to_ascii_lowercase();

        let mut entries = write(&self.entries);
        if self.policy == DefinePolicy::RejectDuplicates && entries.contains_key(&key) {
            tracing::debug!("Shared variable '{}' already defined, keeping existing value", name);
            return Ok(false);
        }

        tracing::trace!("Defining shared variable '{}' ({})", name, value.kind());
        entries.insert(
            key,
            Entry {
                name: name.to_string(),
                value,
            },
        );
        Ok(true)
    }

    /// Defines a value from JSON, wrapping it with [`SharedValue::from_json`].
    pub fn set_json(&self, name: &str, value: Value) -> Result<bool> {
        validate_name(name)?;
        self.set(name, SharedValue::from_json(value)?)
    }

    /// Case-insensitive lookup. The returned handle aliases the stored value.
    pub fn try_get(&self, name: &str) -> Option<SharedValue> {
        read(&self.entries)
            .get(&name.to_ascii_lowercase())
            .map(|entry| entry.value.clone())
    }

    /// Lookup that also fails on a type mismatch.
    pub fn try_get_as<T: FromSharedValue>(&self, name: &str) -> Option<T> {
        self.try_get(name).and_then(|value| T::from_shared(&value))
    }

    /// Lookup of a native value by concrete type.
    pub fn try_get_native<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        match self.try_get(name)? {
            SharedValue::Native(value) => value.downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Adds `delta` to a counter, or to `key` of a table, atomically.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the name is undefined, a table increment has
    /// no key, or the value cannot be incremented.
    pub fn increment(&self, name: &str, key: Option<&str>, delta: i64) -> Result<i64> {
        let value = self
            .try_get(name)
            .ok_or_else(|| KestrunError::Validation(format!("shared variable '{}' is not defined", name)))?;

        match (value, key) {
            (SharedValue::Counter(counter), _) => Ok(counter.add(delta)),
            (SharedValue::Table(table), Some(key)) => table.increment(key, delta),
            (SharedValue::Table(_), None) => Err(KestrunError::Validation(format!(
                "incrementing table '{}' requires a key",
                name
            ))),
            (other, _) => Err(KestrunError::Validation(format!(
                "shared variable '{}' is a {} and cannot be incremented",
                name,
                other.kind()
            ))),
        }
    }

    pub fn remove(&self, name: &str) -> bool {
        write(&self.entries).remove(&name.to_ascii_lowercase()).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        read(&self.entries).contains_key(&name.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        read(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.entries).is_empty()
    }

    /// Point-in-time copy of all entries, keyed by their defined names.
    ///
    /// The values are handles; later mutation through them is visible.
    pub fn snapshot(&self) -> BTreeMap<String, SharedValue> {
        read(&self.entries)
            .values()
            .map(|entry| (entry.name.clone(), entry.value.clone()))
            .collect()
    }

    /// Point-in-time JSON rendering of all entries, for diagnostics.
    pub fn snapshot_json(&self) -> Map<String, Value> {
        self.snapshot()
            .into_iter()
            .map(|(name, value)| (name, value.to_json()))
            .collect()
    }

    pub fn key_snapshot(&self) -> BTreeSet<String> {
        read(&self.entries).values().map(|entry| entry.name.clone()).collect()
    }
}

impl fmt::Debug for SharedStateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStateStore")
            .field("keys", &self.key_snapshot())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Names are identifiers: a letter or underscore, then letters, digits or
/// underscores.
pub fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(KestrunError::Validation(format!(
            "'{}' is not a valid shared variable name",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::thread;

    #[test]
    fn test_name_validation() {
        let store = SharedStateStore::new();
        assert!(matches!(store.set_json("1bad", json!({})), Err(KestrunError::Validation(_))));
        assert!(matches!(store.set_json("bad-name", json!({})), Err(KestrunError::Validation(_))));
        assert!(matches!(store.set_json("", json!({})), Err(KestrunError::Validation(_))));
        assert!(store.set_json("ok_1", json!({"a": 1})).unwrap());
        assert!(store.set_json("_private", json!([])).unwrap());
    }

    #[test]
    fn test_primitive_values_rejected() {
        let store = SharedStateStore::new();
        assert!(matches!(store.set_json("num", json!(123)), Err(KestrunError::Validation(_))));
        assert!(matches!(store.set_json("flag", json!(true)), Err(KestrunError::Validation(_))));
        assert!(matches!(store.set_json("nothing", Value::Null), Err(KestrunError::Validation(_))));
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_name_checked_before_value() {
        let store = SharedStateStore::new();
        let err = store.set_json("9lives", json!(9)).unwrap_err();
        assert!(err.to_string().contains("9lives"));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let store = SharedStateStore::new();
        store.set("Bar", "baz").unwrap();
        assert_eq!(store.try_get_as::<String>("bar").as_deref(), Some("baz"));
        assert_eq!(store.try_get_as::<String>("BAR").as_deref(), Some("baz"));
        assert!(store.contains("bAr"));
        assert_eq!(store.key_snapshot().into_iter().collect::<Vec<_>>(), vec!["Bar"]);
    }

    #[test]
    fn test_type_mismatch_is_absent() {
        let store = SharedStateStore::new();
        store.set("Visits", SharedTable::new()).unwrap();
        assert!(store.try_get_as::<SharedTable>("visits").is_some());
        assert!(store.try_get_as::<SharedList>("visits").is_none());
        assert!(store.try_get_as::<String>("visits").is_none());
        assert!(store.try_get("missing").is_none());
    }

    #[test]
    fn test_values_alias() {
        let store = SharedStateStore::new();
        store.set_json("Config", json!({"mode": "a"})).unwrap();

        let table = store.try_get_as::<SharedTable>("config").unwrap();
        table.set("mode", json!("b"));

        let again = store.try_get_as::<SharedTable>("CONFIG").unwrap();
        assert_eq!(again.get("mode"), Some(json!("b")));
    }

    #[test]
    fn test_reject_duplicates_policy() {
        let store = SharedStateStore::with_policy(DefinePolicy::RejectDuplicates);
        assert!(store.set("Name", "first").unwrap());
        assert!(!store.set("name", "second").unwrap());
        assert_eq!(store.try_get_as::<String>("NAME").as_deref(), Some("first"));
    }

    #[test]
    fn test_overwrite_policy() {
        let store = SharedStateStore::new();
        assert!(store.set("Name", "first").unwrap());
        assert!(store.set("NAME", "second").unwrap());
        assert_eq!(store.try_get_as::<String>("name").as_deref(), Some("second"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove() {
        let store = SharedStateStore::new();
        store.set("Temp", SharedList::new()).unwrap();
        assert!(store.remove("temp"));
        assert!(!store.remove("temp"));
        assert!(!store.contains("Temp"));
    }

    #[test]
    fn test_native_values() {
        struct Settings {
            retries: u32,
        }

        let store = SharedStateStore::new();
        store.set("Settings", SharedValue::native(Settings { retries: 3 })).unwrap();
        assert_eq!(store.try_get_native::<Settings>("settings").unwrap().retries, 3);
        assert!(store.try_get_native::<String>("settings").is_none());
        assert_eq!(store.snapshot_json()["Settings"], Value::Null);
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let store = SharedStateStore::new();
        store.set("A", "1").unwrap();
        let snapshot = store.snapshot();
        store.set("B", "2").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_increment_table_and_counter() {
        let store = SharedStateStore::new();
        store.set_json("Visits", json!({"Count": 0})).unwrap();
        store.set("Hits", SharedCounter::new(10)).unwrap();

        assert_eq!(store.increment("visits", Some("Count"), 1).unwrap(), 1);
        assert_eq!(store.increment("visits", Some("Other"), 5).unwrap(), 5);
        assert_eq!(store.increment("hits", None, 2).unwrap(), 12);

        assert!(store.increment("visits", None, 1).is_err());
        assert!(store.increment("missing", Some("x"), 1).is_err());

        store.set("Label", "x").unwrap();
        assert!(store.increment("label", None, 1).is_err());
    }

    #[test]
    fn test_increment_non_integer_fails() {
        let table = SharedTable::new();
        table.set("Name", json!("text"));
        assert!(matches!(table.increment("Name", 1), Err(KestrunError::Validation(_))));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(SharedStateStore::new());
        store.set_json("Visits", json!({"Count": 0})).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..250 {
                        store.increment("Visits", Some("Count"), 1).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let table = store.try_get_as::<SharedTable>("visits").unwrap();
        assert_eq!(table.get("Count"), Some(json!(2000)));
    }
}
