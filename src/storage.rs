// File: src/storage.rs
//
// Per-VM variable store and named-function registry. Storage itself never
// fails; typing is enforced by the opcode that reads a variable.

use crate::value::Value;
use std::collections::HashMap;

/// Registry entry recorded by `DEF_FUNC` and consumed by `CALL_FUNC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    /// Stream position of the first body instruction.
    pub entry_pc: usize,
    pub param_count: usize,
}

/// Variable bindings and function registrations for one VM run. A VM owns
/// its storage exclusively; the contract manager moves the data map in and
/// out around each invocation.
#[derive(Debug, Clone, Default)]
pub struct Storage {
    data: HashMap<String, Value>,
    functions: HashMap<String, FunctionInfo>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the variable map, e.g. from a contract's persisted state.
    /// Function registrations always start empty: entry pcs are positions
    /// in the stream about to run, not durable state.
    pub fn from_data(data: HashMap<String, Value>) -> Self {
        Self { data, functions: HashMap::new() }
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.data.insert(key.into(), value);
    }

    /// Reads of unbound variables yield the integer zero.
    pub fn get(&self, key: &str) -> Value {
        self.data.get(key).cloned().unwrap_or(Value::Int(0))
    }

    pub fn delete(&mut self, key: &str) {
        self.data.remove(key);
    }

    pub fn has(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    pub fn define_function(&mut self, name: impl Into<String>, entry_pc: usize, param_count: usize) {
        self.functions.insert(name.into(), FunctionInfo { entry_pc, param_count });
    }

    pub fn lookup_function(&self, name: &str) -> Option<FunctionInfo> {
        self.functions.get(name).copied()
    }

    pub fn data(&self) -> &HashMap<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> HashMap<String, Value> {
        self.data
    }

    pub fn vars(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.data.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbound_reads_yield_zero() {
        let storage = Storage::new();
        assert_eq!(storage.get("missing"), Value::Int(0));
        assert!(!storage.has("missing"));
    }

    #[test]
    fn test_set_get_delete() {
        let mut storage = Storage::new();
        storage.set("x", Value::Int(41));
        assert!(storage.has("x"));
        assert_eq!(storage.get("x"), Value::Int(41));

        storage.set("x", Value::str("now a string"));
        assert_eq!(storage.get("x"), Value::str("now a string"));

        storage.delete("x");
        assert!(!storage.has("x"));
        assert_eq!(storage.get("x"), Value::Int(0));

        // Deleting an unbound key is a no-op.
        storage.delete("x");
    }

    #[test]
    fn test_function_registry() {
        let mut storage = Storage::new();
        assert!(storage.lookup_function("inc").is_none());

        storage.define_function("inc", 5, 1);
        let info = storage.lookup_function("inc").expect("registered");
        assert_eq!(info.entry_pc, 5);
        assert_eq!(info.param_count, 1);

        // Redefinition overwrites.
        storage.define_function("inc", 9, 2);
        assert_eq!(storage.lookup_function("inc").map(|f| f.entry_pc), Some(9));
    }

    #[test]
    fn test_from_data_starts_with_empty_registry() {
        let mut data = HashMap::new();
        data.insert("balance".to_string(), Value::Int(100));
        let storage = Storage::from_data(data);
        assert_eq!(storage.get("balance"), Value::Int(100));
        assert!(storage.lookup_function("anything").is_none());
    }
}
