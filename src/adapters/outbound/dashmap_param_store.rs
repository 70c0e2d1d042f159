//! DashMap Parameter Store
//!
//! Implements ParamStore using DashMap for lock-free concurrent access.
//! Values live for the lifetime of the process.

use crate::domain::ports::ParamStore;
use dashmap::DashMap;

#[derive(Debug, Default)]
pub struct DashMapParamStore {
    bools: DashMap<String, bool>,
}

impl DashMapParamStore {
    pub fn new() -> Self {
        Self {
            bools: DashMap::new(),
        }
    }
}

impl ParamStore for DashMapParamStore {
    fn get_bool(&self, key: &str) -> Option<bool> {
        self.bools.get(key).map(|e| *e.value())
    }

    fn set_bool(&self, key: &str, value: bool) {
        self.bools.insert(key.to_string(), value);
    }
}
