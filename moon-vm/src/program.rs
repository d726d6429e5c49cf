use std::collections::HashMap;
use std::hash::Hash;

use crate::debug_info::DebugInfo;

/// Values that can live in a [`ConstantPool`]. The key decides which entries are
/// considered the same constant.
pub trait PoolEntry: Clone {
    type Key: Eq + Hash;

    fn pool_key(&self) -> Self::Key;
}

impl PoolEntry for f64 {
    type Key = u64;

    fn pool_key(&self) -> u64 {
        self.to_bits()
    }
}

impl PoolEntry for String {
    type Key = String;

    fn pool_key(&self) -> String {
        self.clone()
    }
}

/// Ordered, deduplicating table handing out stable ids.
#[derive(Clone, Debug)]
pub struct ConstantPool<T: PoolEntry> {
    items: Vec<T>,
    ids: HashMap<T::Key, u32>,
}

impl<T: PoolEntry> Default for ConstantPool<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            ids: HashMap::new(),
        }
    }
}

impl<T: PoolEntry> ConstantPool<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, value: T) -> u32 {
        let key = value.pool_key();
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = self.items.len() as u32;
        self.items.push(value);
        self.ids.insert(key, id);
        id
    }

    pub fn get(&self, id: u32) -> Option<&T> {
        self.items.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

/// A compiled guest program. Immutable once produced; the interpreter shares it
/// behind an `Rc` between every closure that points into it.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub code: Vec<u8>,
    pub numbers: Vec<f64>,
    pub strings: Vec<String>,
    pub debug: Option<DebugInfo>,
}

impl Program {
    pub fn new(code: Vec<u8>, numbers: Vec<f64>, strings: Vec<String>) -> Self {
        Self {
            code,
            numbers,
            strings,
            debug: None,
        }
    }

    pub fn with_debug(
        code: Vec<u8>,
        numbers: Vec<f64>,
        strings: Vec<String>,
        debug: Option<DebugInfo>,
    ) -> Self {
        Self {
            code,
            numbers,
            strings,
            debug,
        }
    }

    pub fn number(&self, id: u32) -> Option<f64> {
        self.numbers.get(id as usize).copied()
    }

    pub fn string(&self, id: u32) -> Option<&str> {
        self.strings.get(id as usize).map(String::as_str)
    }

    /// Function name and `file: line` for a code offset, when debug info is present.
    pub fn describe_offset(&self, offset: usize) -> Option<String> {
        let debug = self.debug.as_ref()?;
        let function = debug
            .function_for_offset(offset)
            .and_then(|entry| self.string(entry.name))
            .unwrap_or("<unknown>");
        let line = debug.line_for_offset(offset)?;
        let file = self.string(line.file).unwrap_or("<unknown>");
        Some(format!("at {function} in {file}: line {}", line.line))
    }
}
