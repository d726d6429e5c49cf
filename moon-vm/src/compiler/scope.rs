use std::collections::HashMap;

/// Where a name lives: a slot in the argument or local frame of the function
/// at lexical `depth` (the top-level program is depth 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Address {
    pub depth: i32,
    pub slot: i32,
    pub is_argument: bool,
    pub read_only: bool,
}

impl Address {
    /// Depth operand as encoded in `ldloc`/`stloc`: argument frames are negative.
    pub fn encoded_depth(self) -> i32 {
        if self.is_argument {
            -self.depth
        } else {
            self.depth
        }
    }
}

#[derive(Debug)]
struct BlockScope {
    depth: i32,
    names: HashMap<String, Address>,
}

/// Lexical scope chain shared by every function being compiled.
///
/// Block scopes inside one function share that function's slot counter, so
/// closing a block forgets its names without reusing their storage.
#[derive(Debug, Default)]
pub struct ScopeChain {
    blocks: Vec<BlockScope>,
    next_slot: Vec<i32>,
}

impl ScopeChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Depth of the innermost open function, or -1 before any is opened.
    pub fn depth(&self) -> i32 {
        self.next_slot.len() as i32 - 1
    }

    pub fn push_function(&mut self) {
        self.next_slot.push(0);
        let depth = self.depth();
        self.blocks.push(BlockScope {
            depth,
            names: HashMap::new(),
        });
    }

    /// Closes the innermost function and returns how many local slots it used.
    pub fn pop_function(&mut self) -> i32 {
        let depth = self.depth();
        while self.blocks.last().is_some_and(|block| block.depth == depth) {
            self.blocks.pop();
        }
        self.next_slot.pop().unwrap_or(0)
    }

    pub fn push_block(&mut self) {
        let depth = self.depth();
        self.blocks.push(BlockScope {
            depth,
            names: HashMap::new(),
        });
    }

    pub fn pop_block(&mut self) {
        self.blocks.pop();
    }

    /// True while only the outermost block of the top-level function is open.
    pub fn is_root(&self) -> bool {
        self.depth() == 0 && self.blocks.len() == 1
    }

    /// Returns `None` when the innermost block already defines `name`.
    pub fn define(&mut self, name: &str, read_only: bool) -> Option<Address> {
        if self.innermost_defines(name) {
            return None;
        }
        let address = Address {
            depth: self.depth(),
            slot: self.allocate_slot(),
            is_argument: false,
            read_only,
        };
        self.insert(name, address);
        Some(address)
    }

    pub fn define_argument(&mut self, index: i32, name: &str) -> Option<Address> {
        if self.innermost_defines(name) {
            return None;
        }
        let address = Address {
            depth: self.depth(),
            slot: index,
            is_argument: true,
            read_only: false,
        };
        self.insert(name, address);
        Some(address)
    }

    /// A hidden `#name` slot; never rejected, never visible to source code.
    pub fn define_internal(&mut self, name: &str) -> Address {
        let address = Address {
            depth: self.depth(),
            slot: self.allocate_slot(),
            is_argument: false,
            read_only: false,
        };
        self.insert(&format!("#{name}"), address);
        address
    }

    pub fn resolve(&self, name: &str) -> Option<Address> {
        self.blocks
            .iter()
            .rev()
            .find_map(|block| block.names.get(name).copied())
    }

    fn innermost_defines(&self, name: &str) -> bool {
        self.blocks
            .last()
            .is_some_and(|block| block.names.contains_key(name))
    }

    fn insert(&mut self, name: &str, address: Address) {
        if let Some(block) = self.blocks.last_mut() {
            block.names.insert(name.to_string(), address);
        }
    }

    fn allocate_slot(&mut self) -> i32 {
        match self.next_slot.last_mut() {
            Some(next) => {
                let slot = *next;
                *next += 1;
                slot
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadowing_resolves_innermost_and_restores_outer() {
        let mut scopes = ScopeChain::new();
        scopes.push_function();
        let outer = scopes.define("x", false).expect("outer x");
        scopes.push_block();
        let inner = scopes.define("x", false).expect("inner x");
        assert_ne!(outer.slot, inner.slot);
        assert_eq!(scopes.resolve("x"), Some(inner));
        scopes.pop_block();
        assert_eq!(scopes.resolve("x"), Some(outer));
        assert_eq!(scopes.pop_function(), 2);
    }

    #[test]
    fn duplicate_in_same_block_is_rejected() {
        let mut scopes = ScopeChain::new();
        scopes.push_function();
        assert!(scopes.define("x", false).is_some());
        assert!(scopes.define("x", true).is_none());
    }

    #[test]
    fn nested_functions_get_their_own_depth_and_slots() {
        let mut scopes = ScopeChain::new();
        scopes.push_function();
        scopes.define("a", false).expect("a");
        scopes.push_function();
        let arg = scopes.define_argument(0, "n").expect("n");
        let local = scopes.define("b", false).expect("b");
        assert_eq!(arg.encoded_depth(), -1);
        assert_eq!((local.depth, local.slot), (1, 0));
        assert_eq!(scopes.resolve("a").map(|a| a.depth), Some(0));
        assert_eq!(scopes.pop_function(), 1);
        assert_eq!(scopes.resolve("n"), None);
        assert!(scopes.is_root());
    }

    #[test]
    fn internal_names_are_hidden() {
        let mut scopes = ScopeChain::new();
        scopes.push_function();
        let first = scopes.define_internal("limit");
        let second = scopes.define_internal("limit");
        assert_ne!(first.slot, second.slot);
        assert_eq!(scopes.resolve("limit"), None);
        assert_eq!(scopes.resolve("#limit"), Some(second));
    }
}
