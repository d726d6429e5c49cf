use std::fmt;
use std::rc::Rc;

use super::RuntimeError;
use super::frame::FrameRef;
use crate::program::Program;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackKind {
    Call,
    Local,
    Eval,
}

impl fmt::Display for StackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StackKind::Call => "call",
            StackKind::Local => "local",
            StackKind::Eval => "evaluation",
        };
        f.write_str(name)
    }
}

/// Where a returning guest function resumes.
#[derive(Clone, Debug)]
pub(crate) struct ReturnAddress {
    pub program: Option<Rc<Program>>,
    pub ip: usize,
    pub args: Option<FrameRef>,
}

/// Fixed-capacity stack; overflow and underflow are reported, never panics.
#[derive(Debug)]
pub(crate) struct BoundedStack<T> {
    items: Vec<T>,
    capacity: usize,
    kind: StackKind,
    peak: usize,
}

impl<T> BoundedStack<T> {
    pub fn new(kind: StackKind, capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity.min(1024)),
            capacity,
            kind,
            peak: 0,
        }
    }

    pub fn push(&mut self, value: T) -> Result<(), RuntimeError> {
        if self.items.len() >= self.capacity {
            return Err(RuntimeError::StackOverflow(self.kind));
        }
        self.items.push(value);
        self.peak = self.peak.max(self.items.len());
        Ok(())
    }

    pub fn pop(&mut self) -> Result<T, RuntimeError> {
        self.items
            .pop()
            .ok_or(RuntimeError::StackUnderflow(self.kind))
    }

    pub fn peek(&self) -> Result<&T, RuntimeError> {
        self.items
            .last()
            .ok_or(RuntimeError::StackUnderflow(self.kind))
    }

    /// Pops `count` items, returned bottom-first.
    pub fn pop_many(&mut self, count: usize) -> Result<Vec<T>, RuntimeError> {
        if count > self.items.len() {
            return Err(RuntimeError::StackUnderflow(self.kind));
        }
        Ok(self.items.split_off(self.items.len() - count))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    pub fn above(&self, len: usize) -> &[T] {
        self.items.get(len..).unwrap_or(&[])
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn reset_peak(&mut self) {
        self.peak = self.items.len();
    }
}
