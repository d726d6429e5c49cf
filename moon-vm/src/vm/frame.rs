use std::cell::RefCell;
use std::rc::Rc;

use super::RuntimeError;
use crate::value::Value;

pub type FrameRef = Rc<Frame>;

/// Slot storage for one activation's arguments or locals.
///
/// Frames link to the frame of the lexically enclosing function through
/// `previous`, so a nested function reaches an outer slot by walking the chain
/// down to the requested depth. Closures hold frames by reference, which keeps
/// them alive after the call that created them returns.
#[derive(Debug)]
pub struct Frame {
    depth: i32,
    previous: Option<FrameRef>,
    slots: RefCell<Vec<Value>>,
}

impl Frame {
    pub fn new(depth: i32, previous: Option<FrameRef>, size: usize) -> FrameRef {
        Self::with_values(depth, previous, vec![Value::Nil; size])
    }

    pub fn with_values(depth: i32, previous: Option<FrameRef>, values: Vec<Value>) -> FrameRef {
        Rc::new(Self {
            depth,
            previous,
            slots: RefCell::new(values),
        })
    }

    /// Depth of a frame created for a closure that captured `parent`.
    pub fn depth_after(parent: Option<&FrameRef>) -> i32 {
        parent.map_or(0, |frame| frame.depth + 1)
    }

    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    fn resolve(&self, depth: i32) -> Result<&Frame, RuntimeError> {
        let mut current = self;
        while current.depth > depth {
            current = current
                .previous
                .as_deref()
                .ok_or(RuntimeError::UnresolvedFrame(depth))?;
        }
        if current.depth != depth {
            return Err(RuntimeError::UnresolvedFrame(depth));
        }
        Ok(current)
    }

    pub fn get(&self, depth: i32, index: i32) -> Result<Value, RuntimeError> {
        Ok(self.resolve(depth)?.get_local(index))
    }

    pub fn set(&self, depth: i32, index: i32, value: Value) -> Result<(), RuntimeError> {
        self.resolve(depth)?.set_local(index, value);
        Ok(())
    }

    pub fn get_local(&self, index: i32) -> Value {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.slots.borrow().get(index).cloned())
            .unwrap_or_default()
    }

    /// Writing past the end grows the frame, filling the gap with nil.
    pub fn set_local(&self, index: i32, value: Value) {
        let Ok(index) = usize::try_from(index) else {
            return;
        };
        let mut slots = self.slots.borrow_mut();
        if index >= slots.len() {
            slots.resize(index + 1, Value::Nil);
        }
        slots[index] = value;
    }

    /// Moves every slot from `fixed` on into an array stored at `fixed`.
    pub fn collect_rest(&self, fixed: usize) {
        let mut slots = self.slots.borrow_mut();
        let rest = if slots.len() > fixed {
            slots.split_off(fixed)
        } else {
            Vec::new()
        };
        slots.resize(fixed, Value::Nil);
        slots.push(Value::array(rest));
    }

    pub fn has_parent(&self, parent: Option<&FrameRef>) -> bool {
        match (self.previous.as_ref(), parent) {
            (Some(mine), Some(theirs)) => Rc::ptr_eq(mine, theirs),
            (None, None) => true,
            _ => false,
        }
    }

    /// Reuses an argument frame for a tail call when nothing captured it and it
    /// already hangs off the callee's parent; otherwise allocates a new one.
    pub fn recycle(
        current: Option<FrameRef>,
        parent: Option<&FrameRef>,
        values: Vec<Value>,
    ) -> FrameRef {
        if let Some(mut frame) = current
            && frame.has_parent(parent)
        {
            if let Some(inner) = Rc::get_mut(&mut frame) {
                *inner.slots.get_mut() = values;
                return frame;
            }
            return Frame::with_values(frame.depth, parent.cloned(), values);
        }
        Frame::with_values(Frame::depth_after(parent), parent.cloned(), values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_walks_previous_links_by_depth() {
        let outer = Frame::with_values(0, None, vec![Value::Number(1.0)]);
        let inner = Frame::with_values(1, Some(outer.clone()), vec![Value::Number(2.0)]);

        assert_eq!(inner.get(0, 0).expect("outer"), Value::Number(1.0));
        assert_eq!(inner.get(1, 0).expect("inner"), Value::Number(2.0));
        assert!(matches!(
            outer.get(1, 0),
            Err(RuntimeError::UnresolvedFrame(1))
        ));
    }

    #[test]
    fn set_grows_slots_with_nil() {
        let frame = Frame::new(0, None, 0);
        frame.set_local(3, Value::Bool(true));
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.get_local(1), Value::Nil);
        assert_eq!(frame.get_local(3), Value::Bool(true));
        assert_eq!(frame.get_local(-1), Value::Nil);
    }

    #[test]
    fn collect_rest_packs_trailing_arguments() {
        let frame = Frame::with_values(
            1,
            None,
            vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)],
        );
        frame.collect_rest(1);
        assert_eq!(frame.len(), 2);
        match frame.get_local(1) {
            Value::Array(items) => assert_eq!(items.borrow().len(), 2),
            other => panic!("expected array, got {other:?}"),
        }

        let short = Frame::with_values(1, None, vec![]);
        short.collect_rest(2);
        assert_eq!(short.len(), 3);
        assert_eq!(short.get_local(0), Value::Nil);
    }

    #[test]
    fn recycle_reuses_uncaptured_frame_only() {
        let parent = Frame::new(0, None, 0);
        let current = Frame::with_values(1, Some(parent.clone()), vec![Value::Nil]);
        let address = Rc::as_ptr(&current);
        let reused = Frame::recycle(Some(current), Some(&parent), vec![Value::Number(9.0)]);
        assert_eq!(Rc::as_ptr(&reused), address);
        assert_eq!(reused.get_local(0), Value::Number(9.0));

        let captured = reused.clone();
        let fresh = Frame::recycle(Some(reused), Some(&parent), vec![]);
        assert!(!Rc::ptr_eq(&fresh, &captured));
        assert_eq!(captured.get_local(0), Value::Number(9.0));
    }
}
