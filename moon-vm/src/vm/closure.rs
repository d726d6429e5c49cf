use std::fmt;
use std::rc::Rc;

use super::frame::FrameRef;
use super::{Vm, VmError};
use crate::program::Program;
use crate::value::Value;

pub type NativeFn = Rc<dyn Fn(&mut Vm, &[Value]) -> Result<Value, VmError>>;
pub type NativeMethodFn = Rc<dyn Fn(&mut Vm, &Value, &[Value]) -> Result<Value, VmError>>;

/// A guest function: an entry point plus the frames it closed over.
#[derive(Clone)]
pub struct ScriptClosure {
    pub program: Rc<Program>,
    pub entry: usize,
    pub args: Option<FrameRef>,
    pub locals: Option<FrameRef>,
}

pub enum Closure {
    Native(NativeFn),
    Method {
        function: NativeMethodFn,
        receiver: Option<Value>,
    },
    Script(ScriptClosure),
}

impl Closure {
    /// Entry closure for a whole program: offset zero, nothing captured.
    pub fn program(program: Rc<Program>) -> Self {
        Closure::Script(ScriptClosure {
            program,
            entry: 0,
            args: None,
            locals: None,
        })
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Closure::Native(_) => write!(f, "Native"),
            Closure::Method { receiver, .. } => {
                write!(f, "Method(bound={})", receiver.is_some())
            }
            Closure::Script(script) => write!(f, "Script(entry={})", script.entry),
        }
    }
}
