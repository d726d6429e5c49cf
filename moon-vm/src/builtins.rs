use std::collections::HashMap;
use std::rc::Rc;

use crate::value::Value;
use crate::vm::{Closure, NativeFn, Vm, VmError};

/// Natives installed by [`NativeRegistry::standard`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BuiltinFunction {
    Print,
    Type,
    ToString,
    ToNumber,
    Len,
    Push,
    Lock,
    Error,
    Assert,
    Serialize,
    Values,
}

const ALL_BUILTINS: [BuiltinFunction; 11] = [
    BuiltinFunction::Print,
    BuiltinFunction::Type,
    BuiltinFunction::ToString,
    BuiltinFunction::ToNumber,
    BuiltinFunction::Len,
    BuiltinFunction::Push,
    BuiltinFunction::Lock,
    BuiltinFunction::Error,
    BuiltinFunction::Assert,
    BuiltinFunction::Serialize,
    BuiltinFunction::Values,
];

impl BuiltinFunction {
    pub fn name(self) -> &'static str {
        match self {
            BuiltinFunction::Print => "print",
            BuiltinFunction::Type => "type",
            BuiltinFunction::ToString => "tostring",
            BuiltinFunction::ToNumber => "tonumber",
            BuiltinFunction::Len => "len",
            BuiltinFunction::Push => "push",
            BuiltinFunction::Lock => "lock",
            BuiltinFunction::Error => "error",
            BuiltinFunction::Assert => "assert",
            BuiltinFunction::Serialize => "serialize",
            BuiltinFunction::Values => "values",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ALL_BUILTINS
            .iter()
            .copied()
            .find(|builtin| builtin.name() == name)
    }

    fn call(self, _vm: &mut Vm, args: &[Value]) -> Result<Value, VmError> {
        let first = args.first().cloned().unwrap_or_default();
        match self {
            BuiltinFunction::Print => {
                let line = args
                    .iter()
                    .map(Value::to_string)
                    .collect::<Vec<_>>()
                    .join("\t");
                println!("{line}");
                Ok(Value::Nil)
            }
            BuiltinFunction::Type => Ok(Value::string(first.type_name())),
            BuiltinFunction::ToString => Ok(Value::string(first.to_string())),
            BuiltinFunction::ToNumber => Ok(match first {
                Value::Number(value) => Value::Number(value),
                Value::String(text) => text
                    .trim()
                    .parse::<f64>()
                    .map(Value::Number)
                    .unwrap_or_default(),
                _ => Value::Nil,
            }),
            BuiltinFunction::Len => match &first {
                Value::String(text) => Ok(Value::Number(text.chars().count() as f64)),
                Value::Array(items) => Ok(Value::Number(items.borrow().len() as f64)),
                Value::Object(table) => Ok(Value::Number(table.borrow().len() as f64)),
                other => Err(VmError::native(format!(
                    "len expects a string, array or object, got {}",
                    other.type_name()
                ))),
            },
            BuiltinFunction::Push => match &first {
                Value::Array(items) => {
                    let mut items = items.borrow_mut();
                    items.extend(args.iter().skip(1).cloned());
                    Ok(Value::Number(items.len() as f64))
                }
                other => Err(VmError::native(format!(
                    "push expects an array, got {}",
                    other.type_name()
                ))),
            },
            BuiltinFunction::Lock => match &first {
                Value::Object(table) => {
                    table.borrow_mut().lock();
                    Ok(first.clone())
                }
                _ => Err(VmError::native("attempt to lock non-object")),
            },
            BuiltinFunction::Error => Err(VmError::native(first.to_string())),
            BuiltinFunction::Assert => {
                if first.is_truthy() {
                    Ok(first)
                } else {
                    let message = args
                        .get(1)
                        .map(Value::to_string)
                        .unwrap_or_else(|| "assertion failed".to_string());
                    Err(VmError::native(message))
                }
            }
            BuiltinFunction::Serialize => Ok(Value::string(first.serialize())),
            BuiltinFunction::Values => match &first {
                Value::Array(items) => Ok(Value::from_values(items.borrow().clone())),
                other => Err(VmError::native(format!(
                    "values expects an array, got {}",
                    other.type_name()
                ))),
            },
        }
    }
}

/// Name to callable table assembled by the host and installed into a machine's
/// global table.
#[derive(Default, Clone)]
pub struct NativeRegistry {
    entries: Vec<(String, Value)>,
    by_name: HashMap<String, usize>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Self {
        let mut registry = Self::new();
        for builtin in ALL_BUILTINS {
            let function: NativeFn = Rc::new(move |vm: &mut Vm, args: &[Value]| builtin.call(vm, args));
            registry.register_value(builtin.name(), Value::Function(Rc::new(Closure::Native(function))));
        }
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, function: F)
    where
        F: Fn(&mut Vm, &[Value]) -> Result<Value, VmError> + 'static,
    {
        self.register_value(name, Value::native(function));
    }

    /// Registers any value, typically an object of methods built with [`Value::method`].
    pub fn register_value(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        if let Some(&slot) = self.by_name.get(&name)
            && let Some(entry) = self.entries.get_mut(slot)
        {
            entry.1 = value;
            return;
        }
        self.by_name.insert(name.clone(), self.entries.len());
        self.entries.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let slot = *self.by_name.get(name)?;
        self.entries.get(slot).map(|(_, value)| value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn install(&self, vm: &mut Vm) {
        for (name, value) in &self.entries {
            vm.set_global(name, value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_lists_every_builtin() {
        let registry = NativeRegistry::standard();
        let names = registry.names().collect::<Vec<_>>();
        assert_eq!(names.len(), ALL_BUILTINS.len());
        for builtin in ALL_BUILTINS {
            assert_eq!(BuiltinFunction::from_name(builtin.name()), Some(builtin));
            assert!(registry.get(builtin.name()).is_some());
        }
    }

    #[test]
    fn registering_twice_replaces_the_entry() {
        let mut registry = NativeRegistry::new();
        registry.register_value("answer", Value::Number(1.0));
        registry.register_value("answer", Value::Number(42.0));
        assert_eq!(registry.names().count(), 1);
        assert_eq!(registry.get("answer"), Some(&Value::Number(42.0)));
    }

    #[test]
    fn tonumber_and_len() {
        let mut vm = Vm::default();
        let parsed = BuiltinFunction::ToNumber
            .call(&mut vm, &[Value::string(" 12.5 ")])
            .expect("tonumber");
        assert_eq!(parsed, Value::Number(12.5));
        let bad = BuiltinFunction::ToNumber
            .call(&mut vm, &[Value::string("x")])
            .expect("tonumber");
        assert_eq!(bad, Value::Nil);
        let len = BuiltinFunction::Len
            .call(&mut vm, &[Value::string("héllo")])
            .expect("len");
        assert_eq!(len, Value::Number(5.0));
        assert!(BuiltinFunction::Len.call(&mut vm, &[Value::Nil]).is_err());
    }
}
