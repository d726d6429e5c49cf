use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

use crate::vm::{Closure, NativeFn, NativeMethodFn, RuntimeError, Vm, VmError};

pub type ArrayRef = Rc<RefCell<Vec<Value>>>;
pub type TableRef = Rc<RefCell<Table>>;

const MAX_SERIALIZE_DEPTH: usize = 64;

/// Dynamically typed runtime value. Arrays, objects and functions are shared by
/// reference and compare by identity.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Nil,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(ArrayRef),
    Object(TableRef),
    Function(Rc<Closure>),
}

impl Value {
    pub fn string(value: impl Into<Rc<str>>) -> Self {
        Value::String(value.into())
    }

    pub fn array(values: Vec<Value>) -> Self {
        Value::Array(Rc::new(RefCell::new(values)))
    }

    pub fn object(table: Table) -> Self {
        Value::Object(Rc::new(RefCell::new(table)))
    }

    pub fn new_object() -> Self {
        Value::object(Table::new())
    }

    pub fn native<F>(function: F) -> Self
    where
        F: Fn(&mut Vm, &[Value]) -> Result<Value, VmError> + 'static,
    {
        let function: NativeFn = Rc::new(function);
        Value::Function(Rc::new(Closure::Native(function)))
    }

    /// Host method; reading it from an object field binds it to that object.
    pub fn method<F>(function: F) -> Self
    where
        F: Fn(&mut Vm, &Value, &[Value]) -> Result<Value, VmError> + 'static,
    {
        let function: NativeMethodFn = Rc::new(function);
        Value::Function(Rc::new(Closure::Method {
            function,
            receiver: None,
        }))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil | Value::Bool(false) => false,
            Value::Number(value) => !value.is_nan(),
            _ => true,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    /// Reads `self[key]`. Only arrays can fail, on an out-of-range numeric index.
    pub fn index(&self, key: &Value) -> Result<Value, RuntimeError> {
        match (self, key) {
            (Value::Array(items), Value::Number(index)) => {
                let items = items.borrow();
                let slot = array_slot(*index, items.len())?;
                Ok(items[slot].clone())
            }
            (Value::Object(table), _) => {
                let value = table.borrow().get(key).cloned().unwrap_or_default();
                Ok(self.bind_method(value))
            }
            _ => Ok(Value::Nil),
        }
    }

    pub fn field(&self, name: &str) -> Value {
        match self {
            Value::Object(table) => {
                let value = table.borrow().get_str(name).cloned().unwrap_or_default();
                self.bind_method(value)
            }
            _ => Value::Nil,
        }
    }

    /// Writes `self[key] = value`. Writes into a locked object are dropped.
    pub fn set_index(&self, key: Value, value: Value) -> Result<(), RuntimeError> {
        match (self, &key) {
            (Value::Array(items), Value::Number(index)) => {
                let mut items = items.borrow_mut();
                let slot = array_slot(*index, items.len())?;
                items[slot] = value;
                Ok(())
            }
            (Value::Object(table), _) => {
                table.borrow_mut().set(key, value);
                Ok(())
            }
            _ => Err(RuntimeError::CantCreateField(self.type_name())),
        }
    }

    pub fn set_field(&self, name: &str, value: Value) -> Result<(), RuntimeError> {
        self.set_index(Value::string(name), value)
    }

    fn bind_method(&self, value: Value) -> Value {
        if let Value::Function(closure) = &value
            && let Closure::Method {
                function,
                receiver: None,
            } = closure.as_ref()
        {
            return Value::Function(Rc::new(Closure::Method {
                function: function.clone(),
                receiver: Some(self.clone()),
            }));
        }
        value
    }

    pub fn add(&self, other: &Value) -> Result<Value, RuntimeError> {
        self.arithmetic(other, "addition", |a, b| a + b)
    }

    pub fn sub(&self, other: &Value) -> Result<Value, RuntimeError> {
        self.arithmetic(other, "subtraction", |a, b| a - b)
    }

    pub fn mul(&self, other: &Value) -> Result<Value, RuntimeError> {
        self.arithmetic(other, "multiplication", |a, b| a * b)
    }

    pub fn div(&self, other: &Value) -> Result<Value, RuntimeError> {
        self.arithmetic(other, "division", |a, b| a / b)
    }

    pub fn rem(&self, other: &Value) -> Result<Value, RuntimeError> {
        self.arithmetic(other, "modulo", |a, b| a % b)
    }

    pub fn pow(&self, other: &Value) -> Result<Value, RuntimeError> {
        self.arithmetic(other, "exponent", f64::powf)
    }

    pub fn neg(&self) -> Result<Value, RuntimeError> {
        match self {
            Value::Number(value) => Ok(Value::Number(-value)),
            other => Err(RuntimeError::CantUseOperatorOnType {
                op: "negation",
                operand: other.type_name(),
            }),
        }
    }

    pub fn concat(&self, other: &Value) -> Result<Value, RuntimeError> {
        match (self, other) {
            (Value::String(left), Value::String(right)) => {
                let mut out = String::with_capacity(left.len() + right.len());
                out.push_str(left);
                out.push_str(right);
                Ok(Value::string(out))
            }
            _ => Err(self.mismatch("concat", other)),
        }
    }

    /// Ordering for `<`, `<=`, `>` and `>=`. Strings compare ordinally.
    pub fn compare(&self, other: &Value) -> Result<Option<std::cmp::Ordering>, RuntimeError> {
        match (self, other) {
            (Value::Number(left), Value::Number(right)) => Ok(left.partial_cmp(right)),
            (Value::String(left), Value::String(right)) => Ok(Some(left.cmp(right))),
            _ => Err(self.mismatch("relational", other)),
        }
    }

    fn arithmetic(
        &self,
        other: &Value,
        op: &'static str,
        apply: impl Fn(f64, f64) -> f64,
    ) -> Result<Value, RuntimeError> {
        match (self, other) {
            (Value::Number(left), Value::Number(right)) => Ok(Value::Number(apply(*left, *right))),
            _ => Err(self.mismatch(op, other)),
        }
    }

    fn mismatch(&self, op: &'static str, other: &Value) -> RuntimeError {
        RuntimeError::CantUseOperatorOnTypes {
            op,
            left: self.type_name(),
            right: other.type_name(),
        }
    }

    /// Objects exposing `moveNext`, or `getEnumerator` returning such an object.
    pub fn is_enumerable(&self) -> bool {
        matches!(self.field("moveNext"), Value::Function(_))
            || matches!(self.field("getEnumerator"), Value::Function(_))
    }

    /// Wraps a list of values in an object speaking the enumeration protocol.
    pub fn from_values(values: Vec<Value>) -> Value {
        let table = Rc::new(RefCell::new(Table::new()));
        let cursor = Rc::new(RefCell::new(values.into_iter()));
        let weak: Weak<RefCell<Table>> = Rc::downgrade(&table);

        let move_next = Value::native(move |_vm, _args| {
            let next = cursor.borrow_mut().next();
            let success = next.is_some();
            if let Some(table) = weak.upgrade() {
                table
                    .borrow_mut()
                    .set(Value::string("current"), next.unwrap_or_default());
            }
            Ok(Value::Bool(success))
        });
        let weak: Weak<RefCell<Table>> = Rc::downgrade(&table);
        let get_enumerator = Value::native(move |_vm, _args| {
            Ok(weak.upgrade().map(Value::Object).unwrap_or_default())
        });

        {
            let mut table = table.borrow_mut();
            table.set(Value::string("current"), Value::Nil);
            table.set(Value::string("moveNext"), move_next);
            table.set(Value::string("getEnumerator"), get_enumerator);
        }
        Value::Object(table)
    }

    /// Pretty, JSON-like rendering of nested values.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        self.serialize_into(&mut out, 0);
        out
    }

    fn serialize_into(&self, out: &mut String, depth: usize) -> bool {
        if depth >= MAX_SERIALIZE_DEPTH {
            out.push_str("< max depth reached >");
            return false;
        }
        match self {
            Value::String(value) => serialize_string(out, value),
            Value::Array(items) => {
                let items = items.borrow();
                if items.is_empty() {
                    out.push_str("[]");
                    return true;
                }
                out.push_str("[\n");
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        out.push_str(",\n");
                    }
                    push_indent(out, depth + 1);
                    if !item.serialize_into(out, depth + 1) {
                        break;
                    }
                }
                out.push('\n');
                push_indent(out, depth);
                out.push(']');
            }
            Value::Object(table) => {
                let table = table.borrow();
                if table.is_empty() {
                    out.push_str("{}");
                    return true;
                }
                out.push_str("{\n");
                for (index, (key, value)) in table.iter().enumerate() {
                    if index > 0 {
                        out.push_str(",\n");
                    }
                    push_indent(out, depth + 1);
                    if !key.serialize_into(out, depth + 1) {
                        break;
                    }
                    out.push_str(": ");
                    if !value.serialize_into(out, depth + 1) {
                        break;
                    }
                }
                out.push('\n');
                push_indent(out, depth);
                out.push('}');
            }
            other => out.push_str(&other.to_string()),
        }
        true
    }
}

fn array_slot(index: f64, len: usize) -> Result<usize, RuntimeError> {
    let slot = index.trunc();
    if slot < 0.0 || slot >= len as f64 || slot.is_nan() {
        return Err(RuntimeError::IndexOutOfBounds { index, len });
    }
    Ok(slot as usize)
}

fn push_indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("    ");
    }
}

fn serialize_string(out: &mut String, value: &str) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
}

pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else if value.is_infinite() {
        (if value > 0.0 { "inf" } else { "-inf" }).to_string()
    } else if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(left), Value::Bool(right)) => left == right,
            (Value::Number(left), Value::Number(right)) => left == right,
            (Value::String(left), Value::String(right)) => left == right,
            (Value::Array(left), Value::Array(right)) => Rc::ptr_eq(left, right),
            (Value::Object(left), Value::Object(right)) => Rc::ptr_eq(left, right),
            (Value::Function(left), Value::Function(right)) => Rc::ptr_eq(left, right),
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Number(value) => write!(f, "{}", format_number(*value)),
            Value::String(value) => write!(f, "{value}"),
            other => write!(f, "{}", other.type_name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::Bool(value) => write!(f, "Bool({value})"),
            Value::Number(value) => write!(f, "Number({value})"),
            Value::String(value) => write!(f, "String({value:?})"),
            Value::Array(items) => write!(f, "Array(len={})", items.borrow().len()),
            Value::Object(table) => write!(f, "Object(len={})", table.borrow().len()),
            Value::Function(_) => write!(f, "Function"),
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::string(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::string(value)
    }
}

/// Hash identity of a table key: numbers and strings by value, references by address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum TableKey {
    Nil,
    Bool(bool),
    Number(u64),
    String(Rc<str>),
    Reference(usize),
}

impl TableKey {
    fn of(value: &Value) -> Self {
        match value {
            Value::Nil => TableKey::Nil,
            Value::Bool(value) => TableKey::Bool(*value),
            // -0.0 and 0.0 compare equal, so they must land on the same entry.
            Value::Number(value) if *value == 0.0 => TableKey::Number(0f64.to_bits()),
            Value::Number(value) => TableKey::Number(value.to_bits()),
            Value::String(value) => TableKey::String(value.clone()),
            Value::Array(items) => TableKey::Reference(Rc::as_ptr(items) as *const () as usize),
            Value::Object(table) => TableKey::Reference(Rc::as_ptr(table) as *const () as usize),
            Value::Function(closure) => {
                TableKey::Reference(Rc::as_ptr(closure) as *const () as usize)
            }
        }
    }
}

/// Insertion-ordered map from values to values.
#[derive(Default)]
pub struct Table {
    entries: Vec<(Value, Value)>,
    index: HashMap<TableKey, usize>,
    locked: bool,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        let slot = *self.index.get(&TableKey::of(key))?;
        self.entries.get(slot).map(|(_, value)| value)
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        let slot = *self.index.get(&TableKey::String(Rc::from(key)))?;
        self.entries.get(slot).map(|(_, value)| value)
    }

    /// Returns false when the table is locked and nothing was written.
    pub fn set(&mut self, key: Value, value: Value) -> bool {
        if self.locked {
            return false;
        }
        let table_key = TableKey::of(&key);
        match self.index.get(&table_key) {
            Some(&slot) => self.entries[slot].1 = value,
            None => {
                self.index.insert(table_key, self.entries.len());
                self.entries.push((key, value));
            }
        }
        true
    }

    pub fn lock(&mut self) {
        self.locked = true;
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::Number(f64::NAN).is_truthy());
        assert!(Value::Number(0.0).is_truthy());
        assert!(Value::string("").is_truthy());
        assert!(Value::new_object().is_truthy());
    }

    #[test]
    fn equality_is_by_value_for_scalars_and_identity_for_references() {
        assert_eq!(Value::string("a"), Value::string("a"));
        assert_eq!(Value::Number(1.0), Value::Number(1.0));
        let array = Value::array(vec![]);
        assert_eq!(array, array.clone());
        assert_ne!(Value::array(vec![]), Value::array(vec![]));
        assert_ne!(Value::Nil, Value::Bool(false));
    }

    #[test]
    fn arithmetic_reports_operand_types() {
        let err = Value::Number(1.0)
            .add(&Value::string("a"))
            .expect_err("mixed add should fail");
        assert_eq!(
            err,
            RuntimeError::CantUseOperatorOnTypes {
                op: "addition",
                left: "number",
                right: "string",
            }
        );
        assert!(Value::Bool(true).neg().is_err());
        assert!(Value::Number(1.0).concat(&Value::string("a")).is_err());
    }

    #[test]
    fn table_keeps_insertion_order_and_numeric_zero_identity() {
        let mut table = Table::new();
        table.set(Value::string("b"), Value::Number(1.0));
        table.set(Value::Number(0.0), Value::Number(2.0));
        table.set(Value::string("a"), Value::Number(3.0));
        table.set(Value::Number(-0.0), Value::Number(4.0));

        let keys = table.iter().map(|(key, _)| key.to_string()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["b", "0", "a"]);
        assert_eq!(table.get(&Value::Number(0.0)), Some(&Value::Number(4.0)));
    }

    #[test]
    fn locked_table_ignores_writes() {
        let object = Value::new_object();
        object.set_field("x", Value::Number(1.0)).expect("set");
        if let Value::Object(table) = &object {
            assert!(!table.borrow().is_locked());
            table.borrow_mut().lock();
            assert!(table.borrow().is_locked());
        }
        object.set_field("x", Value::Number(2.0)).expect("set");
        object.set_field("y", Value::Number(3.0)).expect("set");
        assert_eq!(object.field("x"), Value::Number(1.0));
        assert_eq!(object.field("y"), Value::Nil);
    }

    #[test]
    fn array_indexing_is_zero_based_and_bounded() {
        let array = Value::array(vec![Value::Number(10.0), Value::Number(20.0)]);
        assert_eq!(
            array.index(&Value::Number(1.0)).expect("in range"),
            Value::Number(20.0)
        );
        assert!(matches!(
            array.index(&Value::Number(2.0)),
            Err(RuntimeError::IndexOutOfBounds { .. })
        ));
        assert!(matches!(
            Value::Number(1.0).set_field("x", Value::Nil),
            Err(RuntimeError::CantCreateField("number"))
        ));
        assert_eq!(Value::Nil.field("x"), Value::Nil);
    }

    #[test]
    fn serialize_nested_values() {
        let mut table = Table::new();
        table.set(Value::string("name"), Value::string("a\"b"));
        table.set(
            Value::string("list"),
            Value::array(vec![Value::Number(1.0), Value::Bool(true)]),
        );
        let text = Value::object(table).serialize();
        assert_eq!(
            text,
            "{\n    \"name\": \"a\\\"b\",\n    \"list\": [\n        1,\n        true\n    ]\n}"
        );
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(-2.5), "-2.5");
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(f64::NAN), "nan");
    }
}
