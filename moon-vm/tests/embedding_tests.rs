#![cfg(feature = "runtime")]
mod common;
use common::*;

use std::rc::Rc;

fn run_with(natives: &NativeRegistry, source: &str) -> Result<Value, moon::Error> {
    let options = CompilerOptions::default().with_globals(natives.names());
    let mut vm = Vm::with_natives(MachineOptions::default(), natives);
    moon::run_source(&mut vm, source, &options)
}

#[test]
fn host_calls_returned_closure() {
    let source = "local base = 10 return function(x, y) return base + x * y end";
    let mut vm = machine();
    let function = moon::run_source(&mut vm, source, &options()).expect("run");
    let result = vm
        .call(&function, &[Value::Number(3.0), Value::Number(4.0)])
        .expect("call");
    assert_eq!(result, number(22.0));
    let again = vm
        .call(&function, &[Value::Number(1.0), Value::Number(1.0)])
        .expect("call");
    assert_eq!(again, number(11.0));
    assert_eq!(vm.call_depth(), 0);
}

#[test]
fn calling_non_function_from_host_fails() {
    let mut vm = machine();
    let err = vm.call(&Value::Number(1.0), &[]).expect_err("not callable");
    assert_eq!(err.kind, RuntimeError::ValueNotCallable("number"));
}

#[test]
fn globals_are_shared_with_host() {
    let mut vm = machine();
    vm.set_global("limit", Value::Number(3.0));
    let options = options().with_globals(["limit", "result"]);
    moon::run_source(&mut vm, "result = limit * 2", &options).expect("run");
    assert_eq!(vm.global("result"), number(6.0));
    assert_eq!(vm.global("missing"), Value::Nil);
}

#[test]
fn implicit_globals_persist_between_runs() {
    let mut vm = machine();
    let mut options = options();
    options.use_implicit_globals = true;
    moon::run_source(&mut vm, "total = 40", &options).expect("first");
    let value = moon::run_source(&mut vm, "return total + 2", &options).expect("second");
    assert_eq!(value, number(42.0));
}

#[test]
fn natives_may_call_back_into_guest_code() {
    let natives = registry_with_apply();
    let source = r#"
        local function twice(x) return x * 2 end
        return apply(twice, 21) + apply(function(a, b) return a - b end, 5, 3)
    "#;
    assert_eq!(run_with(&natives, source).expect("run"), number(44.0));
}

#[test]
fn errors_raised_under_a_native_list_inner_frames_first() {
    let natives = registry_with_apply();
    let source = [
        "local function fail() error(\"inner\") end",
        "local function outer()",
        "    local result = apply(fail)",
        "    return result",
        "end",
        "local value = outer()",
        "return value",
    ]
    .join("\n");
    let err = match run_with(&natives, &source) {
        Err(moon::Error::Runtime(err)) => err,
        other => panic!("expected runtime error, got {other:?}"),
    };
    assert_eq!(err.kind, RuntimeError::Native("inner".to_string()));
    assert_eq!(err.line, Some(1));
    assert_eq!(
        err.trace,
        [
            "at fail in <source>: line 1",
            "[... native ...]",
            "at outer in <source>: line 3",
            "at main in <source>: line 6",
        ]
    );
}

#[test]
fn host_objects_enumerate_through_get_enumerator() {
    let mut table = Table::new();
    table.set(
        Value::string("getEnumerator"),
        Value::native(|_vm, _args| Ok(Value::from_values(vec![number(1.0), number(2.0)]))),
    );
    let source = Value::object(table);
    assert!(source.is_enumerable());
    assert!(!Value::new_object().is_enumerable());

    let mut vm = machine();
    assert_eq!(
        vm.enumerate(&source).expect("enumerate"),
        [number(1.0), number(2.0)]
    );
    let err = vm.enumerate(&Value::new_object()).expect_err("plain object");
    assert_eq!(err.kind, RuntimeError::NotEnumerable("object"));
}

#[test]
fn host_methods_bind_their_receiver() {
    let mut natives = NativeRegistry::standard();
    natives.register_value("counter", counter_object());
    let source = "counter.next() counter.next(5) return counter.n";
    assert_eq!(run_with(&natives, source).expect("run"), number(6.0));

    let source = "local next = counter.next return next(2)";
    assert_eq!(run_with(&natives, source).expect("run"), number(8.0));
}

#[test]
fn host_closures_capture_state() {
    let mut natives = NativeRegistry::standard();
    let seen = Rc::new(std::cell::RefCell::new(Vec::new()));
    let sink = seen.clone();
    natives.register("emit", move |_vm, args| {
        sink.borrow_mut().extend(args.iter().map(Value::to_string));
        Ok(Value::Nil)
    });
    run_with(&natives, "for i = 1, 3 do emit(i) end emit(\"done\")").expect("run");
    assert_eq!(*seen.borrow(), ["1", "2", "3", "done"]);
}

#[test]
fn machine_options_load_from_partial_json() {
    let options = MachineOptions::from_json(r#"{"call_stack_capacity": 8}"#).expect("json");
    assert_eq!(options.call_stack_capacity, 8);
    assert_eq!(
        options.eval_stack_capacity,
        MachineOptions::default().eval_stack_capacity
    );

    let mut vm = Vm::with_natives(options, &NativeRegistry::standard());
    let source = "local function f(n) if n == 0 then return 0 end return 1 + f(n - 1) end return f(20)";
    let err = moon::run_source(&mut vm, source, &common::options()).expect_err("overflow");
    assert!(matches!(err, moon::Error::Runtime(_)));
    assert!(MachineOptions::from_json("{\"call_stack_capacity\": -1}").is_err());
}

#[test]
fn bytecode_runs_through_umbrella_entry_point() {
    let bytes = moon::encode_program(&compile("return len({1, 2, 3})")).expect("encode");
    let mut vm = machine();
    assert_eq!(moon::run_bytecode(&mut vm, &bytes).expect("run"), number(3.0));

    let err = moon::run_bytecode(&mut vm, &bytes[1..]).expect_err("corrupt");
    assert!(matches!(err, moon::Error::Wire(_)));
}
