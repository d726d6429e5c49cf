#![cfg(feature = "runtime")]
mod common;
use common::*;

use moon::diagnostics::render_source_error;

#[test]
fn compile_errors_point_at_the_source_line() {
    let source = "local x = 1\n    x = missing + 1\n";
    let err = compile_error(source);
    assert_eq!(
        render_source_error(source, &err),
        "error: undefined identifier 'missing'\n --> <source>:2\n  |\n  2 |     x = missing + 1\n  |     ^^^^^^^^^^^^^^^"
    );
}

#[test]
fn compile_errors_use_configured_file_name() {
    let mut options = options();
    options.file_name = "scripts/init.moon".to_string();
    let err = compile_source("local = 1", &options).expect_err("syntax error");
    let text = render_source_error("local = 1", &err);
    assert!(text.starts_with("error: expected identifier but found '='"), "{text}");
    assert!(text.contains(" --> scripts/init.moon:1"), "{text}");
}

#[test]
fn runtime_errors_show_trace_and_line() {
    use moon::diagnostics::render_vm_error;

    let source = "local t = {}\nreturn t + 1";
    let err = runtime_error(source);
    let text = render_vm_error(&err, Some(source));
    assert!(
        text.starts_with("runtime error: can't use addition operator on object and number"),
        "{text}"
    );
    assert!(text.contains("\n  at main in <source>: line 2"), "{text}");
    assert!(text.ends_with("\n  2 | return t + 1\n    | ^"), "{text}");

    let bare = render_vm_error(&err, None);
    assert!(!bare.contains(" | "), "{bare}");
}
