//! End-to-end tests driving whole scripts through the library API.

use std::cell::RefCell;
use std::rc::Rc;

use opal::compiler::{compile_source, format_errors};
use opal::vm::bytecode;
use opal::vm::native::HostValue;
use opal::{RuntimeConfig, VM};

/// Compile and run a script, capturing everything `print` emits.
fn run_capture_with_config(source: &str, config: &RuntimeConfig) -> Result<String, String> {
    let chunk = compile_source(source).map_err(|errors| format_errors(&errors))?;
    let mut vm = VM::new(config);
    let output = Rc::new(RefCell::new(String::new()));
    let sink = output.clone();
    vm.register_native(
        "print",
        1,
        Rc::new(move |args: &[HostValue]| {
            sink.borrow_mut()
                .push_str(&opal::stdlib::display(&args[0]));
            sink.borrow_mut().push('\n');
            Ok(HostValue::Nil)
        }),
    )
    .map_err(|e| e.to_string())?;
    vm.run(&chunk).map_err(|e| e.to_string())?;
    let captured = output.borrow().clone();
    Ok(captured)
}

fn run_capture(source: &str) -> Result<String, String> {
    run_capture_with_config(source, &RuntimeConfig::default())
}

fn assert_output(source: &str, expected: &str) {
    match run_capture(source) {
        Ok(out) => assert_eq!(out, expected),
        Err(e) => panic!("program should succeed, got:\n{}", e),
    }
}

fn assert_failure(source: &str) -> String {
    run_capture(source).expect_err("program should fail")
}

#[test]
fn test_arithmetic() {
    assert_output("print((2 + 3) * 4);", "20\n");
}

#[test]
fn test_string_concatenation() {
    assert_output("print(\"a\" + \"b\");", "ab\n");
}

#[test]
fn test_comparison() {
    assert_output("print(1 < 2);", "true\n");
}

#[test]
fn test_open_upvalue_observes_mutation() {
    // The closure reads through to the live variable, not a snapshot
    // taken at closure creation.
    assert_output(
        "fun outer() { \
           var x = 1; \
           fun f() { return x; } \
           x = 2; \
           return f(); \
         } \
         print(outer());",
        "2\n",
    );
}

#[test]
fn test_global_capture_observes_mutation() {
    assert_output(
        "var x = 1; fun f() { return x; } x = 2; print(f());",
        "2\n",
    );
}

#[test]
fn test_closure_outlives_capturing_scope() {
    // The upvalue closes over the last value set before the scope exits.
    assert_output(
        "fun make() { var n = 10; fun get() { return n; } n = 20; return get; } \
         var g = make(); \
         print(g());",
        "20\n",
    );
}

#[test]
fn test_counter_closures_keep_state() {
    assert_output(
        "fun counter() { \
           var n = 0; \
           fun next() { n = n + 1; return n; } \
           return next; \
         } \
         var a = counter(); var b = counter(); \
         print(a()); print(a()); print(b());",
        "1\n2\n1\n",
    );
}

#[test]
fn test_duplicate_local_in_same_scope_fails() {
    let err = assert_failure("{ var a = 1; var a = 2; }");
    assert!(err.contains("already declared"));
}

#[test]
fn test_shadowing_in_nested_block_allowed() {
    assert_output(
        "{ var a = 1; { var a = 2; print(a); } print(a); }",
        "2\n1\n",
    );
}

#[test]
fn test_inheritance_is_copy_on_declare() {
    // B copies A's method table when B is declared. Rebinding the global
    // `A` to a richer class afterwards changes nothing for B.
    assert_output(
        "class A { m() { return 1; } } \
         class B < A { } \
         class A { m() { return 1; } extra() { return 2; } } \
         print(B().m());",
        "1\n",
    );
    let err = assert_failure(
        "class A { m() { return 1; } } \
         class B < A { } \
         class A { m() { return 1; } extra() { return 2; } } \
         B().extra();",
    );
    assert!(err.contains("undefined property 'extra'"));
}

#[test]
fn test_subclass_override_wins() {
    assert_output(
        "class A { m() { return 1; } } \
         class B < A { m() { return 2; } } \
         print(B().m());",
        "2\n",
    );
}

#[test]
fn test_super_dispatches_to_superclass_implementation() {
    // super.m() inside B::m resolves against A even though the dynamic
    // class of `this` (C) overrides m again.
    assert_output(
        "class A { m() { return 1; } } \
         class B < A { m() { return super.m() + 10; } } \
         class C < B { m() { return super.m() + 100; } } \
         print(C().m());",
        "111\n",
    );
}

#[test]
fn test_arity_mismatch_names_expected_and_actual() {
    let err = assert_failure("fun f(a, b, c) { return a; } f(1);");
    assert!(err.contains("expected 3 arguments but got 1"));
}

#[test]
fn test_method_arity_checked() {
    let err = assert_failure(
        "class A { m(x) { return x; } } A().m(1, 2);",
    );
    assert!(err.contains("expected 1 arguments but got 2"));
}

#[test]
fn test_heap_exhaustion_is_fatal_when_everything_reachable() {
    let config = RuntimeConfig {
        heap_capacity: 24,
        ..Default::default()
    };
    let err = run_capture_with_config(
        "class Node { init(next) { this.next = next; } } \
         var head = nil; \
         for (var i = 0; i < 50; i++) { head = Node(head); }",
        &config,
    )
    .expect_err("reachable chain must exhaust the heap");
    assert!(err.contains("out of heap space"));
}

#[test]
fn test_heap_survives_when_garbage_is_reclaimable() {
    // The same allocation volume succeeds when each temporary becomes
    // garbage immediately.
    let config = RuntimeConfig {
        heap_capacity: 24,
        ..Default::default()
    };
    run_capture_with_config(
        "for (var i = 0; i < 50; i++) { var s = \"left\" + \"right\"; }",
        &config,
    )
    .expect("discarded temporaries must be reclaimed");
}

#[test]
fn test_serialize_deserialize_round_trip() {
    let chunk = compile_source(
        "class Pair { init(a, b) { this.a = a; this.b = b; } sum() { return this.a + this.b; } } \
         fun twice(n) { return n * 2; } \
         var p = Pair(1, twice(3)); \
         var total = p.sum();",
    )
    .unwrap();

    let bytes = bytecode::serialize(&chunk);
    let back = bytecode::deserialize(&bytes).unwrap();
    assert_eq!(back.code, chunk.code);
    assert_eq!(back.consts, chunk.consts);
    assert_eq!(back.strings, chunk.strings);
}

#[test]
fn test_bytecode_file_round_trip_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.opalb");

    let chunk = compile_source("var x = 1; print(x + 41);").unwrap();
    bytecode::write_file(&path, &chunk).unwrap();
    let back = bytecode::read_file(&path).unwrap();
    assert_eq!(back, chunk);

    let mut vm = VM::new(&RuntimeConfig::default());
    let output = Rc::new(RefCell::new(String::new()));
    let sink = output.clone();
    vm.register_native(
        "print",
        1,
        Rc::new(move |args: &[HostValue]| {
            sink.borrow_mut()
                .push_str(&opal::stdlib::display(&args[0]));
            Ok(HostValue::Nil)
        }),
    )
    .unwrap();
    vm.run(&back).unwrap();
    assert_eq!(output.borrow().as_str(), "42");
}

#[test]
fn test_multiple_compile_errors_in_one_pass() {
    let errors = compile_source("var 1;\nvar 2;\nvar ok = 3;\nreturn ok;").unwrap_err();
    assert_eq!(errors.len(), 3);
    assert_eq!(errors[0].line, 1);
    assert_eq!(errors[1].line, 2);
    assert_eq!(errors[2].line, 4);
}

#[test]
fn test_for_initializer_is_scoped_to_the_loop() {
    let err = assert_failure("for (var i = 0; i < 3; i++) { } print(i);");
    assert!(err.contains("undefined variable 'i'"));
}

#[test]
fn test_fibonacci() {
    assert_output(
        "fun fib(n) { if (n <= 1) { return n; } return fib(n - 1) + fib(n - 2); } \
         for (var i = 0; i < 8; i++) { print(fib(i)); }",
        "0\n1\n1\n2\n3\n5\n8\n13\n",
    );
}

#[test]
fn test_bitwise_pipeline() {
    assert_output(
        "var flags = 0; \
         flags = flags | 1 << 3; \
         flags = flags | 1 << 5; \
         print(flags); \
         print((flags & (1 << 3)) != 0); \
         print(~flags & 255);",
        "40\ntrue\n215\n",
    );
}

#[test]
fn test_logical_operators_short_circuit() {
    assert_output(
        "fun boom() { return 1 / 0; } \
         print(false and boom()); \
         print(true or boom());",
        "false\ntrue\n",
    );
}

#[test]
fn test_runtime_error_reports_line() {
    let err = assert_failure("var a = 1;\nvar b = a + \"no\";");
    assert!(err.contains("[line 2]"));
}
