//! End-to-end interpreter scenarios: source in, printed output out.

use lox_vm::{InterpretError, Vm};
use std::io::Write;
use std::sync::{Arc, Mutex};

/// A `Write` handle the test can keep while the VM owns a clone.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("buffer lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (Result<(), InterpretError>, String) {
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(Box::new(buf.clone()));
    let result = vm.interpret(source);
    let output = String::from_utf8(buf.0.lock().expect("buffer lock").clone())
        .expect("program output is UTF-8");
    (result, output)
}

fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert_eq!(result, Ok(()), "program failed; output so far: {output:?}");
    output
}

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run_ok("print -2 + 6 / 3;"), "0\n");
    assert_eq!(run_ok("print 7 / 2;"), "3.5\n");
}

#[test]
fn test_string_concatenation() {
    assert_eq!(run_ok("var a = \"foo\"; var b = \"bar\"; print a + b;"), "foobar\n");
    // Concatenation re-interns: the result is identical to the literal.
    assert_eq!(run_ok("print \"foo\" + \"bar\" == \"foobar\";"), "true\n");
}

#[test]
fn test_equality_and_comparison() {
    assert_eq!(run_ok("print 1 == 1.0;"), "true\n");
    assert_eq!(run_ok("print nil == false;"), "false\n");
    assert_eq!(run_ok("print \"a\" == \"b\";"), "false\n");
    assert_eq!(run_ok("print 1 < 2; print 2 <= 2; print 3 > 4; print 4 >= 4;"),
        "true\ntrue\nfalse\ntrue\n");
    assert_eq!(run_ok("print 1 != 2;"), "true\n");
}

#[test]
fn test_truthiness() {
    assert_eq!(run_ok("print !nil; print !false; print !0; print !\"\";"),
        "true\ntrue\nfalse\nfalse\n");
    assert_eq!(run_ok("if (0) print \"zero is truthy\";"), "zero is truthy\n");
}

#[test]
fn test_control_flow() {
    assert_eq!(run_ok("if (1 < 2) print \"then\"; else print \"else\";"), "then\n");
    assert_eq!(run_ok("if (1 > 2) print \"then\"; else print \"else\";"), "else\n");
    assert_eq!(
        run_ok("var i = 0; while (i < 3) { print i; i = i + 1; }"),
        "0\n1\n2\n"
    );
    assert_eq!(
        run_ok("for (var i = 0; i < 3; i = i + 1) print i;"),
        "0\n1\n2\n"
    );
}

#[test]
fn test_logical_operators_short_circuit() {
    assert_eq!(run_ok("print true and 2;"), "2\n");
    assert_eq!(run_ok("print false and 2;"), "false\n");
    assert_eq!(run_ok("print nil or \"fallback\";"), "fallback\n");
    assert_eq!(run_ok("print 1 or 2;"), "1\n");
    // The right side must not run when short-circuited.
    assert_eq!(
        run_ok("fun loud() { print \"ran\"; return true; } false and loud(); print \"done\";"),
        "done\n"
    );
}

#[test]
fn test_recursive_function() {
    assert_eq!(
        run_ok("fun fib(n){ if (n<2) return n; return fib(n-1)+fib(n-2);} print fib(10);"),
        "55\n"
    );
}

#[test]
fn test_closure_over_global_counter() {
    assert_eq!(
        run_ok(
            "var c = 0; fun make(){ fun inc(){ c = c+1; return c;} return inc;} \
             var f = make(); f(); f(); print f();"
        ),
        "3\n"
    );
}

#[test]
fn test_closure_captures_its_own_cell() {
    let source = "\
        fun make() {\n\
          var n = 0;\n\
          fun inc() { n = n + 1; return n; }\n\
          return inc;\n\
        }\n\
        var a = make();\n\
        a(); a();\n\
        print a();\n\
        var b = make();\n\
        print b();\n";
    assert_eq!(run_ok(source), "3\n1\n");
}

#[test]
fn test_two_closures_share_one_upvalue() {
    let source = "\
        fun pair() {\n\
          var x = 0;\n\
          fun set(v) { x = v; }\n\
          fun get() { return x; }\n\
          set(42);\n\
          print get();\n\
        }\n\
        pair();\n";
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn test_upvalue_closed_at_scope_exit() {
    let source = "\
        var hold;\n\
        {\n\
          var local = \"captured\";\n\
          fun get() { return local; }\n\
          hold = get;\n\
        }\n\
        print hold();\n";
    assert_eq!(run_ok(source), "captured\n");
}

#[test]
fn test_class_inheritance_finds_super_method() {
    assert_eq!(
        run_ok("class A{ greet(){ return \"hi\";} } class B < A {} print B().greet();"),
        "hi\n"
    );
}

#[test]
fn test_initializer_and_method_state() {
    assert_eq!(
        run_ok(
            "class Counter{ init(){ this.n=0;} tick(){ this.n = this.n+1; return this.n;} } \
             var c=Counter(); c.tick(); c.tick(); print c.tick();"
        ),
        "3\n"
    );
}

#[test]
fn test_initializer_returns_the_receiver() {
    assert_eq!(
        run_ok("class A { init() { this.x = 1; } } print A().x;"),
        "1\n"
    );
}

#[test]
fn test_super_call_dispatches_to_superclass() {
    let source = "\
        class A { describe() { return \"A\"; } }\n\
        class B < A {\n\
          describe() { return super.describe() + \"B\"; }\n\
        }\n\
        print B().describe();\n";
    assert_eq!(run_ok(source), "AB\n");
}

#[test]
fn test_method_override_wins_over_inherited() {
    let source = "\
        class A { f() { return \"base\"; } }\n\
        class B < A { f() { return \"override\"; } }\n\
        print B().f();\n";
    assert_eq!(run_ok(source), "override\n");
}

#[test]
fn test_fields_shadow_methods_on_invoke() {
    let source = "\
        class A { f() { return \"method\"; } }\n\
        var a = A();\n\
        fun replacement() { return \"field\"; }\n\
        a.f = replacement;\n\
        print a.f();\n";
    assert_eq!(run_ok(source), "field\n");
}

#[test]
fn test_bound_method_remembers_receiver() {
    let source = "\
        class Person {\n\
          init(name) { this.name = name; }\n\
          greet() { return \"hi \" + this.name; }\n\
        }\n\
        var m = Person(\"ada\").greet;\n\
        print m();\n";
    assert_eq!(run_ok(source), "hi ada\n");
}

#[test]
fn test_clock_native() {
    assert_eq!(run_ok("print clock() >= 0;"), "true\n");
    assert_eq!(run_ok("var t = clock(); print clock() >= t;"), "true\n");
}

#[test]
fn test_print_formats() {
    assert_eq!(run_ok("print nil; print true; print 1; print 1.5;"), "nil\ntrue\n1\n1.5\n");
    assert_eq!(run_ok("fun f() {} print f;"), "<fn f>\n");
    assert_eq!(run_ok("class C {} print C; print C();"), "C\nC instance\n");
    assert_eq!(run_ok("print clock;"), "<native fn>\n");
}

// --- error scenarios ----------------------------------------------------

#[test]
fn test_add_number_and_string_is_a_runtime_error() {
    let (result, output) = run("print 1 + \"a\";");
    assert_eq!(result, Err(InterpretError::Runtime));
    assert_eq!(output, "");
}

#[test]
fn test_read_local_in_own_initializer_is_a_compile_error() {
    let (result, _) = run("{ var x = x; }");
    assert_eq!(result, Err(InterpretError::Compile));
}

#[test]
fn test_unbounded_recursion_overflows_the_frame_stack() {
    let (result, _) = run("fun f(n) { return f(n); } f(1);");
    assert_eq!(result, Err(InterpretError::Runtime));
}

#[test]
fn test_undefined_variable() {
    assert_eq!(run("print missing;").0, Err(InterpretError::Runtime));
    assert_eq!(run("missing = 1;").0, Err(InterpretError::Runtime));
    // A failed assignment must not define the global as a side effect.
    let buf = SharedBuf::default();
    let mut vm = Vm::with_output(Box::new(buf.clone()));
    assert_eq!(vm.interpret("missing = 1;"), Err(InterpretError::Runtime));
    assert_eq!(vm.interpret("print missing;"), Err(InterpretError::Runtime));
}

#[test]
fn test_type_errors() {
    assert_eq!(run("print -\"a\";").0, Err(InterpretError::Runtime));
    assert_eq!(run("print 1 < \"a\";").0, Err(InterpretError::Runtime));
    assert_eq!(run("print nil + nil;").0, Err(InterpretError::Runtime));
}

#[test]
fn test_call_errors() {
    assert_eq!(run("var x = 1; x();").0, Err(InterpretError::Runtime));
    assert_eq!(run("\"text\"();").0, Err(InterpretError::Runtime));
    assert_eq!(
        run("fun f(a, b) {} f(1);").0,
        Err(InterpretError::Runtime)
    );
    assert_eq!(run("class A {} A(1);").0, Err(InterpretError::Runtime));
}

#[test]
fn test_property_errors() {
    assert_eq!(run("print 1.x;").0, Err(InterpretError::Runtime));
    assert_eq!(run("1.x = 2;").0, Err(InterpretError::Runtime));
    assert_eq!(
        run("class A {} print A().missing;").0,
        Err(InterpretError::Runtime)
    );
    assert_eq!(
        run("class A {} A().missing();").0,
        Err(InterpretError::Runtime)
    );
}

#[test]
fn test_superclass_must_be_a_class() {
    assert_eq!(
        run("var NotAClass = 1; class B < NotAClass {}").0,
        Err(InterpretError::Runtime)
    );
}

#[test]
fn test_output_stops_at_the_failing_statement() {
    let (result, output) = run("print \"before\"; print missing; print \"after\";");
    assert_eq!(result, Err(InterpretError::Runtime));
    assert_eq!(output, "before\n");
}
