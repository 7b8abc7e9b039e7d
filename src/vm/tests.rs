use super::Vm;
use crate::error::InterpretResult;

fn run(source: &str) -> (InterpretResult, String) {
    let mut vm = Vm::new(Vec::new());
    let result = vm.interpret(source);
    let out = String::from_utf8(vm.into_writer()).expect("program output is valid utf8");
    (result, out)
}

#[test]
fn prints_arithmetic_without_newline() {
    let (result, out) = run("print 1 + 2;");
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(out, "3");
}

#[test]
fn println_concatenates_strings_with_newline() {
    let (result, out) = run("println \"a\" + \"b\";");
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(out, "ab\n");
}

#[test]
fn closures_capture_and_keep_their_own_upvalue() {
    let source = r#"
        fun mk() {
            var count = 0;
            fun inc() {
                count = count + 1;
                return count;
            }
            return inc;
        }
        var counter = mk();
        println counter();
        println counter();
        println counter();
    "#;
    let (result, out) = run(source);
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(out, "1\n2\n3\n");
}

#[test]
fn two_closures_from_the_same_call_share_the_upvalue() {
    let source = r#"
        fun mk() {
            var count = 0;
            fun inc() { count = count + 1; return count; }
            fun get() { return count; }
            var pair = [inc, get];
            return pair;
        }
        var pair = mk();
        pair[0]();
        pair[0]();
        println pair[1]();
    "#;
    let (result, out) = run(source);
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(out, "2\n");
}

#[test]
fn classes_bind_methods_and_run_init() {
    let source = r#"
        class Counter {
            init(start) {
                this.value = start;
            }
            bump() {
                this.value = this.value + 1;
                return this.value;
            }
        }
        var c = Counter(10);
        println c.bump();
        println c.bump();
    "#;
    let (result, out) = run(source);
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(out, "11\n12\n");
}

#[test]
fn array_indexing_and_mutation() {
    let source = r#"
        var a = [1, 2, 3];
        a[1] = 99;
        println a[0];
        println a[1];
        println a[2];
    "#;
    let (result, out) = run(source);
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(out, "1\n99\n3\n");
}

#[test]
fn map_literal_field_access() {
    let source = r#"
        var m = {x: 1, y: 2};
        println m.x;
        m.x = 5;
        println m["x"];
    "#;
    let (result, out) = run(source);
    assert!(matches!(result, InterpretResult::Ok));
    assert_eq!(out, "1\n5\n");
}

#[test]
fn undefined_global_is_a_runtime_error() {
    let (result, _out) = run("print undefinedVar;");
    assert!(matches!(result, InterpretResult::RuntimeError));
}

#[test]
fn calling_a_non_callable_is_a_runtime_error() {
    let (result, _out) = run("var x = 1; x();");
    assert!(matches!(result, InterpretResult::RuntimeError));
}

#[test]
fn wrong_arity_is_a_runtime_error() {
    let source = r#"
        fun add(a, b) { return a + b; }
        add(1);
    "#;
    let (result, _out) = run(source);
    assert!(matches!(result, InterpretResult::RuntimeError));
}
