// Integration tests for the Pluto compiler and VM
//
// These tests run complete Pluto programs through the whole pipeline —
// lexer, parser, compiler, VM — and inspect the value left at the top
// of the root frame's stack. Covered areas:
// - Literal round-trips and arithmetic
// - Collection algebra and indexing
// - Control flow (if/elif, while, for, break/next, match)
// - Pattern-dispatched functions and blocks
// - Classes, methods, and inheritance
// - try/catch and user-level errors
// - The `use` importer

use pluto::bytecode;
use pluto::compiler::Compiler;
use pluto::errors::ErrorKind;
use pluto::lexer::tokenize;
use pluto::parser::Parser;
use pluto::store::Store;
use pluto::value::Value;
use pluto::vm::Vm;
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

fn run_code(source: &str) -> (Vm, Rc<RefCell<Store>>) {
    let mut parser = Parser::new(tokenize(source));
    let program = parser.parse();
    assert!(parser.errors.is_empty(), "parse errors: {:?}", parser.errors);

    let mut compiler = Compiler::new();
    compiler.compile_program(&program).expect("compilation failed");

    let code = bytecode::read(&compiler.bytes).expect("bytecode decoding failed");

    let store = Rc::new(RefCell::new(Store::new()));
    compiler.install(&mut store.borrow_mut());

    let mut vm = Vm::new();
    vm.run(Rc::new(code), Rc::clone(&store), Rc::new(compiler.constants), false);

    (vm, store)
}

/// Run a program and return the final top-of-stack value
fn eval(source: &str) -> Value {
    let (vm, _store) = run_code(source);
    assert!(vm.error.is_none(), "runtime error: {:?}", vm.error);
    vm.extract_value().expect("program left no value on the stack")
}

fn eval_err(source: &str) -> ErrorKind {
    let (vm, _store) = run_code(source);
    vm.error.expect("expected a runtime error").kind
}

fn assert_number(source: &str, expected: f64) {
    let value = eval(source);
    assert!(
        value.equals(&Value::Number(expected)),
        "{} evaluated to {:?}, expected {}",
        source,
        value,
        expected
    );
}

fn assert_value(source: &str, expected: &Value) {
    let value = eval(source);
    assert!(
        value.equals(expected),
        "{} evaluated to {:?}, expected {:?}",
        source,
        value,
        expected
    );
}

fn numbers(values: &[f64]) -> Value {
    Value::array(values.iter().map(|n| Value::Number(*n)).collect())
}

/* Literals and arithmetic */

#[test]
fn literals_round_trip() {
    assert_number("5", 5.0);
    assert_value("\"hello\"", &Value::string("hello"));
    assert_value("true", &Value::Boolean(true));
    assert_value("'c'", &Value::Char('c'));
    assert_value("null", &Value::Null);
    assert_value("(1, 2)", &Value::tuple(vec![Value::Number(1.0), Value::Number(2.0)]));
}

#[test]
fn arithmetic_precedence() {
    assert_number("1 + 2 * 3", 7.0);
    assert_number("(1 + 2) * 3", 9.0);
    assert_number("2 ** 3", 8.0);
    assert_number("7 // 2", 3.0);
    assert_number("7 % 2", 1.0);
    assert_number("-(-3)", 3.0);
    assert_number("10 / 4", 2.5);
}

#[test]
fn floor_div_and_mod_agree() {
    // a // b * b + a % b == a
    assert_number("7 // 2 * 2 + 7 % 2", 7.0);
    assert_number("9 // 4 * 4 + 9 % 4", 9.0);
}

#[test]
fn bitwise_on_numbers() {
    assert_number("6 & 3", 2.0);
    assert_number("6 | 3", 7.0);
}

#[test]
fn comparisons_and_logic() {
    assert_value("1 < 2", &Value::Boolean(true));
    assert_value("2 <= 2", &Value::Boolean(true));
    assert_value("3 == 3", &Value::Boolean(true));
    assert_value("3 != 3", &Value::Boolean(false));
    assert_value("true && false", &Value::Boolean(false));
    assert_value("false || true", &Value::Boolean(true));
}

#[test]
fn logical_operators_short_circuit_to_operand_values() {
    // && and || yield the deciding operand, like the jumps they
    // compile to
    assert_number("0 && 5", 0.0);
    assert_number("1 && 5", 5.0);
    assert_number("0 || 7", 7.0);
    assert_number("3 || 7", 3.0);
}

#[test]
fn cross_variant_equality_is_false() {
    assert_value("3 == '3'", &Value::Boolean(false));
    assert_value("0 == false", &Value::Boolean(false));
    assert_value("\"1\" == 1", &Value::Boolean(false));
}

/* Collections */

#[test]
fn collection_identities() {
    assert_value("xs = [1, 2, 3]; ys = []; xs + ys", &numbers(&[1.0, 2.0, 3.0]));
    assert_value("xs = [1, 2]; ys = [2]; xs - ys", &numbers(&[1.0]));
    assert_value("xs = [1, 2, 1]; ys = [2, 3]; xs | ys", &numbers(&[1.0, 2.0, 3.0]));
    assert_value("xs = [1, 2]; ys = [2, 3]; xs & ys", &numbers(&[2.0]));
    assert_value("xs = [1, 2]; xs * 0", &numbers(&[]));
    assert_value("xs = [1, 2]; xs * 2", &numbers(&[1.0, 2.0, 1.0, 2.0]));
}

#[test]
fn strings_are_collections_of_chars() {
    assert_value("s = \"abc\"; s[1]", &Value::Char('b'));
    assert_value("\"ab\" + \"cd\"", &Value::string("abcd"));
    assert_value("\"ab\" * 2", &Value::string("abab"));
}

#[test]
fn string_mutation_replaces_one_char() {
    assert_value("s = \"abc\"; s[1] = 'z'; s", &Value::string("azc"));
}

#[test]
fn indexing_reads_and_writes() {
    assert_number("a = [1, 2, 3, 4]; a[2]", 3.0);
    assert_value("a = [1, 2]; a[0] = 9; a", &numbers(&[9.0, 2.0]));
    // out-of-range writes are no-ops
    assert_value("a = [1, 2]; a[9] = 5; a", &numbers(&[1.0, 2.0]));
}

#[test]
fn out_of_range_read_is_not_found() {
    assert_eq!(eval_err("a = [1]; a[5]"), ErrorKind::NotFound);
}

#[test]
fn maps_read_and_write_through_dot_and_index() {
    assert_number("a = [\"x\": 1, \"y\": 2]; a.x = 10; a.x", 10.0);
    assert_number("a = [\"x\": 1]; a[\"x\"]", 1.0);
    assert_number("a = [:]; a.k = 3; a.k", 3.0);
}

#[test]
fn assignment_shares_structure() {
    assert_value("a = [1, 2]; b = a; b[0] = 9; a", &numbers(&[9.0, 2.0]));
}

#[test]
fn shorthand_assignment_desugars() {
    assert_number("a = 1; a += 4; a", 5.0);
    assert_number("a = 10; a //= 3; a", 3.0);
}

/* Control flow */

#[test]
fn if_and_elif_chains() {
    assert_number("if (true) { 1 } else { 2 }", 1.0);
    assert_number("if (false) { 1 } else { 2 }", 2.0);
    assert_number("x = 5; if (x < 3) { 1 } elif (x < 10) { 2 } else { 3 }", 2.0);
}

#[test]
fn while_false_never_runs_the_body() {
    assert_number("a = 0; while (false) { a = 1 }; a", 0.0);
}

#[test]
fn break_stops_iteration() {
    assert_number("a = 0; while (a < 5) { a = a + 1; if (a == 3) { break } }; a", 3.0);
}

#[test]
fn next_skips_to_the_check() {
    assert_number(
        "a = 0; b = 0; while (a < 5) { a = a + 1; if (a == 3) { next }; b = b + 1 }; b",
        4.0,
    );
}

#[test]
fn nested_loops_break_independently() {
    let source = "
        total = 0
        i = 0
        while (i < 3) {
            i = i + 1
            j = 0
            while (true) {
                j = j + 1
                if (j == 2) { break }
            }
            total = total + j
        }
        total
    ";
    assert_number(source, 6.0);
}

#[test]
fn break_outside_a_loop_is_a_syntax_error() {
    assert_eq!(eval_err("break"), ErrorKind::Syntax);
    assert_eq!(eval_err("next"), ErrorKind::Syntax);
}

#[test]
fn for_loops_iterate_collections() {
    assert_number("sum = 0; for (x : 1 to 4) { sum = sum + x }; sum", 10.0);
    assert_number("s = 0; xs = [2, 4, 6]; for (x : xs) { s = s + x }; s", 12.0);
}

#[test]
fn for_loops_support_next_and_break() {
    assert_number("sum = 0; for (x : 1 to 5) { if (x == 3) { next }; sum = sum + x }; sum", 12.0);
    assert_number("sum = 0; for (x : 1 to 5) { if (x == 3) { break }; sum = sum + x }; sum", 3.0);
}

#[test]
fn match_selects_the_first_matching_arm() {
    assert_value(
        "match (3) { 1, 2 => \"low\", 3 => \"three\", * => \"other\" }",
        &Value::string("three"),
    );
    assert_value("match (9) { 1 => \"one\", * => \"other\" }", &Value::string("other"));
    assert_value("match (9) { 1 => \"one\" }", &Value::Null);
}

/* Functions and blocks */

#[test]
fn pattern_dispatch_calls_the_right_function() {
    assert_number("def square $n { return $n * $n }; square 5", 25.0);
}

#[test]
fn parameters_bind_left_to_right() {
    assert_number("def sub $a from $b { return $b - $a }; sub 3 from 10", 7.0);
}

#[test]
fn functions_with_the_same_word_differ_by_shape() {
    let source = "
        def greet $name { return \"hi \" + $name }
        def greet $a and $b { return \"hi \" + $a + \" and \" + $b }
        greet \"ada\" and \"alan\"
    ";
    assert_value(source, &Value::string("hi ada and alan"));
}

#[test]
fn recursion_works_through_the_shared_store() {
    let source = "
        def fib $n {
            if ($n < 2) { return $n }
            return (fib ($n - 1)) + (fib ($n - 2))
        }
        fib 10
    ";
    assert_number(source, 55.0);
}

#[test]
fn zero_argument_calls_use_the_backslash() {
    assert_number("def answer { return 42 }; \\answer", 42.0);
}

#[test]
fn parent_scope_is_readable_from_a_callee() {
    assert_number("x = 10; def read_x { return x }; \\read_x", 10.0);
}

#[test]
fn caller_names_survive_a_call() {
    // the callee swaps the store's name table; the caller's table must
    // come back afterwards
    assert_number("def id $v { return $v }; a = id 1; b = 2; a + b", 3.0);
}

#[test]
fn missing_function_is_not_found() {
    assert_eq!(eval_err("frobnicate 5"), ErrorKind::NotFound);
}

#[test]
fn missing_name_is_not_found() {
    assert_eq!(eval_err("nope"), ErrorKind::NotFound);
}

#[test]
fn blocks_run_with_do() {
    assert_number("b = { return 7 }; do $b", 7.0);
    assert_number("b = { |x| -> return $x * 2 }; do $b on 21", 42.0);
    assert_number("b = { |x, y| -> return $x + $y }; args = [2, 3]; do $b with $args", 5.0);
}

#[test]
fn map_and_filter_over_collections() {
    assert_value(
        "xs = [1, 2, 3]; map { |x| -> return $x * $x } over $xs",
        &numbers(&[1.0, 4.0, 9.0]),
    );
    assert_value(
        "xs = [1, 2, 3, 4]; filter $xs by { |x| -> return $x % 2 == 0 }",
        &numbers(&[2.0, 4.0]),
    );
}

#[test]
fn builtin_type_coercion_yields_a_type_error_instance() {
    // `do` requires a block; a number produces a TypeError value
    assert_value("t = do 5; t.tag", &Value::string("TypeError"));
}

/* Builtins */

#[test]
fn ranges_count_both_ways() {
    assert_value("1 to 4", &numbers(&[1.0, 2.0, 3.0, 4.0]));
    assert_value("3 to 1", &numbers(&[3.0, 2.0, 1.0]));
    assert_value("2 to 2", &numbers(&[2.0]));
}

#[test]
fn slicing_preserves_collection_type() {
    assert_value("xs = [1, 2, 3, 4]; slice $xs from 1 to 3", &numbers(&[2.0, 3.0]));
    assert_value("s = \"hello\"; slice $s from 0 to 2", &Value::string("he"));
}

#[test]
fn format_replaces_placeholders_in_order() {
    assert_value(
        "args = [\"a\", \"b\"]; format \"{} then {}\" with $args",
        &Value::string("a then b"),
    );
}

#[test]
fn map_keys_and_values() {
    assert_value("m = [\"a\": 1]; keys of $m", &Value::array(vec![Value::string("a")]));
    assert_value("m = [\"a\": 1]; values of $m", &numbers(&[1.0]));
}

#[test]
fn numeric_builtins() {
    assert_number("round 2.5", 3.0);
    assert_number("floor 2.9", 2.0);
    assert_number("ceil 2.1", 3.0);
    assert_number("sqrt 49", 7.0);
}

#[test]
fn conversions_and_type_of() {
    assert_value("string of 3", &Value::string("3"));
    assert_number("number of \"2.5\"", 2.5);
    assert_value("t = number of \"nope\"; t.tag", &Value::string("TypeError"));
    assert_value("type of 3", &Value::string("<number>"));
    assert_value("xs = []; type of $xs", &Value::string("<array>"));
}

#[test]
fn append_and_contains() {
    assert_value("xs = [1]; append 2 to $xs; xs", &numbers(&[1.0, 2.0]));
    assert_value("xs = [1, 2]; $xs contains 2", &Value::Boolean(true));
    assert_value("xs = [1, 2]; $xs contains 9", &Value::Boolean(false));
}

#[test]
fn length_of_collections() {
    assert_number("xs = [1, 2, 3]; length of $xs", 3.0);
    assert_number("length of \"hello\"", 5.0);
}

/* Errors and try/catch */

#[test]
fn raise_builds_an_error_instance() {
    assert_value("e = raise \"kaboom\" with \"Boom\"; e.tag", &Value::string("Boom"));
    assert_value("e = raise \"kaboom\"; e.msg", &Value::string("kaboom"));
    assert_value("e = raise \"x\"; is error $e", &Value::Boolean(true));
    assert_value("is error 5", &Value::Boolean(false));
}

#[test]
fn catch_arm_matches_the_error_tag() {
    let source = "
        def boom { return raise \"kaboom\" with \"Boom\" }
        try { \\boom } catch (e) { \"Boom\" => e.tag, * => \"other\" }
    ";
    assert_value(source, &Value::string("Boom"));
}

#[test]
fn catch_wildcard_handles_unknown_tags() {
    let source = "
        def boom { return raise \"kaboom\" with \"Surprise\" }
        try { \\boom } catch (e) { \"Boom\" => 1, * => 2 }
    ";
    assert_number(source, 2.0);
}

#[test]
fn try_without_an_error_keeps_the_body_value() {
    assert_number("try { 5 } catch (e) { * => 0 }", 5.0);
}

#[test]
fn uncaught_errors_pass_through_as_values() {
    let source = "
        def boom { return raise \"kaboom\" with \"Odd\" }
        t = try { \\boom } catch (e) { \"Even\" => 1 }
        t.tag
    ";
    assert_value(source, &Value::string("Odd"));
}

#[test]
fn wrong_operand_types_set_vm_errors() {
    assert_eq!(eval_err("5 + true"), ErrorKind::WrongType);
    assert_eq!(eval_err("xs = [1]; xs + 5"), ErrorKind::NoOp);
    assert_eq!(eval_err("true < false"), ErrorKind::WrongType);
    assert_eq!(eval_err("5[0]"), ErrorKind::NotFound);
}

/* Classes and methods */

#[test]
fn init_constructs_instances() {
    let source = "
        class Counter {
            init with $start { self.count = $start }
        }
        c = Counter with 5
        c.count
    ";
    assert_number(source, 5.0);
}

#[test]
fn methods_dispatch_on_the_receiver() {
    let source = "
        class Counter {
            init with $start { self.count = $start }
            def bump { self.count = self.count + 1 }
        }
        c = Counter with 5
        c : bump
        c.count
    ";
    assert_number(source, 6.0);
}

#[test]
fn child_methods_override_parent_methods() {
    let source = "
        class Animal {
            def speak { return \"generic\" }
        }
        class Dog extends Animal {
            def speak { return \"woof\" }
        }
        d = new $Dog
        d : speak
    ";
    assert_value(source, &Value::string("woof"));
}

#[test]
fn parent_methods_are_inherited() {
    let source = "
        class Animal {
            def speak { return \"generic\" }
        }
        class Dog extends Animal {
            def fetch { return \"ball\" }
        }
        d = new $Dog
        (d : speak) + \" \" + (d : fetch)
    ";
    assert_value(source, &Value::string("generic ball"));
}

#[test]
fn instances_of_error_subclasses_are_caught() {
    let source = "
        class ParseFailure extends Error {
            init at $pos { self.tag = \"ParseFailure\"; self.msg = \"bad input\" }
        }
        e = ParseFailure at 3
        is error $e
    ";
    assert_value(source, &Value::Boolean(true));
}

#[test]
fn emission_injects_raw_bytecode() {
    // the stream holds 21 at constant 0; the emission adds it to itself
    assert_number("21; emit (LOAD_CONST 0, BINARY_ADD)", 42.0);
}

/* Imports */

static IMPORT_COUNTER: AtomicU64 = AtomicU64::new(1);

fn write_package(name: &str, contents: &str) -> std::path::PathBuf {
    let id = IMPORT_COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("pluto_test_{}_{}", std::process::id(), id));
    std::fs::create_dir_all(&dir).expect("failed to create package dir");

    let path = dir.join(format!("{}.pluto", name));
    std::fs::write(&path, contents).expect("failed to write package source");
    path
}

#[test]
fn use_binds_a_module_map() {
    let path = write_package(
        "mathmod",
        "
        _module = [\"title\": \"mathmod\"]
        pi = 3
        def double $x { return $x * 2 }
        ",
    );

    let source = format!("use \"{}\"\nmathmod.pi", path.display());
    assert_number(&source, 3.0);
}

#[test]
fn qualified_calls_reach_imported_functions() {
    let path = write_package("geometry", "def area $r { return 3 * $r * $r }");

    let source = format!("use \"{}\"\ngeometry :: area 2", path.display());
    assert_number(&source, 12.0);
}

#[test]
fn absorbed_bindings_do_not_leak_into_modules() {
    let path = write_package("leaky", "own = 1");

    let source = format!("outer = 99\nuse \"{}\"\nleaky.outer", path.display());
    // `outer` was absorbed from the importer, so the module map holds
    // only `own`; missing container keys read as null
    assert_value(&source, &Value::Null);
}

#[test]
fn importing_twice_is_idempotent() {
    let path = write_package("once", "def triple $x { return $x * 3 }");

    let source = format!(
        "use \"{0}\"\nuse \"{0}\"\nonce :: triple 4",
        path.display()
    );

    let (vm, store) = run_code(&source);
    assert!(vm.error.is_none(), "runtime error: {:?}", vm.error);
    assert!(vm.extract_value().unwrap().equals(&Value::Number(12.0)));

    // the second use re-bound the cached module without duplicating
    // its functions
    let module = store.borrow().get_name("once").expect("module not bound");
    let methods = module.get(&Value::string("_methods")).expect("_methods missing");
    assert_eq!(methods.elements().unwrap().len(), 1);
}

#[test]
fn missing_package_is_an_import_error() {
    let kind = eval_err("use \"definitely_not_a_real_package_xyz\"");
    assert!(matches!(kind, ErrorKind::NotFound | ErrorKind::Unknown));
}
