// File: src/builtins.rs
//
// Built-in functions, registered at VM start alongside user
// definitions. Each builtin is a pattern plus a parameter-to-type
// coercion table: capability tags (<collection>, <container>, <hasher>,
// <any>) match structurally, anything else matches the exact type tag.
// A coercion failure produces a user-level TypeError instance rather
// than a VM error.

use crate::store::Store;
use crate::value::{
    make_collection, Class, Function, OnCall, PatternItem, Value, ANY_TYPE, ARRAY_TYPE,
    BLOCK_TYPE, CLASS_TYPE, COLLECTION_TYPE, MAP_TYPE, NUMBER_TYPE, STRING_TYPE,
};
use crate::vm::Vm;
use ahash::AHashMap;
use once_cell::sync::Lazy;
use std::cell::RefCell;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

pub type Args = AHashMap<String, Value>;
pub type BuiltinFn = fn(&Args, &mut Vm, &Rc<RefCell<Store>>) -> Value;

pub struct Builtin {
    pub pattern: &'static str,
    pub types: &'static [(&'static str, &'static str)],
    pub func: BuiltinFn,
}

static BUILTINS: Lazy<Vec<Builtin>> = Lazy::new(|| {
    vec![
        Builtin { pattern: "print $obj", types: &[], func: print_obj },
        Builtin { pattern: "prompt $msg", types: &[("msg", STRING_TYPE)], func: prompt_msg },
        Builtin { pattern: "do $block", types: &[("block", BLOCK_TYPE)], func: do_block },
        Builtin {
            pattern: "do $block with $args",
            types: &[("block", BLOCK_TYPE), ("args", COLLECTION_TYPE)],
            func: do_block_with_args,
        },
        Builtin {
            pattern: "do $block on $arg",
            types: &[("block", BLOCK_TYPE)],
            func: do_block_on_arg,
        },
        Builtin {
            pattern: "map $block over $collection",
            types: &[("block", BLOCK_TYPE), ("collection", COLLECTION_TYPE)],
            func: map_block_over,
        },
        Builtin {
            pattern: "filter $collection by $block",
            types: &[("collection", COLLECTION_TYPE), ("block", BLOCK_TYPE)],
            func: filter_collection,
        },
        Builtin {
            pattern: "format $format with $args",
            types: &[("format", STRING_TYPE), ("args", COLLECTION_TYPE)],
            func: format_with_args,
        },
        Builtin {
            pattern: "$start to $end",
            types: &[("start", NUMBER_TYPE), ("end", NUMBER_TYPE)],
            func: start_to_end,
        },
        Builtin {
            pattern: "slice $collection from $start to $end",
            types: &[
                ("collection", COLLECTION_TYPE),
                ("start", NUMBER_TYPE),
                ("end", NUMBER_TYPE),
            ],
            func: slice_collection,
        },
        Builtin { pattern: "keys of $map", types: &[("map", MAP_TYPE)], func: keys_of },
        Builtin { pattern: "values of $map", types: &[("map", MAP_TYPE)], func: values_of },
        Builtin {
            pattern: "length of $collection",
            types: &[("collection", COLLECTION_TYPE)],
            func: length_of,
        },
        Builtin {
            pattern: "append $item to $array",
            types: &[("array", ARRAY_TYPE)],
            func: append_to,
        },
        Builtin {
            pattern: "$collection contains $item",
            types: &[("collection", COLLECTION_TYPE)],
            func: collection_contains,
        },
        Builtin { pattern: "round $num", types: &[("num", NUMBER_TYPE)], func: round_num },
        Builtin { pattern: "floor $num", types: &[("num", NUMBER_TYPE)], func: floor_num },
        Builtin { pattern: "ceil $num", types: &[("num", NUMBER_TYPE)], func: ceil_num },
        Builtin { pattern: "sqrt $num", types: &[("num", NUMBER_TYPE)], func: sqrt_num },
        Builtin { pattern: "string of $obj", types: &[], func: string_of },
        Builtin { pattern: "number of $str", types: &[("str", STRING_TYPE)], func: number_of },
        Builtin { pattern: "type of $obj", types: &[("obj", ANY_TYPE)], func: type_of },
        Builtin { pattern: "new $class", types: &[("class", CLASS_TYPE)], func: new_instance },
        Builtin { pattern: "raise $msg", types: &[("msg", STRING_TYPE)], func: raise_msg },
        Builtin {
            pattern: "raise $msg with $tag",
            types: &[("msg", STRING_TYPE), ("tag", STRING_TYPE)],
            func: raise_msg_with_tag,
        },
        Builtin { pattern: "is error $obj", types: &[], func: is_error },
    ]
});

pub fn lookup(key: &str) -> Option<&'static Builtin> {
    BUILTINS.iter().find(|b| b.pattern == key)
}

/// Register every builtin, plus the root classes `Base` and `Error`,
/// into a store. Called at VM start; re-registration replaces by
/// pattern, so running twice is harmless.
pub fn register(store: &mut Store) {
    for builtin in BUILTINS.iter() {
        let pattern = builtin
            .pattern
            .split(' ')
            .map(|item| {
                if let Some(name) = item.strip_prefix('$') {
                    PatternItem::Param(name.to_string())
                } else {
                    PatternItem::Ident(item.to_string())
                }
            })
            .collect();

        let function = Function {
            pattern,
            body: Rc::new(Vec::new()),
            constants: Rc::new(Vec::new()),
            names: Vec::new(),
            patterns: Vec::new(),
            on_call: Some(OnCall::Builtin(builtin.pattern)),
        };

        store.functions.define(Rc::new(function));
    }

    let base = Class { name: "Base".to_string(), parent: None, methods: Vec::new() };
    store.define("Base", Value::Class(Rc::new(base)), false);

    let error =
        Class { name: "Error".to_string(), parent: Some("Base".to_string()), methods: Vec::new() };
    store.define("Error", Value::Class(Rc::new(error)), false);
}

/// Build a user-level error: an Instance of class Error with `tag` and
/// `msg` fields
pub fn err_instance(tag: &str, msg: &str) -> Value {
    let class =
        Class { name: "Error".to_string(), parent: Some("Base".to_string()), methods: Vec::new() };

    let instance = Value::instance(Rc::new(class));
    instance.set(Value::string("tag"), Value::string(tag));
    instance.set(Value::string("msg"), Value::string(msg));
    instance
}

/// Is this value an Error instance (directly or through its parent
/// chain, resolved by name through the store)?
pub fn value_is_error(value: &Value, store: &Rc<RefCell<Store>>) -> bool {
    let Value::Instance(instance) = value else { return false };

    let mut class = Rc::clone(&instance.borrow().base);
    let mut seen: Vec<String> = Vec::new();

    loop {
        if class.name == "Error" {
            return true;
        }

        if seen.contains(&class.name) {
            return false;
        }
        seen.push(class.name.clone());

        let parent = match &class.parent {
            Some(parent) => parent.clone(),
            None => return false,
        };

        class = match store.borrow().get_name(&parent) {
            Some(Value::Class(parent)) => parent,
            _ => return false,
        };
    }
}

/* The builtins themselves */

// print $obj
fn print_obj(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    println!("{}", args["obj"]);
    Value::Null
}

// prompt $msg
fn prompt_msg(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    print!("{}", args["msg"]);
    let _ = io::stdout().flush();

    let mut line = String::new();
    match io::stdin().lock().read_line(&mut line) {
        Ok(_) => Value::string(line.trim_end_matches(&['\n', '\r'][..])),
        Err(err) => err_instance("IOError", &err.to_string()),
    }
}

fn block_arg<'a>(args: &'a Args, name: &str) -> &'a Rc<crate::value::Block> {
    match &args[name] {
        Value::Block(block) => block,
        // unreachable: the coercion table checked the type already
        _ => panic!("builtin parameter ${} was not coerced to a block", name),
    }
}

// do $block
fn do_block(args: &Args, vm: &mut Vm, store: &Rc<RefCell<Store>>) -> Value {
    let block = Rc::clone(block_arg(args, "block"));
    vm.run_block(&block, Vec::new(), store)
}

// do $block with $args
fn do_block_with_args(args: &Args, vm: &mut Vm, store: &Rc<RefCell<Store>>) -> Value {
    let block = Rc::clone(block_arg(args, "block"));
    let call_args = args["args"].elements().unwrap_or_default();
    vm.run_block(&block, call_args, store)
}

// do $block on $arg
fn do_block_on_arg(args: &Args, vm: &mut Vm, store: &Rc<RefCell<Store>>) -> Value {
    let block = Rc::clone(block_arg(args, "block"));
    let arg = args["arg"].clone();
    vm.run_block(&block, vec![arg], store)
}

/// Apply a block to one element, passing (index, item) when the block
/// takes two parameters
fn apply_element(
    vm: &mut Vm,
    store: &Rc<RefCell<Store>>,
    block: &Rc<crate::value::Block>,
    index: usize,
    item: Value,
) -> Value {
    match block.params.len() {
        1 => vm.run_block(block, vec![item], store),
        2 => vm.run_block(block, vec![Value::Number(index as f64), item], store),
        n => err_instance(
            "TypeError",
            &format!("a block applied over a collection takes 1 or 2 parameters, not {}", n),
        ),
    }
}

// map $block over $collection
fn map_block_over(args: &Args, vm: &mut Vm, store: &Rc<RefCell<Store>>) -> Value {
    let block = Rc::clone(block_arg(args, "block"));
    let collection = args["collection"].clone();
    let elements = collection.elements().unwrap_or_default();

    let mut result = Vec::with_capacity(elements.len());

    for (index, item) in elements.into_iter().enumerate() {
        let mapped = apply_element(vm, store, &block, index, item);

        if value_is_error(&mapped, store) {
            return mapped;
        }

        result.push(mapped);
    }

    make_collection(collection.type_tag(), result)
}

// filter $collection by $block
fn filter_collection(args: &Args, vm: &mut Vm, store: &Rc<RefCell<Store>>) -> Value {
    let block = Rc::clone(block_arg(args, "block"));
    let collection = args["collection"].clone();
    let elements = collection.elements().unwrap_or_default();

    let mut result = Vec::new();

    for (index, item) in elements.into_iter().enumerate() {
        let keep = apply_element(vm, store, &block, index, item.clone());

        if value_is_error(&keep, store) {
            return keep;
        }

        if keep.is_truthy() {
            result.push(item);
        }
    }

    make_collection(collection.type_tag(), result)
}

// format $format with $args
fn format_with_args(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    let mut result = args["format"].to_string();

    for item in args["args"].elements().unwrap_or_default() {
        result = result.replacen("{}", &item.to_string(), 1);
    }

    Value::string(result)
}

// $start to $end — an inclusive range, counting down when end < start
fn start_to_end(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    let start = args["start"].as_number().unwrap_or(0.0) as i64;
    let end = args["end"].as_number().unwrap_or(0.0) as i64;

    let numbers: Vec<Value> = if end < start {
        (end..=start).rev().map(|n| Value::Number(n as f64)).collect()
    } else {
        (start..=end).map(|n| Value::Number(n as f64)).collect()
    };

    Value::array(numbers)
}

// slice $collection from $start to $end — half-open, clamped
fn slice_collection(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    let collection = args["collection"].clone();
    let elements = collection.elements().unwrap_or_default();

    let start = (args["start"].as_number().unwrap_or(0.0).max(0.0) as usize).min(elements.len());
    let end = (args["end"].as_number().unwrap_or(0.0).max(0.0) as usize).min(elements.len());

    let sliced = if start <= end { elements[start..end].to_vec() } else { Vec::new() };
    make_collection(collection.type_tag(), sliced)
}

// keys of $map
fn keys_of(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    match &args["map"] {
        Value::Map(map) => Value::array(map.borrow().key_objects()),
        _ => Value::array(Vec::new()),
    }
}

// values of $map
fn values_of(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    match &args["map"] {
        Value::Map(map) => Value::array(map.borrow().value_objects()),
        _ => Value::array(Vec::new()),
    }
}

// length of $collection
fn length_of(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    let elements = args["collection"].elements().unwrap_or_default();
    Value::Number(elements.len() as f64)
}

// append $item to $array — mutates in place, returns the array
fn append_to(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    let array = args["array"].clone();

    if let Value::Array(elements) = &array {
        elements.borrow_mut().push(args["item"].clone());
    }

    array
}

// $collection contains $item
fn collection_contains(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    let elements = args["collection"].elements().unwrap_or_default();
    let item = &args["item"];

    Value::Boolean(elements.iter().any(|el| el.equals(item)))
}

// round $num
fn round_num(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    Value::Number(args["num"].as_number().unwrap_or(0.0).round())
}

// floor $num
fn floor_num(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    Value::Number(args["num"].as_number().unwrap_or(0.0).floor())
}

// ceil $num
fn ceil_num(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    Value::Number(args["num"].as_number().unwrap_or(0.0).ceil())
}

// sqrt $num
fn sqrt_num(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    Value::Number(args["num"].as_number().unwrap_or(0.0).sqrt())
}

// string of $obj
fn string_of(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    Value::string(args["obj"].to_string())
}

// number of $str
fn number_of(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    let text = args["str"].to_string();

    match text.trim().parse::<f64>() {
        Ok(n) => Value::Number(n),
        Err(_) => err_instance("TypeError", &format!("cannot parse {} as a number", text)),
    }
}

// type of $obj
fn type_of(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    Value::string(args["obj"].type_tag())
}

// new $class — a bare instance, for classes without an init
fn new_instance(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    match &args["class"] {
        Value::Class(class) => Value::instance(Rc::clone(class)),
        _ => Value::Null,
    }
}

// raise $msg
fn raise_msg(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    err_instance("Error", &args["msg"].to_string())
}

// raise $msg with $tag
fn raise_msg_with_tag(args: &Args, _vm: &mut Vm, _store: &Rc<RefCell<Store>>) -> Value {
    err_instance(&args["tag"].to_string(), &args["msg"].to_string())
}

// is error $obj
fn is_error(args: &Args, _vm: &mut Vm, store: &Rc<RefCell<Store>>) -> Value {
    Value::Boolean(value_is_error(&args["obj"], store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_installs_patterns_and_root_classes() {
        let mut store = Store::new();
        register(&mut store);

        assert!(store.functions.search("print $").is_some());
        assert!(store.functions.search("slice $ from $ to $").is_some());
        assert!(store.functions.search("$ to $").is_some());
        assert!(matches!(store.get_name("Base"), Some(Value::Class(_))));
        assert!(matches!(store.get_name("Error"), Some(Value::Class(_))));
    }

    #[test]
    fn register_twice_does_not_duplicate() {
        let mut store = Store::new();
        register(&mut store);
        let count = store.functions.functions.len();
        register(&mut store);

        assert_eq!(store.functions.functions.len(), count);
    }

    #[test]
    fn err_instances_carry_tag_and_msg() {
        let err = err_instance("Boom", "it broke");

        assert!(err.get(&Value::string("tag")).unwrap().equals(&Value::string("Boom")));
        assert!(err.get(&Value::string("msg")).unwrap().equals(&Value::string("it broke")));

        let store = Rc::new(RefCell::new(Store::new()));
        assert!(value_is_error(&err, &store));
        assert!(!value_is_error(&Value::Number(1.0), &store));
    }

    #[test]
    fn error_subclasses_are_errors_through_the_store() {
        let mut store = Store::new();
        register(&mut store);

        let custom = Class {
            name: "ParseError".to_string(),
            parent: Some("Error".to_string()),
            methods: Vec::new(),
        };
        let custom = Rc::new(custom);
        store.define("ParseError", Value::Class(Rc::clone(&custom)), true);

        let store = Rc::new(RefCell::new(store));
        let instance = Value::instance(custom);
        assert!(value_is_error(&instance, &store));
    }
}
