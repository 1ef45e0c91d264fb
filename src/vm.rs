// File: src/vm.rs
//
// The Pluto virtual machine: a register-less stack interpreter.
//
// Frames live in a pool owned by the VM; a frame's parent is simply the
// frame below it. A callee shares its caller's Store by reference —
// CALL_FN swaps the store's name and pattern tables for the callee's
// own — which is what gives Pluto its lexical visibility of outer
// scope. The first error written to `vm.error` stops every frame.

use crate::builtins;
use crate::bytecode::{self, Instruction};
use crate::errors::{find_closest_match, ErrorKind, PlutoError};
use crate::module;
use crate::store::{call_pattern_matches, Store};
use crate::value::{make_collection, Block, Class, Function, MapData, OnCall, PatternItem, Value};
use ahash::AHashMap;
use std::cell::RefCell;
use std::rc::Rc;

/// Path-keyed module cache shared between a VM and the sub-machines it
/// spawns for imports. A re-`use` of the same source re-binds the
/// cached module instead of executing it again.
#[derive(Default)]
pub struct ImportCache {
    pub modules: AHashMap<String, (String, Value)>,
    pub loading: Vec<String>,
}

/// A single activation record
pub struct Frame {
    code: Rc<Vec<Instruction>>,
    constants: Rc<Vec<Value>>,
    pub locals: Rc<RefCell<Store>>,
    pub stack: Vec<Value>,
    offset: usize,
    breaks: Vec<usize>,
    nexts: Vec<usize>,
    jumped: bool,
}

impl Frame {
    fn new(
        code: Rc<Vec<Instruction>>,
        constants: Rc<Vec<Value>>,
        locals: Rc<RefCell<Store>>,
    ) -> Self {
        Self {
            code,
            constants,
            locals,
            stack: Vec::new(),
            offset: 0,
            breaks: Vec::new(),
            nexts: Vec::new(),
            jumped: false,
        }
    }
}

/// The virtual machine
pub struct Vm {
    frames: Vec<Frame>,
    pub error: Option<PlutoError>,
    pub imports: Rc<RefCell<ImportCache>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self { frames: Vec::new(), error: None, imports: Rc::new(RefCell::new(ImportCache::default())) }
    }

    /// A machine sharing another machine's import cache; used when a
    /// `use` compiles and executes a package
    pub fn with_imports(imports: Rc<RefCell<ImportCache>>) -> Self {
        Self { frames: Vec::new(), error: None, imports }
    }

    /// Execute a compiled unit in the given store. Builtins are
    /// registered first; with `use_prelude`, the standard packages are
    /// imported before the code runs. The root frame stays behind so
    /// `extract_value` can read the final stack.
    pub fn run(
        &mut self,
        code: Rc<Vec<Instruction>>,
        locals: Rc<RefCell<Store>>,
        constants: Rc<Vec<Value>>,
        use_prelude: bool,
    ) {
        builtins::register(&mut locals.borrow_mut());

        let frame = Frame::new(code, constants, locals);
        self.frames.push(frame);
        let fi = self.frames.len() - 1;

        if use_prelude {
            module::import_prelude(self, fi);

            if self.error.is_some() {
                return;
            }
        }

        self.execute(fi);
    }

    /// The top value of the root frame's stack, if any
    pub fn extract_value(&self) -> Option<Value> {
        self.frames.first().and_then(|f| f.stack.last().cloned())
    }

    /// The store shared by a frame's call chain
    pub fn frame_store(&self, fi: usize) -> Rc<RefCell<Store>> {
        Rc::clone(&self.frames[fi].locals)
    }

    /* Frame driving */

    fn execute(&mut self, fi: usize) {
        loop {
            let instruction = {
                let frame = &self.frames[fi];

                if frame.offset >= frame.code.len() {
                    break;
                }

                frame.code[frame.offset].clone()
            };

            self.do_instruction(fi, &instruction);

            if self.error.is_some() {
                break;
            }

            let frame = &mut self.frames[fi];
            if frame.jumped {
                frame.jumped = false;
            } else {
                frame.offset += 1;
            }
        }
    }

    /// Push a frame, drive it to completion, and pop it; the callee's
    /// top-of-stack (if any) is the call's value
    fn run_frame(&mut self, frame: Frame) -> Option<Value> {
        self.frames.push(frame);
        let fi = self.frames.len() - 1;
        self.execute(fi);

        let mut frame = self.frames.pop().expect("frame pool underflow");
        frame.stack.pop()
    }

    /// Drive a block with the invoking frame's store visible. Blocks do
    /// not snapshot their enclosing scope.
    pub fn run_block(
        &mut self,
        block: &Block,
        args: Vec<Value>,
        store: &Rc<RefCell<Store>>,
    ) -> Value {
        if block.params.len() != args.len() {
            return builtins::err_instance(
                "TypeError",
                &format!(
                    "wrong number of arguments applied to a block. expected {}, got {}",
                    block.params.len(),
                    args.len()
                ),
            );
        }

        let saved = swap_tables(store, &block.names, &block.patterns);

        for (param, arg) in block.params.iter().zip(args) {
            store.borrow_mut().define(param, arg, true);
        }

        let frame =
            Frame::new(Rc::clone(&block.body), Rc::clone(&block.constants), Rc::clone(store));
        let result = self.run_frame(frame).unwrap_or(Value::Null);

        restore_tables(store, saved);
        result
    }

    /* Error helpers */

    fn fail(&mut self, kind: ErrorKind, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(PlutoError::new(kind, message));
        }
    }

    fn pop(&mut self, fi: usize) -> Option<Value> {
        match self.frames[fi].stack.pop() {
            Some(value) => Some(value),
            None => {
                self.fail(ErrorKind::Internal, "operand stack underflow");
                None
            }
        }
    }

    fn push(&mut self, fi: usize, value: Value) {
        self.frames[fi].stack.push(value);
    }

    fn jump_to(&mut self, fi: usize, index: usize) {
        let frame = &mut self.frames[fi];
        frame.offset = index;
        frame.jumped = true;
    }

    /* Name resolution */

    /// Resolve a name-table index, falling back to the previous frame's
    /// table
    fn get_name(&self, fi: usize, index: usize) -> Option<String> {
        let frame = &self.frames[fi];

        if let Some(name) = frame.locals.borrow().name_at(index) {
            return Some(name.to_string());
        }

        if fi > 0 {
            if let Some(name) = self.frames[fi - 1].locals.borrow().name_at(index) {
                return Some(name.to_string());
            }
        }

        None
    }

    /// Resolve a name's value, falling back to the previous frame's
    /// store
    pub fn search_name(&self, fi: usize, name: &str) -> Option<Value> {
        if let Some(value) = self.frames[fi].locals.borrow().get_name(name) {
            return Some(value);
        }

        if fi > 0 {
            if let Some(value) = self.frames[fi - 1].locals.borrow().get_name(name) {
                return Some(value);
            }
        }

        None
    }

    fn visible_names(&self, fi: usize) -> Vec<String> {
        let mut names: Vec<String> =
            self.frames[fi].locals.borrow().data.iter().map(|b| b.name.clone()).collect();

        if fi > 0 {
            names.extend(self.frames[fi - 1].locals.borrow().data.iter().map(|b| b.name.clone()));
        }

        names
    }

    /* Dispatch */

    fn do_instruction(&mut self, fi: usize, i: &Instruction) {
        match i.code {
            bytecode::POP => {
                self.pop(fi);
            }
            bytecode::DUP => {
                match self.frames[fi].stack.last().cloned() {
                    Some(top) => self.push(fi, top),
                    None => self.fail(ErrorKind::Internal, "operand stack underflow"),
                }
            }
            bytecode::ROT => {
                let len = self.frames[fi].stack.len();
                if len < 2 {
                    self.fail(ErrorKind::Internal, "operand stack underflow");
                    return;
                }
                self.frames[fi].stack.swap(len - 1, len - 2);
            }

            bytecode::LOAD_CONST => self.op_load_const(fi, i),
            bytecode::LOAD_NAME => self.op_load_name(fi, i),
            bytecode::STORE_NAME => self.op_store_name(fi, i),
            bytecode::LOAD_FIELD => self.op_load_field(fi),
            bytecode::STORE_FIELD => self.op_store_field(fi),

            bytecode::UNARY_INVERT | bytecode::UNARY_NEGATE | bytecode::UNARY_NO_OP => {
                self.op_prefix(fi, i)
            }

            bytecode::BINARY_ADD
            | bytecode::BINARY_SUBTRACT
            | bytecode::BINARY_MULTIPLY
            | bytecode::BINARY_DIVIDE
            | bytecode::BINARY_EXPONENT
            | bytecode::BINARY_FLOOR_DIV
            | bytecode::BINARY_MOD
            | bytecode::BINARY_BIT_OR
            | bytecode::BINARY_BIT_AND => self.op_infix(fi, i),

            bytecode::BINARY_EQUALS => {
                let (Some(right), Some(left)) = (self.pop(fi), self.pop(fi)) else { return };
                self.push(fi, Value::Boolean(left.equals(&right)));
            }
            bytecode::BINARY_NOT_EQUAL => {
                let (Some(right), Some(left)) = (self.pop(fi), self.pop(fi)) else { return };
                self.push(fi, Value::Boolean(!left.equals(&right)));
            }

            bytecode::BINARY_LESS_THAN
            | bytecode::BINARY_MORE_THAN
            | bytecode::BINARY_LESS_EQ
            | bytecode::BINARY_MORE_EQ => self.op_compare(fi, i),

            bytecode::PUSH_FN => self.op_push_fn(fi, i),
            bytecode::PUSH_QUAL_FN => self.op_push_qual_fn(fi, i),
            bytecode::CALL_FN => self.op_call(fi),
            bytecode::RETURN => {
                let end = self.frames[fi].code.len();
                self.jump_to(fi, end);
            }
            bytecode::DO_BLOCK => self.op_do_block(fi),

            bytecode::PRINT => {
                let Some(top) = self.pop(fi) else { return };
                print!("{}", top);
            }
            bytecode::PRINTLN => {
                let Some(top) = self.pop(fi) else { return };
                println!("{}", top);
            }
            bytecode::LENGTH => {
                let Some(top) = self.pop(fi) else { return };

                match top.elements() {
                    Some(elements) => self.push(fi, Value::Number(elements.len() as f64)),
                    None => self.fail(
                        ErrorKind::WrongType,
                        format!("cannot get the length of type {}", top.type_tag()),
                    ),
                }
            }

            bytecode::JUMP => {
                let index = self.translate_jump(fi, i.arg);
                self.jump_to(fi, index);
            }
            bytecode::JUMP_IF_TRUE => {
                let Some(top) = self.pop(fi) else { return };
                if top.is_truthy() {
                    let index = self.translate_jump(fi, i.arg);
                    self.jump_to(fi, index);
                }
            }
            bytecode::JUMP_IF_FALSE => {
                let Some(top) = self.pop(fi) else { return };
                if !top.is_truthy() {
                    let index = self.translate_jump(fi, i.arg);
                    self.jump_to(fi, index);
                }
            }

            bytecode::BREAK => match self.frames[fi].breaks.last().copied() {
                Some(target) => self.jump_to(fi, target),
                None => self.fail(ErrorKind::Syntax, "break statement found outside loop"),
            },
            bytecode::NEXT => match self.frames[fi].nexts.last().copied() {
                Some(target) => self.jump_to(fi, target),
                None => self.fail(ErrorKind::Syntax, "next statement found outside loop"),
            },
            bytecode::LOOP_START => self.op_loop_start(fi),
            bytecode::LOOP_END => {
                let frame = &mut self.frames[fi];
                frame.breaks.pop();
                frame.nexts.pop();
            }

            bytecode::MAKE_ARRAY => {
                let Some(elements) = self.pop_elements(fi, i.arg as usize) else { return };
                self.push(fi, Value::array(elements));
            }
            bytecode::MAKE_TUPLE => {
                let Some(elements) = self.pop_elements(fi, i.arg as usize) else { return };
                self.push(fi, Value::tuple(elements));
            }
            bytecode::MAKE_MAP => self.op_make_map(fi, i),

            bytecode::USE => self.op_use(fi, i),

            _ => self.fail(
                ErrorKind::NoInstruction,
                format!("bytecode instruction {} not implemented", i.name()),
            ),
        }
    }

    fn translate_jump(&self, fi: usize, arg: u16) -> usize {
        bytecode::byte_to_instruction_index(&self.frames[fi].code, arg as usize)
    }

    fn pop_elements(&mut self, fi: usize, count: usize) -> Option<Vec<Value>> {
        let mut elements = vec![Value::Null; count];

        for n in (0..count).rev() {
            elements[n] = self.pop(fi)?;
        }

        Some(elements)
    }

    /* Load/store effectors */

    fn op_load_const(&mut self, fi: usize, i: &Instruction) {
        match self.frames[fi].constants.get(i.arg as usize).cloned() {
            Some(value) => self.push(fi, value),
            None => self.fail(
                ErrorKind::Internal,
                format!("constant index {} out of range", i.arg),
            ),
        }
    }

    fn op_load_name(&mut self, fi: usize, i: &Instruction) {
        let Some(name) = self.get_name(fi, i.arg as usize) else {
            self.fail(ErrorKind::Internal, "name not defined");
            return;
        };

        match self.search_name(fi, &name) {
            Some(value) => self.push(fi, value),
            None => {
                let candidates = self.visible_names(fi);
                let mut error = PlutoError::new(
                    ErrorKind::NotFound,
                    format!("name {} not found in the current scope", name),
                );

                if let Some(suggestion) = find_closest_match(&name, &candidates) {
                    error = error.with_suggestion(suggestion.to_string());
                }

                if self.error.is_none() {
                    self.error = Some(error);
                }
            }
        }
    }

    fn op_store_name(&mut self, fi: usize, i: &Instruction) {
        let Some(name) = self.get_name(fi, i.arg as usize) else {
            self.fail(ErrorKind::Internal, "name not defined");
            return;
        };

        let Some(value) = self.frames[fi].stack.last().cloned() else {
            self.fail(ErrorKind::Internal, "operand stack underflow");
            return;
        };

        self.frames[fi].locals.borrow_mut().define(&name, value, true);
    }

    fn op_load_field(&mut self, fi: usize) {
        let (Some(field), Some(obj)) = (self.pop(fi), self.pop(fi)) else { return };

        if obj.is_collection() {
            let Some(index) = field.as_number() else {
                self.fail(
                    ErrorKind::WrongType,
                    format!("non-numeric type {} used to index a collection", field.type_tag()),
                );
                return;
            };

            if index < 0.0 {
                self.fail(ErrorKind::NotFound, format!("index {} out of range", index));
                return;
            }

            match obj.get_index(index as usize) {
                Some(value) => self.push(fi, value),
                None => self.fail(ErrorKind::NotFound, format!("index {} out of range", index)),
            }
        } else if obj.is_container() {
            let value = obj.get(&field).unwrap_or(Value::Null);
            self.push(fi, value);
        } else {
            self.fail(ErrorKind::NotFound, format!("cannot index type {}", obj.type_tag()));
        }
    }

    fn op_store_field(&mut self, fi: usize) {
        let (Some(field), Some(obj)) = (self.pop(fi), self.pop(fi)) else { return };

        let Some(value) = self.frames[fi].stack.last().cloned() else {
            self.fail(ErrorKind::Internal, "operand stack underflow");
            return;
        };

        if obj.is_collection() {
            match field.as_number() {
                // out-of-range writes are deliberate no-ops
                Some(index) if index >= 0.0 => obj.set_index(index as usize, value),
                Some(_) => {}
                None => self.fail(
                    ErrorKind::WrongType,
                    format!("non-numeric type {} used to index a collection", field.type_tag()),
                ),
            }
        } else if obj.is_container() {
            if matches!(obj, Value::Map(_)) && !field.is_hasher() {
                self.fail(
                    ErrorKind::WrongType,
                    format!("non-hashable type as map key: {}", field.type_tag()),
                );
                return;
            }

            obj.set(field, value);
        } else {
            self.fail(ErrorKind::WrongType, format!("cannot index type {}", obj.type_tag()));
        }
    }

    /* Operator effectors */

    fn op_prefix(&mut self, fi: usize, i: &Instruction) {
        let Some(right) = self.pop(fi) else { return };

        if i.code == bytecode::UNARY_INVERT {
            self.push(fi, Value::Boolean(!right.is_truthy()));
            return;
        }

        match right.as_number() {
            Some(value) => {
                let result = if i.code == bytecode::UNARY_NEGATE { -value } else { value };
                self.push(fi, Value::Number(result));
            }
            None => self.fail(ErrorKind::WrongType, "prefix r-value of invalid type"),
        }
    }

    fn op_infix(&mut self, fi: usize, i: &Instruction) {
        let (Some(right), Some(left)) = (self.pop(fi), self.pop(fi)) else { return };

        if let Some(l) = left.as_number() {
            if let Some(r) = right.as_number() {
                if let Some(result) = self.num_infix(i, l, r) {
                    self.push(fi, result);
                }
            } else if right.is_collection() {
                if let Some(result) = self.num_col_infix(i, l, &right) {
                    self.push(fi, result);
                }
            } else {
                self.fail(
                    ErrorKind::WrongType,
                    "infix r-value of invalid type when l-value is <number>",
                );
            }
        } else if left.is_collection() {
            if let Some(r) = right.as_number() {
                if let Some(result) = self.num_col_infix(i, r, &left) {
                    self.push(fi, result);
                }
            } else if right.is_collection() {
                if let Some(result) = self.col_infix(i, &left, &right) {
                    self.push(fi, result);
                }
            } else {
                self.fail(
                    ErrorKind::WrongType,
                    "infix r-value of invalid type when l-value is a collection",
                );
            }
        } else {
            self.fail(ErrorKind::WrongType, "infix l-value of invalid type");
        }
    }

    fn num_infix(&mut self, i: &Instruction, left: f64, right: f64) -> Option<Value> {
        let value = match i.code {
            bytecode::BINARY_ADD => left + right,
            bytecode::BINARY_SUBTRACT => left - right,
            bytecode::BINARY_MULTIPLY => left * right,
            bytecode::BINARY_DIVIDE => left / right,
            bytecode::BINARY_EXPONENT => left.powf(right),
            bytecode::BINARY_FLOOR_DIV => (left / right).floor(),
            bytecode::BINARY_MOD => left % right,
            bytecode::BINARY_BIT_OR => ((left as i64) | (right as i64)) as f64,
            bytecode::BINARY_BIT_AND => ((left as i64) & (right as i64)) as f64,
            _ => {
                self.fail(
                    ErrorKind::NoOp,
                    format!("operator {} not supported for two numbers", op_name(i)),
                );
                return None;
            }
        };

        Some(Value::Number(value))
    }

    /// The only number-by-collection operator is `*`, which repeats
    fn num_col_infix(&mut self, i: &Instruction, left: f64, right: &Value) -> Option<Value> {
        if i.code != bytecode::BINARY_MULTIPLY {
            self.fail(
                ErrorKind::NoOp,
                format!("operator {} not supported for a collection and a number", op_name(i)),
            );
            return None;
        }

        let elements = right.elements().unwrap_or_default();
        let mut result = Vec::new();

        for _ in 0..(left.max(0.0) as usize) {
            result.extend(elements.iter().cloned());
        }

        Some(make_collection(right.type_tag(), result))
    }

    /// Collection algebra: + concatenates, - removes, | unions
    /// (deduplicated, left order first), & intersects. The result
    /// preserves the left operand's type.
    fn col_infix(&mut self, i: &Instruction, left: &Value, right: &Value) -> Option<Value> {
        let lefts = left.elements().unwrap_or_default();
        let rights = right.elements().unwrap_or_default();

        let elements = match i.code {
            bytecode::BINARY_ADD => {
                let mut elements = lefts;
                elements.extend(rights);
                elements
            }
            bytecode::BINARY_SUBTRACT => lefts
                .into_iter()
                .filter(|el| !rights.iter().any(|rel| el.equals(rel)))
                .collect(),
            bytecode::BINARY_BIT_OR => {
                let mut elements: Vec<Value> = Vec::new();

                for el in lefts.into_iter().chain(rights) {
                    if !elements.iter().any(|existing| existing.equals(&el)) {
                        elements.push(el);
                    }
                }

                elements
            }
            bytecode::BINARY_BIT_AND => lefts
                .into_iter()
                .filter(|el| rights.iter().any(|rel| el.equals(rel)))
                .collect(),
            _ => {
                self.fail(
                    ErrorKind::NoOp,
                    format!("operator {} not supported for two collections", op_name(i)),
                );
                return None;
            }
        };

        Some(make_collection(left.type_tag(), elements))
    }

    fn op_compare(&mut self, fi: usize, i: &Instruction) {
        let (Some(b), Some(a)) = (self.pop(fi), self.pop(fi)) else { return };

        let (Some(lval), Some(rval)) = (a.as_number(), b.as_number()) else {
            self.fail(ErrorKind::WrongType, "non-numeric value in numeric binary expression");
            return;
        };

        let result = match i.code {
            bytecode::BINARY_LESS_THAN => lval < rval,
            bytecode::BINARY_MORE_THAN => lval > rval,
            bytecode::BINARY_LESS_EQ => lval <= rval,
            _ => lval >= rval,
        };

        self.push(fi, Value::Boolean(result));
    }

    /* Call effectors */

    fn op_push_fn(&mut self, fi: usize, i: &Instruction) {
        let pattern =
            self.frames[fi].locals.borrow().pattern_at(i.arg as usize).map(str::to_string);

        let Some(pattern) = pattern else {
            self.fail(ErrorKind::Internal, "pattern not defined");
            return;
        };

        let function = self.frames[fi].locals.borrow().functions.search(&pattern);

        match function {
            Some(function) => self.push(fi, Value::Function(function)),
            None => self.fail(
                ErrorKind::NotFound,
                format!("function '{}' not found in the current scope", pattern),
            ),
        }
    }

    fn op_push_qual_fn(&mut self, fi: usize, i: &Instruction) {
        let pattern =
            self.frames[fi].locals.borrow().pattern_at(i.arg as usize).map(str::to_string);

        let Some(pattern) = pattern else {
            self.fail(ErrorKind::Internal, "pattern not defined");
            return;
        };

        let Some(base) = self.pop(fi) else { return };
        let parts: Vec<&str> = pattern.split(' ').collect();

        match &base {
            Value::Map(map) => {
                let methods = match map.borrow().get_str("_methods") {
                    Some(methods) => methods,
                    None => {
                        self.fail(ErrorKind::WrongType, "_methods key not found");
                        return;
                    }
                };

                let Value::Array(methods) = methods else {
                    self.fail(ErrorKind::WrongType, "_methods is not an array");
                    return;
                };

                let hit = methods.borrow().iter().cloned().find(|method| {
                    matches!(method, Value::Function(f) if call_pattern_matches(&parts, &f.pattern))
                });

                match hit {
                    Some(function) => self.push(fi, function),
                    None => self.fail(
                        ErrorKind::NotFound,
                        format!("no method was found matching the pattern: '{}'", pattern),
                    ),
                }
            }
            Value::Instance(instance) => {
                let class = Rc::clone(&instance.borrow().base);
                let methods = self.class_methods(fi, &class);

                // reverse iteration makes the most-derived match win
                let hit = methods
                    .iter()
                    .rev()
                    .find(|f| call_pattern_matches(&parts, &f.pattern))
                    .cloned();

                match hit {
                    Some(function) => {
                        let bound = Function {
                            on_call: Some(OnCall::Bound { receiver: Box::new(base.clone()) }),
                            ..(*function).clone()
                        };
                        self.push(fi, Value::Function(Rc::new(bound)));
                    }
                    None => self.fail(
                        ErrorKind::NotFound,
                        format!("no method was found matching the pattern: '{}'", pattern),
                    ),
                }
            }
            other => self.fail(
                ErrorKind::WrongType,
                format!("cannot call a method of non-map type {}", other.type_tag()),
            ),
        }
    }

    /// Collect a class's methods parent-first, resolving parents by
    /// name through the store
    fn class_methods(&self, fi: usize, class: &Rc<Class>) -> Vec<Rc<Function>> {
        let mut methods = Vec::new();
        let mut visited = Vec::new();
        self.collect_methods(fi, class, &mut methods, &mut visited);
        methods
    }

    fn collect_methods(
        &self,
        fi: usize,
        class: &Rc<Class>,
        out: &mut Vec<Rc<Function>>,
        visited: &mut Vec<String>,
    ) {
        if visited.contains(&class.name) {
            return;
        }
        visited.push(class.name.clone());

        if let Some(parent_name) = &class.parent {
            if let Some(Value::Class(parent)) = self.search_name(fi, parent_name) {
                self.collect_methods(fi, &parent, out, visited);
            }
        }

        for method in &class.methods {
            if let Value::Function(f) = method {
                out.push(Rc::clone(f));
            }
        }
    }

    fn op_call(&mut self, fi: usize) {
        let Some(callee) = self.pop(fi) else { return };

        let function = match callee {
            Value::Function(function) => function,
            other => {
                self.fail(
                    ErrorKind::WrongType,
                    format!("cannot call non-function type: {}", other.type_tag()),
                );
                return;
            }
        };

        match function.on_call.clone() {
            Some(OnCall::Builtin(key)) => self.call_builtin(fi, &function, key),
            Some(OnCall::Init { class }) => self.call_init(fi, &function, &class),
            Some(OnCall::Bound { receiver }) => self.call_function(fi, &function, Some(*receiver)),
            None => self.call_function(fi, &function, None),
        }
    }

    /// The shared-store call: the callee borrows the caller's store,
    /// swapping in its own name and pattern tables, then binds its
    /// parameters by popping arguments right-to-left. The caller's
    /// tables are restored afterwards, so names the callee declared
    /// stay in the data but are no longer addressable from the caller.
    fn call_function(&mut self, fi: usize, function: &Function, receiver: Option<Value>) {
        let locals = Rc::clone(&self.frames[fi].locals);
        let saved = swap_tables(&locals, &function.names, &function.patterns);

        if !self.bind_params(fi, function, &locals) {
            restore_tables(&locals, saved);
            return;
        }

        if let Some(receiver) = receiver {
            locals.borrow_mut().define("self", receiver, true);
        }

        let frame =
            Frame::new(Rc::clone(&function.body), Rc::clone(&function.constants), Rc::clone(&locals));

        let result = self.run_frame(frame);
        restore_tables(&locals, saved);

        if let Some(value) = result {
            self.push(fi, value);
        }
    }

    /// Arguments were pushed left-to-right, so popping right-to-left
    /// binds the last parameter first
    fn bind_params(
        &mut self,
        fi: usize,
        function: &Function,
        locals: &Rc<RefCell<Store>>,
    ) -> bool {
        for item in function.pattern.iter().rev() {
            if let PatternItem::Param(name) = item {
                let Some(arg) = self.pop(fi) else { return false };
                locals.borrow_mut().define(name, arg, true);
            }
        }

        true
    }

    /// An init call constructs the instance, binds `self`, runs the
    /// body, and yields whatever `self` holds afterwards
    fn call_init(&mut self, fi: usize, function: &Function, class_name: &str) {
        let class = match self.search_name(fi, class_name) {
            Some(Value::Class(class)) => class,
            _ => {
                self.fail(
                    ErrorKind::NotFound,
                    format!("class {} not found in the current scope", class_name),
                );
                return;
            }
        };

        let locals = Rc::clone(&self.frames[fi].locals);
        let saved = swap_tables(&locals, &function.names, &function.patterns);

        if !self.bind_params(fi, function, &locals) {
            restore_tables(&locals, saved);
            return;
        }

        locals.borrow_mut().define("self", Value::instance(class), true);

        let frame =
            Frame::new(Rc::clone(&function.body), Rc::clone(&function.constants), Rc::clone(&locals));
        self.run_frame(frame);

        let constructed = locals.borrow().get_name("self").unwrap_or(Value::Null);
        restore_tables(&locals, saved);

        if self.error.is_some() {
            return;
        }

        self.push(fi, constructed);
    }

    /// Builtins pop their arguments into a by-name map, run the
    /// per-parameter type coercion table, and push the result. A
    /// coercion failure is a user-level TypeError instance, not a VM
    /// error.
    fn call_builtin(&mut self, fi: usize, function: &Function, key: &'static str) {
        let Some(builtin) = builtins::lookup(key) else {
            self.fail(ErrorKind::Internal, format!("builtin {} not registered", key));
            return;
        };

        let mut args: AHashMap<String, Value> = AHashMap::new();

        for item in function.pattern.iter().rev() {
            if let PatternItem::Param(name) = item {
                let Some(arg) = self.pop(fi) else { return };
                args.insert(name.clone(), arg);
            }
        }

        for &(param, expected) in builtin.types {
            let value = args.get(param).cloned().unwrap_or(Value::Null);

            if !value.matches_type(expected) {
                let error = builtins::err_instance(
                    "TypeError",
                    &format!(
                        "the ${} parameter of {} must be of type {}, not {}",
                        param,
                        builtin.pattern,
                        expected,
                        value.type_tag()
                    ),
                );
                self.push(fi, error);
                return;
            }
        }

        let store = Rc::clone(&self.frames[fi].locals);
        let result = (builtin.func)(&args, self, &store);

        if self.error.is_some() {
            return;
        }

        self.push(fi, result);
    }

    fn op_do_block(&mut self, fi: usize) {
        let Some(top) = self.pop(fi) else { return };

        let block = match top {
            Value::Block(block) => block,
            other => {
                self.fail(
                    ErrorKind::WrongType,
                    format!("cannot 'do' a non-block. got {}", other.type_tag()),
                );
                return;
            }
        };

        let mut args = vec![Value::Null; block.params.len()];

        for n in (0..block.params.len()).rev() {
            let Some(arg) = self.pop(fi) else { return };
            args[n] = arg;
        }

        let store = Rc::clone(&self.frames[fi].locals);
        let result = self.run_block(&block, args, &store);

        if self.error.is_some() {
            return;
        }

        self.push(fi, result);
    }

    /* Loop effectors */

    /// Record the loop's next target (the instruction after this one)
    /// and its break target (the matching LOOP_END, depth-aware so
    /// nested loops pair correctly)
    fn op_loop_start(&mut self, fi: usize) {
        let offset = self.frames[fi].offset;
        let code = Rc::clone(&self.frames[fi].code);

        let mut depth = 0;
        let mut end = None;

        for (index, instruction) in code.iter().enumerate().skip(offset + 1) {
            match instruction.code {
                bytecode::LOOP_START => depth += 1,
                bytecode::LOOP_END => {
                    if depth == 0 {
                        end = Some(index);
                        break;
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }

        let Some(end) = end else {
            self.fail(ErrorKind::Internal, "loop has no matching LOOP_END");
            return;
        };

        let frame = &mut self.frames[fi];
        frame.nexts.push(offset + 1);
        frame.breaks.push(end);
    }

    /* Constructors */

    fn op_make_map(&mut self, fi: usize, i: &Instruction) {
        let mut map = MapData::new();

        for _ in 0..i.arg {
            let (Some(value), Some(key)) = (self.pop(fi), self.pop(fi)) else { return };

            if !key.is_hasher() {
                self.fail(
                    ErrorKind::WrongType,
                    format!("non-hashable type as map key: {}", key.type_tag()),
                );
                return;
            }

            map.set(key, value);
        }

        self.push(fi, Value::map(map));
    }

    /* Imports */

    fn op_use(&mut self, fi: usize, i: &Instruction) {
        let constant = self.frames[fi].constants.get(i.arg as usize).cloned();

        let path = match constant {
            Some(Value::Str(path)) => path.borrow().clone(),
            Some(other) => {
                self.fail(
                    ErrorKind::WrongType,
                    format!("use expects a string path, got {}", other.type_tag()),
                );
                return;
            }
            None => {
                self.fail(ErrorKind::Internal, format!("constant index {} out of range", i.arg));
                return;
            }
        };

        module::import(self, fi, &path);
    }
}

fn op_name(i: &Instruction) -> &'static str {
    i.name().strip_prefix("BINARY_").unwrap_or(i.name())
}

/// Swap a store's name and pattern tables for a callee's own,
/// returning the caller's for restoration after the call
fn swap_tables(
    locals: &Rc<RefCell<Store>>,
    names: &[String],
    patterns: &[String],
) -> (Vec<String>, Vec<String>) {
    let mut store = locals.borrow_mut();
    let saved_names = std::mem::replace(&mut store.names, names.to_vec());
    let saved_patterns = std::mem::replace(&mut store.patterns, patterns.to_vec());
    (saved_names, saved_patterns)
}

fn restore_tables(locals: &Rc<RefCell<Store>>, saved: (Vec<String>, Vec<String>)) {
    let mut store = locals.borrow_mut();
    store.names = saved.0;
    store.patterns = saved.1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Instruction, LOOP_END, LOOP_START};

    fn run_code(code: Vec<Instruction>, constants: Vec<Value>) -> Vm {
        let mut vm = Vm::new();
        let store = Rc::new(RefCell::new(Store::new()));
        vm.run(Rc::new(code), store, Rc::new(constants), false);
        vm
    }

    #[test]
    fn loop_start_pairs_with_matching_end() {
        // LOOP_START LOOP_START LOOP_END LOOP_END — the outer loop's
        // break target must be the outer LOOP_END
        let code = vec![
            Instruction::new(LOOP_START),
            Instruction::new(LOOP_START),
            Instruction::new(LOOP_END),
            Instruction::new(LOOP_END),
        ];

        let vm = run_code(code, vec![]);
        assert!(vm.error.is_none());
    }

    #[test]
    fn break_outside_a_loop_is_a_syntax_error() {
        let vm = run_code(vec![Instruction::new(bytecode::BREAK)], vec![]);

        let error = vm.error.expect("expected an error");
        assert_eq!(error.kind, ErrorKind::Syntax);
    }

    #[test]
    fn unknown_opcode_reports_no_instruction() {
        let vm = run_code(vec![Instruction::new(250)], vec![]);

        let error = vm.error.expect("expected an error");
        assert_eq!(error.kind, ErrorKind::NoInstruction);
    }

    #[test]
    fn equals_pushes_a_boolean() {
        let code = vec![
            Instruction::with_arg(bytecode::LOAD_CONST, 0),
            Instruction::with_arg(bytecode::LOAD_CONST, 0),
            Instruction::new(bytecode::BINARY_EQUALS),
        ];

        let vm = run_code(code, vec![Value::Number(3.0)]);
        assert!(vm.error.is_none());
        assert!(vm.extract_value().unwrap().equals(&Value::Boolean(true)));
    }
}
