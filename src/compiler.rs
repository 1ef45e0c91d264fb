// File: src/compiler.rs
//
// Bytecode compiler for the Pluto language.
// Lowers an AST into a linear byte stream plus the per-unit constant,
// name, and pattern tables, and the list of compiled functions for the
// driver to register. Jump arguments are byte offsets into the encoded
// stream; the VM translates them to instruction indices at dispatch.

use crate::ast::{Arm, DefItem, EmittedItem, Expr, PatternPart, Stmt};
use crate::bytecode::{self, arg_bytes};
use crate::errors::PlutoError;
use crate::value::{Block, Class, Function, OnCall, PatternItem, Value};
use std::rc::Rc;

const MAX_INDEX: usize = u16::MAX as usize;

/// Compiler state for one compilation unit (a program, a function body,
/// or a block body)
#[derive(Default)]
pub struct Compiler {
    pub bytes: Vec<u8>,
    pub constants: Vec<Value>,
    pub functions: Vec<Rc<Function>>,
    pub names: Vec<String>,
    pub patterns: Vec<String>,

    /// Counter for hidden loop variables, so nested for-loops don't
    /// collide
    hidden: usize,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compile_program(&mut self, program: &[Stmt]) -> Result<(), PlutoError> {
        for stmt in program {
            self.compile_statement(stmt)?;
        }

        Ok(())
    }

    /// Install this unit's tables into a store: the VM driver does this
    /// before executing user code, registering every compiled function
    pub fn install(&self, store: &mut crate::store::Store) {
        store.names = self.names.clone();
        store.patterns = self.patterns.clone();

        for function in &self.functions {
            store.functions.define(Rc::clone(function));
        }
    }

    /* Emission helpers */

    fn emit(&mut self, code: u8) {
        self.bytes.push(code);
    }

    fn emit_arg(&mut self, code: u8, arg: u16) {
        let (high, low) = arg_bytes(arg);
        self.bytes.push(code);
        self.bytes.push(high);
        self.bytes.push(low);
    }

    /// Emit a jump with a placeholder target; returns the position of
    /// the opcode byte for patching
    fn emit_jump(&mut self, code: u8) -> usize {
        let at = self.bytes.len();
        self.emit_arg(code, 0);
        at
    }

    /// Point a previously emitted jump at the current end of the stream
    fn patch_jump(&mut self, at: usize) -> Result<(), PlutoError> {
        let target = self.bytes.len();

        if target > MAX_INDEX {
            return Err(PlutoError::compile(format!(
                "jump target {} greater than 0xFFFF (maximum u16)",
                target
            )));
        }

        let (high, low) = arg_bytes(target as u16);
        self.bytes[at + 1] = high;
        self.bytes[at + 2] = low;

        Ok(())
    }

    /* Table helpers */

    /// Add a constant, deduplicating primitive literals by equality
    fn add_const(&mut self, value: Value) -> Result<u16, PlutoError> {
        if value.is_hasher() {
            if let Some(index) = self.constants.iter().position(|c| c.equals(&value)) {
                return Ok(index as u16);
            }
        }

        let index = self.constants.len();

        if index >= MAX_INDEX + 1 {
            return Err(PlutoError::compile(format!(
                "constant index {} greater than 0xFFFF (maximum u16)",
                index
            )));
        }

        self.constants.push(value);
        Ok(index as u16)
    }

    fn add_name(&mut self, name: &str) -> Result<u16, PlutoError> {
        if let Some(index) = self.names.iter().position(|n| n == name) {
            return Ok(index as u16);
        }

        let index = self.names.len();

        if index >= MAX_INDEX + 1 {
            return Err(PlutoError::compile(format!(
                "name index {} greater than 0xFFFF (maximum u16)",
                index
            )));
        }

        self.names.push(name.to_string());
        Ok(index as u16)
    }

    fn add_pattern(&mut self, pattern: String) -> Result<u16, PlutoError> {
        if let Some(index) = self.patterns.iter().position(|p| p == &pattern) {
            return Ok(index as u16);
        }

        let index = self.patterns.len();

        if index >= MAX_INDEX + 1 {
            return Err(PlutoError::compile(format!(
                "pattern index {} greater than 0xFFFF (maximum u16)",
                index
            )));
        }

        self.patterns.push(pattern);
        Ok(index as u16)
    }

    fn load_const(&mut self, value: Value) -> Result<(), PlutoError> {
        let index = self.add_const(value)?;
        self.emit_arg(bytecode::LOAD_CONST, index);
        Ok(())
    }

    fn load_name(&mut self, name: &str) -> Result<(), PlutoError> {
        let index = self.add_name(name)?;
        self.emit_arg(bytecode::LOAD_NAME, index);
        Ok(())
    }

    fn store_name(&mut self, name: &str) -> Result<(), PlutoError> {
        let index = self.add_name(name)?;
        self.emit_arg(bytecode::STORE_NAME, index);
        Ok(())
    }

    /* Statements */

    pub fn compile_statement(&mut self, stmt: &Stmt) -> Result<(), PlutoError> {
        match stmt {
            Stmt::Expression(expr) => self.compile_expression(expr),

            Stmt::Block(statements) => {
                for stmt in statements {
                    self.compile_statement(stmt)?;
                }
                Ok(())
            }

            Stmt::FunctionDef { pattern, body } => {
                let function = self.compile_function(def_pattern(pattern), body, None)?;
                self.functions.push(Rc::new(function));
                Ok(())
            }

            Stmt::InitDef { .. } => {
                Err(PlutoError::compile("init definitions are only allowed inside a class"))
            }

            Stmt::ClassDef { name, parent, body } => self.compile_class(name, parent, body),

            Stmt::Return(value) => {
                match value {
                    Some(expr) => self.compile_expression(expr)?,
                    None => self.load_const(Value::Null)?,
                }
                self.emit(bytecode::RETURN);
                Ok(())
            }

            Stmt::Next => {
                self.emit(bytecode::NEXT);
                Ok(())
            }

            Stmt::Break => {
                self.emit(bytecode::BREAK);
                Ok(())
            }

            Stmt::Use(path) | Stmt::Import(path) => {
                let index = self.add_const(Value::string(path.as_str()))?;
                self.emit_arg(bytecode::USE, index);
                Ok(())
            }
        }
    }

    /// Compile a function or block body in a fresh compiler. Functions
    /// defined inside the body bubble up so the driver registers them
    /// all.
    fn compile_function(
        &mut self,
        pattern: Vec<PatternItem>,
        body: &[Stmt],
        on_call: Option<OnCall>,
    ) -> Result<Function, PlutoError> {
        let mut sub = Compiler::new();

        for stmt in body {
            sub.compile_statement(stmt)?;
        }

        let code = bytecode::read(&sub.bytes)?;
        self.functions.append(&mut sub.functions);

        Ok(Function {
            pattern,
            body: Rc::new(code),
            constants: Rc::new(sub.constants),
            names: sub.names,
            patterns: sub.patterns,
            on_call,
        })
    }

    /// A class statement builds the Class value at compile time and
    /// binds it. Each `init` also registers a constructor function
    /// whose pattern is the class name followed by the init pattern.
    fn compile_class(
        &mut self,
        name: &str,
        parent: &Option<String>,
        body: &[Stmt],
    ) -> Result<(), PlutoError> {
        let mut methods = Vec::new();

        for stmt in body {
            match stmt {
                Stmt::FunctionDef { pattern, body } => {
                    let method = self.compile_function(def_pattern(pattern), body, None)?;
                    methods.push(Value::Function(Rc::new(method)));
                }
                Stmt::InitDef { pattern, body } => {
                    let mut full = vec![PatternItem::Ident(name.to_string())];
                    full.extend(def_pattern(pattern));

                    let init = self.compile_function(
                        full,
                        body,
                        Some(OnCall::Init { class: name.to_string() }),
                    )?;

                    let init = Rc::new(init);
                    self.functions.push(Rc::clone(&init));
                    methods.push(Value::Function(init));
                }
                other => {
                    return Err(PlutoError::compile(format!(
                        "only def and init are allowed in a class body, found {:?}",
                        other
                    )));
                }
            }
        }

        let parent = match parent {
            Some(parent) => Some(parent.clone()),
            None if name != "Base" => Some("Base".to_string()),
            None => None,
        };

        let class = Class { name: name.to_string(), parent, methods };
        self.load_const(Value::Class(Rc::new(class)))?;
        self.store_name(name)?;

        Ok(())
    }

    /* Expressions */

    pub fn compile_expression(&mut self, expr: &Expr) -> Result<(), PlutoError> {
        match expr {
            Expr::Number(n) => self.load_const(Value::Number(*n)),
            Expr::Boolean(b) => self.load_const(Value::Boolean(*b)),
            Expr::Str(s) => self.load_const(Value::string(s.as_str())),
            Expr::Char(c) => self.load_const(Value::Char(*c)),
            Expr::Null => self.load_const(Value::Null),
            Expr::Identifier(name) => self.load_name(name),

            Expr::Array(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit_arg(bytecode::MAKE_ARRAY, collection_len(elements.len())?);
                Ok(())
            }

            Expr::Tuple(elements) => {
                for element in elements {
                    self.compile_expression(element)?;
                }
                self.emit_arg(bytecode::MAKE_TUPLE, collection_len(elements.len())?);
                Ok(())
            }

            Expr::Map(pairs) => {
                for (key, value) in pairs {
                    self.compile_expression(key)?;
                    self.compile_expression(value)?;
                }
                self.emit_arg(bytecode::MAKE_MAP, collection_len(pairs.len())?);
                Ok(())
            }

            Expr::BlockLiteral { params, body } => {
                let compiled = self.compile_function(Vec::new(), body, None)?;

                let block = Block {
                    params: params.clone(),
                    body: compiled.body,
                    constants: compiled.constants,
                    names: compiled.names,
                    patterns: compiled.patterns,
                };

                let index = self.add_const(Value::Block(Rc::new(block)))?;
                self.emit_arg(bytecode::LOAD_CONST, index);
                Ok(())
            }

            Expr::Assign { name, value } | Expr::Declare { name, value } => {
                self.compile_assign(name, value)
            }

            Expr::Prefix { op, right } => {
                self.compile_expression(right)?;

                let code = match op.as_str() {
                    "+" => bytecode::UNARY_NO_OP,
                    "-" => bytecode::UNARY_NEGATE,
                    "!" => bytecode::UNARY_INVERT,
                    other => {
                        return Err(PlutoError::compile(format!(
                            "prefix operator {} not implemented",
                            other
                        )))
                    }
                };

                self.emit(code);
                Ok(())
            }

            Expr::Infix { op, left, right } => self.compile_infix(op, left, right),

            Expr::Dot { left, right } => {
                self.compile_expression(left)?;
                self.compile_field_name(right)?;
                self.emit(bytecode::LOAD_FIELD);
                Ok(())
            }

            Expr::Index { collection, index } => {
                self.compile_expression(collection)?;
                self.compile_expression(index)?;
                self.emit(bytecode::LOAD_FIELD);
                Ok(())
            }

            Expr::Call { pattern } => {
                let index = self.compile_call_args(pattern)?;
                self.emit_arg(bytecode::PUSH_FN, index);
                self.emit(bytecode::CALL_FN);
                Ok(())
            }

            Expr::QualifiedCall { base, pattern } | Expr::MethodCall { receiver: base, pattern } => {
                let index = self.compile_call_args(pattern)?;
                self.compile_expression(base)?;
                self.emit_arg(bytecode::PUSH_QUAL_FN, index);
                self.emit(bytecode::CALL_FN);
                Ok(())
            }

            Expr::If { condition, consequence, alternative } => {
                self.compile_if(condition, consequence, alternative)
            }

            Expr::While { condition, body } => self.compile_while(condition, body),

            Expr::For { var, collection, body } => self.compile_for(var, collection, body),

            Expr::Match { subject, arms } => self.compile_match(subject, arms),

            Expr::Try { body, err_name, arms } => self.compile_try(body, err_name, arms),

            Expr::Emission(items) => self.compile_emission(items),
        }
    }

    fn compile_field_name(&mut self, field: &Expr) -> Result<(), PlutoError> {
        match field {
            Expr::Identifier(name) => self.load_const(Value::string(name.as_str())),
            other => Err(PlutoError::compile(format!(
                "expected an identifier to the right of a dot, found {:?}",
                other
            ))),
        }
    }

    /// Assignment evaluates the value first, then stores into a name,
    /// an index, or a field. STORE_NAME and STORE_FIELD both leave the
    /// value on the stack, so an assignment is an expression.
    fn compile_assign(&mut self, name: &Expr, value: &Expr) -> Result<(), PlutoError> {
        self.compile_expression(value)?;

        match name {
            Expr::Identifier(target) => {
                self.store_name(target)?;
                Ok(())
            }
            Expr::Index { collection, index } => {
                self.compile_expression(collection)?;
                self.compile_expression(index)?;
                self.emit(bytecode::STORE_FIELD);
                Ok(())
            }
            Expr::Dot { left, right } => {
                self.compile_expression(left)?;
                self.compile_field_name(right)?;
                self.emit(bytecode::STORE_FIELD);
                Ok(())
            }
            other => Err(PlutoError::compile(format!(
                "can only assign to identifiers and field accessors, found {:?}",
                other
            ))),
        }
    }

    fn compile_infix(&mut self, op: &str, left: &Expr, right: &Expr) -> Result<(), PlutoError> {
        // && and || have no opcodes; they lower to short-circuit jumps
        // around the right operand
        if op == "&&" || op == "||" {
            self.compile_expression(left)?;
            self.emit(bytecode::DUP);

            let skip = if op == "&&" {
                self.emit_jump(bytecode::JUMP_IF_FALSE)
            } else {
                self.emit_jump(bytecode::JUMP_IF_TRUE)
            };

            self.emit(bytecode::POP);
            self.compile_expression(right)?;
            self.patch_jump(skip)?;
            return Ok(());
        }

        self.compile_expression(left)?;
        self.compile_expression(right)?;

        let code = match op {
            "+" => bytecode::BINARY_ADD,
            "-" => bytecode::BINARY_SUBTRACT,
            "*" => bytecode::BINARY_MULTIPLY,
            "/" => bytecode::BINARY_DIVIDE,
            "**" => bytecode::BINARY_EXPONENT,
            "//" => bytecode::BINARY_FLOOR_DIV,
            "%" => bytecode::BINARY_MOD,
            "|" => bytecode::BINARY_BIT_OR,
            "&" => bytecode::BINARY_BIT_AND,
            "==" => bytecode::BINARY_EQUALS,
            "!=" => bytecode::BINARY_NOT_EQUAL,
            "<" => bytecode::BINARY_LESS_THAN,
            ">" => bytecode::BINARY_MORE_THAN,
            "<=" => bytecode::BINARY_LESS_EQ,
            ">=" => bytecode::BINARY_MORE_EQ,
            other => {
                return Err(PlutoError::compile(format!(
                    "operator {} not implemented",
                    other
                )))
            }
        };

        self.emit(code);
        Ok(())
    }

    /// Evaluate a call's arguments left-to-right and register its
    /// pattern; returns the pattern index for PUSH_FN/PUSH_QUAL_FN
    fn compile_call_args(&mut self, pattern: &[PatternPart]) -> Result<u16, PlutoError> {
        let joined = pattern
            .iter()
            .map(|part| match part {
                PatternPart::Ident(name) => name.as_str(),
                PatternPart::Arg(_) => "$",
            })
            .collect::<Vec<_>>()
            .join(" ");

        let index = self.add_pattern(joined)?;

        for part in pattern {
            if let PatternPart::Arg(arg) = part {
                self.compile_expression(arg)?;
            }
        }

        Ok(index)
    }

    fn compile_if(
        &mut self,
        condition: &Expr,
        consequence: &[Stmt],
        alternative: &Option<Vec<Stmt>>,
    ) -> Result<(), PlutoError> {
        self.compile_expression(condition)?;
        let cond_jump = self.emit_jump(bytecode::JUMP_IF_FALSE);

        for stmt in consequence {
            self.compile_statement(stmt)?;
        }

        match alternative {
            Some(alternative) => {
                let skip_jump = self.emit_jump(bytecode::JUMP);
                self.patch_jump(cond_jump)?;

                for stmt in alternative {
                    self.compile_statement(stmt)?;
                }

                self.patch_jump(skip_jump)?;
            }
            None => {
                self.patch_jump(cond_jump)?;
            }
        }

        Ok(())
    }

    fn compile_while(&mut self, condition: &Expr, body: &[Stmt]) -> Result<(), PlutoError> {
        self.emit(bytecode::LOOP_START);
        let head = self.bytes.len();

        self.compile_expression(condition)?;
        let exit_jump = self.emit_jump(bytecode::JUMP_IF_FALSE);

        for stmt in body {
            self.compile_statement(stmt)?;
        }

        self.emit_arg(bytecode::JUMP, jump_target(head)?);
        self.patch_jump(exit_jump)?;
        self.emit(bytecode::LOOP_END);

        Ok(())
    }

    /// A for loop lowers to an index-driven while loop over hidden
    /// variables. The index increments at the loop head so `next`
    /// (which jumps to the instruction after LOOP_START) still
    /// advances.
    fn compile_for(
        &mut self,
        var: &str,
        collection: &Expr,
        body: &[Stmt],
    ) -> Result<(), PlutoError> {
        let id = self.hidden;
        self.hidden += 1;

        let iter_var = format!("__for_iter_{}", id);
        let index_var = format!("__for_index_{}", id);

        self.compile_expression(collection)?;
        self.store_name(&iter_var)?;
        self.emit(bytecode::POP);

        self.load_const(Value::Number(-1.0))?;
        self.store_name(&index_var)?;
        self.emit(bytecode::POP);

        self.emit(bytecode::LOOP_START);
        let head = self.bytes.len();

        // index = index + 1
        self.load_name(&index_var)?;
        self.load_const(Value::Number(1.0))?;
        self.emit(bytecode::BINARY_ADD);
        self.store_name(&index_var)?;
        self.emit(bytecode::POP);

        // index < length(iter)
        self.load_name(&index_var)?;
        self.load_name(&iter_var)?;
        self.emit(bytecode::LENGTH);
        self.emit(bytecode::BINARY_LESS_THAN);
        let exit_jump = self.emit_jump(bytecode::JUMP_IF_FALSE);

        // var = iter[index]
        self.load_name(&iter_var)?;
        self.load_name(&index_var)?;
        self.emit(bytecode::LOAD_FIELD);
        self.store_name(var)?;
        self.emit(bytecode::POP);

        for stmt in body {
            self.compile_statement(stmt)?;
        }

        self.emit_arg(bytecode::JUMP, jump_target(head)?);
        self.patch_jump(exit_jump)?;
        self.emit(bytecode::LOOP_END);

        Ok(())
    }

    /// A match lowers to a chain of DUP/equality tests. Each arm's
    /// candidate expressions jump to a shared body; a wildcard arm
    /// matches unconditionally. The subject is popped on entry to a
    /// body, and a match with no matching arm yields null.
    fn compile_match(&mut self, subject: &Expr, arms: &[Arm]) -> Result<(), PlutoError> {
        self.compile_expression(subject)?;

        let mut body_jumps: Vec<Vec<usize>> = Vec::with_capacity(arms.len());

        for arm in arms {
            let mut jumps = Vec::new();

            match &arm.exprs {
                None => {
                    jumps.push(self.emit_jump(bytecode::JUMP));
                }
                Some(exprs) => {
                    for expr in exprs {
                        self.emit(bytecode::DUP);
                        self.compile_expression(expr)?;
                        self.emit(bytecode::BINARY_EQUALS);
                        jumps.push(self.emit_jump(bytecode::JUMP_IF_TRUE));
                    }
                }
            }

            body_jumps.push(jumps);
        }

        // No arm matched
        self.emit(bytecode::POP);
        self.load_const(Value::Null)?;
        let mut end_jumps = vec![self.emit_jump(bytecode::JUMP)];

        for (arm, jumps) in arms.iter().zip(body_jumps) {
            for jump in jumps {
                self.patch_jump(jump)?;
            }

            self.emit(bytecode::POP);

            for stmt in &arm.body {
                self.compile_statement(stmt)?;
            }

            end_jumps.push(self.emit_jump(bytecode::JUMP));
        }

        for jump in end_jumps {
            self.patch_jump(jump)?;
        }

        Ok(())
    }

    /// try/catch is value-level: the body runs inline above a null
    /// sentinel, and the result is tested with the hidden
    /// `is error $obj` builtin. On an Error instance the value binds to
    /// the catch name and the arms match against its `tag` field.
    fn compile_try(
        &mut self,
        body: &[Stmt],
        err_name: &str,
        arms: &[Arm],
    ) -> Result<(), PlutoError> {
        self.load_const(Value::Null)?;

        for stmt in body {
            self.compile_statement(stmt)?;
        }

        self.emit(bytecode::DUP);
        let check = self.add_pattern("is error $".to_string())?;
        self.emit_arg(bytecode::PUSH_FN, check);
        self.emit(bytecode::CALL_FN);

        let no_error = self.emit_jump(bytecode::JUMP_IF_FALSE);

        // Error path: bind the error and dispatch on its tag
        self.store_name(err_name)?;
        self.emit(bytecode::POP);

        let mut body_jumps: Vec<Vec<usize>> = Vec::with_capacity(arms.len());

        for arm in arms {
            let mut jumps = Vec::new();

            match &arm.exprs {
                None => {
                    jumps.push(self.emit_jump(bytecode::JUMP));
                }
                Some(exprs) => {
                    for expr in exprs {
                        self.load_name(err_name)?;
                        self.load_const(Value::string("tag"))?;
                        self.emit(bytecode::LOAD_FIELD);
                        self.compile_expression(expr)?;
                        self.emit(bytecode::BINARY_EQUALS);
                        jumps.push(self.emit_jump(bytecode::JUMP_IF_TRUE));
                    }
                }
            }

            body_jumps.push(jumps);
        }

        // No arm caught it: the error itself is the try's value
        self.load_name(err_name)?;
        let mut end_jumps = vec![self.emit_jump(bytecode::JUMP), no_error];

        for (arm, jumps) in arms.iter().zip(body_jumps) {
            for jump in jumps {
                self.patch_jump(jump)?;
            }

            for stmt in &arm.body {
                self.compile_statement(stmt)?;
            }

            end_jumps.push(self.emit_jump(bytecode::JUMP));
        }

        for jump in end_jumps {
            self.patch_jump(jump)?;
        }

        Ok(())
    }

    /// Substitute raw bytecode for an emission expression
    fn compile_emission(&mut self, items: &[EmittedItem]) -> Result<(), PlutoError> {
        for item in items {
            match item {
                EmittedItem::Instruction { name, arg } => {
                    let data = bytecode::lookup_name(name).ok_or_else(|| {
                        PlutoError::compile(format!("unknown instruction {}", name))
                    })?;

                    if data.has_arg {
                        self.emit_arg(data.code, arg.unwrap_or(0));
                    } else {
                        self.emit(data.code);
                    }
                }
                EmittedItem::Expr(expr) => self.compile_expression(expr)?,
            }
        }

        Ok(())
    }
}

fn def_pattern(pattern: &[DefItem]) -> Vec<PatternItem> {
    pattern
        .iter()
        .map(|item| match item {
            DefItem::Ident(name) => PatternItem::Ident(name.clone()),
            DefItem::Param(name) => PatternItem::Param(name.clone()),
        })
        .collect()
}

fn collection_len(len: usize) -> Result<u16, PlutoError> {
    if len > MAX_INDEX {
        return Err(PlutoError::compile(format!(
            "collection literal with {} elements exceeds the u16 argument range",
            len
        )));
    }

    Ok(len as u16)
}

fn jump_target(byte: usize) -> Result<u16, PlutoError> {
    if byte > MAX_INDEX {
        return Err(PlutoError::compile(format!(
            "jump target {} greater than 0xFFFF (maximum u16)",
            byte
        )));
    }

    Ok(byte as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Instruction;
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn compile(source: &str) -> Compiler {
        let mut parser = Parser::new(tokenize(source));
        let program = parser.parse();
        assert!(parser.errors.is_empty(), "parse errors: {:?}", parser.errors);

        let mut compiler = Compiler::new();
        compiler.compile_program(&program).expect("compilation failed");
        compiler
    }

    fn decode(compiler: &Compiler) -> Vec<Instruction> {
        bytecode::read(&compiler.bytes).unwrap()
    }

    #[test]
    fn literals_load_deduplicated_constants() {
        let compiler = compile("1; 1; \"a\"; \"a\"; 1");
        assert_eq!(compiler.constants.len(), 2);

        let code = decode(&compiler);
        assert!(code.iter().all(|i| i.code == bytecode::LOAD_CONST));
        assert_eq!(code.len(), 5);
    }

    #[test]
    fn names_are_deduplicated() {
        let compiler = compile("a = 1; a = 2; b = a");
        assert_eq!(compiler.names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn infix_emits_operator_opcodes() {
        let code = decode(&compile("1 + 2 * 3"));
        let ops: Vec<u8> = code.iter().map(|i| i.code).collect();

        assert_eq!(
            ops,
            vec![
                bytecode::LOAD_CONST,
                bytecode::LOAD_CONST,
                bytecode::LOAD_CONST,
                bytecode::BINARY_MULTIPLY,
                bytecode::BINARY_ADD,
            ]
        );
    }

    #[test]
    fn modulo_maps_to_mod_not_floor_div() {
        let code = decode(&compile("5 % 2"));
        assert!(code.iter().any(|i| i.code == bytecode::BINARY_MOD));
        assert!(!code.iter().any(|i| i.code == bytecode::BINARY_FLOOR_DIV));
    }

    #[test]
    fn if_jump_targets_are_byte_offsets() {
        let compiler = compile("if (true) { 1 } else { 2 }");
        let code = decode(&compiler);

        let false_jump = code.iter().find(|i| i.code == bytecode::JUMP_IF_FALSE).unwrap();
        let index = bytecode::byte_to_instruction_index(&code, false_jump.arg as usize);

        // The false-jump lands on the first instruction of the
        // alternative: LOAD_CONST of 2
        assert_eq!(code[index].code, bytecode::LOAD_CONST);
        assert!(compiler.constants[code[index].arg as usize].equals(&Value::Number(2.0)));
    }

    #[test]
    fn while_loops_bracket_with_loop_markers() {
        let code = decode(&compile("while (false) { 1 }"));

        assert_eq!(code.first().unwrap().code, bytecode::LOOP_START);
        assert_eq!(code.last().unwrap().code, bytecode::LOOP_END);
        assert!(code.iter().any(|i| i.code == bytecode::JUMP));
        assert!(code.iter().any(|i| i.code == bytecode::JUMP_IF_FALSE));
    }

    #[test]
    fn calls_push_pattern_then_call() {
        let compiler = compile("print \"hi\"");
        let code = decode(&compiler);

        assert_eq!(compiler.patterns, vec!["print $".to_string()]);

        let ops: Vec<u8> = code.iter().map(|i| i.code).collect();
        assert_eq!(ops, vec![bytecode::LOAD_CONST, bytecode::PUSH_FN, bytecode::CALL_FN]);
    }

    #[test]
    fn call_patterns_are_deduplicated() {
        let compiler = compile("print 1; print 2");
        assert_eq!(compiler.patterns.len(), 1);
    }

    #[test]
    fn function_definitions_compile_into_the_function_list() {
        let compiler = compile("def square $n { return $n * $n }");

        assert!(compiler.bytes.is_empty());
        assert_eq!(compiler.functions.len(), 1);

        let function = &compiler.functions[0];
        assert_eq!(function.pattern_string(), "square $");
        assert!(!function.body.is_empty());
    }

    #[test]
    fn nested_function_definitions_bubble_up() {
        let compiler = compile("def outer $x { def inner $y { return $y } ; return $x }");

        let patterns: Vec<String> =
            compiler.functions.iter().map(|f| f.pattern_string()).collect();
        assert!(patterns.contains(&"outer $".to_string()));
        assert!(patterns.contains(&"inner $".to_string()));
    }

    #[test]
    fn class_statements_bind_a_class_constant() {
        let compiler = compile("class Animal { def speak $sound { print $sound } }");
        let code = decode(&compiler);

        assert_eq!(code[0].code, bytecode::LOAD_CONST);
        assert_eq!(code[1].code, bytecode::STORE_NAME);

        match &compiler.constants[code[0].arg as usize] {
            Value::Class(class) => {
                assert_eq!(class.name, "Animal");
                assert_eq!(class.parent.as_deref(), Some("Base"));
                assert_eq!(class.methods.len(), 1);
            }
            other => panic!("expected a class constant, got {:?}", other),
        }
    }

    #[test]
    fn init_definitions_register_a_constructor() {
        let compiler = compile("class Point { init at $x $y { self.x = $x } }");

        assert_eq!(compiler.functions.len(), 1);
        assert_eq!(compiler.functions[0].pattern_string(), "Point at $ $");
        assert!(matches!(compiler.functions[0].on_call, Some(OnCall::Init { .. })));
    }

    #[test]
    fn index_assignment_stores_into_field() {
        let code = decode(&compile("a[0] = 5"));
        let ops: Vec<u8> = code.iter().map(|i| i.code).collect();

        // value, collection, index, store
        assert_eq!(
            ops,
            vec![
                bytecode::LOAD_CONST,
                bytecode::LOAD_NAME,
                bytecode::LOAD_CONST,
                bytecode::STORE_FIELD,
            ]
        );
    }

    #[test]
    fn logical_operators_lower_to_jumps() {
        let code = decode(&compile("true && false"));
        let ops: Vec<u8> = code.iter().map(|i| i.code).collect();

        assert_eq!(
            ops,
            vec![
                bytecode::LOAD_CONST,
                bytecode::DUP,
                bytecode::JUMP_IF_FALSE,
                bytecode::POP,
                bytecode::LOAD_CONST,
            ]
        );
    }

    #[test]
    fn use_emits_a_string_constant() {
        let compiler = compile("use \"std/io\"");
        let code = decode(&compiler);

        assert_eq!(code[0].code, bytecode::USE);
        assert!(compiler.constants[code[0].arg as usize].equals(&Value::string("std/io")));
    }

    #[test]
    fn emissions_substitute_raw_bytes() {
        let compiler = compile("emit (LOAD_CONST 0, DUP, POP)");
        assert_eq!(
            compiler.bytes,
            vec![bytecode::LOAD_CONST, 0, 0, bytecode::DUP, bytecode::POP]
        );
    }

    #[test]
    fn unknown_operator_is_a_compile_error() {
        let mut compiler = Compiler::new();
        let bad = Expr::Infix {
            op: "???".into(),
            left: Box::new(Expr::Number(1.0)),
            right: Box::new(Expr::Number(2.0)),
        };
        assert!(compiler.compile_expression(&bad).is_err());
    }

    #[test]
    fn blocks_compile_once_as_constants() {
        let compiler = compile("b = { |x| -> $x + 1 }");

        let block = compiler
            .constants
            .iter()
            .find_map(|c| match c {
                Value::Block(b) => Some(b),
                _ => None,
            })
            .expect("expected a block constant");

        assert_eq!(block.params, vec!["x".to_string()]);
        assert!(!block.body.is_empty());
    }
}
