// File: src/bytecode.rs
//
// Bytecode instruction definitions for the Pluto VM.
// An instruction is a single opcode byte, optionally followed by a
// two-byte big-endian argument. Whether an opcode takes an argument is
// recorded in the metadata table below.

use crate::errors::{ErrorKind, PlutoError};

// 0-9: stack operations
pub const POP: u8 = 0;
pub const DUP: u8 = 1;
pub const ROT: u8 = 2;

// 10-19: load/store
pub const LOAD_CONST: u8 = 10;
pub const LOAD_NAME: u8 = 11;
pub const STORE_NAME: u8 = 12;
pub const LOAD_FIELD: u8 = 13;
pub const STORE_FIELD: u8 = 14;

// 20-44: operators
pub const UNARY_INVERT: u8 = 20;
pub const UNARY_NEGATE: u8 = 21;
pub const UNARY_NO_OP: u8 = 22;

pub const BINARY_ADD: u8 = 25;
pub const BINARY_SUBTRACT: u8 = 26;
pub const BINARY_MULTIPLY: u8 = 27;
pub const BINARY_DIVIDE: u8 = 28;
pub const BINARY_EXPONENT: u8 = 29;
pub const BINARY_FLOOR_DIV: u8 = 30;
pub const BINARY_MOD: u8 = 31;
pub const BINARY_BIT_OR: u8 = 34;
pub const BINARY_BIT_AND: u8 = 35;
pub const BINARY_EQUALS: u8 = 36;
pub const BINARY_NOT_EQUAL: u8 = 37;
pub const BINARY_LESS_THAN: u8 = 38;
pub const BINARY_MORE_THAN: u8 = 39;
pub const BINARY_LESS_EQ: u8 = 40;
pub const BINARY_MORE_EQ: u8 = 41;

// 45-59: calls
pub const PUSH_FN: u8 = 45;
pub const PUSH_QUAL_FN: u8 = 46;
pub const CALL_FN: u8 = 47;
pub const RETURN: u8 = 48;
pub const DO_BLOCK: u8 = 49;

// 60-69: built-in I/O
pub const PRINT: u8 = 60;
pub const PRINTLN: u8 = 61;
pub const LENGTH: u8 = 62;

// 70-89: control flow
pub const JUMP: u8 = 70;
pub const JUMP_IF_TRUE: u8 = 71;
pub const JUMP_IF_FALSE: u8 = 72;
pub const BREAK: u8 = 73;
pub const NEXT: u8 = 74;
pub const LOOP_START: u8 = 75;
pub const LOOP_END: u8 = 76;

// 90-99: constructors
pub const MAKE_ARRAY: u8 = 90;
pub const MAKE_TUPLE: u8 = 91;
pub const MAKE_MAP: u8 = 92;

// 100+: imports
pub const USE: u8 = 100;

/// Metadata about a single opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpData {
    pub code: u8,
    pub name: &'static str,
    pub has_arg: bool,
}

/// The instruction metadata table. Jump arguments are byte offsets into
/// the encoded stream; everything else indexes a per-function table.
pub static INSTRUCTIONS: &[OpData] = &[
    OpData { code: POP, name: "POP", has_arg: false },
    OpData { code: DUP, name: "DUP", has_arg: false },
    OpData { code: ROT, name: "ROT", has_arg: false },
    OpData { code: LOAD_CONST, name: "LOAD_CONST", has_arg: true },
    OpData { code: LOAD_NAME, name: "LOAD_NAME", has_arg: true },
    OpData { code: STORE_NAME, name: "STORE_NAME", has_arg: true },
    OpData { code: LOAD_FIELD, name: "LOAD_FIELD", has_arg: false },
    OpData { code: STORE_FIELD, name: "STORE_FIELD", has_arg: false },
    OpData { code: UNARY_INVERT, name: "UNARY_INVERT", has_arg: false },
    OpData { code: UNARY_NEGATE, name: "UNARY_NEGATE", has_arg: false },
    OpData { code: UNARY_NO_OP, name: "UNARY_NO_OP", has_arg: false },
    OpData { code: BINARY_ADD, name: "BINARY_ADD", has_arg: false },
    OpData { code: BINARY_SUBTRACT, name: "BINARY_SUBTRACT", has_arg: false },
    OpData { code: BINARY_MULTIPLY, name: "BINARY_MULTIPLY", has_arg: false },
    OpData { code: BINARY_DIVIDE, name: "BINARY_DIVIDE", has_arg: false },
    OpData { code: BINARY_EXPONENT, name: "BINARY_EXPONENT", has_arg: false },
    OpData { code: BINARY_FLOOR_DIV, name: "BINARY_FLOOR_DIV", has_arg: false },
    OpData { code: BINARY_MOD, name: "BINARY_MOD", has_arg: false },
    OpData { code: BINARY_BIT_OR, name: "BINARY_BIT_OR", has_arg: false },
    OpData { code: BINARY_BIT_AND, name: "BINARY_BIT_AND", has_arg: false },
    OpData { code: BINARY_EQUALS, name: "BINARY_EQUALS", has_arg: false },
    OpData { code: BINARY_NOT_EQUAL, name: "BINARY_NOT_EQUAL", has_arg: false },
    OpData { code: BINARY_LESS_THAN, name: "BINARY_LESS_THAN", has_arg: false },
    OpData { code: BINARY_MORE_THAN, name: "BINARY_MORE_THAN", has_arg: false },
    OpData { code: BINARY_LESS_EQ, name: "BINARY_LESS_EQ", has_arg: false },
    OpData { code: BINARY_MORE_EQ, name: "BINARY_MORE_EQ", has_arg: false },
    OpData { code: PUSH_FN, name: "PUSH_FN", has_arg: true },
    OpData { code: PUSH_QUAL_FN, name: "PUSH_QUAL_FN", has_arg: true },
    OpData { code: CALL_FN, name: "CALL_FN", has_arg: false },
    OpData { code: RETURN, name: "RETURN", has_arg: false },
    OpData { code: DO_BLOCK, name: "DO_BLOCK", has_arg: false },
    OpData { code: PRINT, name: "PRINT", has_arg: false },
    OpData { code: PRINTLN, name: "PRINTLN", has_arg: false },
    OpData { code: LENGTH, name: "LENGTH", has_arg: false },
    OpData { code: JUMP, name: "JUMP", has_arg: true },
    OpData { code: JUMP_IF_TRUE, name: "JUMP_IF_TRUE", has_arg: true },
    OpData { code: JUMP_IF_FALSE, name: "JUMP_IF_FALSE", has_arg: true },
    OpData { code: BREAK, name: "BREAK", has_arg: false },
    OpData { code: NEXT, name: "NEXT", has_arg: false },
    OpData { code: LOOP_START, name: "LOOP_START", has_arg: false },
    OpData { code: LOOP_END, name: "LOOP_END", has_arg: false },
    OpData { code: MAKE_ARRAY, name: "MAKE_ARRAY", has_arg: true },
    OpData { code: MAKE_TUPLE, name: "MAKE_TUPLE", has_arg: true },
    OpData { code: MAKE_MAP, name: "MAKE_MAP", has_arg: true },
    OpData { code: USE, name: "USE", has_arg: true },
];

/// Look up metadata by opcode byte
pub fn lookup(code: u8) -> Option<&'static OpData> {
    INSTRUCTIONS.iter().find(|d| d.code == code)
}

/// Look up metadata by instruction name. Used by emission expressions,
/// which refer to instructions by their assembly name.
pub fn lookup_name(name: &str) -> Option<&'static OpData> {
    INSTRUCTIONS.iter().find(|d| d.name == name)
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub code: u8,
    pub arg: u16,
}

impl Instruction {
    pub fn new(code: u8) -> Self {
        Self { code, arg: 0 }
    }

    pub fn with_arg(code: u8, arg: u16) -> Self {
        Self { code, arg }
    }

    pub fn name(&self) -> &'static str {
        lookup(self.code).map(|d| d.name).unwrap_or("UNKNOWN")
    }

    pub fn has_arg(&self) -> bool {
        lookup(self.code).map(|d| d.has_arg).unwrap_or(false)
    }
}

/// Split a u16 argument into (high, low) bytes for encoding
pub fn arg_bytes(arg: u16) -> (u8, u8) {
    ((arg >> 8) as u8, (arg & 0xff) as u8)
}

/// Decode an encoded byte stream into a list of instructions.
///
/// Unknown opcodes decode as argument-less instructions; they fail at
/// dispatch time with a NoInstruction error rather than here, so that
/// emission expressions can exercise reserved opcodes.
pub fn read(bytes: &[u8]) -> Result<Vec<Instruction>, PlutoError> {
    let mut instructions = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let code = bytes[i];
        let has_arg = lookup(code).map(|d| d.has_arg).unwrap_or(false);

        if has_arg {
            if i + 2 >= bytes.len() {
                return Err(PlutoError::new(
                    ErrorKind::Internal,
                    format!("bytecode truncated: {} needs a 2-byte argument", code),
                ));
            }

            let arg = ((bytes[i + 1] as u16) << 8) | bytes[i + 2] as u16;
            instructions.push(Instruction::with_arg(code, arg));
            i += 3;
        } else {
            instructions.push(Instruction::new(code));
            i += 1;
        }
    }

    Ok(instructions)
}

/// Translate a byte offset in the encoded stream into an index into the
/// decoded instruction list. Jump arguments are written as byte offsets
/// by the compiler and must go through this on every branch.
pub fn byte_to_instruction_index(code: &[Instruction], byte: usize) -> usize {
    let mut counter = 0;

    for (index, instr) in code.iter().enumerate() {
        if counter >= byte {
            return index;
        }

        counter += if instr.has_arg() { 3 } else { 1 };
    }

    code.len()
}

/// Render a decoded instruction list for `--tree` dumps
pub fn disassemble(code: &[Instruction]) -> String {
    let mut out = String::new();
    let mut offset = 0;

    for (index, instr) in code.iter().enumerate() {
        if instr.has_arg() {
            out.push_str(&format!("{:4}  {:04x}  {} {}\n", index, offset, instr.name(), instr.arg));
            offset += 3;
        } else {
            out.push_str(&format!("{:4}  {:04x}  {}\n", index, offset, instr.name()));
            offset += 1;
        }
    }

    out
}
