//! Bytecode chunk: a byte stream with a parallel per-instruction line table
//! and a capped constant pool (§3, §4.1).

use crate::error::{CoreError, CoreResult};
use crate::object::Heap;
use crate::value::Value;

/// Opcode tags. Values are implementation-chosen (§4.1 fixes only the set
/// and semantics, not the encoding), but stable within one build so a
/// `Chunk`'s bytes always mean the same thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Constant = 0,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    DefineGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
}

impl OpCode {
    pub fn from_byte(byte: u8) -> Option<OpCode> {
        use OpCode::*;
        const TABLE: &[OpCode] = &[
            Constant, Nil, True, False, Pop, GetLocal, SetLocal, GetGlobal, DefineGlobal,
            SetGlobal, GetUpvalue, SetUpvalue, GetProperty, SetProperty, GetSuper, Equal,
            Greater, Less, Add, Subtract, Multiply, Divide, Not, Negate, Print, Jump,
            JumpIfFalse, Loop, Call, Invoke, SuperInvoke, Closure, CloseUpvalue, Return, Class,
            Inherit, Method,
        ];
        TABLE.get(byte as usize).copied()
    }

    pub fn mnemonic(self) -> &'static str {
        use OpCode::*;
        match self {
            Constant => "OP_CONSTANT",
            Nil => "OP_NIL",
            True => "OP_TRUE",
            False => "OP_FALSE",
            Pop => "OP_POP",
            GetLocal => "OP_GET_LOCAL",
            SetLocal => "OP_SET_LOCAL",
            GetGlobal => "OP_GET_GLOBAL",
            DefineGlobal => "OP_DEFINE_GLOBAL",
            SetGlobal => "OP_SET_GLOBAL",
            GetUpvalue => "OP_GET_UPVALUE",
            SetUpvalue => "OP_SET_UPVALUE",
            GetProperty => "OP_GET_PROPERTY",
            SetProperty => "OP_SET_PROPERTY",
            GetSuper => "OP_GET_SUPER",
            Equal => "OP_EQUAL",
            Greater => "OP_GREATER",
            Less => "OP_LESS",
            Add => "OP_ADD",
            Subtract => "OP_SUBTRACT",
            Multiply => "OP_MULTIPLY",
            Divide => "OP_DIVIDE",
            Not => "OP_NOT",
            Negate => "OP_NEGATE",
            Print => "OP_PRINT",
            Jump => "OP_JUMP",
            JumpIfFalse => "OP_JUMP_IF_FALSE",
            Loop => "OP_LOOP",
            Call => "OP_CALL",
            Invoke => "OP_INVOKE",
            SuperInvoke => "OP_SUPER_INVOKE",
            Closure => "OP_CLOSURE",
            CloseUpvalue => "OP_CLOSE_UPVALUE",
            Return => "OP_RETURN",
            Class => "OP_CLASS",
            Inherit => "OP_INHERIT",
            Method => "OP_METHOD",
        }
    }
}

/// A compiled function body: parallel `code`/`lines` arrays plus the
/// constant pool they index into. Owned exclusively by the `ObjFunction`
/// that wraps it (§5).
#[derive(Debug, Default)]
pub struct Chunk {
    code: Vec<u8>,
    lines: Vec<u32>,
    constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Self {
        Chunk::default()
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines[offset]
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn constant(&self, index: u8) -> Value {
        self.constants[index as usize]
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn write_byte(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: u32) {
        self.write_byte(op as u8, line);
    }

    /// Interns `value` into the constant pool, returning its index.
    /// Errors once the pool would exceed 256 entries (u8 operand width).
    pub fn add_constant(&mut self, value: Value) -> CoreResult<u8> {
        if self.constants.len() >= 256 {
            return Err(CoreError::TooManyConstants);
        }
        self.constants.push(value);
        Ok((self.constants.len() - 1) as u8)
    }

    /// Emits `OP_JUMP`/`OP_JUMP_IF_FALSE`/`OP_LOOP`'s placeholder 16-bit
    /// operand and returns the offset of its first byte, for later
    /// back-patching by [`Chunk::patch_jump`].
    pub fn emit_jump(&mut self, op: OpCode, line: u32) -> usize {
        self.write_op(op, line);
        self.write_byte(0xff, line);
        self.write_byte(0xff, line);
        self.code.len() - 2
    }

    /// Back-patches the two placeholder bytes at `offset` with the distance
    /// from just past them to the current end of the chunk.
    pub fn patch_jump(&mut self, offset: usize) -> CoreResult<()> {
        let jump = self.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err(CoreError::JumpTooLarge);
        }
        let jump = jump as u16;
        self.code[offset] = (jump >> 8) as u8;
        self.code[offset + 1] = (jump & 0xff) as u8;
        Ok(())
    }

    /// Emits `OP_LOOP` followed by the big-endian distance back to
    /// `loop_start`.
    pub fn emit_loop(&mut self, loop_start: usize, line: u32) -> CoreResult<()> {
        self.write_op(OpCode::Loop, line);
        let offset = self.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            return Err(CoreError::JumpTooLarge);
        }
        let offset = offset as u16;
        self.write_byte((offset >> 8) as u8, line);
        self.write_byte((offset & 0xff) as u8, line);
        Ok(())
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        ((self.code[offset] as u16) << 8) | self.code[offset + 1] as u16
    }
}

/// Renders one instruction at `offset` as clox's `disassembleInstruction`
/// does, returning the text and the offset of the next instruction. Used by
/// `glimmer-cli`'s `disasm` subcommand and by `tracing`-gated execution
/// traces in the VM.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize, heap: &Heap) -> (String, usize) {
    let line = chunk.line_at(offset);
    let same_line = offset > 0 && chunk.line_at(offset - 1) == line;
    let prefix = if same_line { format!("{offset:04}    | ") } else { format!("{offset:04} {line:4} ") };

    let byte = chunk.code()[offset];
    let Some(op) = OpCode::from_byte(byte) else {
        return (format!("{prefix}Unknown opcode {byte}"), offset + 1);
    };

    use OpCode::*;
    match op {
        Constant | GetGlobal | DefineGlobal | SetGlobal | GetProperty | SetProperty
        | GetSuper | Class | Method => {
            let idx = chunk.code()[offset + 1];
            let value = chunk.constant(idx);
            (format!("{prefix}{:<16} {idx:4} '{}'", op.mnemonic(), value.render(heap)), offset + 2)
        }
        GetLocal | SetLocal | GetUpvalue | SetUpvalue | Call => {
            let slot = chunk.code()[offset + 1];
            (format!("{prefix}{:<16} {slot:4}", op.mnemonic()), offset + 2)
        }
        Invoke | SuperInvoke => {
            let idx = chunk.code()[offset + 1];
            let argc = chunk.code()[offset + 2];
            let value = chunk.constant(idx);
            (
                format!("{prefix}{:<16} ({argc} args) {idx:4} '{}'", op.mnemonic(), value.render(heap)),
                offset + 3,
            )
        }
        Jump | JumpIfFalse => {
            let jump = chunk.read_u16(offset + 1) as usize;
            (format!("{prefix}{:<16} {offset:4} -> {}", op.mnemonic(), offset + 3 + jump), offset + 3)
        }
        Loop => {
            let jump = chunk.read_u16(offset + 1) as usize;
            (format!("{prefix}{:<16} {offset:4} -> {}", op.mnemonic(), offset + 3 - jump), offset + 3)
        }
        Closure => {
            let mut cursor = offset + 1;
            let idx = chunk.code()[cursor];
            cursor += 1;
            let value = chunk.constant(idx);
            let mut text = format!("{prefix}{:<16} {idx:4} '{}'", op.mnemonic(), value.render(heap));
            if let Some(func) = heap.get(value.as_object().expect("closure constant is an object")).as_function() {
                for _ in 0..func.upvalue_count {
                    let is_local = chunk.code()[cursor];
                    let index = chunk.code()[cursor + 1];
                    let kind = if is_local != 0 { "local" } else { "upvalue" };
                    text.push_str(&format!("\n{cursor:04}      |                     {kind} {index}"));
                    cursor += 2;
                }
            }
            (text, cursor)
        }
        _ => (format!("{prefix}{}", op.mnemonic()), offset + 1),
    }
}

/// Dumps every instruction in `chunk` under a `name` header, clox's
/// `disassembleChunk`.
pub fn disassemble_chunk(chunk: &Chunk, name: &str, heap: &Heap) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.len() {
        let (line, next) = disassemble_instruction(chunk, offset, heap);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}
