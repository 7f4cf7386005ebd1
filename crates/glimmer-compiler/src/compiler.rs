//! Single-pass Pratt compiler: source tokens straight to bytecode, no
//! intermediate AST (§4.3). One `Compiler` compiles one function; compilers
//! nest through `enclosing` while a nested function or method is parsed.

use glimmer_core::prelude::*;

use crate::diagnostics::Diagnostics;
use crate::lexer::{Lexer, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

fn infix_precedence(kind: TokenKind) -> Precedence {
    use TokenKind::*;
    match kind {
        Or => Precedence::Or,
        And => Precedence::And,
        EqualEqual | BangEqual => Precedence::Equality,
        Less | LessEqual | Greater | GreaterEqual => Precedence::Comparison,
        Plus | Minus => Precedence::Term,
        Star | Slash => Precedence::Factor,
        LeftParen | Dot => Precedence::Call,
        _ => Precedence::None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `-1` while the initializer is still being parsed (invariant 6, §3).
    depth: i32,
    is_captured: bool,
}

struct UpvalueSlot {
    index: u8,
    is_local: bool,
}

struct ClassState {
    has_superclass: bool,
}

/// One function-in-progress. Forms a chain via `enclosing`; the chain is
/// exactly the GC root set named in §4.5 item 5.
struct FnCompiler<'src> {
    function: Handle,
    kind: FunctionType,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueSlot>,
    scope_depth: i32,
}

impl<'src> FnCompiler<'src> {
    fn new(function: Handle, kind: FunctionType) -> Self {
        // Slot 0 is reserved for the receiver in methods/initializers, and
        // for nothing addressable in plain functions/the script (§4.3).
        let first_local_name = if matches!(kind, FunctionType::Method | FunctionType::Initializer) {
            "this"
        } else {
            ""
        };
        FnCompiler {
            function,
            kind,
            locals: vec![Local { name: first_local_name, depth: 0, is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Drives the whole parse. Owns the chain of in-progress function
/// compilers and the class-nesting stack, the source lexer, and the
/// current/previous token lookahead pair.
pub struct Parser<'src> {
    lexer: Lexer<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    diagnostics: Diagnostics,
    chain: Vec<FnCompiler<'src>>,
    classes: Vec<ClassState>,
}

/// Lets a caller's GC roots (the VM's globals/init-string, say) be combined
/// with the compiler's own in-progress function chain when a collection is
/// triggered mid-compile (Design Notes §9: "Compiler-during-GC").
struct CompilerRoots<'a, 'src> {
    chain: &'a [FnCompiler<'src>],
    extra: &'a mut dyn GcRoots,
}

impl<'a, 'src> GcRoots for CompilerRoots<'a, 'src> {
    fn mark_roots(&mut self, heap: &mut Heap, gray: &mut Vec<Handle>) {
        for frame in self.chain {
            heap.mark_handle(gray, frame.function);
        }
        self.extra.mark_roots(heap, gray);
    }
}

/// A no-op root set, for compiling without a VM around (e.g. in tests, or
/// `glimmer-cli disasm`, where no globals/init-string exist yet).
pub struct NoExtraRoots;
impl GcRoots for NoExtraRoots {
    fn mark_roots(&mut self, _heap: &mut Heap, _gray: &mut Vec<Handle>) {}
}

type ParseResult = Result<(), ()>;

impl<'src> Parser<'src> {
    fn new(source: &'src str, heap: &mut Heap) -> Self {
        let mut lexer = Lexer::new(source);
        let current = lexer.next_token();
        let script = heap.alloc_function(ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        });
        Parser {
            lexer,
            current,
            // Placeholder; overwritten by the first `advance()` call below.
            previous: current,
            diagnostics: Diagnostics::new(),
            chain: vec![FnCompiler::new(script, FunctionType::Script)],
            classes: Vec::new(),
        }
    }

    fn top(&mut self) -> &mut FnCompiler<'src> {
        self.chain.last_mut().expect("compiler chain is never empty")
    }

    fn current_line(&self) -> u32 {
        self.previous.line
    }

    fn chunk_mut<'h>(&self, heap: &'h mut Heap) -> &'h mut Chunk {
        let handle = self.chain.last().unwrap().function;
        &mut heap.get_mut(handle).as_function_mut().unwrap().chunk
    }

    // ---- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_tok(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        let location = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.diagnostics.push(token.line, &location, message);
    }

    fn synchronize(&mut self) {
        self.diagnostics.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            if matches!(self.current.kind, Class | Fun | Var | For | If | While | Print | Return) {
                return;
            }
            self.advance();
        }
    }

    // ---- bytecode emission -------------------------------------------

    fn emit_byte(&mut self, byte: u8, heap: &mut Heap) {
        let line = self.current_line();
        self.chunk_mut(heap).write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode, heap: &mut Heap) {
        let line = self.current_line();
        self.chunk_mut(heap).write_op(op, line);
    }

    fn emit_ops(&mut self, a: OpCode, b: u8, heap: &mut Heap) {
        self.emit_op(a, heap);
        self.emit_byte(b, heap);
    }

    fn make_constant(&mut self, value: Value, heap: &mut Heap) -> u8 {
        match self.chunk_mut(heap).add_constant(value) {
            Ok(idx) => idx,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value, heap: &mut Heap) {
        let idx = self.make_constant(value, heap);
        self.emit_ops(OpCode::Constant, idx, heap);
    }

    fn identifier_constant(&mut self, name: &str, heap: &mut Heap, extra: &mut dyn GcRoots) -> u8 {
        {
            let mut roots = CompilerRoots { chain: &self.chain, extra: &mut *extra };
            heap.maybe_collect(&mut roots);
        }
        let handle = heap.intern_string(name);
        self.make_constant(Value::Object(handle), heap)
    }

    fn emit_jump(&mut self, op: OpCode, heap: &mut Heap) -> usize {
        let line = self.current_line();
        self.chunk_mut(heap).emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize, heap: &mut Heap) {
        if self.chunk_mut(heap).patch_jump(offset).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, loop_start: usize, heap: &mut Heap) {
        let line = self.current_line();
        if self.chunk_mut(heap).emit_loop(loop_start, line).is_err() {
            self.error("Loop body too large.");
        }
    }

    fn emit_return(&mut self, heap: &mut Heap) {
        if self.top().kind == FunctionType::Initializer {
            // `return;` inside init() hands back the receiver, slot 0.
            self.emit_ops(OpCode::GetLocal, 0, heap);
        } else {
            self.emit_op(OpCode::Nil, heap);
        }
        self.emit_op(OpCode::Return, heap);
    }

    // ---- scopes & locals -----------------------------------------------

    fn begin_scope(&mut self) {
        self.top().scope_depth += 1;
    }

    fn end_scope(&mut self, heap: &mut Heap) {
        self.top().scope_depth -= 1;
        let depth = self.top().scope_depth;
        while let Some(local) = self.top().locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.is_captured {
                self.emit_op(OpCode::CloseUpvalue, heap);
            } else {
                self.emit_op(OpCode::Pop, heap);
            }
            self.top().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        if self.top().locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.top().locals.push(Local { name, depth: -1, is_captured: false });
    }

    fn declare_variable(&mut self, name: Token<'src>) {
        if self.top().scope_depth == 0 {
            return;
        }
        let depth = self.top().scope_depth;
        for local in self.top().locals.iter().rev() {
            if local.depth != -1 && local.depth < depth {
                break;
            }
            if local.name == name.lexeme {
                self.error("Already a variable with this name in this scope.");
            }
        }
        self.add_local(name.lexeme);
    }

    fn mark_initialized(&mut self) {
        if self.top().scope_depth == 0 {
            return;
        }
        let depth = self.top().scope_depth;
        if let Some(local) = self.top().locals.last_mut() {
            local.depth = depth;
        }
    }

    fn parse_variable(&mut self, message: &str, heap: &mut Heap, extra: &mut dyn GcRoots) -> u8 {
        self.consume(TokenKind::Identifier, message);
        let name = self.previous;
        self.declare_variable(name);
        if self.top().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name.lexeme, heap, extra)
    }

    fn define_variable(&mut self, global: u8, heap: &mut Heap) {
        if self.top().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global, heap);
    }

    fn resolve_local(compiler: &FnCompiler<'src>, name: &str) -> Option<(u8, bool)> {
        for (i, local) in compiler.locals.iter().enumerate().rev() {
            if local.name == name {
                return Some((i as u8, local.depth == -1));
            }
        }
        None
    }

    /// Resolves `name` as an upvalue of `self.chain[frame_idx]`, recursing
    /// into enclosing frames and marking captured locals along the way.
    fn resolve_upvalue(&mut self, frame_idx: usize, name: &str) -> Option<u8> {
        if frame_idx == 0 {
            return None;
        }
        let enclosing_idx = frame_idx - 1;
        if let Some((slot, uninitialized)) = Self::resolve_local(&self.chain[enclosing_idx], name) {
            if uninitialized {
                self.error("Can't read local variable in its own initializer.");
            }
            self.chain[enclosing_idx].locals[slot as usize].is_captured = true;
            return Some(self.add_upvalue(frame_idx, slot, true));
        }
        if let Some(slot) = self.resolve_upvalue(enclosing_idx, name) {
            return Some(self.add_upvalue(frame_idx, slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_idx: usize, index: u8, is_local: bool) -> u8 {
        let frame = &mut self.chain[frame_idx];
        for (i, up) in frame.upvalues.iter().enumerate() {
            if up.index == index && up.is_local == is_local {
                return i as u8;
            }
        }
        if frame.upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        frame.upvalues.push(UpvalueSlot { index, is_local });
        (frame.upvalues.len() - 1) as u8
    }

    // ---- expressions -----------------------------------------------

    fn parse_precedence(&mut self, precedence: Precedence, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix(self.previous.kind, can_assign, heap, extra);
        while precedence <= infix_precedence(self.current.kind) {
            self.advance();
            self.infix(self.previous.kind, can_assign, heap, extra);
        }
        if can_assign && self.match_tok(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.parse_precedence(Precedence::Assignment, heap, extra);
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool, heap: &mut Heap, extra: &mut dyn GcRoots) {
        use TokenKind::*;
        match kind {
            LeftParen => self.grouping(heap, extra),
            Minus | Bang => self.unary(kind, heap, extra),
            Number => self.number(heap),
            String => self.string(heap, extra),
            True => self.emit_op(OpCode::True, heap),
            False => self.emit_op(OpCode::False, heap),
            Nil => self.emit_op(OpCode::Nil, heap),
            Identifier => self.variable(can_assign, heap, extra),
            This => self.this_expr(heap, extra),
            Super => self.super_expr(heap, extra),
            _ => self.error("Expect expression."),
        }
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool, heap: &mut Heap, extra: &mut dyn GcRoots) {
        use TokenKind::*;
        match kind {
            Minus | Plus | Slash | Star | EqualEqual | BangEqual | Less | LessEqual | Greater
            | GreaterEqual => self.binary(kind, heap, extra),
            And => self.and_expr(heap, extra),
            Or => self.or_expr(heap, extra),
            LeftParen => self.call_expr(heap, extra),
            Dot => self.dot_expr(can_assign, heap, extra),
            _ => unreachable!("token has no infix rule"),
        }
    }

    fn grouping(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.expression(heap, extra);
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, heap: &mut Heap) {
        let value: f64 = self.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value), heap);
    }

    fn string(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let raw = self.previous.lexeme;
        let content = &raw[1..raw.len() - 1];
        {
            let mut roots = CompilerRoots { chain: &self.chain, extra: &mut *extra };
            heap.maybe_collect(&mut roots);
        }
        let handle = heap.intern_string(content);
        self.emit_constant(Value::Object(handle), heap);
    }

    /// Shared by plain identifiers, `this`, and `super`'s receiver: resolve
    /// as local, then upvalue, then global, emitting GET/SET accordingly.
    fn named_variable(&mut self, name: &str, can_assign: bool, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let frame_idx = self.chain.len() - 1;
        let (get_op, set_op, arg) = if let Some((slot, uninitialized)) = Self::resolve_local(&self.chain[frame_idx], name) {
            if uninitialized {
                self.error("Can't read local variable in its own initializer.");
            }
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(frame_idx, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let idx = self.identifier_constant(name, heap, extra);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression(heap, extra);
            self.emit_ops(set_op, arg, heap);
        } else {
            self.emit_ops(get_op, arg, heap);
        }
    }

    fn variable(&mut self, can_assign: bool, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign, heap, extra);
    }

    fn this_expr(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false, heap, extra);
    }

    fn super_expr(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(c) if !c.has_superclass => self.error("Can't use 'super' in a class with no superclass."),
            _ => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name, heap, extra);

        self.named_variable("this", false, heap, extra);
        if self.match_tok(TokenKind::LeftParen) {
            let argc = self.argument_list(heap, extra);
            self.named_variable("super", false, heap, extra);
            self.emit_op(OpCode::SuperInvoke, heap);
            self.emit_byte(name_const, heap);
            self.emit_byte(argc, heap);
        } else {
            self.named_variable("super", false, heap, extra);
            self.emit_ops(OpCode::GetSuper, name_const, heap);
        }
    }

    fn unary(&mut self, kind: TokenKind, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.parse_precedence(Precedence::Unary, heap, extra);
        match kind {
            // §9: the reference drops the `break` here, so `!` falls into
            // NEGATE too. A single opcode per operator is correct.
            TokenKind::Bang => self.emit_op(OpCode::Not, heap),
            TokenKind::Minus => self.emit_op(OpCode::Negate, heap),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self, kind: TokenKind, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let next = infix_precedence(kind).next();
        self.parse_precedence(next, heap, extra);
        use TokenKind::*;
        match kind {
            Plus => self.emit_op(OpCode::Add, heap),
            Minus => self.emit_op(OpCode::Subtract, heap),
            Star => self.emit_op(OpCode::Multiply, heap),
            Slash => self.emit_op(OpCode::Divide, heap),
            EqualEqual => self.emit_op(OpCode::Equal, heap),
            BangEqual => {
                self.emit_op(OpCode::Equal, heap);
                self.emit_op(OpCode::Not, heap);
            }
            Greater => self.emit_op(OpCode::Greater, heap),
            GreaterEqual => {
                self.emit_op(OpCode::Less, heap);
                self.emit_op(OpCode::Not, heap);
            }
            Less => self.emit_op(OpCode::Less, heap),
            LessEqual => {
                self.emit_op(OpCode::Greater, heap);
                self.emit_op(OpCode::Not, heap);
            }
            _ => unreachable!(),
        }
    }

    fn and_expr(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse, heap);
        self.emit_op(OpCode::Pop, heap);
        self.parse_precedence(Precedence::And, heap, extra);
        self.patch_jump(end_jump, heap);
    }

    fn or_expr(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse, heap);
        let end_jump = self.emit_jump(OpCode::Jump, heap);
        self.patch_jump(else_jump, heap);
        self.emit_op(OpCode::Pop, heap);
        self.parse_precedence(Precedence::Or, heap, extra);
        self.patch_jump(end_jump, heap);
    }

    fn argument_list(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) -> u8 {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression(heap, extra);
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn call_expr(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let argc = self.argument_list(heap, extra);
        self.emit_ops(OpCode::Call, argc, heap);
    }

    fn dot_expr(&mut self, can_assign: bool, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name, heap, extra);

        if can_assign && self.match_tok(TokenKind::Equal) {
            self.expression(heap, extra);
            self.emit_ops(OpCode::SetProperty, name_const, heap);
        } else if self.match_tok(TokenKind::LeftParen) {
            let argc = self.argument_list(heap, extra);
            self.emit_op(OpCode::Invoke, heap);
            self.emit_byte(name_const, heap);
            self.emit_byte(argc, heap);
        } else {
            self.emit_ops(OpCode::GetProperty, name_const, heap);
        }
    }

    // ---- statements -----------------------------------------------

    pub fn declaration(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        if self.match_tok(TokenKind::Class) {
            self.class_declaration(heap, extra);
        } else if self.match_tok(TokenKind::Fun) {
            self.fun_declaration(heap, extra);
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration(heap, extra);
        } else {
            self.statement(heap, extra);
        }
        if self.diagnostics.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        if self.match_tok(TokenKind::Print) {
            self.print_statement(heap, extra);
        } else if self.match_tok(TokenKind::For) {
            self.for_statement(heap, extra);
        } else if self.match_tok(TokenKind::If) {
            self.if_statement(heap, extra);
        } else if self.match_tok(TokenKind::Return) {
            self.return_statement(heap, extra);
        } else if self.match_tok(TokenKind::While) {
            self.while_statement(heap, extra);
        } else if self.match_tok(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block(heap, extra);
            self.end_scope(heap);
        } else {
            self.expression_statement(heap, extra);
        }
    }

    fn block(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration(heap, extra);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.expression(heap, extra);
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print, heap);
    }

    fn expression_statement(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.expression(heap, extra);
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop, heap);
    }

    fn if_statement(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression(heap, extra);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse, heap);
        self.emit_op(OpCode::Pop, heap);
        self.statement(heap, extra);
        let else_jump = self.emit_jump(OpCode::Jump, heap);

        self.patch_jump(then_jump, heap);
        self.emit_op(OpCode::Pop, heap);
        if self.match_tok(TokenKind::Else) {
            self.statement(heap, extra);
        }
        self.patch_jump(else_jump, heap);
    }

    fn while_statement(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let loop_start = self.chunk_mut(heap).len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression(heap, extra);
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse, heap);
        self.emit_op(OpCode::Pop, heap);
        self.statement(heap, extra);
        self.emit_loop(loop_start, heap);

        self.patch_jump(exit_jump, heap);
        self.emit_op(OpCode::Pop, heap);
    }

    fn for_statement(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_tok(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_tok(TokenKind::Var) {
            self.var_declaration(heap, extra);
        } else {
            self.expression_statement(heap, extra);
        }

        let mut loop_start = self.chunk_mut(heap).len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_tok(TokenKind::Semicolon) {
            self.expression(heap, extra);
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse, heap));
            self.emit_op(OpCode::Pop, heap);
        }

        if !self.match_tok(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump, heap);
            let increment_start = self.chunk_mut(heap).len();
            self.expression(heap, extra);
            self.emit_op(OpCode::Pop, heap);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start, heap);
            loop_start = increment_start;
            self.patch_jump(body_jump, heap);
        }

        self.statement(heap, extra);
        self.emit_loop(loop_start, heap);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump, heap);
            self.emit_op(OpCode::Pop, heap);
        }

        self.end_scope(heap);
    }

    fn return_statement(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        if self.top().kind == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_tok(TokenKind::Semicolon) {
            self.emit_return(heap);
        } else {
            if self.top().kind == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression(heap, extra);
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return, heap);
        }
    }

    fn var_declaration(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let global = self.parse_variable("Expect variable name.", heap, extra);
        if self.match_tok(TokenKind::Equal) {
            self.expression(heap, extra);
        } else {
            self.emit_op(OpCode::Nil, heap);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global, heap);
    }

    fn fun_declaration(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let global = self.parse_variable("Expect function name.", heap, extra);
        self.mark_initialized();
        self.function(FunctionType::Function, heap, extra);
        self.define_variable(global, heap);
    }

    fn function(&mut self, kind: FunctionType, heap: &mut Heap, extra: &mut dyn GcRoots) {
        let name_lexeme = self.previous.lexeme;
        {
            let mut roots = CompilerRoots { chain: &self.chain, extra: &mut *extra };
            heap.maybe_collect(&mut roots);
        }
        let name_handle = heap.intern_string(name_lexeme);
        let func_handle = heap.alloc_function(ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: Some(name_handle),
        });
        self.chain.push(FnCompiler::new(func_handle, kind));

        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let arity = heap.get(func_handle).as_function().unwrap().arity;
                if arity == 255 {
                    self.error("Can't have more than 255 parameters.");
                } else {
                    heap.get_mut(func_handle).as_function_mut().unwrap().arity = arity + 1;
                }
                let param = self.parse_variable("Expect parameter name.", heap, extra);
                self.define_variable(param, heap);
                if !self.match_tok(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block(heap, extra);

        self.emit_return(heap);
        let finished = self.chain.pop().expect("pushed above");
        heap.get_mut(finished.function).as_function_mut().unwrap().upvalue_count =
            finished.upvalues.len() as u8;

        let func_idx = self.make_constant(Value::Object(finished.function), heap);
        self.emit_ops(OpCode::Closure, func_idx, heap);
        for up in &finished.upvalues {
            self.emit_byte(up.is_local as u8, heap);
            self.emit_byte(up.index, heap);
        }
    }

    fn method(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let name_const = self.identifier_constant(name, heap, extra);
        let kind = if name == "init" { FunctionType::Initializer } else { FunctionType::Method };
        self.function(kind, heap, extra);
        self.emit_ops(OpCode::Method, name_const, heap);
    }

    fn class_declaration(&mut self, heap: &mut Heap, extra: &mut dyn GcRoots) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_const = self.identifier_constant(class_name.lexeme, heap, extra);
        self.declare_variable(class_name);

        self.emit_ops(OpCode::Class, name_const, heap);
        self.define_variable(name_const, heap);

        self.classes.push(ClassState { has_superclass: false });

        if self.match_tok(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.previous.lexeme;
            if super_name == class_name.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.variable(false, heap, extra);

            self.begin_scope();
            self.add_local("super");
            self.define_variable(0, heap);

            self.named_variable(class_name.lexeme, false, heap, extra);
            self.emit_op(OpCode::Inherit, heap);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name.lexeme, false, heap, extra);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method(heap, extra);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop, heap);

        let class = self.classes.pop().unwrap();
        if class.has_superclass {
            self.end_scope(heap);
        }
    }
}

/// Compiles `source` into a top-level script function, or `None` if any
/// compile error occurred (§7: "`compile` returns 'no function'"). `extra`
/// lets a host (typically the VM) fold its own GC roots in for any
/// collection triggered mid-compile; pass [`NoExtraRoots`] if there is none.
pub fn compile(source: &str, heap: &mut Heap, extra: &mut dyn GcRoots) -> (Option<Handle>, Diagnostics) {
    let mut parser = Parser::new(source, heap);
    parser.advance();
    while !parser.check(TokenKind::Eof) {
        parser.declaration(heap, extra);
    }
    parser.consume(TokenKind::Eof, "Expect end of expression.");
    parser.emit_return(heap);

    let finished = parser.chain.pop().expect("script frame");
    heap.get_mut(finished.function).as_function_mut().unwrap().upvalue_count = 0;

    if parser.diagnostics.had_error {
        (None, parser.diagnostics)
    } else {
        (Some(finished.function), parser.diagnostics)
    }
}
