// src/vm/compiler.rs

use std::iter;
use std::mem;

use tracing::debug;

use crate::config::UINT8_COUNT;
use crate::error::{CompileError, Diagnostic, ErrorLocation};
use crate::memory::{Heap, HeapObject, ObjRef};
use crate::scanner::{Scanner, Token, TokenType};
use crate::value::Value;
use crate::vm::chunk::Chunk;
use crate::vm::function::Function;
use crate::vm::opcode::OpCode;

/// The main entry point for compilation.
///
/// `roots` are the values the caller keeps alive outside the heap (the VM's
/// globals and stack). They are passed to every collection the compiler
/// triggers, together with the functions still under construction.
pub fn compile(source: &str, heap: &mut Heap, roots: &[Value]) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler::new(source, heap, roots);
    compiler.advance();
    while !compiler.matches(TokenType::Eof) {
        compiler.declaration();
    }
    let (script, _) = compiler.end_function();

    if compiler.had_error {
        debug!(errors = compiler.diagnostics.len(), "compilation failed");
        return Err(CompileError { diagnostics: compiler.diagnostics });
    }
    Ok(script)
}

// --- Pratt rule table ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseFn {
    Grouping,
    Call,
    Dot,
    Unary,
    Binary,
    Variable,
    String,
    Number,
    And,
    Or,
    Literal,
    Super,
    This,
}

#[derive(Debug, Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

fn rule(kind: TokenType) -> ParseRule {
    use ParseFn as F;
    use Precedence as P;
    use TokenType as T;

    let (prefix, infix, precedence) = match kind {
        T::LeftParen => (Some(F::Grouping), Some(F::Call), P::Call),
        T::Dot => (None, Some(F::Dot), P::Call),
        T::Minus => (Some(F::Unary), Some(F::Binary), P::Term),
        T::Plus => (None, Some(F::Binary), P::Term),
        T::Slash | T::Star => (None, Some(F::Binary), P::Factor),
        T::Bang => (Some(F::Unary), None, P::None),
        T::BangEqual | T::EqualEqual => (None, Some(F::Binary), P::Equality),
        T::Greater | T::GreaterEqual | T::Less | T::LessEqual => (None, Some(F::Binary), P::Comparison),
        T::Identifier => (Some(F::Variable), None, P::None),
        T::String => (Some(F::String), None, P::None),
        T::Number => (Some(F::Number), None, P::None),
        T::And => (None, Some(F::And), P::And),
        T::Or => (None, Some(F::Or), P::Or),
        T::False | T::Nil | T::True => (Some(F::Literal), None, P::None),
        T::Super => (Some(F::Super), None, P::None),
        T::This => (Some(F::This), None, P::None),
        T::RightParen
        | T::LeftBrace
        | T::RightBrace
        | T::Comma
        | T::Semicolon
        | T::Colon
        | T::Equal
        | T::PlusEqual
        | T::MinusEqual
        | T::StarEqual
        | T::SlashEqual
        | T::PlusPlus
        | T::MinusMinus
        | T::Class
        | T::Else
        | T::For
        | T::Fun
        | T::If
        | T::Print
        | T::Return
        | T::Var
        | T::While
        | T::Switch
        | T::Case
        | T::Default
        | T::Break
        | T::Continue
        | T::Assert
        | T::Exit
        | T::Error
        | T::Eof => (None, None, P::None),
    };
    ParseRule { prefix, infix, precedence }
}

// --- Per-function state ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Initializer,
    Method,
    Script,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    // None while the initializer is still being compiled.
    depth: Option<usize>,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

#[derive(Debug)]
struct LoopContext {
    // Target of `continue`: the condition, or the increment clause of a `for`.
    start: usize,
    scope_depth: usize,
    break_jumps: Vec<usize>,
}

struct FunctionCompiler<'src> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
    loops: Vec<LoopContext>,
}

impl<'src> FunctionCompiler<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        // Slot 0 holds the receiver in methods and the callee otherwise.
        let slot_zero = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            FunctionKind::Function | FunctionKind::Script => "",
        };
        FunctionCompiler {
            function: Function::new(name),
            kind,
            locals: vec![Local { name: slot_zero, depth: Some(0), is_captured: false }],
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
        }
    }
}

struct ClassCompiler {
    has_superclass: bool,
}

struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    current_token: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,

    heap: &'h mut Heap,
    roots: &'h [Value],

    current: FunctionCompiler<'src>,
    enclosing: Vec<FunctionCompiler<'src>>,
    classes: Vec<ClassCompiler>,
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap, roots: &'h [Value]) -> Self {
        let placeholder = Token { kind: TokenType::Eof, lexeme: "", line: 1 };
        Compiler {
            scanner: Scanner::new(source),
            current_token: placeholder,
            previous: placeholder,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            heap,
            roots,
            current: FunctionCompiler::new(FunctionKind::Script, None),
            enclosing: Vec::new(),
            classes: Vec::new(),
        }
    }

    // --- Heap access ---

    // Runs a collection when due. Everything reachable from a function under
    // construction is a root, since none of them is on the heap yet.
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        let mut roots = self.roots.to_vec();
        for fc in self.enclosing.iter().chain(iter::once(&self.current)) {
            roots.extend(fc.function.name.map(Value::Obj));
            roots.extend_from_slice(&fc.function.chunk.constants);
        }
        self.heap.collect_full(&roots);
    }

    // The result must be stored in a constant pool before the next allocation.
    fn intern(&mut self, text: &str) -> ObjRef {
        self.maybe_collect();
        self.heap.intern(text)
    }

    // --- Token handling ---

    fn advance(&mut self) {
        self.previous = self.current_token;
        loop {
            self.current_token = self.scanner.scan_token();
            if self.current_token.kind != TokenType::Error {
                break;
            }
            let message = self.current_token.lexeme;
            self.error_at_current(message);
        }
    }

    fn consume(&mut self, kind: TokenType, message: &str) {
        if self.current_token.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    fn check(&self, kind: TokenType) -> bool {
        self.current_token.kind == kind
    }

    fn matches(&mut self, kind: TokenType) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // Consumes a compound assignment operator and returns its arithmetic op.
    fn match_compound_assignment(&mut self) -> Option<OpCode> {
        let op = match self.current_token.kind {
            TokenType::PlusEqual => OpCode::OpAdd,
            TokenType::MinusEqual => OpCode::OpSubtract,
            TokenType::StarEqual => OpCode::OpMultiply,
            TokenType::SlashEqual => OpCode::OpDivide,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn match_increment(&mut self) -> Option<OpCode> {
        let op = match self.current_token.kind {
            TokenType::PlusPlus => OpCode::OpAdd,
            TokenType::MinusMinus => OpCode::OpSubtract,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    // --- Error reporting ---

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        // Suppress cascades until the parser resynchronises.
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let location = match token.kind {
            TokenType::Eof => ErrorLocation::AtEnd,
            TokenType::Error => ErrorLocation::Unspecified,
            _ => ErrorLocation::At(token.lexeme.to_string()),
        };
        self.diagnostics.push(Diagnostic { line: token.line, location, message: message.to_string() });
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current_token, message);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current_token.kind != TokenType::Eof {
            if self.previous.kind == TokenType::Semicolon {
                return;
            }
            match self.current_token.kind {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return
                | TokenType::Switch
                | TokenType::Assert
                | TokenType::Exit => return,
                _ => self.advance(),
            }
        }
    }

    // --- Emitting bytecode ---

    fn current_chunk(&mut self) -> &mut Chunk { &mut self.current.function.chunk }
    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write(byte, line);
    }
    fn emit_opcode(&mut self, op: OpCode) { self.emit_byte(op as u8); }
    fn emit_op_with(&mut self, op: OpCode, operand: u8) {
        self.emit_opcode(op);
        self.emit_byte(operand);
    }

    fn emit_return(&mut self) {
        if self.current.kind == FunctionKind::Initializer {
            self.emit_op_with(OpCode::OpGetLocal, 0);
        } else {
            self.emit_opcode(OpCode::OpNil);
        }
        self.emit_opcode(OpCode::OpReturn);
    }

    // Index for 1-byte operands (names, functions).
    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.current_chunk().add_constant(value);
        match u8::try_from(index) {
            Ok(index) => index,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    // Literals switch to the 3-byte form once the pool outgrows one byte.
    fn emit_constant(&mut self, value: Value) {
        let index = self.current_chunk().add_constant(value);
        if let Ok(short) = u8::try_from(index) {
            self.emit_op_with(OpCode::OpConstant, short);
        } else if index < 1 << 24 {
            self.emit_opcode(OpCode::OpConstantLong);
            for byte in &(index as u32).to_be_bytes()[1..] {
                self.emit_byte(*byte);
            }
        } else {
            self.error("Too many constants in one chunk.");
        }
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_opcode(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 to adjust for the bytecode for the jump offset itself.
        let jump = self.current_chunk().code.len() - offset - 2;
        let Ok(jump) = u16::try_from(jump) else {
            self.error("Too much code to jump over.");
            return;
        };
        let [hi, lo] = jump.to_be_bytes();
        let code = &mut self.current_chunk().code;
        code[offset] = hi;
        code[offset + 1] = lo;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_opcode(OpCode::OpLoop);
        let offset = self.current_chunk().code.len() - loop_start + 2;
        let [hi, lo] = match u16::try_from(offset) {
            Ok(offset) => offset.to_be_bytes(),
            Err(_) => {
                self.error("Loop body too large.");
                [0, 0]
            }
        };
        self.emit_byte(hi);
        self.emit_byte(lo);
    }

    fn emit_pops(&mut self, mut count: usize) {
        while count > 0 {
            if count == 1 {
                self.emit_opcode(OpCode::OpPop);
                return;
            }
            let batch = count.min(u8::MAX as usize);
            self.emit_op_with(OpCode::OpPopN, batch as u8);
            count -= batch;
        }
    }

    // --- Function lifecycle ---

    fn begin_function(&mut self, kind: FunctionKind) {
        let name = self.intern(self.previous.lexeme);
        let enclosing = mem::replace(&mut self.current, FunctionCompiler::new(kind, Some(name)));
        self.enclosing.push(enclosing);
    }

    // Finishes the current function, puts it on the heap and returns it with
    // the upvalue descriptors its closure instruction needs.
    fn end_function(&mut self) -> (ObjRef, Vec<UpvalueRef>) {
        self.emit_return();
        // Collect while the finished function is still a root.
        self.maybe_collect();
        let finished = match self.enclosing.pop() {
            Some(parent) => mem::replace(&mut self.current, parent),
            None => mem::replace(&mut self.current, FunctionCompiler::new(FunctionKind::Script, None)),
        };
        let obj = self.heap.register(HeapObject::Function(finished.function));
        (obj, finished.upvalues)
    }

    // --- Scopes and variables ---

    fn begin_scope(&mut self) { self.current.scope_depth += 1; }

    fn end_scope(&mut self) {
        self.current.scope_depth -= 1;
        let depth = self.current.scope_depth;
        let discarded = self.discard_locals(depth);
        let remaining = self.current.locals.len() - discarded;
        self.current.locals.truncate(remaining);
    }

    // Emits the pops for every local deeper than `depth` without forgetting
    // them. Captured locals are closed instead of popped.
    fn discard_locals(&mut self, depth: usize) -> usize {
        let captured: Vec<bool> = self
            .current
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |d| d > depth))
            .map(|local| local.is_captured)
            .collect();

        let mut pending = 0;
        for is_captured in &captured {
            if *is_captured {
                self.emit_pops(pending);
                pending = 0;
                self.emit_opcode(OpCode::OpCloseUpvalue);
            } else {
                pending += 1;
            }
        }
        self.emit_pops(pending);
        captured.len()
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let obj = self.intern(name);
        self.make_constant(Value::Obj(obj))
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current.locals.len() == UINT8_COUNT {
            self.error("Too many local variables in function.");
            return;
        }
        self.current.locals.push(Local { name, depth: None, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.current.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let scope_depth = self.current.scope_depth;
        let duplicate = self
            .current
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |d| d >= scope_depth))
            .any(|local| local.name == name);
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.current.scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let depth = self.current.scope_depth;
        if depth == 0 {
            return;
        }
        if let Some(local) = self.current.locals.last_mut() {
            local.depth = Some(depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.current.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_op_with(OpCode::OpDefineGlobal, global);
    }

    // `level` indexes the function stack: 0 is the script, `enclosing.len()`
    // is the function being compiled.
    fn function_at(&mut self, level: usize) -> &mut FunctionCompiler<'src> {
        if level == self.enclosing.len() {
            &mut self.current
        } else {
            &mut self.enclosing[level]
        }
    }

    fn resolve_local(&mut self, level: usize, name: &str) -> Option<u8> {
        let fc = self.function_at(level);
        let slot = fc.locals.iter().rposition(|local| local.name == name)?;
        if fc.locals[slot].depth.is_none() {
            self.error("Can't read local variable in its own initializer.");
        }
        Some(slot as u8)
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<u8> {
        if level == 0 {
            return None;
        }
        let parent = level - 1;
        if let Some(local) = self.resolve_local(parent, name) {
            self.function_at(parent).locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(level, UpvalueRef { index: local, is_local: true }));
        }
        let upvalue = self.resolve_upvalue(parent, name)?;
        Some(self.add_upvalue(level, UpvalueRef { index: upvalue, is_local: false }))
    }

    fn add_upvalue(&mut self, level: usize, upvalue: UpvalueRef) -> u8 {
        let fc = self.function_at(level);
        if let Some(existing) = fc.upvalues.iter().position(|u| *u == upvalue) {
            return existing as u8;
        }
        if fc.upvalues.len() == UINT8_COUNT {
            self.error("Too many closure variables in function.");
            return 0;
        }
        fc.upvalues.push(upvalue);
        fc.function.upvalue_count = fc.upvalues.len();
        (fc.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &'src str, can_assign: bool) {
        let level = self.enclosing.len();
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(level, name) {
            (OpCode::OpGetLocal, OpCode::OpSetLocal, slot)
        } else if let Some(index) = self.resolve_upvalue(level, name) {
            (OpCode::OpGetUpvalue, OpCode::OpSetUpvalue, index)
        } else {
            let constant = self.identifier_constant(name);
            (OpCode::OpGetGlobal, OpCode::OpSetGlobal, constant)
        };

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op_with(set_op, arg);
        } else if let Some(op) = can_assign.then(|| self.match_compound_assignment()).flatten() {
            self.emit_op_with(get_op, arg);
            self.expression();
            self.emit_opcode(op);
            self.emit_op_with(set_op, arg);
        } else if let Some(op) = self.match_increment() {
            // Postfix update; the expression yields the updated value.
            self.emit_op_with(get_op, arg);
            self.emit_constant(Value::Number(1.0));
            self.emit_opcode(op);
            self.emit_op_with(set_op, arg);
        } else {
            self.emit_op_with(get_op, arg);
        }
    }

    // --- Expressions ---

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        self.apply(prefix, can_assign);

        while precedence <= rule(self.current_token.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.previous.kind).infix {
                self.apply(infix, can_assign);
            }
        }

        if can_assign && (self.matches(TokenType::Equal) || self.match_compound_assignment().is_some()) {
            self.error("Invalid assignment target.");
        }
    }

    fn apply(&mut self, parse_fn: ParseFn, can_assign: bool) {
        match parse_fn {
            ParseFn::Grouping => self.grouping(),
            ParseFn::Call => self.call(),
            ParseFn::Dot => self.dot(can_assign),
            ParseFn::Unary => self.unary(),
            ParseFn::Binary => self.binary(),
            ParseFn::Variable => self.named_variable(self.previous.lexeme, can_assign),
            ParseFn::String => self.string(),
            ParseFn::Number => self.number(),
            ParseFn::And => self.and(),
            ParseFn::Or => self.or(),
            ParseFn::Literal => self.literal(),
            ParseFn::Super => self.super_(),
            ParseFn::This => self.this(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self) {
        match self.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self) {
        let lexeme = self.previous.lexeme;
        // Strip the surrounding quotes.
        let obj = self.intern(&lexeme[1..lexeme.len() - 1]);
        self.emit_constant(Value::Obj(obj));
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenType::False => self.emit_opcode(OpCode::OpFalse),
            TokenType::Nil => self.emit_opcode(OpCode::OpNil),
            TokenType::True => self.emit_opcode(OpCode::OpTrue),
            _ => {}
        }
    }

    fn unary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Bang => self.emit_opcode(OpCode::OpNot),
            TokenType::Minus => self.emit_opcode(OpCode::OpNegate),
            _ => {}
        }
    }

    fn binary(&mut self) {
        let operator = self.previous.kind;
        self.parse_precedence(rule(operator).precedence.next());

        match operator {
            TokenType::BangEqual => {
                self.emit_opcode(OpCode::OpEqual);
                self.emit_opcode(OpCode::OpNot);
            }
            TokenType::EqualEqual => self.emit_opcode(OpCode::OpEqual),
            TokenType::Greater => self.emit_opcode(OpCode::OpGreater),
            TokenType::GreaterEqual => {
                self.emit_opcode(OpCode::OpLess);
                self.emit_opcode(OpCode::OpNot);
            }
            TokenType::Less => self.emit_opcode(OpCode::OpLess),
            TokenType::LessEqual => {
                self.emit_opcode(OpCode::OpGreater);
                self.emit_opcode(OpCode::OpNot);
            }
            TokenType::Plus => self.emit_opcode(OpCode::OpAdd),
            TokenType::Minus => self.emit_opcode(OpCode::OpSubtract),
            TokenType::Star => self.emit_opcode(OpCode::OpMultiply),
            TokenType::Slash => self.emit_opcode(OpCode::OpDivide),
            _ => {}
        }
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::OpJumpIfFalse);
        self.emit_opcode(OpCode::OpPop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::OpJumpIfFalse);
        let end_jump = self.emit_jump(OpCode::OpJump);
        self.patch_jump(else_jump);
        self.emit_opcode(OpCode::OpPop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX as usize {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        count.min(u8::MAX as usize) as u8
    }

    fn call(&mut self) {
        let count = self.argument_list();
        self.emit_op_with(OpCode::OpCall, count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.matches(TokenType::Equal) {
            self.expression();
            self.emit_op_with(OpCode::OpSetProperty, name);
        } else if let Some(op) = can_assign.then(|| self.match_compound_assignment()).flatten() {
            // Keep the receiver for the store.
            self.emit_opcode(OpCode::OpDup);
            self.emit_op_with(OpCode::OpGetProperty, name);
            self.expression();
            self.emit_opcode(op);
            self.emit_op_with(OpCode::OpSetProperty, name);
        } else if let Some(op) = self.match_increment() {
            self.emit_opcode(OpCode::OpDup);
            self.emit_op_with(OpCode::OpGetProperty, name);
            self.emit_constant(Value::Number(1.0));
            self.emit_opcode(op);
            self.emit_op_with(OpCode::OpSetProperty, name);
        } else if self.matches(TokenType::LeftParen) {
            let count = self.argument_list();
            self.emit_op_with(OpCode::OpInvoke, name);
            self.emit_byte(count);
        } else {
            self.emit_op_with(OpCode::OpGetProperty, name);
        }
    }

    fn this(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self) {
        match self.classes.last() {
            None => self.error("Can't use 'super' outside of a class."),
            Some(class) if !class.has_superclass => self.error("Can't use 'super' in a class with no superclass."),
            Some(_) => {}
        }

        self.consume(TokenType::Dot, "Expect '.' after 'super'.");
        self.consume(TokenType::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.matches(TokenType::LeftParen) {
            let count = self.argument_list();
            self.named_variable("super", false);
            self.emit_op_with(OpCode::OpSuperInvoke, name);
            self.emit_byte(count);
        } else {
            self.named_variable("super", false);
            self.emit_op_with(OpCode::OpGetSuper, name);
        }
    }

    // --- Declarations ---

    fn declaration(&mut self) {
        if self.matches(TokenType::Class) {
            self.class_declaration();
        } else if self.matches(TokenType::Fun) {
            self.fun_declaration();
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.lexeme;
        let name_constant = self.identifier_constant(class_name);
        self.declare_variable();

        self.emit_op_with(OpCode::OpClass, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler { has_superclass: false });

        if self.matches(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            self.named_variable(self.previous.lexeme, false);
            if self.previous.lexeme == class_name {
                self.error("A class can't inherit from itself.");
            }

            // The superclass lives in a local named `super` for the methods to capture.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit_opcode(OpCode::OpInherit);
            if let Some(class) = self.classes.last_mut() {
                class.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_opcode(OpCode::OpPop);

        if self.classes.pop().is_some_and(|class| class.has_superclass) {
            self.end_scope();
        }
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name = self.identifier_constant(self.previous.lexeme);
        let kind = if self.previous.lexeme == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit_op_with(OpCode::OpMethod, name);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        self.begin_function(kind);
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                self.current.function.arity += 1;
                if self.current.function.arity > u8::MAX as usize {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.matches(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_function();
        let constant = self.make_constant(Value::Obj(function));
        self.emit_op_with(OpCode::OpClosure, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.matches(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_opcode(OpCode::OpNil);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    // --- Statements ---

    fn statement(&mut self) {
        if self.matches(TokenType::Print) {
            self.print_statement();
        } else if self.matches(TokenType::For) {
            self.for_statement();
        } else if self.matches(TokenType::If) {
            self.if_statement();
        } else if self.matches(TokenType::Return) {
            self.return_statement();
        } else if self.matches(TokenType::While) {
            self.while_statement();
        } else if self.matches(TokenType::Switch) {
            self.switch_statement();
        } else if self.matches(TokenType::Break) {
            self.break_statement();
        } else if self.matches(TokenType::Continue) {
            self.continue_statement();
        } else if self.matches(TokenType::Assert) {
            self.assert_statement();
        } else if self.matches(TokenType::Exit) {
            self.exit_statement();
        } else if self.matches(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_opcode(OpCode::OpPrint);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_opcode(OpCode::OpPop);
    }

    fn assert_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after assertion.");
        self.emit_opcode(OpCode::OpAssert);
    }

    fn exit_statement(&mut self) {
        if self.matches(TokenType::Semicolon) {
            self.emit_constant(Value::Number(0.0));
        } else {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after exit code.");
        }
        self.emit_opcode(OpCode::OpExit);
    }

    fn return_statement(&mut self) {
        if self.current.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.matches(TokenType::Semicolon) {
            self.emit_return();
            return;
        }
        if self.current.kind == FunctionKind::Initializer {
            self.error("Can't return a value from an initializer.");
        }
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after return value.");
        self.emit_opcode(OpCode::OpReturn);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::OpJumpIfFalse);
        self.emit_opcode(OpCode::OpPop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::OpJump);
        self.patch_jump(then_jump);
        self.emit_opcode(OpCode::OpPop);

        if self.matches(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn begin_loop(&mut self, start: usize) {
        let scope_depth = self.current.scope_depth;
        self.current.loops.push(LoopContext { start, scope_depth, break_jumps: Vec::new() });
    }

    // Call once the exit path has dropped the condition; breaks land here.
    fn end_loop(&mut self) {
        if let Some(finished) = self.current.loops.pop() {
            for jump in finished.break_jumps {
                self.patch_jump(jump);
            }
        }
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().code.len();
        self.begin_loop(loop_start);

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::OpJumpIfFalse);
        self.emit_opcode(OpCode::OpPop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_opcode(OpCode::OpPop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenType::Semicolon) {
            // No initializer.
        } else if self.matches(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().code.len();
        self.begin_loop(loop_start);

        let mut exit_jump = None;
        if !self.matches(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::OpJumpIfFalse));
            self.emit_opcode(OpCode::OpPop);
        }

        if !self.matches(TokenType::RightParen) {
            let body_jump = self.emit_jump(OpCode::OpJump);
            let increment_start = self.current_chunk().code.len();
            self.expression();
            self.emit_opcode(OpCode::OpPop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            if let Some(context) = self.current.loops.last_mut() {
                context.start = increment_start;
            }
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_opcode(OpCode::OpPop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn break_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'break'.");
        let Some(depth) = self.current.loops.last().map(|l| l.scope_depth) else {
            self.error("Can't use 'break' outside of a loop.");
            return;
        };
        self.discard_locals(depth);
        let jump = self.emit_jump(OpCode::OpJump);
        if let Some(context) = self.current.loops.last_mut() {
            context.break_jumps.push(jump);
        }
    }

    fn continue_statement(&mut self) {
        self.consume(TokenType::Semicolon, "Expect ';' after 'continue'.");
        let Some((start, depth)) = self.current.loops.last().map(|l| (l.start, l.scope_depth)) else {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        };
        self.discard_locals(depth);
        self.emit_loop(start);
    }

    // Cases do not fall through. The switch value lives in a hidden local so
    // that `break`/`continue` inside a case pop it like any other local.
    fn switch_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after value.");
        self.add_local(" switch");
        self.mark_initialized();
        self.consume(TokenType::LeftBrace, "Expect '{' before switch cases.");

        #[derive(PartialEq)]
        enum State { BeforeCases, InCase, AfterDefault }

        let mut state = State::BeforeCases;
        let mut case_ends = Vec::new();
        let mut previous_case_skip = None;

        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            if self.matches(TokenType::Case) || self.matches(TokenType::Default) {
                let label = self.previous.kind;
                if state == State::AfterDefault {
                    self.error("Can't have another case or default after the default case.");
                }

                if state == State::InCase {
                    // The previous case is done: skip the remaining ones.
                    case_ends.push(self.emit_jump(OpCode::OpJump));
                    if let Some(skip) = previous_case_skip.take() {
                        self.patch_jump(skip);
                        self.emit_opcode(OpCode::OpPop);
                    }
                }

                if label == TokenType::Case {
                    state = State::InCase;
                    self.emit_opcode(OpCode::OpDup);
                    self.expression();
                    self.consume(TokenType::Colon, "Expect ':' after case value.");
                    self.emit_opcode(OpCode::OpEqual);
                    previous_case_skip = Some(self.emit_jump(OpCode::OpJumpIfFalse));
                    self.emit_opcode(OpCode::OpPop);
                } else {
                    state = State::AfterDefault;
                    self.consume(TokenType::Colon, "Expect ':' after default.");
                    previous_case_skip = None;
                }
            } else {
                if state == State::BeforeCases {
                    self.error_at_current("Can't have statements before any case.");
                }
                self.statement();
            }
        }
        self.consume(TokenType::RightBrace, "Expect '}' after switch cases.");

        // No default: the last failed comparison still sits on the stack.
        if let Some(skip) = previous_case_skip {
            case_ends.push(self.emit_jump(OpCode::OpJump));
            self.patch_jump(skip);
            self.emit_opcode(OpCode::OpPop);
        }
        for jump in case_ends {
            self.patch_jump(jump);
        }
        self.end_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let script = compile(source, &mut heap, &[]).expect("source should compile");
        (heap, script)
    }

    fn compile_err(source: &str) -> Vec<String> {
        let mut heap = Heap::new();
        match compile(source, &mut heap, &[]) {
            Ok(_) => panic!("expected a compile error for {source:?}"),
            Err(err) => err.diagnostics.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn code(heap: &Heap, function: ObjRef) -> Vec<u8> {
        heap.function(function).map(|f| f.chunk.code.clone()).unwrap_or_default()
    }

    #[test]
    fn test_block_locals_use_popn() {
        let (heap, script) = compile_ok("var v = 27; { var a = 1; var b = 2; a + b; }");
        let code = code(&heap, script);
        let expected = [
            OpCode::OpConstant as u8, 1,
            OpCode::OpDefineGlobal as u8, 0,
            OpCode::OpConstant as u8, 2,
            OpCode::OpConstant as u8, 3,
            OpCode::OpGetLocal as u8, 1,
            OpCode::OpGetLocal as u8, 2,
            OpCode::OpAdd as u8,
            OpCode::OpPop as u8,
            OpCode::OpPopN as u8, 2,
            OpCode::OpNil as u8,
            OpCode::OpReturn as u8,
        ];
        assert_eq!(code, expected);
    }

    #[test]
    fn test_nested_function_emits_closure_with_upvalues() {
        let (heap, script) = compile_ok("fun outer() { var x = 1; fun inner() { return x; } return inner; }");
        let script_code = code(&heap, script);
        assert_eq!(script_code[0], OpCode::OpClosure as u8);
        assert_eq!(script_code[2], OpCode::OpDefineGlobal as u8);

        let outer = heap.function(script).and_then(|f| f.chunk.constants[1].as_obj()).expect("outer function");
        let outer_fn = heap.function(outer).expect("outer is a function");
        assert_eq!(heap.str(outer_fn.name.expect("named")), "outer");

        let inner = outer_fn.chunk.constants.iter().find_map(|c| c.as_obj().filter(|o| heap.function(*o).is_some()));
        let inner_fn = inner.and_then(|o| heap.function(o)).expect("inner function");
        assert_eq!(inner_fn.upvalue_count, 1);
        assert_eq!(inner_fn.chunk.code[0], OpCode::OpGetUpvalue as u8);
    }

    #[test]
    fn test_large_literal_pools_use_wide_constants() {
        let source: String = (0..300).map(|i| format!("{i}.5;")).collect();
        let (heap, script) = compile_ok(&source);
        let code = code(&heap, script);
        assert!(code.contains(&(OpCode::OpConstantLong as u8)));
        assert_eq!(heap.function(script).map(|f| f.chunk.constants.len()), Some(300));
    }

    #[test]
    fn test_reported_errors() {
        assert_eq!(compile_err("print 1"), vec!["[line 1] Error at end: Expect ';' after value."]);
        assert_eq!(compile_err("1 + 2 = 3;"), vec!["[line 1] Error at '=': Invalid assignment target."]);
        assert_eq!(compile_err("return 1;"), vec!["[line 1] Error at 'return': Can't return from top-level code."]);
        assert_eq!(compile_err("print this;"), vec!["[line 1] Error at 'this': Can't use 'this' outside of a class."]);
        assert_eq!(compile_err("class A < A {}"), vec!["[line 1] Error at 'A': A class can't inherit from itself."]);
        assert_eq!(compile_err("break;"), vec!["[line 1] Error at ';': Can't use 'break' outside of a loop."]);
        assert_eq!(compile_err("continue;"), vec!["[line 1] Error at ';': Can't use 'continue' outside of a loop."]);
        assert_eq!(
            compile_err("{ var a = 1; var a = 2; }"),
            vec!["[line 1] Error at 'a': Already a variable with this name in this scope."]
        );
        assert_eq!(
            compile_err("{ var a = a; }"),
            vec!["[line 1] Error at 'a': Can't read local variable in its own initializer."]
        );
        assert_eq!(
            compile_err("class A { init() { return 1; } }"),
            vec!["[line 1] Error at 'return': Can't return a value from an initializer."]
        );
        assert_eq!(
            compile_err("class A { m() { super.m(); } }"),
            vec!["[line 1] Error at 'super': Can't use 'super' in a class with no superclass."]
        );
        assert_eq!(compile_err("switch (1) { print 1; }"), vec!["[line 1] Error at 'print': Can't have statements before any case."]);
        assert_eq!(
            compile_err("switch (1) { default: print 1; case 2: print 2; }"),
            vec!["[line 1] Error at 'case': Can't have another case or default after the default case."]
        );
        assert_eq!(
            compile_err("switch (1) { case 1: print 1;"),
            vec!["[line 1] Error at end: Expect '}' after switch cases."]
        );
        compile_ok("switch (1) { }");
    }

    #[test]
    fn test_panic_mode_reports_independent_errors() {
        let errors = compile_err("var = 1;\nprint 2\nvar ok = 3;\nprint ok;\n1 +;");
        assert_eq!(errors.len(), 3);
        assert!(errors[0].starts_with("[line 1]"));
        assert!(errors[2].starts_with("[line 5]"));
    }

    #[test]
    fn test_lexical_errors_have_no_location() {
        assert_eq!(compile_err("print \"open;"), vec!["[line 1] Error: Unterminated string."]);
    }

    #[test]
    fn test_stress_collection_keeps_compiler_roots() {
        let config = crate::config::VmConfig::default().with_gc_stress(true);
        let mut heap = Heap::with_config(&config);
        let source = "fun f(a, b) { var s = \"x\" + \"y\"; return a; } class C { m() { return \"m\"; } }";
        let script = compile(source, &mut heap, &[]).expect("compiles under stress");
        let f = heap.function(script).and_then(|s| s.chunk.constants[1].as_obj()).expect("function constant");
        let f = heap.function(f).expect("still a function after collections");
        assert_eq!(f.arity, 2);
        assert!(f.chunk.constants.iter().any(|c| heap.value_as_str(*c) == Some("x")));
    }
}
