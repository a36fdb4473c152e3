use lexer::{Lexer, Token, TokenKind, STATEMENT_BOUNDARIES};

use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::heap::{FunctionObj, Heap, ObjRef};
use crate::value::Value;

/// Low to high; `Precedence::Assignment` is the ceiling below which a
/// prefix parser is allowed to consume a trailing `=` (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
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
    fn one_higher(self) -> Self {
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

    /// The Pratt table expressed as a match on token kind rather than a
    /// constant array of function pointers (spec.md §9 Design Notes treats
    /// the two as semantically identical; a match is simpler to keep
    /// correct by hand).
    fn of(kind: TokenKind) -> Self {
        use TokenKind::*;
        match kind {
            OParen | Dot => Precedence::Call,
            Minus | Plus => Precedence::Term,
            Slash | Star => Precedence::Factor,
            BangEqual | EqualEqual => Precedence::Equality,
            Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
            And => Precedence::And,
            Or => Precedence::Or,
            _ => Precedence::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `None` is the "uninitialized" sentinel: the local has been declared
    /// but its initializer hasn't finished compiling yet, so a reference
    /// to the name inside that initializer is an error.
    depth: Option<u32>,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// One compiler frame per function being compiled, including the synthetic
/// top-level script. `Compiler::frames` is the stack these form; the last
/// entry is "current", the one before it is its "enclosing" compiler.
struct FunctionCompiler<'src> {
    chunk: Chunk,
    arity: u8,
    name: Option<&'src str>,
    fn_type: FunctionType,
    locals: Vec<Local<'src>>,
    scope_depth: u32,
    upvalues: Vec<UpvalueDesc>,
}

struct ClassCompilerState {
    has_superclass: bool,
}

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_CONSTANTS: usize = 256;
const MAX_PARAMETERS: u8 = 255;
const MAX_ARGUMENTS: u32 = 255;

/// A single-pass Pratt parser that emits bytecode directly — there is no
/// intermediate AST. `heap` is borrowed from whatever owns it (normally the
/// VM about to run the result) because the compiler interns identifiers
/// and string literals as it goes.
pub struct Compiler<'src, 'h> {
    lexer: Lexer<'src>,
    heap: &'h mut Heap,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    frames: Vec<FunctionCompiler<'src>>,
    classes: Vec<ClassCompilerState>,
}

/// Compiles `source` into a top-level script function. Accumulates every
/// diagnostic under a panic flag (synchronizing after each one) so a
/// single pass reports every independent error it can, rather than
/// stopping at the first.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler {
        lexer: Lexer::new(source),
        heap,
        previous: Token::new(TokenKind::Eof, "", 0),
        current: Token::new(TokenKind::Eof, "", 0),
        had_error: false,
        panic_mode: false,
        errors: Vec::new(),
        frames: Vec::new(),
        classes: Vec::new(),
    };
    compiler.begin_function(FunctionType::Script, None);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    let script = compiler.end_function();
    if compiler.had_error {
        Err(compiler.errors)
    } else {
        Ok(script)
    }
}

impl<'src, 'h> Compiler<'src, 'h> {
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

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError::at(&token, message));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            if STATEMENT_BOUNDARIES.contains(&self.current.kind) {
                return;
            }
            self.advance();
        }
    }

    // ---- frame bookkeeping --------------------------------------------

    fn current_frame(&self) -> &FunctionCompiler<'src> {
        self.frames.last().expect("compiler always has an active frame")
    }

    fn current_frame_mut(&mut self) -> &mut FunctionCompiler<'src> {
        self.frames.last_mut().expect("compiler always has an active frame")
    }

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.current_frame_mut().chunk
    }

    fn begin_function(&mut self, fn_type: FunctionType, name: Option<&'src str>) {
        let slot_zero_name = match fn_type {
            FunctionType::Method | FunctionType::Initializer => "this",
            FunctionType::Function | FunctionType::Script => "",
        };
        self.frames.push(FunctionCompiler {
            chunk: Chunk::new(),
            arity: 0,
            name,
            fn_type,
            locals: vec![Local {
                name: slot_zero_name,
                depth: Some(0),
                is_captured: false,
            }],
            scope_depth: 0,
            upvalues: Vec::new(),
        });
    }

    /// Pops the current frame, allocates its finished `Function` on the
    /// heap, and — unless this was the outermost script frame — emits the
    /// `CLOSURE` instruction that captures it into the enclosing chunk.
    fn end_function(&mut self) -> ObjRef {
        self.emit_return();
        let frame = self.frames.pop().expect("end_function always pairs with begin_function");
        let upvalue_count = frame.upvalues.len() as u8;
        let name_ref = frame.name.map(|n| self.heap.intern(n));
        let function_ref = self.heap.alloc_function(FunctionObj {
            name: name_ref,
            arity: frame.arity,
            upvalue_count,
            chunk: frame.chunk,
        });
        if !self.frames.is_empty() {
            let const_idx = self.make_constant(Value::Obj(function_ref));
            self.emit_ops(OpCode::Closure, const_idx);
            for uv in &frame.upvalues {
                self.emit_byte(if uv.is_local { 1 } else { 0 });
                self.emit_byte(uv.index);
            }
        }
        function_ref
    }

    fn begin_scope(&mut self) {
        self.current_frame_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_frame_mut().scope_depth -= 1;
        let depth = self.current_frame().scope_depth;
        loop {
            let should_pop = matches!(
                self.current_frame().locals.last(),
                Some(l) if l.depth.map_or(false, |d| d > depth)
            );
            if !should_pop {
                break;
            }
            let captured = self.current_frame().locals.last().unwrap().is_captured;
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.current_frame_mut().locals.pop();
        }
    }

    // ---- bytecode emission ---------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write_byte(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        let line = self.previous.line;
        self.current_chunk().write_op(op, line);
    }

    fn emit_ops(&mut self, op: OpCode, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    fn emit_return(&mut self) {
        if self.current_frame().fn_type == FunctionType::Initializer {
            self.emit_ops(OpCode::GetLocal, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let len = self.current_frame_mut().chunk.constants().len();
        if len >= MAX_CONSTANTS {
            self.error("too many constants in one chunk");
            return 0;
        }
        self.current_chunk().add_constant(value) as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_ops(OpCode::Constant, idx);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let r = self.heap.intern(name);
        self.make_constant(Value::Obj(r))
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.current_chunk().emit_jump(op, line)
    }

    fn patch_jump(&mut self, offset: usize) {
        if self.current_chunk().patch_jump(offset).is_err() {
            self.error("too much code to jump over");
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.previous.line;
        if self.current_chunk().emit_loop(loop_start, line).is_err() {
            self.error("loop body too large");
        }
    }

    // ---- variable resolution -------------------------------------------

    fn resolve_local(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        let found = self.frames[frame_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, l)| (i as u8, l.depth));
        match found {
            Some((slot, None)) => {
                self.error("can't read local variable in its own initializer");
                Some(slot)
            }
            Some((slot, Some(_))) => Some(slot),
            None => None,
        }
    }

    fn resolve_upvalue(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        if frame_index == 0 {
            return None;
        }
        let enclosing = frame_index - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(frame_index, local_slot, true));
        }
        if let Some(up_slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_index, up_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, frame_index: usize, index: u8, is_local: bool) -> u8 {
        if let Some(i) = self.frames[frame_index]
            .upvalues
            .iter()
            .position(|uv| uv.index == index && uv.is_local == is_local)
        {
            return i as u8;
        }
        if self.frames[frame_index].upvalues.len() >= MAX_UPVALUES {
            self.error("too many closure variables in function");
            return 0;
        }
        self.frames[frame_index]
            .upvalues
            .push(UpvalueDesc { index, is_local });
        (self.frames[frame_index].upvalues.len() - 1) as u8
    }

    fn declare_variable(&mut self, name: &'src str) {
        if self.current_frame().scope_depth == 0 {
            return;
        }
        let scope_depth = self.current_frame().scope_depth;
        let duplicate = {
            let mut found = false;
            for local in self.current_frame().locals.iter().rev() {
                if let Some(d) = local.depth {
                    if d < scope_depth {
                        break;
                    }
                }
                if local.name == name {
                    found = true;
                    break;
                }
            }
            found
        };
        if duplicate {
            self.error("already a variable with this name in this scope");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: &'src str) {
        if self.current_frame().locals.len() >= MAX_LOCALS {
            self.error("too many local variables in function");
            return;
        }
        self.current_frame_mut().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        if self.current_frame().scope_depth == 0 {
            return;
        }
        let depth = self.current_frame().scope_depth;
        self.current_frame_mut().locals.last_mut().unwrap().depth = Some(depth);
    }

    fn parse_variable(&mut self, error_message: &str) -> u8 {
        self.consume(TokenKind::Identifier, error_message);
        let name = self.previous.lexeme;
        self.declare_variable(name);
        if self.current_frame().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(name)
    }

    fn define_variable(&mut self, global_idx: u8) {
        if self.current_frame().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_ops(OpCode::DefineGlobal, global_idx);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let frame_index = self.frames.len() - 1;
        if let Some(slot) = self.resolve_local(frame_index, name) {
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_ops(OpCode::SetLocal, slot);
            } else {
                self.emit_ops(OpCode::GetLocal, slot);
            }
        } else if let Some(slot) = self.resolve_upvalue(frame_index, name) {
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_ops(OpCode::SetUpvalue, slot);
            } else {
                self.emit_ops(OpCode::GetUpvalue, slot);
            }
        } else {
            let idx = self.identifier_constant(name);
            if can_assign && self.match_token(TokenKind::Equal) {
                self.expression();
                self.emit_ops(OpCode::SetGlobal, idx);
            } else {
                self.emit_ops(OpCode::GetGlobal, idx);
            }
        }
    }

    // ---- declarations & statements --------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expected class name");
        let class_name = self.previous.lexeme;
        let name_idx = self.identifier_constant(class_name);
        self.declare_variable(class_name);
        self.emit_ops(OpCode::Class, name_idx);
        self.define_variable(name_idx);

        self.classes.push(ClassCompilerState {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "expected superclass name");
            let superclass_name = self.previous.lexeme;
            if superclass_name == class_name {
                self.error("a class can't inherit from itself");
            }
            self.named_variable(superclass_name, false);

            self.begin_scope();
            self.add_local("super");
            self.mark_initialized();

            self.named_variable(class_name, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::OBrace, "expected '{' before class body");
        while !self.check(TokenKind::CBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::CBrace, "expected '}' after class body");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "expected method name");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);
        let fn_type = if name == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type);
        self.emit_ops(OpCode::Method, name_idx);
    }

    fn fun_declaration(&mut self) {
        let global_idx = self.parse_variable("expected function name");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global_idx);
    }

    fn function(&mut self, fn_type: FunctionType) {
        let name = if fn_type != FunctionType::Script {
            Some(self.previous.lexeme)
        } else {
            None
        };
        self.begin_function(fn_type, name);
        self.begin_scope();

        self.consume(TokenKind::OParen, "expected '(' after function name");
        if !self.check(TokenKind::CParen) {
            loop {
                if self.current_frame().arity >= MAX_PARAMETERS {
                    self.error_at_current("can't have more than 255 parameters");
                }
                self.current_frame_mut().arity += 1;
                let param_idx = self.parse_variable("expected parameter name");
                self.define_variable(param_idx);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::CParen, "expected ')' after parameters");
        self.consume(TokenKind::OBrace, "expected '{' before function body");
        self.block();
        self.end_function();
    }

    fn var_declaration(&mut self) {
        let global_idx = self.parse_variable("expected variable name");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "expected ';' after variable declaration");
        self.define_variable(global_idx);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::OBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::CBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::CBrace, "expected '}' after block");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after value");
        self.emit_op(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "expected ';' after expression");
        self.emit_op(OpCode::Pop);
    }

    fn return_statement(&mut self) {
        if self.current_frame().fn_type == FunctionType::Script {
            self.error("can't return from top-level code");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.current_frame().fn_type == FunctionType::Initializer {
                self.error("can't return a value from an initializer");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after return value");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::OParen, "expected '(' after 'if'");
        self.expression();
        self.consume(TokenKind::CParen, "expected ')' after condition");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);

        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_frame_mut().chunk.code_len();
        self.consume(TokenKind::OParen, "expected '(' after 'while'");
        self.expression();
        self.consume(TokenKind::CParen, "expected ')' after condition");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::OParen, "expected '(' after 'for'");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer clause
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_frame_mut().chunk.code_len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "expected ';' after loop condition");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::CParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_frame_mut().chunk.code_len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::CParen, "expected ')' after for clauses");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    // ---- expressions (Pratt parser) -------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.previous.kind, can_assign) {
            self.error("expected expression");
            return;
        }
        while precedence <= Precedence::of(self.current.kind) {
            self.advance();
            self.infix_rule(self.previous.kind, can_assign);
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::OParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string(),
            TokenKind::True | TokenKind::False | TokenKind::Nil => self.literal(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::This => self.this_expr(),
            TokenKind::Super => self.super_expr(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::EqualEqual
            | TokenKind::BangEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.binary(),
            TokenKind::And => self.and_expr(),
            TokenKind::Or => self.or_expr(),
            TokenKind::OParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            _ => unreachable!("token {kind:?} has no infix rule"),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::CParen, "expected ')' after expression");
    }

    fn unary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!(),
        }
    }

    fn binary(&mut self) {
        let op_kind = self.previous.kind;
        self.parse_precedence(Precedence::of(op_kind).one_higher());
        match op_kind {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!(),
        }
    }

    fn and_expr(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_expr(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn literal(&mut self) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!(),
        }
    }

    fn number(&mut self) {
        let value: f64 = self
            .previous
            .lexeme
            .parse()
            .expect("the lexer only ever produces well-formed numeric lexemes");
        self.emit_constant(Value::Number(value));
    }

    fn string(&mut self) {
        let raw = self.previous.lexeme;
        let content = &raw[1..raw.len() - 1];
        let r = self.heap.intern(content);
        self.emit_constant(Value::Obj(r));
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("can't use 'this' outside of a class");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        if self.classes.is_empty() {
            self.error("can't use 'super' outside of a class");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("can't use 'super' in a class with no superclass");
        }
        self.consume(TokenKind::Dot, "expected '.' after 'super'");
        self.consume(TokenKind::Identifier, "expected superclass method name");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::OParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_ops(OpCode::SuperInvoke, name_idx);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_ops(OpCode::GetSuper, name_idx);
        }
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_ops(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::CParen) {
            loop {
                self.expression();
                if count >= MAX_ARGUMENTS {
                    self.error("can't have more than 255 arguments");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::CParen, "expected ')' after arguments");
        count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "expected property name after '.'");
        let name = self.previous.lexeme;
        let name_idx = self.identifier_constant(name);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_ops(OpCode::SetProperty, name_idx);
        } else if self.match_token(TokenKind::OParen) {
            let arg_count = self.argument_list();
            self.emit_ops(OpCode::Invoke, name_idx);
            self.emit_byte(arg_count);
        } else {
            self.emit_ops(OpCode::GetProperty, name_idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::OpCode;

    fn compile_ok(source: &str) -> (ObjRef, Heap) {
        let mut heap = Heap::new();
        let script = compile(source, &mut heap).unwrap_or_else(|errs| {
            panic!("expected {source:?} to compile, got errors: {errs:?}")
        });
        (script, heap)
    }

    fn script_chunk(script: ObjRef, heap: &Heap) -> &Chunk {
        match heap.data(script) {
            crate::heap::ObjData::Function(f) => &f.chunk,
            _ => panic!("not a function"),
        }
    }

    #[test]
    fn simple_arithmetic_emits_expected_opcodes() {
        let (script, heap) = compile_ok("1 + 2 * 3;");
        let chunk = script_chunk(script, &heap);
        let code = chunk.code();
        // CONSTANT 1, CONSTANT 2, CONSTANT 3, MULTIPLY, ADD, POP, NIL, RETURN
        assert_eq!(OpCode::from(code[0]), OpCode::Constant);
        assert_eq!(OpCode::from(code[2]), OpCode::Constant);
        assert_eq!(OpCode::from(code[4]), OpCode::Constant);
        assert_eq!(OpCode::from(code[6]), OpCode::Multiply);
        assert_eq!(OpCode::from(code[7]), OpCode::Add);
        assert_eq!(OpCode::from(code[8]), OpCode::Pop);
    }

    #[test]
    fn duplicate_local_in_same_scope_is_an_error() {
        let mut heap = Heap::new();
        let result = compile("{ var a = 1; var a = 2; }", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn shadowing_across_scopes_is_allowed() {
        let mut heap = Heap::new();
        let result = compile("var a = 1; { var a = 2; print a; }", &mut heap);
        assert!(result.is_ok());
    }

    #[test]
    fn self_referencing_initializer_is_an_error() {
        let mut heap = Heap::new();
        let result = compile("{ var a = a; }", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn return_from_top_level_is_an_error() {
        let mut heap = Heap::new();
        let result = compile("return 1;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn this_outside_class_is_an_error() {
        let mut heap = Heap::new();
        let result = compile("print this;", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn super_with_no_declared_superclass_is_an_error() {
        let mut heap = Heap::new();
        let result = compile("class A { f() { super.f(); } }", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn class_cannot_inherit_from_itself() {
        let mut heap = Heap::new();
        let result = compile("class A < A {}", &mut heap);
        assert!(result.is_err());
    }

    #[test]
    fn two_hundred_fifty_five_locals_compile_but_two_hundred_fifty_six_do_not() {
        let mut source = String::from("{\n");
        for i in 0..255 {
            source += &format!("var a{i} = {i};\n");
        }
        source += "}\n";
        let mut heap = Heap::new();
        assert!(compile(&source, &mut heap).is_ok());

        let mut too_many = String::from("{\n");
        for i in 0..256 {
            too_many += &format!("var a{i} = {i};\n");
        }
        too_many += "}\n";
        let mut heap = Heap::new();
        assert!(compile(&too_many, &mut heap).is_err());
    }

    #[test]
    fn two_hundred_fifty_six_parameters_is_an_error() {
        let params = (0..256)
            .map(|i| format!("p{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        let source = format!("fun f({params}) {{}}");
        let mut heap = Heap::new();
        assert!(compile(&source, &mut heap).is_err());
    }

    #[test]
    fn closure_over_local_marks_it_captured_and_emits_close_upvalue() {
        let (script, heap) = compile_ok(
            "fun outer() { var x = 1; fun inner() { return x; } return inner; }",
        );
        let _ = (script, heap); // compiling without error is the main assertion here
    }
}
