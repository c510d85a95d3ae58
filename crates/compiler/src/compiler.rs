//! Single-pass bytecode compiler.
//!
//! A Pratt parser drives the scanner and emits bytecode into the
//! current function's chunk as it goes; there is no AST. Lexical scope
//! is resolved during the same pass: locals map to stack slots, captured
//! variables become upvalues threaded through the chain of enclosing
//! function contexts, and everything else falls back to a global lookup
//! by name.
//!
//! Errors put the parser into panic mode, which suppresses cascading
//! diagnostics until the next statement boundary. Parsing always
//! continues to the end of the source so one run can report several
//! unrelated errors.

use crate::scanner::{Scanner, Token, TokenKind};
use lox_core::chunk::OpCode;
use lox_core::debug::disassemble_chunk;
use lox_core::heap::Heap;
use lox_core::object::{Function, Obj, ObjRef};
use lox_core::value::Value;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compilation failed. Diagnostics were already written to stderr; this
/// is just the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompileError;

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "compile error")
    }
}

impl std::error::Error for CompileError {}

/// Compile a complete source buffer into the implicit top-level script
/// function. The heap is used for string interning and for the function
/// objects of nested declarations.
pub fn compile<'a>(source: &'a str, heap: &'a mut Heap) -> Result<Function, CompileError> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.finish()
}

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
    fn next(self) -> Precedence {
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

type ParseFn<'a> = fn(&mut Compiler<'a>, bool);

struct ParseRule<'a> {
    prefix: Option<ParseFn<'a>>,
    infix: Option<ParseFn<'a>>,
    precedence: Precedence,
}

/// The Pratt table: token kind to (prefix, infix, precedence).
fn rule<'a>(kind: TokenKind) -> ParseRule<'a> {
    use TokenKind::*;
    let (prefix, infix, precedence): (Option<ParseFn<'a>>, Option<ParseFn<'a>>, Precedence) =
        match kind {
            LeftParen => (
                Some(Compiler::grouping),
                Some(Compiler::call),
                Precedence::Call,
            ),
            Dot => (None, Some(Compiler::dot), Precedence::Call),
            Minus => (
                Some(Compiler::unary),
                Some(Compiler::binary),
                Precedence::Term,
            ),
            Plus => (None, Some(Compiler::binary), Precedence::Term),
            Slash | Star => (None, Some(Compiler::binary), Precedence::Factor),
            Bang => (Some(Compiler::unary), None, Precedence::None),
            BangEqual | EqualEqual => (None, Some(Compiler::binary), Precedence::Equality),
            Greater | GreaterEqual | Less | LessEqual => {
                (None, Some(Compiler::binary), Precedence::Comparison)
            }
            Identifier => (Some(Compiler::variable), None, Precedence::None),
            Str => (Some(Compiler::string), None, Precedence::None),
            Number => (Some(Compiler::number), None, Precedence::None),
            And => (None, Some(Compiler::and_), Precedence::And),
            Or => (None, Some(Compiler::or_), Precedence::Or),
            False | Nil | True => (Some(Compiler::literal), None, Precedence::None),
            Super => (Some(Compiler::super_), None, Precedence::None),
            This => (Some(Compiler::this_), None, Precedence::None),
            _ => (None, None, Precedence::None),
        };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

#[derive(Debug)]
struct Local<'src> {
    name: &'src str,
    /// Scope depth, or -1 while declared but not yet initialized.
    depth: i32,
    is_captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

/// Per-function compilation context. Nested function declarations stack
/// these via the `enclosing` link; upvalue resolution walks the chain.
struct FunctionCtx<'src> {
    enclosing: Option<Box<FunctionCtx<'src>>>,
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
}

impl<'src> FunctionCtx<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> FunctionCtx<'src> {
        // Slot 0 belongs to the callee: the receiver in methods and
        // initializers, an unnameable blank otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this"
            } else {
                ""
            },
            depth: 0,
            is_captured: false,
        };
        FunctionCtx {
            enclosing: None,
            function: Function::new(name),
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    fn resolve_local(&self, name: &str) -> Result<Option<u8>, &'static str> {
        for (slot, local) in self.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err("Can't read local variable in its own initializer.");
                }
                return Ok(Some(slot as u8));
            }
        }
        Ok(None)
    }

    /// Resolve a name captured from an enclosing function. Marks the
    /// origin local as captured and registers an upvalue at every level
    /// between it and the current function.
    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, &'static str> {
        let Some(enclosing) = self.enclosing.as_deref_mut() else {
            return Ok(None);
        };
        if let Some(local) = enclosing.resolve_local(name)? {
            enclosing.locals[local as usize].is_captured = true;
            return self.add_upvalue(local, true).map(Some);
        }
        if let Some(upvalue) = enclosing.resolve_upvalue(name)? {
            return self.add_upvalue(upvalue, false).map(Some);
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, &'static str> {
        let entry = UpvalueRef { index, is_local };
        for (i, existing) in self.upvalues.iter().enumerate() {
            if *existing == entry {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() == MAX_UPVALUES {
            return Err("Too many closure variables in function.");
        }
        self.upvalues.push(entry);
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Tracks the innermost class declaration so `this` and `super` can be
/// validated during parsing.
struct ClassCtx {
    enclosing: Option<Box<ClassCtx>>,
    has_superclass: bool,
}

struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

pub struct Compiler<'a> {
    parser: Parser<'a>,
    heap: &'a mut Heap,
    ctx: Box<FunctionCtx<'a>>,
    class_ctx: Option<Box<ClassCtx>>,
}

impl<'a> Compiler<'a> {
    fn new(source: &'a str, heap: &'a mut Heap) -> Compiler<'a> {
        let placeholder = Token {
            kind: TokenKind::Eof,
            lexeme: "",
            line: 0,
        };
        Compiler {
            parser: Parser {
                scanner: Scanner::new(source),
                current: placeholder,
                previous: placeholder,
                had_error: false,
                panic_mode: false,
            },
            heap,
            ctx: Box::new(FunctionCtx::new(FunctionKind::Script, None)),
            class_ctx: None,
        }
    }

    fn finish(mut self) -> Result<Function, CompileError> {
        self.emit_return();
        if self.parser.had_error {
            return Err(CompileError);
        }
        self.dump_code();
        let ctx = *self.ctx;
        Ok(ctx.function)
    }

    // --- token plumbing -------------------------------------------------

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let token = self.parser.current;
            self.error_at(token, token.lexeme);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    // --- diagnostics ----------------------------------------------------

    fn error(&mut self, message: &str) {
        self.error_at(self.parser.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.parser.current, message);
    }

    fn error_at(&mut self, token: Token<'a>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        let mut out = format!("[line {}] Error", token.line);
        match token.kind {
            TokenKind::Eof => out.push_str(" at end"),
            TokenKind::Error => {}
            _ => out.push_str(&format!(" at '{}'", token.lexeme)),
        }
        eprintln!("{out}: {message}");
        self.parser.had_error = true;
    }

    /// Skip to a statement boundary so one error does not cascade.
    fn synchronize(&mut self) {
        self.parser.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // --- emission -------------------------------------------------------

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.ctx.function.chunk.write(byte, line);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_return(&mut self) {
        if self.ctx.kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.ctx.function.chunk.add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_bytes(OpCode::Constant as u8, constant);
    }

    /// Emit a forward jump with a two-byte placeholder; returns the
    /// placeholder offset for [`Compiler::patch_jump`].
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.ctx.function.chunk.code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the placeholder itself.
        let jump = self.ctx.function.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.ctx.function.chunk.code[offset] = ((jump >> 8) & 0xff) as u8;
        self.ctx.function.chunk.code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.ctx.function.chunk.code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn dump_code(&self) {
        if !self.parser.had_error && tracing::enabled!(target: "lox_compiler", tracing::Level::DEBUG)
        {
            let name = match self.ctx.function.name {
                Some(name) => self.heap.as_str(name).to_string(),
                None => "<script>".to_string(),
            };
            tracing::debug!(
                target: "lox_compiler",
                "\n{}",
                disassemble_chunk(self.heap, &self.ctx.function.chunk, &name)
            );
        }
    }

    // --- scopes and variables -------------------------------------------

    fn begin_scope(&mut self) {
        self.ctx.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.ctx.scope_depth -= 1;
        while self
            .ctx
            .locals
            .last()
            .is_some_and(|local| local.depth > self.ctx.scope_depth)
        {
            let captured = self
                .ctx
                .locals
                .pop()
                .is_some_and(|local| local.is_captured);
            if captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
        }
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        self.make_constant(Value::Obj(interned))
    }

    fn add_local(&mut self, name: &'a str) {
        if self.ctx.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.ctx.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.ctx.scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme;
        let mut duplicate = false;
        for local in self.ctx.locals.iter().rev() {
            if local.depth != -1 && local.depth < self.ctx.scope_depth {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    /// Parse a variable name; returns its constant index for globals,
    /// 0 for locals (which live on the stack, not in the constant pool).
    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.ctx.scope_depth > 0 {
            return 0;
        }
        let name = self.parser.previous.lexeme;
        self.identifier_constant(name)
    }

    fn mark_initialized(&mut self) {
        if self.ctx.scope_depth == 0 {
            return;
        }
        let depth = self.ctx.scope_depth;
        if let Some(local) = self.ctx.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.ctx.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global);
    }

    fn named_variable(&mut self, name: &'a str, can_assign: bool) {
        let get_op;
        let set_op;
        let arg;
        match self.ctx.resolve_local(name) {
            Err(message) => {
                self.error(message);
                return;
            }
            Ok(Some(slot)) => {
                get_op = OpCode::GetLocal;
                set_op = OpCode::SetLocal;
                arg = slot;
            }
            Ok(None) => match self.ctx.resolve_upvalue(name) {
                Err(message) => {
                    self.error(message);
                    return;
                }
                Ok(Some(index)) => {
                    get_op = OpCode::GetUpvalue;
                    set_op = OpCode::SetUpvalue;
                    arg = index;
                }
                Ok(None) => {
                    get_op = OpCode::GetGlobal;
                    set_op = OpCode::SetGlobal;
                    arg = self.identifier_constant(name);
                }
            },
        }
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    // --- declarations and statements ------------------------------------

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
        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();
        self.emit_bytes(OpCode::Class as u8, name_constant);
        self.define_variable(name_constant);

        self.class_ctx = Some(Box::new(ClassCtx {
            enclosing: self.class_ctx.take(),
            has_superclass: false,
        }));

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.parser.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }
            // A synthetic scope keeps `super` resolvable as a local
            // one slot below `this`.
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name.lexeme, false);
            self.emit_op(OpCode::Inherit);
            if let Some(ctx) = self.class_ctx.as_mut() {
                ctx.has_superclass = true;
            }
        }

        self.named_variable(class_name.lexeme, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        let has_superclass = self
            .class_ctx
            .as_ref()
            .is_some_and(|ctx| ctx.has_superclass);
        if has_superclass {
            self.end_scope();
        }
        self.class_ctx = self.class_ctx.take().and_then(|ctx| ctx.enclosing);
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let method_name = self.parser.previous.lexeme;
        let constant = self.identifier_constant(method_name);
        let kind = if self.parser.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_bytes(OpCode::Method as u8, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself recursively, so it counts as
        // initialized as soon as its name is declared.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind) {
        let lexeme = self.parser.previous.lexeme;
        let name = self.heap.intern(lexeme);
        self.push_ctx(kind, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.ctx.function.arity == u8::MAX {
                    self.error_at_current("Can't have more than 255 parameters.");
                } else {
                    self.ctx.function.arity += 1;
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.pop_ctx();
        let fref = self.heap.alloc(Obj::Function(function));
        let constant = self.make_constant(Value::Obj(fref));
        self.emit_bytes(OpCode::Closure as u8, constant);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
    }

    fn push_ctx(&mut self, kind: FunctionKind, name: Option<ObjRef>) {
        let ctx = Box::new(FunctionCtx::new(kind, name));
        let enclosing = std::mem::replace(&mut self.ctx, ctx);
        self.ctx.enclosing = Some(enclosing);
    }

    fn pop_ctx(&mut self) -> (Function, Vec<UpvalueRef>) {
        self.emit_return();
        self.dump_code();
        let enclosing = match self.ctx.enclosing.take() {
            Some(enclosing) => enclosing,
            None => unreachable!("pop_ctx on the top-level context"),
        };
        let ctx = std::mem::replace(&mut self.ctx, enclosing);
        (ctx.function, ctx.upvalues)
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.ctx.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
            return;
        }
        if self.ctx.kind == FunctionKind::Initializer {
            self.error("Can't return a value from an initializer.");
        }
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
        self.emit_op(OpCode::Return);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

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
        let loop_start = self.ctx.function.chunk.code.len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    /// `for` desugars to an initializer plus a `while` whose body ends
    /// by jumping through the increment clause.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.ctx.function.chunk.code.len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.ctx.function.chunk.code.len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");
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

    // --- expressions ----------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = rule(self.parser.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.parser.current.kind).precedence {
            self.advance();
            if let Some(infix) = rule(self.parser.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn number(&mut self, _can_assign: bool) {
        match self.parser.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.parser.previous.lexeme;
        let content = &lexeme[1..lexeme.len() - 1];
        let interned = self.heap.intern(content);
        self.emit_constant(Value::Obj(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::True => self.emit_op(OpCode::True),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            _ => unreachable!("literal rule on non-literal token"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this_(&mut self, _can_assign: bool) {
        if self.class_ctx.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self, _can_assign: bool) {
        match &self.class_ctx {
            None => self.error("Can't use 'super' outside of a class."),
            Some(ctx) if !ctx.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            Some(_) => {}
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let method_name = self.parser.previous.lexeme;
        let name = self.identifier_constant(method_name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit_bytes(OpCode::SuperInvoke as u8, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable("super", false);
            self.emit_bytes(OpCode::GetSuper as u8, name);
        }
    }

    fn unary(&mut self, _can_assign: bool) {
        let op = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("unary rule on non-unary token"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let op = self.parser.previous.kind;
        self.parse_precedence(rule(op).precedence.next());
        match op {
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
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
            _ => unreachable!("binary rule on non-binary token"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_bytes(OpCode::Call as u8, arg_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let property = self.parser.previous.lexeme;
        let name = self.identifier_constant(property);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty as u8, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke as u8, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_bytes(OpCode::GetProperty as u8, name);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == u8::MAX {
                    self.error("Can't have more than 255 arguments.");
                } else {
                    arg_count += 1;
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lox_core::chunk::Chunk;
    use lox_core::debug::disassemble_instruction;

    fn compile_ok(source: &str) -> (Heap, Function) {
        let mut heap = Heap::new();
        let function = compile(source, &mut heap).expect("source should compile");
        (heap, function)
    }

    fn compile_err(source: &str) -> bool {
        let mut heap = Heap::new();
        compile(source, &mut heap).is_err()
    }

    fn ops(chunk: &Chunk) -> Vec<OpCode> {
        let heap = Heap::new();
        let mut offset = 0;
        let mut out = Vec::new();
        while offset < chunk.code.len() {
            out.push(OpCode::decode(chunk.code[offset]).expect("valid opcode"));
            // Closure operands reference function objects in another
            // heap, so step manually for the shapes used in these tests.
            let (_, next) = disassemble_instruction(&heap, chunk, offset);
            offset = next;
        }
        out
    }

    #[test]
    fn test_arithmetic_respects_precedence() {
        let (_, function) = compile_ok("print 1 + 2 * 3;");
        assert_eq!(
            ops(&function.chunk),
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Multiply,
                OpCode::Add,
                OpCode::Print,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
        assert_eq!(
            function.chunk.constants,
            vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)]
        );
    }

    #[test]
    fn test_line_map_stays_parallel() {
        let (_, function) = compile_ok("var a = 1;\nvar b = 2;\nprint a + b;\n");
        assert_eq!(function.chunk.code.len(), function.chunk.lines.len());
    }

    #[test]
    fn test_locals_compile_to_slots() {
        let (_, function) = compile_ok("{ var a = 1; print a; }");
        let chunk = &function.chunk;
        assert_eq!(
            ops(chunk),
            vec![
                OpCode::Constant,
                OpCode::GetLocal,
                OpCode::Print,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ]
        );
        // Slot 1: slot 0 is reserved for the script function itself.
        assert_eq!(chunk.code[3], 1);
    }

    #[test]
    fn test_implicit_nil_return() {
        let (heap, function) = compile_ok("fun f() {}");
        let inner = find_function(&heap, &function);
        assert_eq!(
            ops(&heap.function(inner).chunk),
            vec![OpCode::Nil, OpCode::Return]
        );
    }

    #[test]
    fn test_closure_captures_enclosing_local() {
        let (heap, function) = compile_ok("fun outer() { var x = 1; fun inner() { print x; } }");
        let outer = find_function(&heap, &function);
        let inner = find_function(&heap, heap.function(outer));
        assert_eq!(heap.function(inner).upvalue_count, 1);
        // The Closure instruction for inner carries one (is_local=1,
        // index) pair; x lives at slot 1 of outer.
        let chunk = &heap.function(outer).chunk;
        let closure_at = chunk
            .code
            .iter()
            .position(|&b| b == OpCode::Closure as u8)
            .expect("outer must emit CLOSURE");
        assert_eq!(chunk.code[closure_at + 2], 1);
        assert_eq!(chunk.code[closure_at + 3], 1);
    }

    #[test]
    fn test_transitive_capture_goes_through_upvalue() {
        let (heap, function) =
            compile_ok("fun a() { var x = 1; fun b() { fun c() { print x; } } }");
        let a = find_function(&heap, &function);
        let b = find_function(&heap, heap.function(a));
        let c = find_function(&heap, heap.function(b));
        assert_eq!(heap.function(b).upvalue_count, 1);
        assert_eq!(heap.function(c).upvalue_count, 1);
        // c captures through b's upvalue, not a local.
        let chunk = &heap.function(b).chunk;
        let closure_at = chunk
            .code
            .iter()
            .position(|&b| b == OpCode::Closure as u8)
            .expect("b must emit CLOSURE");
        assert_eq!(chunk.code[closure_at + 2], 0);
    }

    #[test]
    fn test_forward_jumps_land_on_instruction_boundaries() {
        let (heap, function) = compile_ok(
            "var i = 0;\
             while (i < 10) { if (i == 5 and i > 0 or false) print i; i = i + 1; }\
             for (var j = 0; j < 3; j = j + 1) print j;",
        );
        let chunk = &function.chunk;
        let mut boundaries = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            boundaries.push(offset);
            let (_, next) = disassemble_instruction(&heap, chunk, offset);
            offset = next;
        }
        boundaries.push(chunk.code.len());
        for &at in &boundaries[..boundaries.len() - 1] {
            let op = OpCode::decode(chunk.code[at]).expect("valid opcode");
            let operand =
                || u16::from_be_bytes([chunk.code[at + 1], chunk.code[at + 2]]) as usize;
            match op {
                OpCode::Jump | OpCode::JumpIfFalse => {
                    let target = at + 3 + operand();
                    assert!(boundaries.contains(&target), "jump into operand bytes");
                }
                OpCode::Loop => {
                    let target = at + 3 - operand();
                    assert!(boundaries.contains(&target), "loop into operand bytes");
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_too_many_constants_in_one_chunk() {
        let mut source = String::new();
        for i in 0..300 {
            source.push_str(&format!("print {i}.5;"));
        }
        assert!(compile_err(&source));
    }

    #[test]
    fn test_read_in_own_initializer_is_an_error() {
        assert!(compile_err("{ var a = a; }"));
        // At global scope the same program is legal (it fails at
        // runtime instead).
        assert!(!compile_err("var a = a;"));
    }

    #[test]
    fn test_duplicate_local_is_an_error() {
        assert!(compile_err("{ var a = 1; var a = 2; }"));
        assert!(!compile_err("{ var a = 1; { var a = 2; } }"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        assert!(compile_err("1 + 2 = 3;"));
        assert!(compile_err("a * b = c;"));
    }

    #[test]
    fn test_return_restrictions() {
        assert!(compile_err("return 1;"));
        assert!(compile_err("class A { init() { return 1; } }"));
        assert!(!compile_err("class A { init() { return; } }"));
    }

    #[test]
    fn test_this_and_super_restrictions() {
        assert!(compile_err("print this;"));
        assert!(compile_err("print super.x;"));
        assert!(compile_err("class A { f() { return super.f(); } }"));
        assert!(compile_err("class A < A {}"));
    }

    #[test]
    fn test_multiple_errors_reported_per_run() {
        // Two malformed statements separated by a good one; panic mode
        // must reset at the statement boundary and catch both.
        let mut heap = Heap::new();
        assert!(compile("var 1;\nprint 2;\nvar 2;", &mut heap).is_err());
    }

    fn find_function(heap: &Heap, function: &Function) -> ObjRef {
        for value in &function.chunk.constants {
            if let Value::Obj(r) = value
                && matches!(heap.obj(*r), Obj::Function(_))
            {
                return *r;
            }
        }
        unreachable!("no function constant in chunk")
    }
}
