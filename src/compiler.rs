// File: src/compiler.rs
//
// The single-pass Pratt compiler: source text goes straight to bytecode in
// one scan, with no intermediate AST. Lexical scope, upvalue capture and
// loop/break jump patching are all resolved on the fly against a linked
// stack of `FunctionCompiler` frames, one per nested function (including
// the implicit top-level script).

use crate::bytecode::{Chunk, OpCode, UpvalueDesc};
use crate::errors::CompileError;
use crate::gc::Heap;
use crate::lexer::{Scanner, Token, TokenKind};
use crate::table::Table;
use crate::value::{ObjFunction, ObjRef, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Ternary,
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
    /// One rung up the ladder, for left-associative infix operators.
    /// Clamps at `Primary` — there is nothing higher to climb to.
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Ternary,
            Precedence::Ternary => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// `None` while the variable's initializer is still being compiled —
    /// reading it in that state is a compile error.
    depth: Option<usize>,
    is_captured: bool,
}

struct LoopState {
    /// Where `continue` loops back to. For a `for` loop this gets
    /// reassigned to the increment clause once one is compiled.
    loop_start: usize,
    /// `break` jump indices at this loop's depth, patched to loop-end on close.
    breaks: Vec<usize>,
    /// `current.locals.len()` when the loop was entered. `break`/`continue`
    /// jump straight past `end_scope`'s cleanup, so they have to pop (or
    /// close) everything declared since, themselves.
    local_count: usize,
}

/// One nested compilation context: each function, method, and the
/// top-level script itself gets one of these, linked to its enclosing
/// frame so upvalue resolution can walk outward.
struct FunctionCompiler {
    enclosing: Option<Box<FunctionCompiler>>,
    chunk: Chunk,
    kind: FunctionKind,
    arity: usize,
    locals: Vec<Local>,
    scope_depth: usize,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopState>,
}

impl FunctionCompiler {
    fn new(enclosing: Option<Box<FunctionCompiler>>, kind: FunctionKind) -> Self {
        // Slot 0 is reserved: `this` in methods/initializers, an unnamed
        // holder of the callee otherwise.
        let reserved = if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
            "this"
        } else {
            ""
        };
        Self {
            enclosing,
            chunk: Chunk::new(),
            kind,
            arity: 0,
            locals: vec![Local { name: reserved.to_string(), depth: Some(0), is_captured: false }],
            scope_depth: 0,
            upvalues: Vec::new(),
            loops: Vec::new(),
        }
    }
}

/// Independent of the function-compiler stack; tracks only what's needed to
/// validate `this`/`super` and chain `super` lookups through nested classes.
struct ClassCompiler {
    enclosing: Option<Box<ClassCompiler>>,
    has_superclass: bool,
}

struct Parser<'src> {
    scanner: Scanner<'src>,
    current: Token<'src>,
    previous: Token<'src>,
    had_error: bool,
    panic_mode: bool,
}

impl<'src> Parser<'src> {
    fn new(source: &'src str) -> Self {
        let scanner = Scanner::new(source);
        let dummy = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Self { scanner, current: dummy, previous: dummy, had_error: false, panic_mode: false }
    }
}

struct Compiler<'src, 'a> {
    parser: Parser<'src>,
    current: Box<FunctionCompiler>,
    current_class: Option<Box<ClassCompiler>>,
    heap: &'a mut Heap,
    strings: &'a mut Table,
    errors: Vec<CompileError>,
}

/// Compiles `source` into a top-level script `Function`, allocated on
/// `heap`. On any syntax error, every diagnostic collected up to and past
/// `synchronize()` resynchronization is returned instead.
pub fn compile(source: &str, heap: &mut Heap, strings: &mut Table) -> Result<ObjRef, Vec<CompileError>> {
    let mut compiler = Compiler {
        parser: Parser::new(source),
        current: Box::new(FunctionCompiler::new(None, FunctionKind::Script)),
        current_class: None,
        heap,
        strings,
        errors: Vec::new(),
    };

    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");

    let function_ref = compiler.end_compiler();
    if compiler.parser.had_error {
        Err(compiler.errors)
    } else {
        Ok(function_ref)
    }
}

impl<'src, 'a> Compiler<'src, 'a> {
    // ---- token stream plumbing ----

    fn advance(&mut self) {
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.parser.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let message = self.parser.current.lexeme.to_string();
            self.error_at_current(&message);
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

    fn error_at_current(&mut self, message: &str) {
        let token = self.parser.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.parser.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.parser.panic_mode {
            return;
        }
        self.parser.panic_mode = true;
        self.parser.had_error = true;
        self.errors.push(CompileError {
            line: token.line,
            lexeme: if token.kind == TokenKind::Error { None } else { Some(token.lexeme.to_string()) },
            at_eof: token.kind == TokenKind::Eof,
            message: message.to_string(),
        });
    }

    /// Skips tokens until a likely statement boundary, so one syntax error
    /// doesn't cascade into a page of spurious ones.
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
                | TokenKind::Return
                | TokenKind::Switch => return,
                _ => self.advance(),
            }
        }
    }

    // ---- bytecode emission ----

    fn emit(&mut self, op: OpCode) -> usize {
        let line = self.parser.previous.line;
        self.current.chunk.write_op(op, line)
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.parser.previous.line;
        self.current.chunk.write_constant(value, line);
    }

    fn patch_jump(&mut self, jump_index: usize) {
        if let Err(message) = self.current.chunk.patch_jump(jump_index) {
            self.error(&message);
        }
    }

    fn identifier_constant(&mut self, name: &str) -> usize {
        let r = self.heap.intern_string(self.strings, name);
        self.current.chunk.add_constant(Value::Obj(r))
    }

    // ---- scope & locals ----

    fn begin_scope(&mut self) {
        self.current.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current.scope_depth -= 1;
        while let Some(local) = self.current.locals.last() {
            if local.depth.map_or(false, |d| d > self.current.scope_depth) {
                if local.is_captured {
                    self.emit(OpCode::CloseUpvalue);
                } else {
                    self.emit(OpCode::Pop);
                }
                self.current.locals.pop();
            } else {
                break;
            }
        }
    }

    fn add_local(&mut self, name: String) {
        if self.current.locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        self.current.locals.push(Local { name, depth: None, is_captured: false });
    }

    fn declare_variable(&mut self) {
        if self.current.scope_depth == 0 {
            return;
        }
        let name = self.parser.previous.lexeme.to_string();
        let mut duplicate = false;
        for local in self.current.locals.iter().rev() {
            if let Some(d) = local.depth {
                if d < self.current.scope_depth {
                    break;
                }
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

    fn parse_variable(&mut self, error_message: &str) -> usize {
        self.consume(TokenKind::Identifier, error_message);
        self.declare_variable();
        if self.current.scope_depth > 0 {
            return 0;
        }
        let name = self.parser.previous.lexeme.to_string();
        self.identifier_constant(&name)
    }

    fn mark_initialized(&mut self) {
        if self.current.scope_depth == 0 {
            return;
        }
        let last = self.current.locals.len() - 1;
        self.current.locals[last].depth = Some(self.current.scope_depth);
    }

    fn define_variable(&mut self, global: usize) {
        if self.current.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit(OpCode::DefineGlobal(global));
    }

    fn resolve_local(&mut self, name: &str) -> Option<usize> {
        match resolve_local_in(&mut self.current, name) {
            Ok(slot) => slot,
            Err(message) => {
                self.error(message);
                None
            }
        }
    }

    fn resolve_upvalue(&mut self, name: &str) -> Option<usize> {
        match resolve_upvalue_in(&mut self.current, name) {
            Ok(index) => index,
            Err(message) => {
                self.error(message);
                None
            }
        }
    }

    // ---- functions, classes, methods ----

    fn push_function(&mut self, kind: FunctionKind) {
        let new_frame = Box::new(FunctionCompiler::new(None, kind));
        let old = std::mem::replace(&mut self.current, new_frame);
        self.current.enclosing = Some(old);
    }

    fn pop_function(&mut self) -> Box<FunctionCompiler> {
        let enclosing = self.current.enclosing.take().expect("pop_function with no enclosing frame");
        std::mem::replace(&mut self.current, enclosing)
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.parser.previous.lexeme.to_string();
        self.push_function(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                if self.current.arity == 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.current.arity += 1;
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

        let finished = self.pop_function();
        self.emit_closure(finished, name);
    }

    /// Allocates the just-finished function onto the heap and emits the
    /// `OP_CLOSURE` that builds a closure over it in the *enclosing* chunk.
    fn emit_closure(&mut self, finished: Box<FunctionCompiler>, name: String) {
        let name_ref = self.heap.intern_string(self.strings, &name);
        let upvalues = finished.upvalues;
        let func = ObjFunction {
            arity: finished.arity,
            upvalue_count: upvalues.len(),
            chunk: finished.chunk,
            name: Some(name_ref),
        };
        let func_ref = self.heap.alloc_function(func);
        let function_index = self.current.chunk.add_constant(Value::Obj(func_ref));
        let line = self.parser.previous.line;
        self.current.chunk.write_op(OpCode::Closure { function_index, upvalues }, line);
    }

    fn end_compiler(&mut self) -> ObjRef {
        self.emit(OpCode::Nil);
        self.emit(OpCode::Return);
        let arity = self.current.arity;
        let upvalue_count = self.current.upvalues.len();
        let chunk = std::mem::take(&mut self.current.chunk);
        let func = ObjFunction { arity, upvalue_count, chunk, name: None };
        self.heap.alloc_function(func)
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // Marking initialized before compiling the body lets a local
        // function call itself by name.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&class_name);
        self.declare_variable();
        self.emit(OpCode::Class(name_idx));
        self.define_variable(name_idx);

        let enclosing_class = self.current_class.take();
        self.current_class = Some(Box::new(ClassCompiler { enclosing: enclosing_class, has_superclass: false }));

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            let super_name = self.parser.previous.lexeme.to_string();
            if super_name == class_name {
                self.error("A class can't inherit from itself.");
            }
            self.variable(false);

            self.begin_scope();
            self.add_local("super".to_string());
            self.define_variable(0);

            self.named_variable(&class_name, false);
            self.emit(OpCode::Inherit);
            if let Some(cc) = &mut self.current_class {
                cc.has_superclass = true;
            }
        }

        self.named_variable(&class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit(OpCode::Pop);

        if self.current_class.as_ref().unwrap().has_superclass {
            self.end_scope();
        }
        self.current_class = self.current_class.take().unwrap().enclosing;
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.parser.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&name);
        let kind = if name == "init" { FunctionKind::Initializer } else { FunctionKind::Method };
        self.function(kind);
        self.emit(OpCode::Method(name_idx));
    }

    // ---- declarations & statements ----

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else {
            self.statement();
        }
        if self.parser.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::Switch) {
            self.switch_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::Break) {
            self.break_statement();
        } else if self.match_token(TokenKind::Continue) {
            self.continue_statement();
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

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(OpCode::Pop);
    }

    /// Handles one `if`/`elif` arm; recurses for `elif` chains so each level
    /// patches its own else-jump once the rest of the chain is compiled.
    fn if_statement(&mut self) {
        self.compile_if_arm();
    }

    fn compile_if_arm(&mut self) {
        if self.match_token(TokenKind::LeftParen) {
            self.expression();
            self.consume(TokenKind::RightParen, "Expect ')' after condition.");
        } else {
            self.expression();
            self.consume(TokenKind::Then, "Expect 'then' after condition.");
        }

        let then_jump = self.emit(OpCode::JumpIfFalse(0));
        self.emit(OpCode::Pop);
        self.statement();

        let else_jump = self.emit(OpCode::Jump(0));
        self.patch_jump(then_jump);
        self.emit(OpCode::Pop);

        if self.match_token(TokenKind::Elif) {
            self.compile_if_arm();
        } else if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current.chunk.len();
        let local_count = self.current.locals.len();
        self.current.loops.push(LoopState { loop_start, breaks: Vec::new(), local_count });

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit(OpCode::JumpIfFalse(0));
        self.emit(OpCode::Pop);
        self.statement();
        self.emit(OpCode::Loop(loop_start));

        self.patch_jump(exit_jump);
        self.emit(OpCode::Pop);
        self.end_loop();
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");

        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current.chunk.len();
        let local_count = self.current.locals.len();
        self.current.loops.push(LoopState { loop_start, breaks: Vec::new(), local_count });

        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit(OpCode::JumpIfFalse(0)));
            self.emit(OpCode::Pop);
        }

        if !self.check(TokenKind::RightParen) {
            let body_jump = self.emit(OpCode::Jump(0));
            let increment_start = self.current.chunk.len();
            self.expression();
            self.emit(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit(OpCode::Loop(loop_start));
            loop_start = increment_start;
            self.patch_jump(body_jump);
            if let Some(state) = self.current.loops.last_mut() {
                state.loop_start = loop_start;
            }
        }

        self.statement();
        self.emit(OpCode::Loop(loop_start));

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(OpCode::Pop);
        }
        self.end_loop();
        self.end_scope();
    }

    fn end_loop(&mut self) {
        let loop_state = self.current.loops.pop().expect("end_loop with no active loop");
        let target = self.current.chunk.len();
        for jump in loop_state.breaks {
            if let Err(message) = self.current.chunk.set_jump_target(jump, target) {
                self.error(&message);
            }
        }
    }

    /// The selector stays on the stack for the whole statement, duplicated
    /// and compared per case; mismatch-pop and fallthrough-skip converge on
    /// the same instruction, so whichever path a case takes, the next
    /// case/default always sees `[..., selector]` on entry.
    fn switch_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'switch'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after switch value.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before switch body.");

        let mut end_jumps = Vec::new();

        while self.match_token(TokenKind::Case) {
            self.emit(OpCode::Dup);
            self.expression();
            self.consume(TokenKind::Colon, "Expect ':' after case value.");
            self.emit(OpCode::Equal);

            let mismatch_jump = self.emit(OpCode::JumpIfFalse(0));
            self.emit(OpCode::Pop);

            while !self.check(TokenKind::Case)
                && !self.check(TokenKind::Default)
                && !self.check(TokenKind::RightBrace)
                && !self.check(TokenKind::Eof)
                && !self.check(TokenKind::Fallthrough)
            {
                self.declaration();
            }

            if self.match_token(TokenKind::Fallthrough) {
                let skip_pop_jump = self.emit(OpCode::Jump(0));
                self.patch_jump(mismatch_jump);
                self.emit(OpCode::Pop);
                self.patch_jump(skip_pop_jump);
            } else {
                end_jumps.push(self.emit(OpCode::Jump(0)));
                self.patch_jump(mismatch_jump);
                self.emit(OpCode::Pop);
            }
        }

        if self.match_token(TokenKind::Default) {
            self.consume(TokenKind::Colon, "Expect ':' after 'default'.");
            while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
                self.declaration();
            }
        }

        self.consume(TokenKind::RightBrace, "Expect '}' after switch body.");
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.emit(OpCode::Pop);
    }

    fn return_statement(&mut self) {
        if self.current.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            if self.current.kind == FunctionKind::Initializer {
                self.emit(OpCode::GetLocal(0));
            } else {
                self.emit(OpCode::Nil);
            }
            self.emit(OpCode::Return);
        } else {
            if self.current.kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(OpCode::Return);
        }
    }

    fn break_statement(&mut self) {
        if self.current.loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
        } else {
            let local_count = self.current.loops.last().unwrap().local_count;
            self.emit_loop_locals_cleanup(local_count);
            let jump = self.emit(OpCode::Jump(0));
            self.current.loops.last_mut().unwrap().breaks.push(jump);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
    }

    fn continue_statement(&mut self) {
        if self.current.loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
        } else {
            let local_count = self.current.loops.last().unwrap().local_count;
            self.emit_loop_locals_cleanup(local_count);
            let loop_start = self.current.loops.last().unwrap().loop_start;
            self.emit(OpCode::Loop(loop_start));
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }

    /// Pops (or closes, if captured) every local declared since the loop was
    /// entered, same as `end_scope` would on the fall-through path. Doesn't
    /// touch `current.locals` itself — the block those locals belong to is
    /// still open and will run its own `end_scope` for whatever path doesn't
    /// jump.
    fn emit_loop_locals_cleanup(&mut self, local_count: usize) {
        for i in (local_count..self.current.locals.len()).rev() {
            if self.current.locals[i].is_captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
        }
    }

    // ---- expressions (Pratt) ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.parser.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= self.infix_precedence(self.parser.current.kind) {
            self.advance();
            self.infix_rule(self.parser.previous.kind, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Number => self.number(),
            TokenKind::String => self.string_literal(),
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
            TokenKind::Or => self.or_(),
            TokenKind::And => self.and_(),
            TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Less
            | TokenKind::LessEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent => self.binary(),
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::Question => self.ternary(),
            _ => unreachable!("infix_rule invoked for a token with no infix rule"),
        }
    }

    fn infix_precedence(&self, kind: TokenKind) -> Precedence {
        match kind {
            TokenKind::Or => Precedence::Or,
            TokenKind::And => Precedence::And,
            TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
            TokenKind::Less | TokenKind::LessEqual | TokenKind::Greater | TokenKind::GreaterEqual => {
                Precedence::Comparison
            }
            TokenKind::Plus | TokenKind::Minus => Precedence::Term,
            TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Precedence::Factor,
            TokenKind::LeftParen | TokenKind::Dot => Precedence::Call,
            TokenKind::Question => Precedence::Ternary,
            _ => Precedence::None,
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let op_kind = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match op_kind {
            TokenKind::Bang => self.emit(OpCode::Not),
            TokenKind::Minus => self.emit(OpCode::Negate),
            _ => unreachable!(),
        };
    }

    fn binary(&mut self) {
        let op_kind = self.parser.previous.kind;
        let precedence = self.infix_precedence(op_kind);
        self.parse_precedence(precedence.next());
        match op_kind {
            TokenKind::Plus => {
                self.emit(OpCode::Add);
            }
            TokenKind::Minus => {
                self.emit(OpCode::Subtract);
            }
            TokenKind::Star => {
                self.emit(OpCode::Multiply);
            }
            TokenKind::Slash => {
                self.emit(OpCode::Divide);
            }
            TokenKind::Percent => {
                self.emit(OpCode::Modulo);
            }
            TokenKind::EqualEqual => {
                self.emit(OpCode::Equal);
            }
            TokenKind::BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            TokenKind::Greater => {
                self.emit(OpCode::Greater);
            }
            TokenKind::GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            TokenKind::Less => {
                self.emit(OpCode::Less);
            }
            TokenKind::LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            _ => unreachable!(),
        }
    }

    fn ternary(&mut self) {
        let else_jump = self.emit(OpCode::JumpIfFalse(0));
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Assignment);

        let end_jump = self.emit(OpCode::Jump(0));
        self.patch_jump(else_jump);
        self.emit(OpCode::Pop);

        self.consume(TokenKind::Colon, "Expect ':' after then branch of ternary expression.");
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(end_jump);
    }

    fn and_(&mut self) {
        let end_jump = self.emit(OpCode::JumpIfFalse(0));
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit(OpCode::JumpIfFalse(0));
        let end_jump = self.emit(OpCode::Jump(0));
        self.patch_jump(else_jump);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let value: f64 = self.parser.previous.lexeme.parse().unwrap_or(0.0);
        self.emit_constant(Value::Number(value));
    }

    fn string_literal(&mut self) {
        let lexeme = self.parser.previous.lexeme;
        let s = &lexeme[1..lexeme.len() - 1];
        let r = self.heap.intern_string(self.strings, s);
        self.emit_constant(Value::Obj(r));
    }

    fn literal(&mut self) {
        match self.parser.previous.kind {
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::False => self.emit(OpCode::False),
            TokenKind::Nil => self.emit(OpCode::Nil),
            _ => unreachable!(),
        };
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous.lexeme.to_string();
        self.named_variable(&name, can_assign);
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let (get_op, set_op) = if let Some(slot) = self.resolve_local(name) {
            (OpCode::GetLocal(slot), OpCode::SetLocal(slot))
        } else if let Some(index) = self.resolve_upvalue(name) {
            (OpCode::GetUpvalue(index), OpCode::SetUpvalue(index))
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal(idx), OpCode::SetGlobal(idx))
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit(set_op);
        } else {
            self.emit(get_op);
        }
    }

    fn this_expr(&mut self) {
        if self.current_class.is_none() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_expr(&mut self) {
        match &self.current_class {
            None => {
                self.error("Can't use 'super' outside of a class.");
                return;
            }
            Some(cc) if !cc.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
                return;
            }
            _ => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.parser.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&name);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable("super", false);
            self.emit(OpCode::SuperInvoke { name_index: name_idx, arg_count });
        } else {
            self.named_variable("super", false);
            self.emit(OpCode::GetSuper(name_idx));
        }
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit(OpCode::Call(arg_count));
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.parser.previous.lexeme.to_string();
        let name_idx = self.identifier_constant(&name);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit(OpCode::SetProperty(name_idx));
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit(OpCode::Invoke { name_index: name_idx, arg_count });
        } else {
            self.emit(OpCode::GetProperty(name_idx));
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        count as u8
    }
}

fn resolve_local_in(fc: &mut FunctionCompiler, name: &str) -> Result<Option<usize>, &'static str> {
    for (i, local) in fc.locals.iter().enumerate().rev() {
        if local.name == name {
            if local.depth.is_none() {
                return Err("Can't read local variable in its own initializer.");
            }
            return Ok(Some(i));
        }
    }
    Ok(None)
}

fn resolve_upvalue_in(fc: &mut FunctionCompiler, name: &str) -> Result<Option<usize>, &'static str> {
    let enclosing = match &mut fc.enclosing {
        Some(e) => e,
        None => return Ok(None),
    };

    if let Some(index) = resolve_local_in(enclosing, name)? {
        enclosing.locals[index].is_captured = true;
        return Ok(Some(add_upvalue(fc, index, true)?));
    }
    if let Some(index) = resolve_upvalue_in(enclosing, name)? {
        return Ok(Some(add_upvalue(fc, index, false)?));
    }
    Ok(None)
}

fn add_upvalue(fc: &mut FunctionCompiler, index: usize, is_local: bool) -> Result<usize, &'static str> {
    for (i, existing) in fc.upvalues.iter().enumerate() {
        if existing.index == index && existing.is_local == is_local {
            return Ok(i);
        }
    }
    if fc.upvalues.len() >= 256 {
        return Err("Too many closure variables in function.");
    }
    fc.upvalues.push(UpvalueDesc { is_local, index });
    Ok(fc.upvalues.len() - 1)
}
