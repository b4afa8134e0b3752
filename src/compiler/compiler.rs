//! The single-pass compiler: parsing and code generation are interleaved,
//! with no intermediate tree. Each function body is compiled by its own
//! [`FnCompiler`] into its own chunk; finished bodies are merged into the
//! enclosing chunk through recorded fixups (entry addresses and pool
//! references), so the whole program ends up in one flat code buffer.

use crate::vm::{Chunk, Op};

use super::lexer::{Token, TokenKind};
use super::CompileError;

/// Locals are addressed by a one-byte frame-relative slot.
const MAX_LOCALS: usize = 256;
/// Upvalue indices are one byte as well.
const MAX_UPVALUES: usize = 256;

// =============================================================================
// Per-function compile state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local {
    name: String,
    /// Lexical depth, or -1 while the initializer is still being compiled.
    depth: i32,
    captured: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pool {
    Const,
    Str,
    Name,
}

/// Location of a two-byte pool index inside a chunk's code, re-resolved
/// against the enclosing pools at every merge level.
#[derive(Debug, Clone, Copy)]
struct PoolRef {
    offset: usize,
    pool: Pool,
}

/// A finished nested function waiting to be appended to the enclosing
/// chunk. `patch_loc` is the call site's placeholder entry-address operand.
struct PendingFn {
    patch_loc: usize,
    artifact: Artifact,
}

/// A fully compiled function body: its own children are already merged in,
/// with the fixups translated so the next level up can translate again.
struct Artifact {
    chunk: Chunk,
    pool_refs: Vec<PoolRef>,
    addr_refs: Vec<usize>,
}

/// Compile state for one function body. Holds its own chunk and pools; the
/// lexically enclosing instance is the previous entry on the compiler
/// stack.
struct FnCompiler {
    kind: FunctionKind,
    arity: u8,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    pending: Vec<PendingFn>,
    pool_refs: Vec<PoolRef>,
    addr_refs: Vec<usize>,
}

impl FnCompiler {
    fn new(kind: FunctionKind) -> Self {
        // Slot 0 belongs to the callee: the receiver inside methods, unused
        // otherwise.
        let slot_zero = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Initializer) {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            captured: false,
        };
        Self {
            kind,
            arity: 0,
            chunk: Chunk::new(),
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
            pending: Vec::new(),
            pool_refs: Vec::new(),
            addr_refs: Vec::new(),
        }
    }

    /// Emit the implicit return, then merge every pending nested function
    /// into this chunk, patching entry addresses and re-resolving pool
    /// references.
    fn finish(mut self, line: u32) -> Result<Artifact, CompileError> {
        if self.kind == FunctionKind::Initializer {
            self.chunk.push_op(Op::GetLocal, line);
            self.chunk.push_byte(0, line);
        } else {
            self.chunk.push_op(Op::Nil, line);
        }
        self.chunk.push_op(Op::Return, line);

        let pending = std::mem::take(&mut self.pending);
        for p in pending {
            let mut child = p.artifact;
            let base = self.chunk.code.len();
            if base + child.chunk.code.len() > u16::MAX as usize {
                return Err(CompileError::new("program too large", line));
            }

            // The nested body now has a real address.
            self.chunk.patch_u16(p.patch_loc, base as u16);

            // Re-resolve the child's pool references against our pools and
            // re-record them for the next merge level.
            for pr in &child.pool_refs {
                let old = child.chunk.read_u16(pr.offset) as usize;
                let new = match pr.pool {
                    Pool::Const => {
                        let v = child.chunk.consts[old];
                        self.chunk.add_const(v)
                    }
                    Pool::Str => {
                        let s = child.chunk.strings[old].clone();
                        self.chunk.add_string(&s)
                    }
                    Pool::Name => {
                        let n = child.chunk.names[old].clone();
                        self.chunk.add_name(&n)
                    }
                };
                child.chunk.patch_u16(pr.offset, new);
                self.pool_refs.push(PoolRef {
                    offset: base + pr.offset,
                    pool: pr.pool,
                });
            }

            // Rebase the child's absolute code addresses by its placement.
            for &ar in &child.addr_refs {
                let old = child.chunk.read_u16(ar);
                child.chunk.patch_u16(ar, old + base as u16);
                self.addr_refs.push(base + ar);
            }

            self.chunk.code.extend_from_slice(&child.chunk.code);
            self.chunk.lines.extend_from_slice(&child.chunk.lines);
        }

        Ok(Artifact {
            chunk: self.chunk,
            pool_refs: self.pool_refs,
            addr_refs: self.addr_refs,
        })
    }
}

// =============================================================================
// Pratt precedence ladder
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Prec {
    None,
    Assign,
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Equality,
    Comparison,
    Shift,
    Term,
    Factor,
    Unary,
    Call,
}

impl Prec {
    fn next(self) -> Prec {
        match self {
            Prec::None => Prec::Assign,
            Prec::Assign => Prec::Or,
            Prec::Or => Prec::And,
            Prec::And => Prec::BitOr,
            Prec::BitOr => Prec::BitXor,
            Prec::BitXor => Prec::BitAnd,
            Prec::BitAnd => Prec::Equality,
            Prec::Equality => Prec::Comparison,
            Prec::Comparison => Prec::Shift,
            Prec::Shift => Prec::Term,
            Prec::Term => Prec::Factor,
            Prec::Factor => Prec::Unary,
            Prec::Unary | Prec::Call => Prec::Call,
        }
    }
}

fn infix_prec(kind: &TokenKind) -> Prec {
    match kind {
        TokenKind::Or => Prec::Or,
        TokenKind::And => Prec::And,
        TokenKind::Pipe => Prec::BitOr,
        TokenKind::Caret => Prec::BitXor,
        TokenKind::Amp => Prec::BitAnd,
        TokenKind::EqEq | TokenKind::NotEq => Prec::Equality,
        TokenKind::Lt | TokenKind::Le | TokenKind::Gt | TokenKind::Ge => Prec::Comparison,
        TokenKind::Shl | TokenKind::Shr => Prec::Shift,
        TokenKind::Plus | TokenKind::Minus => Prec::Term,
        TokenKind::Star | TokenKind::Slash | TokenKind::Percent => Prec::Factor,
        TokenKind::LParen | TokenKind::Dot => Prec::Call,
        _ => Prec::None,
    }
}

// =============================================================================
// The compiler proper
// =============================================================================

/// How a variable reference resolved.
enum VarSlot {
    Local(u8),
    Upvalue(u8),
    Global(String),
}

struct ClassInfo {
    has_superclass: bool,
}

/// Drives the token stream through the whole program. One [`FnCompiler`]
/// per function body lives on `fns`; the last entry is the innermost.
struct Compiler {
    tokens: Vec<Token>,
    pos: usize,
    prev_line: u32,
    fns: Vec<FnCompiler>,
    classes: Vec<ClassInfo>,
    errors: Vec<CompileError>,
}

/// Compile a token stream into one merged chunk.
///
/// Parse errors do not abort the pass: the driver records each one,
/// discards tokens to the next statement boundary, and keeps going, so a
/// single run reports every independent error. Success requires zero.
pub fn compile(tokens: Vec<Token>) -> Result<Chunk, Vec<CompileError>> {
    let mut c = Compiler {
        tokens,
        pos: 0,
        prev_line: 1,
        fns: vec![FnCompiler::new(FunctionKind::Script)],
        classes: Vec::new(),
        errors: Vec::new(),
    };

    while !c.check(&TokenKind::Eof) {
        c.declaration();
    }

    let line = c.prev_line;
    let script = c.fns.pop().expect("script compiler");
    match script.finish(line) {
        Ok(artifact) if c.errors.is_empty() => Ok(artifact.chunk),
        Ok(_) => Err(c.errors),
        Err(e) => {
            c.errors.push(e);
            Err(c.errors)
        }
    }
}

impl Compiler {
    // --- Token cursor -------------------------------------------------------

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        self.prev_line = token.line;
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: &TokenKind, message: &str) -> Result<Token, CompileError> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_at_current(message))
        }
    }

    fn consume_ident(&mut self, message: &str) -> Result<String, CompileError> {
        match &self.peek().kind {
            TokenKind::Ident(_) => {
                let token = self.advance();
                match token.kind {
                    TokenKind::Ident(name) => Ok(name),
                    _ => unreachable!(),
                }
            }
            _ => Err(self.error_at_current(message)),
        }
    }

    fn error(&self, message: impl Into<String>) -> CompileError {
        CompileError::new(message, self.prev_line)
    }

    fn error_at_current(&self, message: &str) -> CompileError {
        CompileError::new(
            format!("{}, found {}", message, self.peek().kind.describe()),
            self.peek().line,
        )
    }

    /// Discard tokens to the next statement boundary so parsing can resume
    /// after an error.
    fn synchronize(&mut self) {
        loop {
            match self.peek().kind {
                TokenKind::Eof => return,
                TokenKind::Semi => {
                    self.advance();
                    return;
                }
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Return => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    // --- Emission into the current function ---------------------------------

    fn cur(&mut self) -> &mut FnCompiler {
        self.fns.last_mut().expect("compiler stack")
    }

    fn emit_op(&mut self, op: Op) {
        let line = self.prev_line;
        self.cur().chunk.push_op(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.prev_line;
        self.cur().chunk.push_byte(byte, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.prev_line;
        self.cur().chunk.push_u16(value, line);
    }

    /// Emit `Const` with a recorded pool reference so the operand survives
    /// merging into an enclosing chunk.
    fn emit_const(&mut self, value: i64) -> Result<(), CompileError> {
        if self.cur().chunk.consts.len() >= u16::MAX as usize {
            return Err(self.error("too many constants in one function"));
        }
        let line = self.prev_line;
        let c = self.cur();
        let idx = c.chunk.add_const(value);
        c.chunk.push_op(Op::Const, line);
        c.pool_refs.push(PoolRef {
            offset: c.chunk.code.len(),
            pool: Pool::Const,
        });
        c.chunk.push_u16(idx, line);
        Ok(())
    }

    fn emit_string(&mut self, value: &str) -> Result<(), CompileError> {
        if self.cur().chunk.strings.len() >= u16::MAX as usize {
            return Err(self.error("too many string literals in one function"));
        }
        let line = self.prev_line;
        let c = self.cur();
        let idx = c.chunk.add_string(value);
        c.chunk.push_op(Op::Str, line);
        c.pool_refs.push(PoolRef {
            offset: c.chunk.code.len(),
            pool: Pool::Str,
        });
        c.chunk.push_u16(idx, line);
        Ok(())
    }

    /// Emit an opcode whose operand is a name-table index.
    fn emit_name_op(&mut self, op: Op, name: &str) -> Result<(), CompileError> {
        if self.cur().chunk.names.len() >= u16::MAX as usize {
            return Err(self.error("too many names in one function"));
        }
        let line = self.prev_line;
        let c = self.cur();
        let idx = c.chunk.add_name(name);
        c.chunk.push_op(op, line);
        c.pool_refs.push(PoolRef {
            offset: c.chunk.code.len(),
            pool: Pool::Name,
        });
        c.chunk.push_u16(idx, line);
        Ok(())
    }

    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        let at = self.cur().chunk.code.len();
        self.emit_u16(0xFFFF);
        at
    }

    fn patch_jump(&mut self, at: usize) -> Result<(), CompileError> {
        // -2 for the operand itself: the offset is relative to the byte
        // after it.
        let distance = self.cur().chunk.code.len() - at - 2;
        if distance > u16::MAX as usize {
            return Err(self.error("too much code to jump over"));
        }
        self.cur().chunk.patch_u16(at, distance as u16);
        Ok(())
    }

    fn emit_loop(&mut self, start: usize) -> Result<(), CompileError> {
        self.emit_op(Op::Loop);
        let distance = self.cur().chunk.code.len() - start + 2;
        if distance > u16::MAX as usize {
            return Err(self.error("loop body too large"));
        }
        self.emit_u16(distance as u16);
        Ok(())
    }

    // --- Scopes and variables -----------------------------------------------

    fn begin_scope(&mut self) {
        self.cur().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let c = self.cur();
        c.scope_depth -= 1;
        let mut closes = Vec::new();
        while let Some(local) = c.locals.last() {
            if local.depth <= c.scope_depth {
                break;
            }
            closes.push(local.captured);
            c.locals.pop();
        }
        for captured in closes {
            if captured {
                self.emit_op(Op::CloseUpvalue);
            } else {
                self.emit_op(Op::Pop);
            }
        }
    }

    /// Add a local for `name` at the current depth, initially marked
    /// uninitialized. At depth 0 the variable is a global and nothing is
    /// tracked.
    fn declare_variable(&mut self, name: &str) -> Result<(), CompileError> {
        let line = self.prev_line;
        let c = self.cur();
        if c.scope_depth == 0 {
            return Ok(());
        }
        for local in c.locals.iter().rev() {
            if local.depth != -1 && local.depth < c.scope_depth {
                break;
            }
            if local.name == name {
                return Err(CompileError::new(
                    format!("a variable named '{}' is already declared in this scope", name),
                    line,
                ));
            }
        }
        if c.locals.len() >= MAX_LOCALS {
            return Err(CompileError::new("too many local variables in function", line));
        }
        c.locals.push(Local {
            name: name.to_string(),
            depth: -1,
            captured: false,
        });
        Ok(())
    }

    fn mark_initialized(&mut self) {
        let c = self.cur();
        if c.scope_depth == 0 {
            return;
        }
        let depth = c.scope_depth;
        if let Some(local) = c.locals.last_mut() {
            local.depth = depth;
        }
    }

    /// Make the declared variable usable: locals flip to initialized,
    /// globals get a `DefineGlobal`.
    fn define_variable(&mut self, name: &str) -> Result<(), CompileError> {
        if self.cur().scope_depth > 0 {
            self.mark_initialized();
            Ok(())
        } else {
            self.emit_name_op(Op::DefineGlobal, name)
        }
    }

    fn resolve_local_in(&self, fn_idx: usize, name: &str) -> Result<Option<u8>, CompileError> {
        let c = &self.fns[fn_idx];
        for (i, local) in c.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    return Err(
                        self.error("cannot read local variable in its own initializer")
                    );
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    /// Resolve `name` as a capture from an enclosing function, chaining
    /// through every nesting level between definition and use. The
    /// captured local is flagged so scope exit closes it instead of
    /// popping it.
    fn resolve_upvalue_in(&mut self, fn_idx: usize, name: &str) -> Result<Option<u8>, CompileError> {
        if fn_idx == 0 {
            return Ok(None);
        }
        let parent = fn_idx - 1;
        if let Some(slot) = self.resolve_local_in(parent, name)? {
            self.fns[parent].locals[slot as usize].captured = true;
            return Ok(Some(self.add_upvalue(fn_idx, slot, true)?));
        }
        if let Some(index) = self.resolve_upvalue_in(parent, name)? {
            return Ok(Some(self.add_upvalue(fn_idx, index, false)?));
        }
        Ok(None)
    }

    fn add_upvalue(&mut self, fn_idx: usize, index: u8, is_local: bool) -> Result<u8, CompileError> {
        let line = self.prev_line;
        let desc = UpvalueDesc { index, is_local };
        let c = &mut self.fns[fn_idx];
        if let Some(existing) = c.upvalues.iter().position(|u| *u == desc) {
            return Ok(existing as u8);
        }
        if c.upvalues.len() >= MAX_UPVALUES {
            return Err(CompileError::new(
                "too many captured variables in function",
                line,
            ));
        }
        c.upvalues.push(desc);
        Ok((c.upvalues.len() - 1) as u8)
    }

    fn resolve_variable(&mut self, name: &str) -> Result<VarSlot, CompileError> {
        let innermost = self.fns.len() - 1;
        if let Some(slot) = self.resolve_local_in(innermost, name)? {
            return Ok(VarSlot::Local(slot));
        }
        if let Some(index) = self.resolve_upvalue_in(innermost, name)? {
            return Ok(VarSlot::Upvalue(index));
        }
        Ok(VarSlot::Global(name.to_string()))
    }

    fn emit_get(&mut self, slot: &VarSlot) -> Result<(), CompileError> {
        match slot {
            VarSlot::Local(i) => {
                self.emit_op(Op::GetLocal);
                self.emit_byte(*i);
                Ok(())
            }
            VarSlot::Upvalue(i) => {
                self.emit_op(Op::GetUpvalue);
                self.emit_byte(*i);
                Ok(())
            }
            VarSlot::Global(name) => {
                let name = name.clone();
                self.emit_name_op(Op::GetGlobal, &name)
            }
        }
    }

    fn emit_set(&mut self, slot: &VarSlot) -> Result<(), CompileError> {
        match slot {
            VarSlot::Local(i) => {
                self.emit_op(Op::SetLocal);
                self.emit_byte(*i);
                Ok(())
            }
            VarSlot::Upvalue(i) => {
                self.emit_op(Op::SetUpvalue);
                self.emit_byte(*i);
                Ok(())
            }
            VarSlot::Global(name) => {
                let name = name.clone();
                self.emit_name_op(Op::SetGlobal, &name)
            }
        }
    }

    // --- Declarations -------------------------------------------------------

    /// One declaration or statement. Errors are recorded here, and the
    /// cursor resynchronized, so a broken statement does not take the rest
    /// of the pass down with it.
    fn declaration(&mut self) {
        let result = if self.match_token(&TokenKind::Class) {
            self.class_declaration()
        } else if self.match_token(&TokenKind::Fun) {
            self.fun_declaration()
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration()
        } else {
            self.statement()
        };
        if let Err(e) = result {
            self.errors.push(e);
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) -> Result<(), CompileError> {
        let name = self.consume_ident("expected variable name")?;
        self.declare_variable(&name)?;
        if self.match_token(&TokenKind::Eq) {
            self.expression()?;
        } else {
            self.emit_op(Op::Nil);
        }
        self.consume(&TokenKind::Semi, "expected ';' after variable declaration")?;
        self.define_variable(&name)
    }

    fn fun_declaration(&mut self) -> Result<(), CompileError> {
        let name = self.consume_ident("expected function name")?;
        self.declare_variable(&name)?;
        // Initialized before the body compiles, so the function can call
        // itself.
        self.mark_initialized();
        self.function(FunctionKind::Function, &name)?;
        self.define_variable(&name)
    }

    /// Compile a function body with a fresh [`FnCompiler`], then emit the
    /// `Closure` instruction with a placeholder entry address and register
    /// the finished body for merging.
    fn function(&mut self, kind: FunctionKind, name: &str) -> Result<(), CompileError> {
        let depth = self.fns.len();
        self.fns.push(FnCompiler::new(kind));
        let result = self.function_body();
        match result {
            Ok(()) => {
                let fc = self.fns.pop().expect("function compiler");
                let arity = fc.arity;
                let upvalues = fc.upvalues.clone();
                let artifact = fc.finish(self.prev_line)?;
                self.emit_closure(name, arity, &upvalues, artifact)
            }
            Err(e) => {
                // Drop the half-built body so resynchronization continues
                // in the enclosing function.
                self.fns.truncate(depth);
                Err(e)
            }
        }
    }

    fn function_body(&mut self) -> Result<(), CompileError> {
        self.begin_scope();
        self.consume(&TokenKind::LParen, "expected '(' after function name")?;
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.cur().arity == u8::MAX {
                    return Err(self.error("cannot have more than 255 parameters"));
                }
                self.cur().arity += 1;
                let param = self.consume_ident("expected parameter name")?;
                self.declare_variable(&param)?;
                self.mark_initialized();
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "expected ')' after parameters")?;
        self.consume(&TokenKind::LBrace, "expected '{' before function body")?;
        self.block()
        // No end_scope: frame teardown reclaims every slot at once.
    }

    fn emit_closure(
        &mut self,
        name: &str,
        arity: u8,
        upvalues: &[UpvalueDesc],
        artifact: Artifact,
    ) -> Result<(), CompileError> {
        self.emit_op(Op::Closure);
        let patch_loc = self.cur().chunk.code.len();
        self.cur().addr_refs.push(patch_loc);
        self.emit_u16(0xFFFF);

        let line = self.prev_line;
        let c = self.cur();
        let name_idx = c.chunk.add_name(name);
        c.pool_refs.push(PoolRef {
            offset: c.chunk.code.len(),
            pool: Pool::Name,
        });
        c.chunk.push_u16(name_idx, line);

        self.emit_byte(arity);
        self.emit_byte(upvalues.len() as u8);
        for uv in upvalues {
            self.emit_byte(uv.is_local as u8);
            self.emit_byte(uv.index);
        }

        self.cur().pending.push(PendingFn {
            patch_loc,
            artifact,
        });
        Ok(())
    }

    fn class_declaration(&mut self) -> Result<(), CompileError> {
        let name = self.consume_ident("expected class name")?;
        self.declare_variable(&name)?;
        self.emit_name_op(Op::Class, &name)?;
        self.define_variable(&name)?;

        self.classes.push(ClassInfo {
            has_superclass: false,
        });
        let result = self.class_body(&name);
        let info = self.classes.pop().expect("class stack");
        let result = result.map(|_| {
            if info.has_superclass {
                self.end_scope();
            }
        });
        result
    }

    fn class_body(&mut self, name: &str) -> Result<(), CompileError> {
        if self.match_token(&TokenKind::Lt) {
            let super_name = self.consume_ident("expected superclass name")?;
            if super_name == name {
                return Err(self.error("a class cannot inherit from itself"));
            }
            // Push the superclass, then the subclass; `Inherit` copies the
            // method table and leaves the superclass behind as the 'super'
            // local that methods capture.
            let slot = self.resolve_variable(&super_name)?;
            self.emit_get(&slot)?;
            self.begin_scope();
            self.declare_variable("super")?;
            self.mark_initialized();
            self.classes.last_mut().expect("class stack").has_superclass = true;

            let slot = self.resolve_variable(name)?;
            self.emit_get(&slot)?;
            self.emit_op(Op::Inherit);
        }

        // The class sits on the stack while methods are attached.
        let slot = self.resolve_variable(name)?;
        self.emit_get(&slot)?;
        self.consume(&TokenKind::LBrace, "expected '{' before class body")?;
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.method()?;
        }
        self.consume(&TokenKind::RBrace, "expected '}' after class body")?;
        self.emit_op(Op::Pop);
        Ok(())
    }

    fn method(&mut self) -> Result<(), CompileError> {
        let name = self.consume_ident("expected method name")?;
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind, &name)?;
        self.emit_name_op(Op::Method, &name)
    }

    // --- Statements ---------------------------------------------------------

    fn statement(&mut self) -> Result<(), CompileError> {
        if self.match_token(&TokenKind::If) {
            self.if_statement()
        } else if self.match_token(&TokenKind::While) {
            self.while_statement()
        } else if self.match_token(&TokenKind::For) {
            self.for_statement()
        } else if self.match_token(&TokenKind::Return) {
            self.return_statement()
        } else if self.match_token(&TokenKind::LBrace) {
            self.begin_scope();
            let result = self.block();
            self.end_scope();
            result
        } else {
            self.expression_statement()
        }
    }

    fn block(&mut self) -> Result<(), CompileError> {
        while !self.check(&TokenKind::RBrace) && !self.check(&TokenKind::Eof) {
            self.declaration();
        }
        self.consume(&TokenKind::RBrace, "expected '}' after block")?;
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), CompileError> {
        self.expression()?;
        self.consume(&TokenKind::Semi, "expected ';' after expression")?;
        self.emit_op(Op::Pop);
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), CompileError> {
        self.consume(&TokenKind::LParen, "expected '(' after 'if'")?;
        self.expression()?;
        self.consume(&TokenKind::RParen, "expected ')' after condition")?;

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement()?;
        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump)?;
        self.emit_op(Op::Pop);
        if self.match_token(&TokenKind::Else) {
            self.statement()?;
        }
        self.patch_jump(else_jump)
    }

    fn while_statement(&mut self) -> Result<(), CompileError> {
        let loop_start = self.cur().chunk.code.len();
        self.consume(&TokenKind::LParen, "expected '(' after 'while'")?;
        self.expression()?;
        self.consume(&TokenKind::RParen, "expected ')' after condition")?;

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement()?;
        self.emit_loop(loop_start)?;
        self.patch_jump(exit_jump)?;
        self.emit_op(Op::Pop);
        Ok(())
    }

    fn for_statement(&mut self) -> Result<(), CompileError> {
        self.begin_scope();
        self.consume(&TokenKind::LParen, "expected '(' after 'for'")?;

        // Initializer clause.
        if self.match_token(&TokenKind::Semi) {
            // none
        } else if self.match_token(&TokenKind::Var) {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        let mut loop_start = self.cur().chunk.code.len();

        // Condition clause.
        let exit_jump = if self.match_token(&TokenKind::Semi) {
            None
        } else {
            self.expression()?;
            self.consume(&TokenKind::Semi, "expected ';' after loop condition")?;
            let jump = self.emit_jump(Op::JumpIfFalse);
            self.emit_op(Op::Pop);
            Some(jump)
        };

        // Increment clause runs after the body; jump over it on the way in.
        if !self.match_token(&TokenKind::RParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.cur().chunk.code.len();
            self.expression()?;
            self.emit_op(Op::Pop);
            self.consume(&TokenKind::RParen, "expected ')' after for clauses")?;
            self.emit_loop(loop_start)?;
            loop_start = increment_start;
            self.patch_jump(body_jump)?;
        }

        self.statement()?;
        self.emit_loop(loop_start)?;
        if let Some(jump) = exit_jump {
            self.patch_jump(jump)?;
            self.emit_op(Op::Pop);
        }
        self.end_scope();
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), CompileError> {
        let kind = self.cur().kind;
        if kind == FunctionKind::Script {
            return Err(self.error("cannot return from top-level code"));
        }
        if self.match_token(&TokenKind::Semi) {
            self.emit_return(kind);
            Ok(())
        } else {
            if kind == FunctionKind::Initializer {
                return Err(self.error("cannot return a value from an initializer"));
            }
            self.expression()?;
            self.consume(&TokenKind::Semi, "expected ';' after return value")?;
            self.emit_op(Op::Return);
            Ok(())
        }
    }

    fn emit_return(&mut self, kind: FunctionKind) {
        if kind == FunctionKind::Initializer {
            self.emit_op(Op::GetLocal);
            self.emit_byte(0);
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Return);
    }

    // --- Expressions --------------------------------------------------------

    fn expression(&mut self) -> Result<(), CompileError> {
        self.parse_precedence(Prec::Assign)
    }

    fn parse_precedence(&mut self, min: Prec) -> Result<(), CompileError> {
        let can_assign = min <= Prec::Assign;
        let token = self.advance();
        self.prefix(token, can_assign)?;

        while infix_prec(&self.peek().kind) >= min && infix_prec(&self.peek().kind) != Prec::None {
            let token = self.advance();
            self.infix(token, can_assign)?;
        }

        if can_assign && self.match_token(&TokenKind::Eq) {
            return Err(self.error("invalid assignment target"));
        }
        Ok(())
    }

    fn prefix(&mut self, token: Token, can_assign: bool) -> Result<(), CompileError> {
        match token.kind {
            TokenKind::Int(n) => self.emit_const(n),
            TokenKind::Str(s) => self.emit_string(&s),
            TokenKind::True => {
                self.emit_op(Op::True);
                Ok(())
            }
            TokenKind::False => {
                self.emit_op(Op::False);
                Ok(())
            }
            TokenKind::Nil => {
                self.emit_op(Op::Nil);
                Ok(())
            }
            TokenKind::LParen => {
                self.expression()?;
                self.consume(&TokenKind::RParen, "expected ')' after expression")?;
                Ok(())
            }
            TokenKind::Minus => {
                self.parse_precedence(Prec::Unary)?;
                self.emit_op(Op::Negate);
                Ok(())
            }
            TokenKind::Bang => {
                self.parse_precedence(Prec::Unary)?;
                self.emit_op(Op::Not);
                Ok(())
            }
            TokenKind::Tilde => {
                self.parse_precedence(Prec::Unary)?;
                self.emit_op(Op::BitNot);
                Ok(())
            }
            TokenKind::Ident(name) => self.variable(&name, can_assign),
            TokenKind::This => self.this_expression(),
            TokenKind::Super => self.super_expression(),
            _ => Err(self.error(format!("expected expression, found {}", token.kind.describe()))),
        }
    }

    fn infix(&mut self, token: Token, can_assign: bool) -> Result<(), CompileError> {
        match token.kind {
            TokenKind::LParen => {
                let argc = self.argument_list()?;
                self.emit_op(Op::Call);
                self.emit_byte(argc);
                Ok(())
            }
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::And => self.and_expression(),
            TokenKind::Or => self.or_expression(),
            kind => {
                let prec = infix_prec(&kind);
                self.parse_precedence(prec.next())?;
                let op = match kind {
                    TokenKind::Plus => Op::Add,
                    TokenKind::Minus => Op::Sub,
                    TokenKind::Star => Op::Mul,
                    TokenKind::Slash => Op::Div,
                    TokenKind::Percent => Op::Mod,
                    TokenKind::Amp => Op::BitAnd,
                    TokenKind::Pipe => Op::BitOr,
                    TokenKind::Caret => Op::BitXor,
                    TokenKind::Shl => Op::Shl,
                    TokenKind::Shr => Op::Shr,
                    TokenKind::EqEq => Op::Equal,
                    TokenKind::NotEq => Op::NotEqual,
                    TokenKind::Lt => Op::Less,
                    TokenKind::Le => Op::LessEqual,
                    TokenKind::Gt => Op::Greater,
                    TokenKind::Ge => Op::GreaterEqual,
                    other => {
                        return Err(
                            self.error(format!("unexpected operator {}", other.describe()))
                        );
                    }
                };
                self.emit_op(op);
                Ok(())
            }
        }
    }

    fn variable(&mut self, name: &str, can_assign: bool) -> Result<(), CompileError> {
        let slot = self.resolve_variable(name)?;
        if can_assign && self.match_token(&TokenKind::Eq) {
            self.expression()?;
            self.emit_set(&slot)
        } else if can_assign && self.match_token(&TokenKind::PlusPlus) {
            self.emit_get(&slot)?;
            self.emit_op(Op::Inc);
            self.emit_set(&slot)
        } else if can_assign && self.match_token(&TokenKind::MinusMinus) {
            self.emit_get(&slot)?;
            self.emit_op(Op::Dec);
            self.emit_set(&slot)
        } else {
            self.emit_get(&slot)
        }
    }

    fn this_expression(&mut self) -> Result<(), CompileError> {
        if self.classes.is_empty() {
            return Err(self.error("cannot use 'this' outside of a class"));
        }
        let slot = self.resolve_variable("this")?;
        self.emit_get(&slot)
    }

    fn super_expression(&mut self) -> Result<(), CompileError> {
        match self.classes.last() {
            None => return Err(self.error("cannot use 'super' outside of a class")),
            Some(info) if !info.has_superclass => {
                return Err(self.error("cannot use 'super' in a class with no superclass"));
            }
            Some(_) => {}
        }
        self.consume(&TokenKind::Dot, "expected '.' after 'super'")?;
        let method = self.consume_ident("expected superclass method name")?;

        let this_slot = self.resolve_variable("this")?;
        self.emit_get(&this_slot)?;
        if self.match_token(&TokenKind::LParen) {
            let argc = self.argument_list()?;
            let super_slot = self.resolve_variable("super")?;
            self.emit_get(&super_slot)?;
            self.emit_name_op(Op::SuperInvoke, &method)?;
            self.emit_byte(argc);
            Ok(())
        } else {
            let super_slot = self.resolve_variable("super")?;
            self.emit_get(&super_slot)?;
            self.emit_name_op(Op::GetSuper, &method)
        }
    }

    fn dot(&mut self, can_assign: bool) -> Result<(), CompileError> {
        let name = self.consume_ident("expected property name after '.'")?;
        if can_assign && self.match_token(&TokenKind::Eq) {
            self.expression()?;
            self.emit_name_op(Op::SetProp, &name)
        } else if self.match_token(&TokenKind::LParen) {
            // Call syntax fuses lookup and call, skipping the bound-method
            // allocation.
            let argc = self.argument_list()?;
            self.emit_name_op(Op::Invoke, &name)?;
            self.emit_byte(argc);
            Ok(())
        } else if self.check(&TokenKind::PlusPlus) || self.check(&TokenKind::MinusMinus) {
            Err(self.error("can only increment or decrement a variable"))
        } else {
            self.emit_name_op(Op::GetProp, &name)
        }
    }

    fn and_expression(&mut self) -> Result<(), CompileError> {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Prec::And.next())?;
        self.patch_jump(end_jump)
    }

    fn or_expression(&mut self) -> Result<(), CompileError> {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump)?;
        self.emit_op(Op::Pop);
        self.parse_precedence(Prec::Or.next())?;
        self.patch_jump(end_jump)
    }

    fn argument_list(&mut self) -> Result<u8, CompileError> {
        let mut argc: u8 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                if argc == u8::MAX {
                    return Err(self.error("cannot have more than 255 arguments"));
                }
                self.expression()?;
                argc += 1;
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(&TokenKind::RParen, "expected ')' after arguments")?;
        Ok(argc)
    }
}
