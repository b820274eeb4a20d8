use colored::*;

use super::scanner::Scanner;
use super::token::{Token, TokenKind};
use super::{CompileError, Result};
use crate::debug::{self, LOG_COMPILED_CODE, LOG_COMPILER};
use crate::memory::{Function, Gc, Object, GC};
use crate::vm::instruction::OpCode;
use crate::vm::value::Value;

/// Longest string literal the compiler accepts, in bytes.
const MAX_STRING_LENGTH: usize = 4096;

/// Locals, upvalues and constants are addressed by single-byte operands.
const MAX_SLOTS: usize = 256;

#[derive(Debug)]
struct Local {
    name: Token,

    /// Nesting level this local was declared at. `-1` marks a local that is
    /// declared but not yet initialized.
    depth: i64,

    /// Set when a closure captures this local, so leaving its scope emits
    /// `CloseUpvalue` instead of `Pop`.
    is_captured: bool,
}

impl Local {
    fn new(name: Token, depth: i64) -> Self {
        Self {
            name,
            depth,
            is_captured: false,
        }
    }
}

/// A captured variable reference recorded while compiling one function:
/// either a local slot of the enclosing function or one of its upvalues.
#[derive(Debug)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

#[derive(Debug, PartialEq)]
pub enum FunctionKind {
    Function,
    Initializer,
    Method,
    Script,
}

/// Tracks whether the innermost class being compiled has a superclass, for
/// validating `this`/`super` usage.
#[derive(Debug)]
struct ClassState {
    has_superclass: bool,
}

/// Per-function compilation state. The states of nested function
/// declarations form a stack; it lives inside the GC so that a collection
/// triggered mid-compilation can reach the constants of every function
/// still being built.
#[derive(Debug)]
pub struct FunctionState {
    pub function: Function,
    function_kind: FunctionKind,
    locals: Vec<Local>,
    scope_depth: i64,
    upvalues: Vec<UpvalueRef>,
}

impl FunctionState {
    pub(crate) fn script() -> Self {
        Self {
            function: Function::script(),
            function_kind: FunctionKind::Script,
            // Slot 0 belongs to the function itself.
            locals: vec![Local::new(Token::new_empty(), 0)],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }

    fn new(name: Gc<Object>, function_kind: FunctionKind) -> Self {
        // Slot 0 belongs to the function itself; in methods and
        // initializers it is the receiver, reachable as `this`.
        let slot_zero = match function_kind {
            FunctionKind::Method | FunctionKind::Initializer => {
                Local::new(Token::synthetic("this"), 0)
            }
            _ => Local::new(Token::new_empty(), 0),
        };
        Self {
            function: Function::new(name),
            function_kind,
            locals: vec![slot_zero],
            scope_depth: 0,
            upvalues: Vec::new(),
        }
    }

    fn emit_raw(&mut self, byte: u8, line: u64) -> Result<()> {
        if LOG_COMPILER {
            println!("{}\t[EMIT]\t[BYTE] {}", "[COMPILER]".blue().bold(), byte);
        }
        self.function.chunk.write_byte(byte, line);
        Ok(())
    }

    fn emit_byte(&mut self, op_code: OpCode, line: u64) -> Result<()> {
        if LOG_COMPILER {
            println!("{}\t[EMIT]\t{}", "[COMPILER]".blue().bold(), op_code);
        }
        self.function.chunk.write(op_code, line);
        Ok(())
    }

    fn emit_bytes(&mut self, op_code: OpCode, operand: u8, line: u64) -> Result<()> {
        if LOG_COMPILER {
            println!(
                "{}\t[EMIT]\t{} -> {}",
                "[COMPILER]".blue().bold(),
                op_code,
                operand
            );
        }
        self.function.chunk.write_pair(op_code, operand, line);
        Ok(())
    }

    /// The implicit return at the end of every function body. Initializers
    /// return the receiver in slot 0; everything else returns nil.
    fn emit_return(&mut self, line: u64) -> Result<()> {
        if self.function_kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal, 0, line)?;
        } else {
            self.emit_byte(OpCode::Nil, line)?;
        }
        self.emit_byte(OpCode::Return, line)
    }

    /// Emits a jump with a placeholder offset and returns the position to
    /// patch once the target is known.
    fn emit_jump(&mut self, op_code: OpCode, line: u64) -> Result<usize> {
        self.emit_byte(op_code, line)?;
        self.emit_raw(0xff, line)?;
        self.emit_raw(0xff, line)?;
        Ok(self.function.chunk.code.len() - 2)
    }

    /// Emits a backwards jump to `loop_start`. The 16-bit operand counts
    /// from the position just past it, hence the +3 for opcode and operand.
    fn emit_loop(&mut self, loop_start: usize, line: u64) -> Result<()> {
        let offset = self.function.chunk.code.len() + 3 - loop_start;
        if offset > u16::MAX as usize {
            return Err(CompileError::LoopTooLarge);
        }
        self.emit_byte(OpCode::Loop, line)?;
        self.emit_raw((offset >> 8) as u8, line)?;
        self.emit_raw((offset & 0xff) as u8, line)
    }

    fn patch_jump(&mut self, offset: usize) -> Result<()> {
        // Adjust by 2 for the operand bytes the jump itself skips.
        let jump = self.function.chunk.code.len() - offset - 2;
        if jump > u16::MAX as usize {
            return Err(CompileError::JumpTooLarge);
        }
        self.function.chunk.code[offset] = (jump >> 8) as u8;
        self.function.chunk.code[offset + 1] = (jump & 0xff) as u8;
        Ok(())
    }

    /// Resolves a name against this function's locals, innermost first.
    fn resolve_local(&self, token: &Token) -> Result<Option<u8>> {
        for (i, local) in self.locals.iter().enumerate().rev() {
            if token.data == local.name.data {
                if local.depth == -1 {
                    return Err(CompileError::LocalInitializer);
                }
                return Ok(Some(i as u8));
            }
        }
        Ok(None)
    }

    /// Records a capture, deduplicating repeated captures of the same slot.
    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8> {
        for (i, upvalue) in self.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() == MAX_SLOTS {
            return Err(CompileError::TooManyUpvalues);
        }
        self.upvalues.push(UpvalueRef { index, is_local });
        self.function.upvalue_count = self.upvalues.len();
        Ok((self.upvalues.len() - 1) as u8)
    }
}

/// Single-pass compiler: parses by Pratt precedence and emits bytecode into
/// the chunk of the innermost `FunctionState` as it goes. There is no AST.
pub struct Compiler<'src> {
    scanner: Scanner<'src>,
    parser: Parser,

    gc: &'src mut GC,
    class_states: Vec<ClassState>,
    errors: Vec<CompileError>,
}

impl<'src> Compiler<'src> {
    pub fn new(source: &'src str, gc: &'src mut GC) -> Self {
        Self {
            scanner: Scanner::new(source),
            parser: Parser::new(),
            gc,
            class_states: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Compiles the whole source to the top-level script function. The
    /// returned function object is not yet rooted anywhere; the caller must
    /// protect it before the next allocation.
    pub fn compile(mut self) -> Result<Gc<Object>> {
        self.advance();
        self.gc.functions.push(FunctionState::script());

        let result = self.compile_script();
        if let Err(err) = result {
            self.report(err);
        }

        if !self.errors.is_empty() {
            self.gc.functions.pop();
            return Err(CompileError::Aggregate(self.errors));
        }

        let line = self.parser.line();
        self.state_mut().emit_return(line)?;

        if LOG_COMPILED_CODE {
            let state = self.state();
            debug::disassemble_chunk(&state.function.chunk, state.function.function_name());
        }

        // Track the finished script while its state still roots the
        // constants, then drop the state.
        let function = self.state().function.clone();
        let tracked = self.gc.track_function(function);
        self.gc.functions.pop();
        Ok(tracked)
    }

    fn compile_script(&mut self) -> Result<()> {
        while !self.match_token(TokenKind::EOF)? {
            self.decl()?;
        }
        Ok(())
    }

    fn state(&self) -> &FunctionState {
        self.gc.functions.last().unwrap()
    }

    fn state_mut(&mut self) -> &mut FunctionState {
        self.gc.functions.last_mut().unwrap()
    }

    /// Pulls the next token, reporting and skipping over lexical errors so
    /// the token stream itself never ends early.
    fn advance(&mut self) {
        std::mem::swap(&mut self.parser.previous, &mut self.parser.current);

        loop {
            match self.scanner.scan_token() {
                Ok(token) => {
                    self.parser.current = Some(token);
                    return;
                }
                Err(err) => {
                    eprintln!("Error: {}", err);
                    self.errors.push(err.into());
                }
            }
        }
    }

    fn match_token(&mut self, kind: TokenKind) -> Result<bool> {
        if self.parser.check_current(kind)? {
            self.advance();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn consume(&mut self, expected: TokenKind, message: &'static str) -> Result<()> {
        if self.parser.check_current(expected)? {
            self.advance();
            Ok(())
        } else {
            Err(CompileError::Parse {
                message,
                line: self.parser.line(),
            })
        }
    }

    fn report(&mut self, err: CompileError) {
        eprintln!(
            "{} {}",
            format!("[line {}] Error:", self.parser.line()).red(),
            err
        );
        self.errors.push(err);
    }

    /// Parses one declaration; an error puts the parser into recovery and
    /// skips forward to the next statement boundary.
    fn decl(&mut self) -> Result<()> {
        if let Err(err) = self.declaration() {
            self.report(err);
            self.synchronize()?;
        }
        Ok(())
    }

    /// Skips tokens until something that looks like a statement boundary.
    fn synchronize(&mut self) -> Result<()> {
        loop {
            if self.parser.previous()?.kind == TokenKind::Semicolon {
                return Ok(());
            }
            match self.parser.current()?.kind {
                TokenKind::EOF
                | TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return Ok(()),
                _ => {}
            }
            self.advance();
        }
    }

    fn declaration(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Class)? {
            self.class_declaration()
        } else if self.match_token(TokenKind::Fun)? {
            self.fun_declaration()
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()
        } else {
            self.statement()
        }
    }

    fn class_declaration(&mut self) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect class name.")?;
        let class_name = self.parser.previous()?.clone();
        let name_constant = self.identifier_constant(class_name.data.clone())?;
        self.declare_variable()?;

        let line = self.parser.line();
        self.state_mut()
            .emit_bytes(OpCode::Class, name_constant, line)?;
        self.define_variable(name_constant)?;

        self.class_states.push(ClassState {
            has_superclass: false,
        });
        let result = self.class_body(class_name);
        self.class_states.pop();
        result
    }

    fn class_body(&mut self, class_name: Token) -> Result<()> {
        if self.match_token(TokenKind::Less)? {
            self.consume(TokenKind::Identifier, "Expect superclass name.")?;
            if class_name.data == self.parser.previous()?.data {
                return Err(CompileError::SelfInheritance);
            }
            // Load the superclass, then the subclass, for Inherit.
            self.variable(false)?;

            // `super` lives in a scope of its own so every method of this
            // class captures the same superclass binding.
            self.scope_enter();
            self.add_local(Token::synthetic("super"))?;
            self.define_variable(0)?;

            self.named_variable(class_name.clone(), false)?;
            let line = self.parser.line();
            self.state_mut().emit_byte(OpCode::Inherit, line)?;
            self.class_states.last_mut().unwrap().has_superclass = true;
        }

        // The class is left on the stack while methods attach to it.
        self.named_variable(class_name, false)?;
        self.consume(TokenKind::BraceLeft, "Expect '{' before class body.")?;
        loop {
            let done = self.parser.check_current(TokenKind::BraceRight)?
                || self.parser.check_current(TokenKind::EOF)?;
            if done {
                break;
            }
            self.method()?;
        }
        self.consume(TokenKind::BraceRight, "Expect '}' after class body.")?;
        let line = self.parser.line();
        self.state_mut().emit_byte(OpCode::Pop, line)?;

        if self.class_states.last().unwrap().has_superclass {
            self.scope_leave()?;
        }
        Ok(())
    }

    fn method(&mut self) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect method name.")?;
        let name = self.parser.previous()?.clone();
        let constant = self.identifier_constant(name.data.clone())?;

        let kind = if name.data == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind)?;

        let line = self.parser.line();
        self.state_mut().emit_bytes(OpCode::Method, constant, line)
    }

    fn fun_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect function name.")?;
        // Mark initialized right away so the function can call itself.
        self.mark_local_initialized()?;
        self.function(FunctionKind::Function)?;
        self.define_variable(global)
    }

    /// Compiles a function body in a fresh `FunctionState` and emits the
    /// `Closure` instruction (with its capture list) into the enclosing one.
    /// Expects the function's name token in `parser.previous`.
    fn function(&mut self, kind: FunctionKind) -> Result<()> {
        let name = self.parser.previous()?.data.clone();
        let name = self.gc.track_string(name);
        self.gc.functions.push(FunctionState::new(name, kind));
        self.scope_enter();

        match self.function_body() {
            Ok(()) => {}
            Err(err) => {
                // Drop the nested state so recovery continues compiling the
                // enclosing function.
                self.gc.functions.pop();
                return Err(err);
            }
        }

        let line = self.parser.line();
        self.state_mut().emit_return(line)?;

        if LOG_COMPILED_CODE {
            let state = self.state();
            debug::disassemble_chunk(&state.function.chunk, state.function.function_name());
        }

        // Track the finished function while its state still roots its
        // constants, and keep it on the value stack until the enclosing
        // chunk's constant pool references it.
        let function = self.state().function.clone();
        let tracked = self.gc.track_function(function);
        self.gc.stack.push(Value::Object(tracked));
        let state = self.gc.functions.pop().unwrap();

        let index = self.add_constant(Value::Object(tracked))?;
        self.gc.stack.pop();

        self.state_mut().emit_bytes(OpCode::Closure, index, line)?;
        for upvalue in state.upvalues.iter() {
            self.state_mut()
                .emit_raw(upvalue.is_local as u8, line)?;
            self.state_mut().emit_raw(upvalue.index, line)?;
        }
        Ok(())
    }

    fn function_body(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after function name.")?;
        if !self.parser.check_current(TokenKind::ParenRight)? {
            loop {
                self.state_mut().function.arity += 1;
                if self.state().function.arity > 255 {
                    return Err(CompileError::TooManyParameters);
                }
                let constant = self.parse_variable("Expect parameter name.")?;
                self.define_variable(constant)?;
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.consume(TokenKind::ParenRight, "Expect ')' after parameters.")?;
        self.consume(TokenKind::BraceLeft, "Expect '{' before function body.")?;
        self.block()
    }

    fn var_declaration(&mut self) -> Result<()> {
        let global = self.parse_variable("Expect variable name.")?;

        if self.match_token(TokenKind::Equal)? {
            self.expression()?;
        } else {
            let line = self.parser.line();
            self.state_mut().emit_byte(OpCode::Nil, line)?;
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        )?;

        self.define_variable(global)
    }

    fn statement(&mut self) -> Result<()> {
        if self.match_token(TokenKind::Print)? {
            self.print_statement()
        } else if self.match_token(TokenKind::If)? {
            self.if_statement()
        } else if self.match_token(TokenKind::Return)? {
            self.return_statement()
        } else if self.match_token(TokenKind::While)? {
            self.while_statement()
        } else if self.match_token(TokenKind::For)? {
            self.for_statement()
        } else if self.match_token(TokenKind::BraceLeft)? {
            self.scope_enter();
            self.block()?;
            self.scope_leave()
        } else {
            self.expression_statement()
        }
    }

    fn print_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after value.")?;
        let line = self.parser.line();
        self.state_mut().emit_byte(OpCode::Print, line)
    }

    fn return_statement(&mut self) -> Result<()> {
        if self.state().function_kind == FunctionKind::Script {
            return Err(CompileError::ReturnAtTopLevel);
        }

        if self.match_token(TokenKind::Semicolon)? {
            let line = self.parser.line();
            self.state_mut().emit_return(line)
        } else {
            if self.state().function_kind == FunctionKind::Initializer {
                return Err(CompileError::ReturnFromInitializer);
            }
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.")?;
            let line = self.parser.line();
            self.state_mut().emit_byte(OpCode::Return, line)
        }
    }

    fn if_statement(&mut self) -> Result<()> {
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let line = self.parser.line();
        let then_jump = self.state_mut().emit_jump(OpCode::JumpIfFalse, line)?;
        // The condition value is left by JumpIfFalse; pop it on both paths.
        self.state_mut().emit_byte(OpCode::Pop, line)?;
        self.statement()?;

        let line = self.parser.line();
        let else_jump = self.state_mut().emit_jump(OpCode::Jump, line)?;
        self.state_mut().patch_jump(then_jump)?;
        self.state_mut().emit_byte(OpCode::Pop, line)?;

        if self.match_token(TokenKind::Else)? {
            self.statement()?;
        }
        self.state_mut().patch_jump(else_jump)
    }

    fn while_statement(&mut self) -> Result<()> {
        let loop_start = self.state().function.chunk.code.len();

        self.consume(TokenKind::ParenLeft, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after condition.")?;

        let line = self.parser.line();
        let exit_jump = self.state_mut().emit_jump(OpCode::JumpIfFalse, line)?;
        self.state_mut().emit_byte(OpCode::Pop, line)?;

        self.statement()?;
        let line = self.parser.line();
        self.state_mut().emit_loop(loop_start, line)?;

        self.state_mut().patch_jump(exit_jump)?;
        self.state_mut().emit_byte(OpCode::Pop, line)
    }

    fn for_statement(&mut self) -> Result<()> {
        self.scope_enter();
        self.consume(TokenKind::ParenLeft, "Expect '(' after 'for'.")?;

        // Initializer clause.
        if self.match_token(TokenKind::Semicolon)? {
            // No initializer.
        } else if self.match_token(TokenKind::Var)? {
            self.var_declaration()?;
        } else {
            self.expression_statement()?;
        }

        // Condition clause.
        let mut loop_start = self.state().function.chunk.code.len();
        let exit_jump = if self.match_token(TokenKind::Semicolon)? {
            None
        } else {
            self.expression()?;
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.")?;

            let line = self.parser.line();
            let exit_jump = self.state_mut().emit_jump(OpCode::JumpIfFalse, line)?;
            self.state_mut().emit_byte(OpCode::Pop, line)?;
            Some(exit_jump)
        };

        // Increment clause. It appears before the body in the source but
        // runs after it, so the emitted code jumps over the increment into
        // the body, and the body loops back to the increment, which then
        // loops back to the condition.
        if !self.match_token(TokenKind::ParenRight)? {
            let line = self.parser.line();
            let body_jump = self.state_mut().emit_jump(OpCode::Jump, line)?;
            let increment_start = self.state().function.chunk.code.len();

            self.expression()?;
            let line = self.parser.line();
            self.state_mut().emit_byte(OpCode::Pop, line)?;
            self.consume(TokenKind::ParenRight, "Expect ')' after for clauses.")?;

            self.state_mut().emit_loop(loop_start, line)?;
            loop_start = increment_start;
            self.state_mut().patch_jump(body_jump)?;
        }

        self.statement()?;
        let line = self.parser.line();
        self.state_mut().emit_loop(loop_start, line)?;

        if let Some(exit_jump) = exit_jump {
            self.state_mut().patch_jump(exit_jump)?;
            self.state_mut().emit_byte(OpCode::Pop, line)?;
        }
        self.scope_leave()
    }

    fn expression_statement(&mut self) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.")?;
        let line = self.parser.line();
        self.state_mut().emit_byte(OpCode::Pop, line)
    }

    fn block(&mut self) -> Result<()> {
        loop {
            let done = self.parser.check_current(TokenKind::BraceRight)?
                || self.parser.check_current(TokenKind::EOF)?;
            if done {
                break;
            }
            self.decl()?;
        }
        self.consume(TokenKind::BraceRight, "Expect '}' after block.")
    }

    fn scope_enter(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Drops the locals of the scope being left, closing over any of them
    /// that a closure captured.
    fn scope_leave(&mut self) -> Result<()> {
        let line = self.parser.line();
        let state = self.state_mut();
        state.scope_depth -= 1;
        loop {
            let captured = match state.locals.last() {
                Some(local) if local.depth > state.scope_depth => local.is_captured,
                _ => break,
            };
            if captured {
                state.emit_byte(OpCode::CloseUpvalue, line)?;
            } else {
                state.emit_byte(OpCode::Pop, line)?;
            }
            state.locals.pop();
        }
        Ok(())
    }

    fn expression(&mut self) -> Result<()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn parse_variable(&mut self, error_msg: &'static str) -> Result<u8> {
        self.consume(TokenKind::Identifier, error_msg)?;

        self.declare_variable()?;
        if self.state().scope_depth > 0 {
            return Ok(0);
        }

        self.identifier_constant(self.parser.previous()?.data.clone())
    }

    fn declare_variable(&mut self) -> Result<()> {
        // Globals are late bound; only locals are declared.
        if self.state().scope_depth == 0 {
            return Ok(());
        }
        let name = self.parser.previous()?.clone();
        for local in self.state().locals.iter().rev() {
            if local.depth != -1 && local.depth < self.state().scope_depth {
                break;
            }
            if name.data == local.name.data {
                return Err(CompileError::DuplicateVariable(name.data));
            }
        }

        self.add_local(name)
    }

    fn add_local(&mut self, name: Token) -> Result<()> {
        if self.state().locals.len() == MAX_SLOTS {
            return Err(CompileError::TooManyLocals);
        }
        self.state_mut().locals.push(Local::new(name, -1));
        Ok(())
    }

    fn mark_local_initialized(&mut self) -> Result<()> {
        if self.state().scope_depth == 0 {
            return Ok(());
        }
        let depth = self.state().scope_depth;
        self.state_mut().locals.last_mut().unwrap().depth = depth;
        Ok(())
    }

    fn define_variable(&mut self, index: u8) -> Result<()> {
        if self.state().scope_depth > 0 {
            return self.mark_local_initialized();
        }
        let line = self.parser.line();
        self.state_mut()
            .emit_bytes(OpCode::DefineGlobal, index, line)
    }

    /// Adds a constant, keeping the value reachable on the stack in case
    /// growing the pool lands on a collection.
    fn add_constant(&mut self, constant: Value) -> Result<u8> {
        self.gc.stack.push(constant);
        let result = self.state_mut().function.chunk.add_constant(constant);
        self.gc.stack.pop();
        result
    }

    fn identifier_constant(&mut self, name: String) -> Result<u8> {
        let interned = self.gc.track_string(name);
        self.add_constant(Value::Object(interned))
    }

    fn resolve_local(&self, token: &Token) -> Result<Option<u8>> {
        self.state().resolve_local(token)
    }

    /// Resolves a name through the enclosing compiler chain, recording the
    /// capture in every function between the use and the declaration.
    fn resolve_upvalue(&mut self, state_index: usize, token: &Token) -> Result<Option<u8>> {
        if state_index == 0 {
            return Ok(None);
        }
        let prev_index = state_index - 1;

        if let Some(local_index) = self.gc.functions[prev_index].resolve_local(token)? {
            self.gc.functions[prev_index].locals[local_index as usize].is_captured = true;
            let upvalue_index =
                self.gc.functions[state_index].add_upvalue(local_index, true)?;
            return Ok(Some(upvalue_index));
        }

        if let Some(upvalue_index) = self.resolve_upvalue(prev_index, token)? {
            let upvalue_index =
                self.gc.functions[state_index].add_upvalue(upvalue_index, false)?;
            return Ok(Some(upvalue_index));
        }

        Ok(None)
    }

    fn named_variable(&mut self, token: Token, can_assign: bool) -> Result<()> {
        let (arg, set_op, get_op) = if let Some(arg) = self.resolve_local(&token)? {
            (arg, OpCode::SetLocal, OpCode::GetLocal)
        } else if let Some(arg) =
            self.resolve_upvalue(self.gc.functions.len() - 1, &token)?
        {
            (arg, OpCode::SetUpvalue, OpCode::GetUpvalue)
        } else {
            let arg = self.identifier_constant(token.data)?;
            (arg, OpCode::SetGlobal, OpCode::GetGlobal)
        };

        let line = self.parser.line();
        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            self.state_mut().emit_bytes(set_op, arg, line)
        } else {
            self.state_mut().emit_bytes(get_op, arg, line)
        }
    }

    fn variable(&mut self, can_assign: bool) -> Result<()> {
        let token = self.parser.previous()?.clone();
        self.named_variable(token, can_assign)
    }

    fn this_(&mut self, _can_assign: bool) -> Result<()> {
        if self.class_states.is_empty() {
            return Err(CompileError::ThisOutsideClass);
        }
        self.named_variable(Token::synthetic("this"), false)
    }

    fn super_(&mut self, _can_assign: bool) -> Result<()> {
        match self.class_states.last() {
            None => return Err(CompileError::SuperOutsideClass),
            Some(state) if !state.has_superclass => {
                return Err(CompileError::SuperWithoutSuperclass)
            }
            Some(_) => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.")?;
        self.consume(TokenKind::Identifier, "Expect superclass method name.")?;
        let name = self.identifier_constant(self.parser.previous()?.data.clone())?;

        // The receiver and the captured superclass feed the super dispatch.
        self.named_variable(Token::synthetic("this"), false)?;
        let line = self.parser.line();
        if self.match_token(TokenKind::ParenLeft)? {
            let arg_count = self.argument_list()?;
            self.named_variable(Token::synthetic("super"), false)?;
            self.state_mut()
                .emit_bytes(OpCode::SuperInvoke, name, line)?;
            self.state_mut().emit_raw(arg_count, line)
        } else {
            self.named_variable(Token::synthetic("super"), false)?;
            self.state_mut().emit_bytes(OpCode::GetSuper, name, line)
        }
    }

    fn grouping(&mut self, _can_assign: bool) -> Result<()> {
        self.expression()?;
        self.consume(TokenKind::ParenRight, "Expect ')' after expression.")
    }

    fn number(&mut self, _can_assign: bool) -> Result<()> {
        let value = self.parser.previous()?.data.parse::<f64>()?;
        let index = self.add_constant(Value::Number(value))?;
        let line = self.parser.line();
        self.state_mut().emit_bytes(OpCode::Constant, index, line)
    }

    fn string(&mut self, _can_assign: bool) -> Result<()> {
        let lexeme = self.parser.previous()?.data.clone();
        // Trim the surrounding quotes.
        let string = lexeme[1..lexeme.len() - 1].to_owned();
        if string.len() > MAX_STRING_LENGTH {
            return Err(CompileError::StringTooLong);
        }
        let string = self.gc.track_string(string);
        let index = self.add_constant(Value::Object(string))?;
        let line = self.parser.line();
        self.state_mut().emit_bytes(OpCode::Constant, index, line)
    }

    fn literal(&mut self, _can_assign: bool) -> Result<()> {
        let kind = self.parser.previous()?.kind;
        let line = self.parser.line();
        match kind {
            TokenKind::Nil => self.state_mut().emit_byte(OpCode::Nil, line),
            TokenKind::True => self.state_mut().emit_byte(OpCode::True, line),
            TokenKind::False => self.state_mut().emit_byte(OpCode::False, line),
            _ => Err(CompileError::ParseRuleNotFound),
        }
    }

    fn unary(&mut self, _can_assign: bool) -> Result<()> {
        let operator = self.parser.previous()?.kind;
        self.parse_precedence(Precedence::Unary)?;

        let line = self.parser.line();
        match operator {
            TokenKind::Minus => self.state_mut().emit_byte(OpCode::Negate, line),
            TokenKind::Bang => self.state_mut().emit_byte(OpCode::Not, line),
            _ => Err(CompileError::ParseRuleNotFound),
        }
    }

    fn binary(&mut self, _can_assign: bool) -> Result<()> {
        let operator = self.parser.previous()?.kind;

        // The right operand binds one level tighter: binary operators are
        // left associative.
        let rule = Self::get_rule(operator);
        self.parse_precedence(rule.precedence.higher())?;

        let line = self.parser.line();
        let state = self.state_mut();
        match operator {
            TokenKind::Plus => state.emit_byte(OpCode::Add, line),
            TokenKind::Minus => state.emit_byte(OpCode::Subtract, line),
            TokenKind::Star => state.emit_byte(OpCode::Multiply, line),
            TokenKind::Slash => state.emit_byte(OpCode::Divide, line),
            TokenKind::EqualEqual => state.emit_byte(OpCode::Equal, line),
            TokenKind::BangEqual => {
                state.emit_byte(OpCode::Equal, line)?;
                state.emit_byte(OpCode::Not, line)
            }
            TokenKind::Greater => state.emit_byte(OpCode::Greater, line),
            TokenKind::GreaterEqual => {
                state.emit_byte(OpCode::Less, line)?;
                state.emit_byte(OpCode::Not, line)
            }
            TokenKind::Less => state.emit_byte(OpCode::Less, line),
            TokenKind::LessEqual => {
                state.emit_byte(OpCode::Greater, line)?;
                state.emit_byte(OpCode::Not, line)
            }
            _ => Err(CompileError::ParseRuleNotFound),
        }
    }

    fn and_(&mut self, _can_assign: bool) -> Result<()> {
        let line = self.parser.line();
        let end_jump = self.state_mut().emit_jump(OpCode::JumpIfFalse, line)?;
        self.state_mut().emit_byte(OpCode::Pop, line)?;
        self.parse_precedence(Precedence::And)?;
        self.state_mut().patch_jump(end_jump)
    }

    fn or_(&mut self, _can_assign: bool) -> Result<()> {
        let line = self.parser.line();
        let else_jump = self.state_mut().emit_jump(OpCode::JumpIfFalse, line)?;
        let end_jump = self.state_mut().emit_jump(OpCode::Jump, line)?;

        self.state_mut().patch_jump(else_jump)?;
        self.state_mut().emit_byte(OpCode::Pop, line)?;

        self.parse_precedence(Precedence::Or)?;
        self.state_mut().patch_jump(end_jump)
    }

    fn call(&mut self, _can_assign: bool) -> Result<()> {
        let arg_count = self.argument_list()?;
        let line = self.parser.line();
        self.state_mut().emit_bytes(OpCode::Call, arg_count, line)
    }

    fn dot(&mut self, can_assign: bool) -> Result<()> {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.")?;
        let name = self.identifier_constant(self.parser.previous()?.data.clone())?;

        let line = self.parser.line();
        if can_assign && self.match_token(TokenKind::Equal)? {
            self.expression()?;
            self.state_mut().emit_bytes(OpCode::SetProperty, name, line)
        } else if self.match_token(TokenKind::ParenLeft)? {
            // Property call: dispatch directly without materializing a
            // bound method.
            let arg_count = self.argument_list()?;
            self.state_mut().emit_bytes(OpCode::Invoke, name, line)?;
            self.state_mut().emit_raw(arg_count, line)
        } else {
            self.state_mut().emit_bytes(OpCode::GetProperty, name, line)
        }
    }

    fn argument_list(&mut self) -> Result<u8> {
        let mut arg_count: usize = 0;
        if !self.parser.check_current(TokenKind::ParenRight)? {
            loop {
                self.expression()?;
                if arg_count == 255 {
                    return Err(CompileError::TooManyArguments);
                }
                arg_count += 1;
                if !self.match_token(TokenKind::Comma)? {
                    break;
                }
            }
        }

        self.consume(TokenKind::ParenRight, "Expect ')' after arguments.")?;
        Ok(arg_count as u8)
    }

    fn get_rule(kind: TokenKind) -> ParseRule<'src> {
        Self::RULES_TABLE[kind as usize]
    }

    fn parse_precedence(&mut self, precedence: Precedence) -> Result<()> {
        self.advance();

        let kind = self.parser.previous()?.kind;
        let prefix_rule = match Self::get_rule(kind).prefix {
            Some(rule) => rule,
            None => {
                return Err(CompileError::Parse {
                    message: "Expect expression.",
                    line: self.parser.line(),
                })
            }
        };

        // Only a rule reached at assignment precedence may consume a
        // trailing `=`; everything tighter is not a valid target.
        let can_assign = precedence <= Precedence::Assignment;
        prefix_rule(self, can_assign)?;

        while precedence <= Self::get_rule(self.parser.current()?.kind).precedence {
            self.advance();
            let infix_rule = Self::get_rule(self.parser.previous()?.kind)
                .infix
                .ok_or(CompileError::ParseRuleNotFound)?;
            infix_rule(self, can_assign)?;
        }

        if can_assign && self.match_token(TokenKind::Equal)? {
            return Err(CompileError::InvalidAssignment);
        }

        Ok(())
    }

    #[rustfmt::skip]
    const RULES_TABLE: [ParseRule<'src>; 39] = [
        ParseRule { prefix: Some(Compiler::grouping), infix: Some(Compiler::call)  , precedence: Precedence::Call       }, // ParenLeft
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // ParenRight
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // BraceLeft
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // BraceRight
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // Comma
        ParseRule { prefix: None                    , infix: Some(Compiler::dot)   , precedence: Precedence::Call       }, // Dot
        ParseRule { prefix: Some(Compiler::unary)   , infix: Some(Compiler::binary), precedence: Precedence::Term       }, // Minus
        ParseRule { prefix: None                    , infix: Some(Compiler::binary), precedence: Precedence::Term       }, // Plus
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // Semicolon
        ParseRule { prefix: None                    , infix: Some(Compiler::binary), precedence: Precedence::Factor     }, // Slash
        ParseRule { prefix: None                    , infix: Some(Compiler::binary), precedence: Precedence::Factor     }, // Star
        ParseRule { prefix: Some(Compiler::unary)   , infix: None                  , precedence: Precedence::None       }, // Bang
        ParseRule { prefix: None                    , infix: Some(Compiler::binary), precedence: Precedence::Equality   }, // BangEqual
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // Equal
        ParseRule { prefix: None                    , infix: Some(Compiler::binary), precedence: Precedence::Equality   }, // EqualEqual
        ParseRule { prefix: None                    , infix: Some(Compiler::binary), precedence: Precedence::Comparison }, // Greater
        ParseRule { prefix: None                    , infix: Some(Compiler::binary), precedence: Precedence::Comparison }, // GreaterEqual
        ParseRule { prefix: None                    , infix: Some(Compiler::binary), precedence: Precedence::Comparison }, // Less
        ParseRule { prefix: None                    , infix: Some(Compiler::binary), precedence: Precedence::Comparison }, // LessEqual
        ParseRule { prefix: Some(Compiler::variable), infix: None                  , precedence: Precedence::None       }, // Identifier
        ParseRule { prefix: Some(Compiler::string)  , infix: None                  , precedence: Precedence::None       }, // String
        ParseRule { prefix: Some(Compiler::number)  , infix: None                  , precedence: Precedence::None       }, // Number
        ParseRule { prefix: None                    , infix: Some(Compiler::and_)  , precedence: Precedence::And        }, // And
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // Class
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // Else
        ParseRule { prefix: Some(Compiler::literal) , infix: None                  , precedence: Precedence::None       }, // False
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // For
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // Fun
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // If
        ParseRule { prefix: Some(Compiler::literal) , infix: None                  , precedence: Precedence::None       }, // Nil
        ParseRule { prefix: None                    , infix: Some(Compiler::or_)   , precedence: Precedence::Or         }, // Or
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // Print
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // Return
        ParseRule { prefix: Some(Compiler::super_)  , infix: None                  , precedence: Precedence::None       }, // Super
        ParseRule { prefix: Some(Compiler::this_)   , infix: None                  , precedence: Precedence::None       }, // This
        ParseRule { prefix: Some(Compiler::literal) , infix: None                  , precedence: Precedence::None       }, // True
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // Var
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // While
        ParseRule { prefix: None                    , infix: None                  , precedence: Precedence::None       }, // EOF
    ];
}

type RuleFn<'src> = fn(&mut Compiler<'src>, bool) -> Result<()>;

#[derive(Clone, Copy)]
struct ParseRule<'src> {
    prefix: Option<RuleFn<'src>>,
    infix: Option<RuleFn<'src>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // ==, !=
    Comparison, // <, >, <=, >=
    Term,       // +, -
    Factor,     // *, /
    Unary,      // !, -
    Call,       // ., ()
    Primary,
}

impl Precedence {
    fn higher(&self) -> Precedence {
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
            Precedence::Call => Precedence::Primary,
            Precedence::Primary => Precedence::Primary,
        }
    }
}

struct Parser {
    current: Option<Token>,
    previous: Option<Token>,
}

impl Parser {
    fn new() -> Self {
        Self {
            current: None,
            previous: None,
        }
    }

    fn previous(&self) -> Result<&Token> {
        self.previous.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn current(&self) -> Result<&Token> {
        self.current.as_ref().ok_or(CompileError::TokenNotFound)
    }

    fn check_current(&self, kind: TokenKind) -> Result<bool> {
        Ok(self.current()?.kind == kind)
    }

    fn line(&self) -> u64 {
        self.previous.as_ref().map(|t| t.line).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(source: &str) -> Result<Gc<Object>> {
        let mut gc = GC::new();
        let compiler = Compiler::new(source, &mut gc);
        compiler.compile()
    }

    /// Returns the first error of the aggregate for shape assertions.
    fn first_error(source: &str) -> CompileError {
        match compile(source) {
            Err(CompileError::Aggregate(mut errors)) => errors.remove(0),
            Err(other) => other,
            Ok(_) => panic!("expected a compile error"),
        }
    }

    #[test]
    fn simple_expressions() {
        assert!(compile("(-1 + 2) * 3 - -4;").is_ok());
        assert!(compile("1.5 + 1.3 * 3.5;").is_ok());
        assert!(compile("!(5 - 4 > 3 * 2 == !nil);").is_ok());
    }

    #[test]
    fn print_statement() {
        assert!(compile("print 1;").is_ok());
        assert!(compile("print \"one\" + \"two\";").is_ok());
    }

    #[test]
    fn globals_and_strings() {
        let source = r#"
        var beverage = "cafe au lait";
        var breakfast = "beignets with " + beverage;
        print breakfast;
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn invalid_assignment_target() {
        assert!(matches!(
            first_error("a * b = c + d;"),
            CompileError::InvalidAssignment
        ));
    }

    #[test]
    fn local_in_own_initializer() {
        let source = r#"
        var a = 1;
        {
            var a = a;
        }"#;
        assert!(matches!(
            first_error(source),
            CompileError::LocalInitializer
        ));
    }

    #[test]
    fn duplicate_local() {
        let source = "{ var a = 1; var a = 2; }";
        assert!(matches!(
            first_error(source),
            CompileError::DuplicateVariable(_)
        ));
    }

    #[test]
    fn control_flow() {
        assert!(compile("if (1) {} else {}").is_ok());
        assert!(compile("while (true) {}").is_ok());
        assert!(compile("for (var i = 0; i < 10; i = i + 1) {}").is_ok());
        assert!(compile("print true and false or nil;").is_ok());
    }

    #[test]
    fn functions() {
        let source = r#"
        fun hello() {}
        fun hello2(a, b) { return a + b; }
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn closures() {
        let source = r#"
            fun makeClosure() {
                var local = "local";
                fun closure() {
                    print local;
                }
                return closure;
            }
            var closure = makeClosure();
            closure();
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        assert!(matches!(
            first_error("return 1;"),
            CompileError::ReturnAtTopLevel
        ));
    }

    #[test]
    fn class_declarations() {
        assert!(compile("class Brioche {}").is_ok());
        assert!(compile("class Pair { first() { return 1; } second() { return 2; } }").is_ok());
    }

    #[test]
    fn class_with_initializer_and_this() {
        let source = r#"
            class Greeter {
                init(name) { this.name = name; }
                greet() { print "hi " + this.name; }
            }
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn inheritance_and_super() {
        let source = r#"
            class A { method() { print "A"; } }
            class B < A { method() { super.method(); } }
        "#;
        assert!(compile(source).is_ok());
    }

    #[test]
    fn class_cannot_inherit_from_itself() {
        assert!(matches!(
            first_error("class Oops < Oops {}"),
            CompileError::SelfInheritance
        ));
    }

    #[test]
    fn this_outside_class_is_an_error() {
        assert!(matches!(
            first_error("print this;"),
            CompileError::ThisOutsideClass
        ));
    }

    #[test]
    fn super_outside_class_is_an_error() {
        assert!(matches!(
            first_error("super.method();"),
            CompileError::SuperOutsideClass
        ));
    }

    #[test]
    fn super_without_superclass_is_an_error() {
        assert!(matches!(
            first_error("class A { method() { super.method(); } }"),
            CompileError::SuperWithoutSuperclass
        ));
    }

    #[test]
    fn initializer_cannot_return_a_value() {
        let source = "class A { init() { return 1; } }";
        assert!(matches!(
            first_error(source),
            CompileError::ReturnFromInitializer
        ));
        // A bare return is fine.
        assert!(compile("class A { init() { return; } }").is_ok());
    }

    #[test]
    fn local_count_boundary() {
        // 255 locals on top of the reserved slot compile; one more errors.
        let body: String = (0..255).map(|i| format!("var l{} = {};", i, i)).collect();
        assert!(compile(&format!("{{ {} }}", body)).is_ok());

        let body: String = (0..256).map(|i| format!("var l{} = {};", i, i)).collect();
        assert!(matches!(
            first_error(&format!("{{ {} }}", body)),
            CompileError::TooManyLocals
        ));
    }

    #[test]
    fn parameter_count_boundary() {
        let params = |n: usize| {
            (0..n).map(|i| format!("p{}", i)).collect::<Vec<_>>().join(", ")
        };
        assert!(compile(&format!("fun f({}) {{}}", params(255))).is_ok());
        assert!(matches!(
            first_error(&format!("fun f({}) {{}}", params(256))),
            CompileError::TooManyParameters
        ));
    }

    #[test]
    fn argument_count_boundary() {
        // `true` literals take no constant-pool slots, so only the argument
        // limit is in play.
        let args = |n: usize| {
            (0..n).map(|_| "true".to_owned()).collect::<Vec<_>>().join(", ")
        };
        assert!(compile(&format!("fun f() {{}} f({});", args(255))).is_ok());
        assert!(matches!(
            first_error(&format!("fun f() {{}} f({});", args(256))),
            CompileError::TooManyArguments
        ));
    }

    #[test]
    fn string_length_boundary() {
        let ok = format!("var s = \"{}\";", "a".repeat(4096));
        assert!(compile(&ok).is_ok());

        let too_long = format!("var s = \"{}\";", "a".repeat(4097));
        assert!(matches!(
            first_error(&too_long),
            CompileError::StringTooLong
        ));
    }

    #[test]
    fn constant_pool_boundary() {
        // Each number literal takes one constant slot.
        let ok: String = (0..256).map(|i| format!("var g{} = {};", i, i)).collect();
        assert!(compile(&ok).is_err());
    }

    #[test]
    fn jump_size_boundary() {
        // Build an if-body too large for a 16-bit jump operand. Local reads
        // and writes take no constants, so only code size grows.
        let statement = "a = a;";
        let big_body = statement.repeat(14000);
        let source = format!("{{ var a = 1; if (true) {{ {} }} }}", big_body);
        assert!(matches!(first_error(&source), CompileError::JumpTooLarge));

        let small_body = statement.repeat(100);
        let source = format!("{{ var a = 1; if (true) {{ {} }} }}", small_body);
        assert!(compile(&source).is_ok());
    }

    #[test]
    fn missing_semicolon_reports_parse_error() {
        assert!(matches!(
            first_error("print 1"),
            CompileError::Parse { .. }
        ));
    }

    #[test]
    fn error_recovery_reports_later_errors_too() {
        match compile("var = 1; print this;") {
            Err(CompileError::Aggregate(errors)) => assert!(errors.len() >= 2),
            other => panic!("expected aggregate error, got {:?}", other),
        }
    }
}
