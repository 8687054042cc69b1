mod captures;

use crate::{
  ast::{BinaryOperator, Expr, Expression, LineNumber, Literal, MatchArm, Pattern, Program, UnaryOperator},
  chunk::{Chunk, OpCode},
  diagnostic::{Diagnostic, DiagnosticKind, Fault},
  value::{CaptureKind, Captures, Function, Value},
};
use rustc_hash::{FxHashMap, FxHashSet};
use std::{mem, rc::Rc};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
enum Error {
  #[error("Jump is too big, a loop or branch can span at most 65535 bytes")]
  TooBigJump,
  #[error("Too many constants, a function can use at most 65536")]
  TooManyConstants,
  #[error("Too many global names, a program can use at most 65536")]
  TooManyGlobals,
  #[error("Too many arguments, there is a limit of 255 arguments to be passed to a function")]
  TooManyArguments,
  #[error("Too many parameters, there is a limit of 255 parameters for a function")]
  TooManyParameters,
  #[error("Too many local variables, there is a limit of 255 at once")]
  TooManyLocals,
  #[error("Too many captured variables, there is a limit of 255 per function")]
  TooManyCaptures,
  #[error("Too many nested functions, there is a limit of 256 per function")]
  TooManyFunctions,
  #[error("Array is too long, it can have a maximum of 65535 items")]
  TooLongArray,
  #[error("Dictionary is too large, it can have a maximum of 65535 entries")]
  TooLargeDictionary,
  #[error("Array pattern is too long, it can have a maximum of 255 items")]
  TooLongPattern,
  #[error("'break' used outside of a loop")]
  BreakOutsideLoop,
  #[error("'continue' used outside of a loop")]
  ContinueOutsideLoop,
  #[error("Variable '{0}' is used by a nested function but was not stored in a cell")]
  UncapturedVariable(String),
  #[error("Generated invalid bytecode: {0}")]
  InvalidBytecode(#[from] crate::chunk::verifier::Error),
}
impl Error {
  fn for_operand(code: OpCode) -> Self {
    match code {
      OpCode::Constant | OpCode::ConstantLong => Self::TooManyConstants,
      OpCode::DefineGlobal | OpCode::GetGlobal | OpCode::SetGlobal => Self::TooManyGlobals,
      OpCode::Call | OpCode::TailCall => Self::TooManyArguments,
      OpCode::GetUpvalue | OpCode::SetUpvalue => Self::TooManyCaptures,
      OpCode::Closure => Self::TooManyFunctions,
      OpCode::Array | OpCode::ArrayLong => Self::TooLongArray,
      OpCode::Dictionary | OpCode::DictionaryLong => Self::TooLargeDictionary,
      OpCode::MatchArray | OpCode::MatchArrayAtLeast | OpCode::ArrayElement | OpCode::ArraySlice => {
        Self::TooLongPattern
      }
      OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => Self::TooBigJump,
      _ => Self::TooManyLocals,
    }
  }

  fn into_diagnostic(self, line: LineNumber) -> Diagnostic {
    let fault = Fault::new(DiagnosticKind::CompileError, self.to_string());

    let fault = match self {
      Self::BreakOutsideLoop | Self::ContinueOutsideLoop => {
        fault.with_suggestion("Only use 'break' and 'continue' inside a 'while', 'for' or 'repeat' loop")
      }
      Self::TooManyLocals | Self::TooManyArguments | Self::TooManyParameters => {
        fault.with_suggestion("Group related values into an array or dictionary")
      }
      _ => fault,
    };

    fault.into_diagnostic(line, Vec::new())
  }
}

#[derive(Copy, Clone, Debug)]
enum Storage {
  Slot(u8),
  Cell(u8),
}

enum Resolved {
  Local(u8),
  Cell(u8),
  Upvalue(u8),
  Global,
}

struct Local<'a> {
  name: &'a str,
  depth: u8,
  storage: Storage,
}

fn declared_name(expression: &Expression) -> Option<&str> {
  match &expression.expr {
    Expr::Let { name, .. }
    | Expr::Function {
      name: Some(name), ..
    } => Some(name),
    _ => None,
  }
}

#[derive(Default)]
struct LoopContext {
  /// Stack height inside the loop body, where `break` and `continue` unwind to.
  height: usize,
  continue_target: Option<usize>,
  continue_jumps: Vec<usize>,
  break_jumps: Vec<usize>,
}

#[derive(Default)]
struct FunctionState<'a> {
  name: &'a str,
  arity: u8,
  chunk: Chunk,

  locals: Vec<Local<'a>>,
  scope_depth: u8,
  captured: FxHashSet<String>,
  captures: Captures,
  cells: u8,

  height: usize,
  loops: Vec<LoopContext>,
}
impl<'a> FunctionState<'a> {
  fn new(name: &'a str, arity: u8, captured: FxHashSet<String>) -> Self {
    Self {
      name,
      arity,
      chunk: Chunk::new(),
      captured,
      height: usize::from(arity),
      ..Default::default()
    }
  }

  fn find_local(&self, name: &str) -> Option<Storage> {
    self
      .locals
      .iter()
      .rev()
      .find(|local| local.name == name)
      .map(|local| local.storage)
  }

  fn add_capture(&mut self, index: u8, kind: CaptureKind) -> Result<u8, Error> {
    let position = self
      .captures
      .iter()
      .position(|capture| *capture == (index, kind))
      .unwrap_or_else(|| {
        self.captures.push((index, kind));
        self.captures.len() - 1
      });

    u8::try_from(position).map_err(|_| Error::TooManyCaptures)
  }

  fn finish(self) -> Function {
    debug!(
      function = self.name,
      bytes = self.chunk.length(),
      constants = self.chunk.constants().len(),
      cells = self.cells,
      captures = self.captures.len(),
      "compiled function"
    );

    Function {
      name: Rc::from(self.name),
      arity: self.arity,
      cells: self.cells,
      captures: self.captures,
      chunk: self.chunk.finalize(),
    }
  }
}

struct Compiler<'a> {
  function: FunctionState<'a>,
  enclosing: Vec<FunctionState<'a>>,
  line: LineNumber,
}

// Emit Bytecode
impl Compiler<'_> {
  fn emit(&mut self, code: OpCode) {
    self.function.chunk.write_opcode(code, self.line);
    self.adjust_height(code.stack_effect(0));
  }

  fn emit_with(&mut self, code: OpCode, operand: usize) -> Result<(), Error> {
    let line = self.line;
    let chunk = &mut self.function.chunk;
    chunk.write_opcode(code, line);

    if code.number_of_bytes() == 2 {
      let value = u8::try_from(operand).map_err(|_| Error::for_operand(code))?;
      chunk.write_value(value, line);
    } else {
      let value = u16::try_from(operand).map_err(|_| Error::for_operand(code))?;
      chunk.write_long_value(value, line);
    }

    self.adjust_height(code.stack_effect(operand));
    Ok(())
  }

  fn emit_constant(&mut self, value: Value) -> Result<(), Error> {
    let position = self.function.chunk.add_constant(value);

    if position <= usize::from(u8::MAX) {
      self.emit_with(OpCode::Constant, position)
    } else {
      self.emit_with(OpCode::ConstantLong, position)
    }
  }

  fn emit_global(&mut self, code: OpCode, name: &str) -> Result<(), Error> {
    let position = self.function.chunk.add_string(name);
    self.emit_with(code, position)
  }

  fn emit_jump(&mut self, code: OpCode) -> usize {
    self.function.chunk.write_opcode(code, self.line);
    self.function.chunk.write_long_value(u16::MAX, self.line);
    self.function.chunk.length() - 2
  }

  fn patch_jump(&mut self, offset: usize) -> Result<(), Error> {
    let jump = self.function.chunk.length() - offset - 2;
    let jump = u16::try_from(jump).map_err(|_| Error::TooBigJump)?;

    self.function.chunk.set_long_value(offset, jump);
    Ok(())
  }

  fn emit_loop(&mut self, start: usize) -> Result<(), Error> {
    let offset = self.function.chunk.length() + OpCode::Loop.number_of_bytes() - start;
    self.emit_with(OpCode::Loop, offset)
  }

  fn emit_pops(&mut self, count: usize) {
    (0..count).for_each(|_| self.emit(OpCode::Pop));
  }

  fn length(&self) -> usize {
    self.function.chunk.length()
  }

  fn adjust_height(&mut self, effect: isize) {
    self.function.height = self.function.height.saturating_add_signed(effect);
  }

  fn set_height(&mut self, height: usize) {
    self.function.height = height;
  }
}

// Scopes and Variables
impl<'a> Compiler<'a> {
  fn is_script(&self) -> bool {
    self.enclosing.is_empty()
  }

  fn is_global_scope(&self) -> bool {
    self.is_script() && self.function.scope_depth == 0
  }

  fn begin_scope(&mut self) {
    self.function.scope_depth += 1;
  }

  /// Forget the locals of the innermost scope, returning how many of them
  /// occupy stack slots.
  fn drop_scope(&mut self) -> usize {
    let depth = self.function.scope_depth;
    let locals = &mut self.function.locals;
    let mut slots = 0;

    while let Some(last) = locals.last() {
      if last.depth != depth {
        break;
      }
      if let Storage::Slot(_) = last.storage {
        slots += 1;
      }
      locals.pop();
    }

    self.function.scope_depth -= 1;
    slots
  }

  /// Close the innermost scope, keeping the value on top of its locals.
  fn end_scope(&mut self) -> Result<(), Error> {
    let slots = self.drop_scope();
    if slots > 0 {
      self.emit_with(OpCode::PopBelow, slots)?;
    }
    Ok(())
  }

  fn is_captured(&self, name: &str) -> bool {
    self.function.captured.contains(name)
  }

  /// Make the value on top of the stack the local `name`.
  fn declare_slot(&mut self, name: &'a str) -> Result<u8, Error> {
    let slot = self.function.height.saturating_sub(1);
    let slot = u8::try_from(slot).map_err(|_| Error::TooManyLocals)?;

    self.function.locals.push(Local {
      name,
      depth: self.function.scope_depth,
      storage: Storage::Slot(slot),
    });
    Ok(slot)
  }

  /// Move the value on top of the stack into a fresh cell for the local `name`.
  fn declare_cell(&mut self, name: &'a str) -> Result<u8, Error> {
    let cell = self.function.cells;
    self.function.cells = cell.checked_add(1).ok_or(Error::TooManyLocals)?;
    self.emit_with(OpCode::DefineCell, cell.into())?;

    self.function.locals.push(Local {
      name,
      depth: self.function.scope_depth,
      storage: Storage::Cell(cell),
    });
    Ok(cell)
  }

  fn declare(&mut self, name: &'a str) -> Result<Storage, Error> {
    if self.is_captured(name) {
      self.declare_cell(name).map(Storage::Cell)
    } else {
      self.declare_slot(name).map(Storage::Slot)
    }
  }

  fn load(&mut self, storage: Storage) -> Result<(), Error> {
    match storage {
      Storage::Slot(slot) => self.emit_with(OpCode::GetLocal, slot.into()),
      Storage::Cell(cell) => self.emit_with(OpCode::GetCell, cell.into()),
    }
  }

  fn resolve(&mut self, name: &str) -> Result<Resolved, Error> {
    match self.function.find_local(name) {
      Some(Storage::Slot(slot)) => return Ok(Resolved::Local(slot)),
      Some(Storage::Cell(cell)) => return Ok(Resolved::Cell(cell)),
      None => {}
    }

    let Some((owner, storage)) = self
      .enclosing
      .iter()
      .enumerate()
      .rev()
      .find_map(|(index, function)| function.find_local(name).map(|storage| (index, storage)))
    else {
      return Ok(Resolved::Global);
    };

    let Storage::Cell(cell) = storage else {
      return Err(Error::UncapturedVariable(name.to_string()));
    };

    let (index, _) = self.enclosing[owner + 1..]
      .iter_mut()
      .chain([&mut self.function])
      .try_fold((cell, CaptureKind::Local), |(index, kind), function| {
        function
          .add_capture(index, kind)
          .map(|index| (index, CaptureKind::Upvalue))
      })?;

    Ok(Resolved::Upvalue(index))
  }

  fn at_line<T>(
    &mut self,
    line: LineNumber,
    compile: impl FnOnce(&mut Self) -> Result<T, Error>,
  ) -> Result<T, Error> {
    let outer = self.line;
    if line != 0 {
      self.line = line;
    }

    let result = compile(self)?;
    self.line = outer;
    Ok(result)
  }
}

impl<'a> Compiler<'a> {
  fn new(captured: FxHashSet<String>) -> Self {
    Self {
      function: FunctionState::new("<script>", 0, captured),
      enclosing: Vec::new(),
      line: 0,
    }
  }

  fn compile_program(&mut self, program: &'a Program) -> Result<(), Error> {
    let last = program.body.len().saturating_sub(1);

    for (index, expression) in program.body.iter().enumerate() {
      self.compile_expression(expression, false)?;
      if index != last {
        self.emit(OpCode::Pop);
      }
    }

    if program.body.is_empty() {
      self.emit(OpCode::Null);
    }
    self.emit(OpCode::Return);

    Ok(())
  }

  fn finish(self) -> Function {
    self.function.finish()
  }

  fn compile_expression(&mut self, expression: &'a Expression, tail: bool) -> Result<(), Error> {
    self.at_line(expression.line, |compiler| compiler.compile_expr(expression, tail))
  }

  fn compile_expr(&mut self, expression: &'a Expression, tail: bool) -> Result<(), Error> {
    match &expression.expr {
      Expr::Literal(literal) => self.literal(literal)?,
      Expr::Variable { name } => match self.resolve(name)? {
        Resolved::Local(slot) => self.emit_with(OpCode::GetLocal, slot.into())?,
        Resolved::Cell(cell) => self.emit_with(OpCode::GetCell, cell.into())?,
        Resolved::Upvalue(index) => self.emit_with(OpCode::GetUpvalue, index.into())?,
        Resolved::Global => self.emit_global(OpCode::GetGlobal, name)?,
      },
      Expr::Binary {
        operator,
        left,
        right,
      } => self.binary(*operator, left, right)?,
      Expr::Unary {
        operator,
        expression,
      } => {
        self.compile_expression(expression, false)?;
        match operator {
          UnaryOperator::Minus => self.emit(OpCode::Negate),
          UnaryOperator::Not => self.emit(OpCode::Not),
        }
      }
      Expr::Let { name, value } => {
        if self.is_global_scope() {
          self.compile_expression(value, false)?;
          self.emit_global(OpCode::DefineGlobal, name)?;
        } else {
          self.begin_scope();
          self.compile_expression(value, false)?;
          let storage = self.declare(name)?;
          self.load(storage)?;
          self.end_scope()?;
        }
      }
      Expr::Assign { name, value } => {
        self.compile_expression(value, false)?;

        match self.resolve(name)? {
          Resolved::Local(slot) => self.emit_with(OpCode::SetLocal, slot.into())?,
          Resolved::Cell(cell) => self.emit_with(OpCode::SetCell, cell.into())?,
          Resolved::Upvalue(index) => self.emit_with(OpCode::SetUpvalue, index.into())?,
          Resolved::Global => self.emit_global(OpCode::SetGlobal, name)?,
        }
      }
      Expr::Block { body } => self.block(body, tail)?,
      Expr::If {
        condition,
        then,
        otherwise,
      } => self.if_expression(condition, then, otherwise.as_deref(), tail)?,
      Expr::While { condition, body } => self.while_loop(condition, body)?,
      Expr::For {
        variable,
        start,
        end,
        step,
        body,
      } => self.for_loop(variable, start, end, step.as_deref(), body)?,
      Expr::RepeatUntil { body, condition } => self.repeat_until(body, condition)?,
      Expr::Break => self.break_loop()?,
      Expr::Continue => self.continue_loop()?,
      Expr::Function {
        name,
        parameters,
        body,
      } => match name {
        Some(name) if self.is_global_scope() => {
          self.closure(name, parameters, body)?;
          self.emit_global(OpCode::DefineGlobal, name)?;
        }
        Some(name) => {
          self.begin_scope();
          let storage = self.local_function(name, parameters, body, None)?;
          self.load(storage)?;
          self.end_scope()?;
        }
        None => self.closure("<anonymous>", parameters, body)?,
      },
      Expr::Call { callee, arguments } => {
        self.compile_expression(callee, false)?;
        for argument in arguments {
          self.compile_expression(argument, false)?;
        }

        let code = if tail && !self.is_script() {
          OpCode::TailCall
        } else {
          OpCode::Call
        };
        self.emit_with(code, arguments.len())?;
      }
      Expr::Return { expression } => {
        match expression {
          Some(expression) => self.compile_expression(expression, !self.is_script())?,
          None => self.emit(OpCode::Null),
        }
        self.emit(OpCode::Return);
        // code after a return is unreachable, but still sees a value
        self.adjust_height(1);
      }
      Expr::Array { items } => {
        for item in items {
          self.compile_expression(item, false)?;
        }

        if items.len() <= usize::from(u8::MAX) {
          self.emit_with(OpCode::Array, items.len())?;
        } else {
          self.emit_with(OpCode::ArrayLong, items.len())?;
        }
      }
      Expr::Dictionary { items } => {
        for (key, value) in items {
          self.compile_expression(key, false)?;
          self.compile_expression(value, false)?;
        }

        if items.len() <= usize::from(u8::MAX) {
          self.emit_with(OpCode::Dictionary, items.len())?;
        } else {
          self.emit_with(OpCode::DictionaryLong, items.len())?;
        }
      }
      Expr::Index { expression, index } => {
        self.compile_expression(expression, false)?;
        self.compile_expression(index, false)?;
        self.emit(OpCode::GetIndex);
      }
      Expr::IndexAssign {
        expression,
        index,
        value,
      } => {
        self.compile_expression(expression, false)?;
        self.compile_expression(index, false)?;
        self.compile_expression(value, false)?;
        self.emit(OpCode::SetIndex);
      }
      Expr::Match { scrutinee, arms } => self.match_expression(scrutinee, arms, tail)?,
      Expr::Print { expression } => {
        self.compile_expression(expression, false)?;
        self.emit(OpCode::Print);
      }
    }

    Ok(())
  }

  fn literal(&mut self, literal: &Literal) -> Result<(), Error> {
    match literal {
      Literal::Number(number) => self.emit_constant(Value::from(*number))?,
      Literal::String(string) => self.emit_constant(Value::from(string.as_str()))?,
      Literal::Boolean(true) => self.emit(OpCode::True),
      Literal::Boolean(false) => self.emit(OpCode::False),
      Literal::Nil => self.emit(OpCode::Null),
    }
    Ok(())
  }

  fn binary(
    &mut self,
    operator: BinaryOperator,
    left: &'a Expression,
    right: &'a Expression,
  ) -> Result<(), Error> {
    let code = match operator {
      BinaryOperator::And => return self.and(left, right),
      BinaryOperator::Or => return self.or(left, right),
      BinaryOperator::Plus => OpCode::Add,
      BinaryOperator::Minus => OpCode::Subtract,
      BinaryOperator::Multiply => OpCode::Multiply,
      BinaryOperator::Divide => OpCode::Divide,
      BinaryOperator::IntegerDivide => OpCode::IntegerDivide,
      BinaryOperator::Remainder => OpCode::Remainder,
      BinaryOperator::Power => OpCode::Power,
      BinaryOperator::Equal => OpCode::Equal,
      BinaryOperator::NotEqual => OpCode::NotEqual,
      BinaryOperator::Greater => OpCode::Greater,
      BinaryOperator::GreaterEqual => OpCode::GreaterEqual,
      BinaryOperator::Less => OpCode::Less,
      BinaryOperator::LessEqual => OpCode::LessEqual,
    };

    self.compile_expression(left, false)?;
    self.compile_expression(right, false)?;
    self.emit(code);

    Ok(())
  }

  fn and(&mut self, left: &'a Expression, right: &'a Expression) -> Result<(), Error> {
    self.compile_expression(left, false)?;
    let jump = self.emit_jump(OpCode::JumpIfFalse);
    self.emit(OpCode::Pop);
    self.compile_expression(right, false)?;
    self.patch_jump(jump)?;
    self.emit(OpCode::ToBoolean);

    Ok(())
  }

  fn or(&mut self, left: &'a Expression, right: &'a Expression) -> Result<(), Error> {
    self.compile_expression(left, false)?;
    let else_jump = self.emit_jump(OpCode::JumpIfFalse);
    let end_jump = self.emit_jump(OpCode::Jump);

    self.patch_jump(else_jump)?;
    self.emit(OpCode::Pop);
    self.compile_expression(right, false)?;
    self.patch_jump(end_jump)?;
    self.emit(OpCode::ToBoolean);

    Ok(())
  }

  fn block(&mut self, body: &'a [Expression], tail: bool) -> Result<(), Error> {
    if body.is_empty() {
      self.emit(OpCode::Null);
      return Ok(());
    }

    self.begin_scope();
    let ahead = self.declare_functions_ahead(body)?;
    let last = body.len() - 1;

    for (index, expression) in body.iter().enumerate() {
      let is_last = index == last;

      self.at_line(expression.line, |compiler| {
        let declared = match &expression.expr {
          Expr::Let { name, value } => {
            compiler.compile_expression(value, false)?;
            Some(compiler.declare(name)?)
          }
          Expr::Function {
            name: Some(name),
            parameters,
            body,
          } => {
            let cell = ahead.get(name.as_str()).copied();
            Some(compiler.local_function(name, parameters, body, cell)?)
          }
          _ => {
            compiler.compile_expr(expression, tail && is_last)?;
            None
          }
        };

        match declared {
          Some(storage) if is_last => compiler.load(storage),
          Some(_) => Ok(()),
          None if is_last => Ok(()),
          None => {
            compiler.emit(OpCode::Pop);
            Ok(())
          }
        }
      })?;
    }

    self.end_scope()
  }

  /// Named functions of a block which nested functions refer to get their
  /// cells before the first statement, so siblings can call each other in any
  /// order.
  fn declare_functions_ahead(
    &mut self,
    body: &'a [Expression],
  ) -> Result<FxHashMap<&'a str, u8>, Error> {
    let mut cells = FxHashMap::default();

    for expression in body {
      let Expr::Function {
        name: Some(name), ..
      } = &expression.expr
      else {
        continue;
      };

      let declarations = body
        .iter()
        .filter(|other| declared_name(other) == Some(name.as_str()))
        .count();

      if declarations == 1 && self.is_captured(name) {
        self.emit(OpCode::Null);
        cells.insert(name.as_str(), self.declare_cell(name)?);
      }
    }

    Ok(cells)
  }

  fn if_expression(
    &mut self,
    condition: &'a Expression,
    then: &'a Expression,
    otherwise: Option<&'a Expression>,
    tail: bool,
  ) -> Result<(), Error> {
    self.compile_expression(condition, false)?;
    let height = self.function.height;

    let then_jump = self.emit_jump(OpCode::JumpIfFalse);
    self.emit(OpCode::Pop);
    self.compile_expression(then, tail)?;
    let else_jump = self.emit_jump(OpCode::Jump);

    self.patch_jump(then_jump)?;
    self.set_height(height);
    self.emit(OpCode::Pop);

    match otherwise {
      Some(otherwise) => self.compile_expression(otherwise, tail)?,
      None => self.emit(OpCode::Null),
    }

    self.patch_jump(else_jump)
  }

  fn while_loop(&mut self, condition: &'a Expression, body: &'a Expression) -> Result<(), Error> {
    let height = self.function.height;
    let start = self.length();

    self.compile_expression(condition, false)?;
    let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
    self.emit(OpCode::Pop);

    self.function.loops.push(LoopContext {
      height,
      continue_target: Some(start),
      ..Default::default()
    });
    self.compile_expression(body, false)?;
    self.emit(OpCode::Pop);
    let context = self.function.loops.pop().unwrap_or_default();

    self.emit_loop(start)?;

    self.patch_jump(exit_jump)?;
    self.set_height(height + 1);
    self.emit(OpCode::Pop);

    self.finish_loop(context)
  }

  fn for_loop(
    &mut self,
    variable: &'a str,
    start: &'a Expression,
    end: &'a Expression,
    step: Option<&'a Expression>,
    body: &'a Expression,
  ) -> Result<(), Error> {
    let captured = self.is_captured(variable);
    self.begin_scope();

    self.compile_expression(start, false)?;
    let counter = self.declare_slot(if captured { "" } else { variable })?;
    self.compile_expression(end, false)?;
    let limit = self.declare_slot("")?;
    match step {
      Some(step) => self.compile_expression(step, false)?,
      None => self.emit_constant(Value::from(1))?,
    }
    let increment = self.declare_slot("")?;
    self.emit(OpCode::ForPrepare);

    let height = self.function.height;
    let top = self.length();
    self.emit_with(OpCode::GetLocal, counter.into())?;
    self.emit_with(OpCode::GetLocal, limit.into())?;
    self.emit_with(OpCode::GetLocal, increment.into())?;
    self.emit(OpCode::ForCondition);
    let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
    self.emit(OpCode::Pop);

    // closures made in the body each see their own copy of the counter
    self.begin_scope();
    let cell = if captured {
      self.emit_with(OpCode::GetLocal, counter.into())?;
      Some(self.declare_cell(variable)?)
    } else {
      None
    };

    self.function.loops.push(LoopContext {
      height,
      ..Default::default()
    });
    self.compile_expression(body, false)?;
    self.emit(OpCode::Pop);
    let mut context = self.function.loops.pop().unwrap_or_default();

    for jump in mem::take(&mut context.continue_jumps) {
      self.patch_jump(jump)?;
    }
    if let Some(cell) = cell {
      self.emit_with(OpCode::GetCell, cell.into())?;
      self.emit_with(OpCode::SetLocal, counter.into())?;
      self.emit(OpCode::Pop);
    }
    self.end_scope()?;

    self.emit_with(OpCode::GetLocal, counter.into())?;
    self.emit_with(OpCode::GetLocal, increment.into())?;
    self.emit(OpCode::Add);
    self.emit_with(OpCode::SetLocal, counter.into())?;
    self.emit(OpCode::Pop);
    self.emit_loop(top)?;

    self.patch_jump(exit_jump)?;
    self.set_height(height + 1);
    self.emit(OpCode::Pop);

    self.finish_loop(context)?;
    self.end_scope()
  }

  fn repeat_until(&mut self, body: &'a Expression, condition: &'a Expression) -> Result<(), Error> {
    let height = self.function.height;
    let top = self.length();

    self.function.loops.push(LoopContext {
      height,
      ..Default::default()
    });
    self.compile_expression(body, false)?;
    self.emit(OpCode::Pop);
    let mut context = self.function.loops.pop().unwrap_or_default();

    for jump in mem::take(&mut context.continue_jumps) {
      self.patch_jump(jump)?;
    }

    self.compile_expression(condition, false)?;
    let repeat_jump = self.emit_jump(OpCode::JumpIfFalse);
    self.emit(OpCode::Pop);
    let exit_jump = self.emit_jump(OpCode::Jump);

    self.patch_jump(repeat_jump)?;
    self.set_height(height + 1);
    self.emit(OpCode::Pop);
    self.emit_loop(top)?;

    self.patch_jump(exit_jump)?;
    self.set_height(height);

    self.finish_loop(context)
  }

  /// Land pending `break`s and produce the loop's value.
  fn finish_loop(&mut self, context: LoopContext) -> Result<(), Error> {
    for jump in context.break_jumps {
      self.patch_jump(jump)?;
    }
    self.emit(OpCode::Null);

    Ok(())
  }

  fn break_loop(&mut self) -> Result<(), Error> {
    let height = self.function.height;
    let loop_height = match self.function.loops.last() {
      Some(context) => context.height,
      None => return Err(Error::BreakOutsideLoop),
    };

    self.emit_pops(height.saturating_sub(loop_height));
    let jump = self.emit_jump(OpCode::Jump);
    if let Some(context) = self.function.loops.last_mut() {
      context.break_jumps.push(jump);
    }

    self.set_height(height + 1);
    Ok(())
  }

  fn continue_loop(&mut self) -> Result<(), Error> {
    let height = self.function.height;
    let (loop_height, target) = match self.function.loops.last() {
      Some(context) => (context.height, context.continue_target),
      None => return Err(Error::ContinueOutsideLoop),
    };

    self.emit_pops(height.saturating_sub(loop_height));
    if let Some(target) = target {
      self.emit_loop(target)?;
    } else {
      let jump = self.emit_jump(OpCode::Jump);
      if let Some(context) = self.function.loops.last_mut() {
        context.continue_jumps.push(jump);
      }
    }

    self.set_height(height + 1);
    Ok(())
  }

  fn match_expression(
    &mut self,
    scrutinee: &'a Expression,
    arms: &'a [MatchArm],
    tail: bool,
  ) -> Result<(), Error> {
    self.begin_scope();
    self.compile_expression(scrutinee, false)?;
    let subject = self.declare_slot("")?;
    let height = self.function.height;

    let mut end_jumps = Vec::with_capacity(arms.len());
    for arm in arms {
      let mut fail_jumps = Vec::new();
      self.pattern_tests(&arm.pattern, subject, &mut Vec::new(), &mut fail_jumps)?;

      self.begin_scope();
      self.pattern_bindings(&arm.pattern, subject, &mut Vec::new())?;
      self.compile_expression(&arm.body, tail)?;
      self.end_scope()?;
      end_jumps.push(self.emit_jump(OpCode::Jump));

      if fail_jumps.is_empty() {
        self.set_height(height);
      } else {
        self.set_height(height + 1);
        for jump in fail_jumps {
          self.patch_jump(jump)?;
        }
        self.emit(OpCode::Pop);
      }
    }

    self.emit(OpCode::NoMatch);
    for jump in end_jumps {
      self.patch_jump(jump)?;
    }
    self.set_height(height + 1);

    self.end_scope()
  }

  fn load_path(&mut self, subject: u8, path: &[usize]) -> Result<(), Error> {
    self.emit_with(OpCode::GetLocal, subject.into())?;
    for index in path {
      self.emit_with(OpCode::ArrayElement, *index)?;
    }
    Ok(())
  }

  /// Emit every structural test of a pattern. Each failing test jumps away with
  /// its `false` result still on the stack.
  fn pattern_tests(
    &mut self,
    pattern: &'a Pattern,
    subject: u8,
    path: &mut Vec<usize>,
    fail_jumps: &mut Vec<usize>,
  ) -> Result<(), Error> {
    match pattern {
      Pattern::Wildcard | Pattern::Binding(_) => {}
      Pattern::Literal(literal) => {
        self.load_path(subject, path)?;
        self.literal(literal)?;
        self.emit(OpCode::Equal);
        fail_jumps.push(self.emit_jump(OpCode::JumpIfFalse));
        self.emit(OpCode::Pop);
      }
      Pattern::Array { items, rest } => {
        self.load_path(subject, path)?;
        let code = if rest.is_some() {
          OpCode::MatchArrayAtLeast
        } else {
          OpCode::MatchArray
        };
        self.emit_with(code, items.len())?;
        fail_jumps.push(self.emit_jump(OpCode::JumpIfFalse));
        self.emit(OpCode::Pop);

        for (index, item) in items.iter().enumerate() {
          path.push(index);
          self.pattern_tests(item, subject, path, fail_jumps)?;
          path.pop();
        }
      }
    }

    Ok(())
  }

  fn pattern_bindings(
    &mut self,
    pattern: &'a Pattern,
    subject: u8,
    path: &mut Vec<usize>,
  ) -> Result<(), Error> {
    match pattern {
      Pattern::Wildcard | Pattern::Literal(_) => {}
      Pattern::Binding(name) => {
        self.load_path(subject, path)?;
        self.declare(name)?;
      }
      Pattern::Array { items, rest } => {
        for (index, item) in items.iter().enumerate() {
          path.push(index);
          self.pattern_bindings(item, subject, path)?;
          path.pop();
        }

        if let Some(rest) = rest {
          self.load_path(subject, path)?;
          self.emit_with(OpCode::ArraySlice, items.len())?;
          self.declare(rest)?;
        }
      }
    }

    Ok(())
  }

  /// A named function declared inside a block. Functions which refer to
  /// themselves get their cell before the closure is made.
  fn local_function(
    &mut self,
    name: &'a str,
    parameters: &'a [String],
    body: &'a Expression,
    cell: Option<u8>,
  ) -> Result<Storage, Error> {
    let cell = match cell {
      Some(cell) => cell,
      None if self.is_captured(name) => {
        self.emit(OpCode::Null);
        self.declare_cell(name)?
      }
      None => {
        self.closure(name, parameters, body)?;
        return self.declare_slot(name).map(Storage::Slot);
      }
    };

    self.closure(name, parameters, body)?;
    self.emit_with(OpCode::SetCell, cell.into())?;
    self.emit(OpCode::Pop);
    Ok(Storage::Cell(cell))
  }

  fn closure(
    &mut self,
    name: &'a str,
    parameters: &'a [String],
    body: &'a Expression,
  ) -> Result<(), Error> {
    let arity = u8::try_from(parameters.len()).map_err(|_| Error::TooManyParameters)?;
    let state = FunctionState::new(name, arity, captures::captured_names([body]));

    let parent = mem::replace(&mut self.function, state);
    self.enclosing.push(parent);

    let result = self.function_body(parameters, body);

    let parent = self.enclosing.pop().unwrap_or_default();
    let state = mem::replace(&mut self.function, parent);
    result?;

    let function = state.finish();
    #[cfg(feature = "debug-bytecode")]
    debug!("{function:?}\n{:?}", function.chunk);

    let index = self.function.chunk.add_function(function);
    self.emit_with(OpCode::Closure, index)
  }

  fn function_body(&mut self, parameters: &'a [String], body: &'a Expression) -> Result<(), Error> {
    self.begin_scope();

    for (slot, parameter) in parameters.iter().enumerate() {
      let slot = u8::try_from(slot).map_err(|_| Error::TooManyParameters)?;

      if self.is_captured(parameter) {
        self.function.locals.push(Local {
          name: "",
          depth: self.function.scope_depth,
          storage: Storage::Slot(slot),
        });
        self.emit_with(OpCode::GetLocal, slot.into())?;
        self.declare_cell(parameter)?;
      } else {
        self.function.locals.push(Local {
          name: parameter,
          depth: self.function.scope_depth,
          storage: Storage::Slot(slot),
        });
      }
    }

    self.compile_expression(body, true)?;
    self.emit(OpCode::Return);

    Ok(())
  }
}

/// Compile a program into the prototype of a zero-argument script function.
pub fn compile(program: &Program) -> Result<Rc<Function>, Diagnostic> {
  let mut compiler = Compiler::new(captures::captured_names(&program.body));

  if let Err(error) = compiler.compile_program(program) {
    let line = compiler.line;
    return Err(error.into_diagnostic(line));
  }

  let function = compiler.finish();
  function
    .verify()
    .map_err(|error| Error::from(error).into_diagnostic(0))?;

  #[cfg(feature = "debug-bytecode")]
  debug!("{function:?}\n{:?}", function.chunk);

  Ok(Rc::new(function))
}

#[cfg(test)]
mod test {
  use super::compile;
  use crate::{
    ast::{BinaryOperator, Expression as E, MatchArm, Pattern, Program},
    chunk::OpCode,
    diagnostic::DiagnosticKind,
    value::{CaptureKind, Function},
  };
  use pretty_assertions::assert_eq;

  fn program(body: Vec<E>) -> Program {
    Program::new(body)
  }

  fn opcodes(function: &Function) -> Vec<OpCode> {
    let mut position = 0;
    let mut opcodes = Vec::new();

    while let Some(opcode) = function.chunk.get(position) {
      opcodes.push(opcode);
      position += opcode.number_of_bytes();
    }

    opcodes
  }

  #[test]
  fn compiles_arithmetic() {
    let function = compile(&program(vec![E::binary(
      BinaryOperator::Plus,
      E::number(1.0),
      E::binary(BinaryOperator::Multiply, E::number(2.0), E::number(3.0)),
    )
    .at(1)]))
    .unwrap();

    assert_eq!(
      format!("{:?}", function.chunk),
      "          ╭─[Bytecode]
1    0000 │ Constant 1 (0)
     0002 │ Constant 2 (1)
     0004 │ Constant 3 (2)
     0006 │ Multiply
     0007 │ Add
     0008 │ Return
──────────╯"
    );
  }

  #[test]
  fn empty_program_returns_null() {
    let function = compile(&Program::default()).unwrap();
    assert_eq!(opcodes(&function), vec![OpCode::Null, OpCode::Return]);
  }

  #[test]
  fn top_level_declarations_are_globals() {
    let function = compile(&program(vec![
      E::let_("a", E::number(1.0)),
      E::block(vec![E::let_("b", E::number(2.0)), E::variable("b")]),
    ]))
    .unwrap();

    assert_eq!(
      opcodes(&function),
      vec![
        OpCode::Constant,
        OpCode::DefineGlobal,
        OpCode::Pop,
        OpCode::Constant,
        OpCode::GetLocal,
        OpCode::PopBelow,
        OpCode::Return,
      ]
    );
  }

  #[test]
  fn captured_locals_live_in_cells() {
    let function = compile(&program(vec![E::function(
      "counter",
      &[],
      E::block(vec![
        E::let_("count", E::number(0.0)),
        E::lambda(
          &[],
          E::assign(
            "count",
            E::binary(BinaryOperator::Plus, E::variable("count"), E::number(1.0)),
          ),
        ),
      ]),
    )]))
    .unwrap();

    let counter = &function.chunk.functions()[0];
    assert_eq!(counter.cells, 1);
    assert!(opcodes(counter).contains(&OpCode::DefineCell));

    let increment = &counter.chunk.functions()[0];
    assert_eq!(increment.captures.as_slice(), &[(0, CaptureKind::Local)]);
    assert!(opcodes(increment).contains(&OpCode::SetUpvalue));
  }

  #[test]
  fn captures_pass_through_intermediate_functions() {
    let function = compile(&program(vec![E::function(
      "outer",
      &["x"],
      E::lambda(&[], E::lambda(&[], E::variable("x"))),
    )]))
    .unwrap();

    let outer = &function.chunk.functions()[0];
    let middle = &outer.chunk.functions()[0];
    let inner = &middle.chunk.functions()[0];

    assert_eq!(outer.cells, 1);
    assert_eq!(middle.captures.as_slice(), &[(0, CaptureKind::Local)]);
    assert_eq!(inner.captures.as_slice(), &[(0, CaptureKind::Upvalue)]);
  }

  #[test]
  fn tail_calls_only_in_tail_position() {
    let function = compile(&program(vec![E::function(
      "count",
      &["n"],
      E::if_(
        E::binary(BinaryOperator::Equal, E::variable("n"), E::number(0.0)),
        E::string("done"),
        Some(E::call(
          E::variable("count"),
          vec![E::binary(
            BinaryOperator::Minus,
            E::variable("n"),
            E::number(1.0),
          )],
        )),
      ),
    )]))
    .unwrap();

    let count = &function.chunk.functions()[0];
    assert!(opcodes(count).contains(&OpCode::TailCall));
    assert!(!opcodes(count).contains(&OpCode::Call));

    let script = compile(&program(vec![E::call(E::variable("count"), vec![])])).unwrap();
    assert!(!opcodes(&script).contains(&OpCode::TailCall));
  }

  #[test]
  fn non_tail_calls_are_plain_calls() {
    let function = compile(&program(vec![E::function(
      "sum",
      &["n"],
      E::binary(
        BinaryOperator::Plus,
        E::variable("n"),
        E::call(E::variable("sum"), vec![E::variable("n")]),
      ),
    )]))
    .unwrap();

    let sum = &function.chunk.functions()[0];
    assert!(opcodes(sum).contains(&OpCode::Call));
    assert!(!opcodes(sum).contains(&OpCode::TailCall));
  }

  #[test]
  fn sibling_functions_get_cells_ahead() {
    let function = compile(&program(vec![E::function(
      "outer",
      &[],
      E::block(vec![
        E::function("a", &[], E::call(E::variable("b"), vec![])),
        E::function("b", &[], E::number(1.0)),
        E::call(E::variable("a"), vec![]),
      ]),
    )]))
    .unwrap();

    let outer = &function.chunk.functions()[0];
    assert_eq!(outer.cells, 1);
    assert_eq!(&opcodes(outer)[..2], &[OpCode::Null, OpCode::DefineCell]);

    let a = &outer.chunk.functions()[0];
    assert_eq!(a.captures.as_slice(), &[(0, CaptureKind::Local)]);
    assert!(!opcodes(a).contains(&OpCode::GetGlobal));
  }

  #[test]
  fn compiles_pattern_matching() {
    let function = compile(&program(vec![E::match_(
      E::array(vec![]),
      vec![
        MatchArm::new(Pattern::empty_array(), E::string("Empty")),
        MatchArm::new(Pattern::head_tail("head", "tail"), E::variable("head")),
      ],
    )]))
    .unwrap();

    let code = opcodes(&function);
    for opcode in [
      OpCode::MatchArray,
      OpCode::MatchArrayAtLeast,
      OpCode::ArrayElement,
      OpCode::ArraySlice,
      OpCode::NoMatch,
    ] {
      assert!(code.contains(&opcode), "missing {opcode:?}");
    }
  }

  #[test]
  fn break_outside_loop_is_an_error() {
    let error = compile(&program(vec![E::break_().at(4)])).unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::CompileError);
    assert_eq!(error.line, 4);

    let error = compile(&program(vec![E::while_(
      E::boolean(true),
      E::lambda(&[], E::continue_().at(2)),
    )]))
    .unwrap_err();
    assert_eq!(error.line, 2);
  }

  #[test]
  fn too_many_arguments() {
    let arguments = (0..300).map(|_| E::nil()).collect();
    let error = compile(&program(vec![E::call(E::variable("f"), arguments).at(3)])).unwrap_err();

    assert_eq!(error.kind, DiagnosticKind::CompileError);
    assert!(error.message.contains("255 arguments"));
  }

  #[test]
  fn long_arrays_use_long_instruction() {
    let items = (0..300).map(|i| E::number(f64::from(i))).collect();
    let function = compile(&program(vec![E::array(items)])).unwrap();

    let code = opcodes(&function);
    assert_eq!(code[code.len() - 2], OpCode::ArrayLong);
  }

  #[test]
  fn large_dictionaries_use_long_instruction() {
    let items = (0..300)
      .map(|i| (E::string(&format!("key{i}")), E::number(f64::from(i))))
      .collect();
    let function = compile(&program(vec![E::dictionary(items)])).unwrap();

    let code = opcodes(&function);
    assert_eq!(code[code.len() - 2], OpCode::DictionaryLong);
  }

  #[test]
  fn compilation_is_deterministic() {
    let body = vec![
      E::let_("total", E::number(0.0)),
      E::for_(
        "i",
        E::number(1.0),
        E::number(10.0),
        None,
        E::block(vec![
          E::let_("f", E::lambda(&[], E::variable("i"))),
          E::assign(
            "total",
            E::binary(
              BinaryOperator::Plus,
              E::variable("total"),
              E::call(E::variable("f"), vec![]),
            ),
          ),
        ]),
      ),
      E::dictionary(vec![(E::string("a"), E::number(1.0))]),
    ];

    let first = compile(&program(body.clone())).unwrap();
    let second = compile(&program(body)).unwrap();

    assert_eq!(format!("{:?}", first.chunk), format!("{:?}", second.chunk));
    assert!(first.chunk == second.chunk);
  }
}
