mod display;
pub mod verifier;

use crate::{ast::LineNumber, value::Function, value::Value};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::rc::Rc;

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum OpCode {
  Constant = 0,
  ConstantLong,
  Null,
  True,
  False,

  Add,
  Subtract,
  Multiply,
  Divide,
  IntegerDivide,
  Remainder,
  Power,
  Negate,
  Not,
  ToBoolean,
  Equal,
  NotEqual,
  Greater,
  Less,
  GreaterEqual,
  LessEqual,

  Pop,
  PopBelow,
  DefineGlobal,
  GetGlobal,
  SetGlobal,
  GetLocal,
  SetLocal,
  DefineCell,
  GetCell,
  SetCell,
  GetUpvalue,
  SetUpvalue,

  Jump,
  JumpIfFalse,
  Loop,

  Call,
  TailCall,
  Return,
  Closure,

  Array,
  ArrayLong,
  Dictionary,
  DictionaryLong,
  GetIndex,
  SetIndex,

  MatchArray,
  MatchArrayAtLeast,
  ArrayElement,
  ArraySlice,
  NoMatch,

  ForPrepare,
  ForCondition,
  Print,
}

impl OpCode {
  pub fn from_byte(byte: u8) -> Option<Self> {
    FromPrimitive::from_u8(byte)
  }

  /// Size of the instruction including its operand.
  pub fn number_of_bytes(self) -> usize {
    match self {
      Self::Constant
      | Self::PopBelow
      | Self::GetLocal
      | Self::SetLocal
      | Self::DefineCell
      | Self::GetCell
      | Self::SetCell
      | Self::GetUpvalue
      | Self::SetUpvalue
      | Self::Call
      | Self::TailCall
      | Self::Closure
      | Self::Array
      | Self::Dictionary
      | Self::MatchArray
      | Self::MatchArrayAtLeast
      | Self::ArrayElement
      | Self::ArraySlice => 2,
      Self::ConstantLong
      | Self::DefineGlobal
      | Self::GetGlobal
      | Self::SetGlobal
      | Self::Jump
      | Self::JumpIfFalse
      | Self::Loop
      | Self::ArrayLong
      | Self::DictionaryLong => 3,
      _ => 1,
    }
  }

  /// Net change of the operand stack height after the instruction runs, given
  /// its operand. Instructions which leave the current frame report the effect
  /// as seen by code placed after them.
  #[allow(clippy::cast_possible_wrap)]
  pub fn stack_effect(self, operand: usize) -> isize {
    let operand = operand as isize;

    match self {
      Self::Constant
      | Self::ConstantLong
      | Self::Null
      | Self::True
      | Self::False
      | Self::GetGlobal
      | Self::GetLocal
      | Self::GetCell
      | Self::GetUpvalue
      | Self::Closure
      | Self::NoMatch => 1,

      Self::Add
      | Self::Subtract
      | Self::Multiply
      | Self::Divide
      | Self::IntegerDivide
      | Self::Remainder
      | Self::Power
      | Self::Equal
      | Self::NotEqual
      | Self::Greater
      | Self::Less
      | Self::GreaterEqual
      | Self::LessEqual
      | Self::Pop
      | Self::DefineCell
      | Self::GetIndex
      | Self::Return => -1,

      Self::Negate
      | Self::Not
      | Self::ToBoolean
      | Self::DefineGlobal
      | Self::SetGlobal
      | Self::SetLocal
      | Self::SetCell
      | Self::SetUpvalue
      | Self::Jump
      | Self::JumpIfFalse
      | Self::Loop
      | Self::MatchArray
      | Self::MatchArrayAtLeast
      | Self::ArrayElement
      | Self::ArraySlice
      | Self::ForPrepare
      | Self::Print => 0,

      Self::SetIndex | Self::ForCondition => -2,

      Self::PopBelow | Self::Call | Self::TailCall => -operand,
      Self::Array | Self::ArrayLong => 1 - operand,
      Self::Dictionary | Self::DictionaryLong => 1 - 2 * operand,
    }
  }

  /// Whether execution never continues with the next instruction.
  pub fn is_terminator(self) -> bool {
    matches!(
      self,
      Self::Return | Self::Jump | Self::Loop | Self::NoMatch
    )
  }
}

type InstructionsOnLine = u16;
type Line = (LineNumber, InstructionsOnLine);

/// Run-length table from byte offset to source line.
#[derive(Clone, Default, PartialEq, Eq)]
struct LineInfo {
  lines: Vec<Line>,
  last: LineNumber,
  repeated: InstructionsOnLine,
}
impl LineInfo {
  fn new() -> Self {
    Self {
      lines: Vec::new(),
      last: 1,
      repeated: 0,
    }
  }

  fn add(&mut self, line: LineNumber) {
    let line = if line == 0 { self.last } else { line };

    if line == self.last && self.repeated < InstructionsOnLine::MAX {
      self.repeated += 1;
    } else {
      if self.repeated > 0 {
        self.lines.push((self.last, self.repeated));
      }
      self.last = line;
      self.repeated = 1;
    }
  }

  fn finalize(&mut self) {
    if self.repeated > 0 {
      self.lines.push((self.last, self.repeated));
      self.repeated = 0;
    }
    self.lines.shrink_to_fit();
  }

  fn get(&self, position: usize) -> LineNumber {
    let mut count = 0;

    for (line, repeated) in &self.lines {
      count += usize::from(*repeated);

      if count > position {
        return *line;
      }
    }

    self.lines.last().map_or(self.last, |(line, _)| *line)
  }
}

#[must_use]
#[derive(Clone, Default, PartialEq)]
pub struct Chunk {
  pub(crate) code: Vec<u8>,
  pub(crate) constants: Vec<Value>,
  pub(crate) strings: Vec<Rc<str>>,
  pub(crate) functions: Vec<Rc<Function>>,
  lines: LineInfo,
}
impl Chunk {
  pub fn new() -> Self {
    Self {
      lines: LineInfo::new(),
      ..Default::default()
    }
  }

  pub fn length(&self) -> usize {
    self.code.len()
  }

  pub fn code(&self) -> &[u8] {
    &self.code
  }

  pub fn constants(&self) -> &[Value] {
    &self.constants
  }

  pub fn functions(&self) -> &[Rc<Function>] {
    &self.functions
  }

  pub fn write_opcode(&mut self, code: OpCode, line: LineNumber) {
    self.write_value(code as u8, line);
  }

  pub fn write_value(&mut self, code: u8, line: LineNumber) {
    self.code.push(code);
    self.lines.add(line);
  }

  pub fn write_long_value(&mut self, code: u16, line: LineNumber) {
    let [a, b] = u16::to_be_bytes(code);
    self.write_value(a, line);
    self.write_value(b, line);
  }

  pub fn add_constant(&mut self, value: Value) -> usize {
    // `0.0 == -0.0` but they must stay distinct constants
    let same = |existing: &Value| match (existing, &value) {
      (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
      (a, b) => a == b,
    };

    self.constants.iter().position(same).unwrap_or_else(|| {
      self.constants.push(value);
      self.constants.len() - 1
    })
  }

  pub fn add_string(&mut self, string: &str) -> usize {
    self
      .strings
      .iter()
      .position(|x| &**x == string)
      .unwrap_or_else(|| {
        self.strings.push(Rc::from(string));
        self.strings.len() - 1
      })
  }

  pub fn add_function(&mut self, function: Function) -> usize {
    self.functions.push(Rc::new(function));
    self.functions.len() - 1
  }

  pub fn set_long_value(&mut self, offset: usize, value: u16) {
    let [first_byte, second_byte] = u16::to_be_bytes(value);
    self.code[offset] = first_byte;
    self.code[offset + 1] = second_byte;
  }

  pub fn finalize(mut self) -> Self {
    self.lines.finalize();
    self.code.shrink_to_fit();
    self.constants.shrink_to_fit();
    self
  }

  #[inline]
  pub fn get(&self, position: usize) -> Option<OpCode> {
    self.code.get(position).copied().and_then(OpCode::from_byte)
  }

  #[inline]
  pub fn get_value(&self, position: usize) -> Option<u8> {
    self.code.get(position).copied()
  }

  #[inline]
  pub fn get_long_value(&self, position: usize) -> Option<u16> {
    Some(u16::from_be_bytes([
      self.get_value(position)?,
      self.get_value(position + 1)?,
    ]))
  }

  /// The operand of the instruction at `position`, zero when it has none.
  pub fn get_operand(&self, opcode: OpCode, position: usize) -> Option<usize> {
    match opcode.number_of_bytes() {
      2 => self.get_value(position + 1).map(usize::from),
      3 => self.get_long_value(position + 1).map(usize::from),
      _ => Some(0),
    }
  }

  #[inline]
  pub fn get_constant(&self, pointer: usize) -> Option<Value> {
    self.constants.get(pointer).cloned()
  }

  #[inline]
  pub fn get_string(&self, pointer: usize) -> Option<Rc<str>> {
    self.strings.get(pointer).cloned()
  }

  #[inline]
  pub fn get_function(&self, pointer: usize) -> Option<&Rc<Function>> {
    self.functions.get(pointer)
  }

  pub fn get_line_number(&self, position: usize) -> LineNumber {
    self.lines.get(position)
  }
}

#[cfg(test)]
mod test {
  use super::{Chunk, LineInfo, OpCode};
  use crate::value::Value;

  #[test]
  fn every_byte_decodes_or_is_rejected() {
    let decoded = (0..=u8::MAX).filter_map(OpCode::from_byte).count();
    assert_eq!(decoded, OpCode::Print as usize + 1);
    assert_eq!(OpCode::from_byte(OpCode::Call as u8), Some(OpCode::Call));
    assert_eq!(OpCode::from_byte(245), None);
  }

  #[test]
  fn tracks_line_numbers() {
    let mut chunk = Chunk::new();
    chunk.write_opcode(OpCode::Null, 1);
    chunk.write_opcode(OpCode::Constant, 2);
    chunk.write_value(0, 2);
    chunk.write_opcode(OpCode::Pop, 0);
    chunk.write_opcode(OpCode::Return, 5);
    let chunk = chunk.finalize();

    assert_eq!(chunk.get_line_number(0), 1);
    assert_eq!(chunk.get_line_number(1), 2);
    assert_eq!(chunk.get_line_number(2), 2);
    assert_eq!(chunk.get_line_number(3), 2);
    assert_eq!(chunk.get_line_number(4), 5);
  }

  #[test]
  fn long_runs_of_one_line() {
    let mut lines = LineInfo::new();
    for _ in 0..70_000 {
      lines.add(3);
    }
    lines.add(4);
    lines.finalize();

    assert_eq!(lines.get(0), 3);
    assert_eq!(lines.get(69_999), 3);
    assert_eq!(lines.get(70_000), 4);
  }

  #[test]
  fn deduplicates_constants() {
    let mut chunk = Chunk::new();

    assert_eq!(chunk.add_constant(Value::from(1)), 0);
    assert_eq!(chunk.add_constant(Value::from("a")), 1);
    assert_eq!(chunk.add_constant(Value::from(1)), 0);
    assert_eq!(chunk.add_constant(Value::from(-0.0)), 2);
    assert_eq!(chunk.add_constant(Value::from(0.0)), 3);
    assert_eq!(chunk.add_string("x"), 0);
    assert_eq!(chunk.add_string("x"), 0);
  }

  #[test]
  fn stack_effects_of_counted_instructions() {
    assert_eq!(OpCode::Call.stack_effect(2), -2);
    assert_eq!(OpCode::Array.stack_effect(0), 1);
    assert_eq!(OpCode::Array.stack_effect(3), -2);
    assert_eq!(OpCode::Dictionary.stack_effect(2), -3);
    assert_eq!(OpCode::DictionaryLong.stack_effect(300), -599);
    assert_eq!(OpCode::PopBelow.stack_effect(4), -4);
    assert_eq!(OpCode::SetIndex.stack_effect(0), -2);
  }
}
