//! Checks compiled functions before they run: every instruction decodes, every
//! operand points at something that exists, and the operand stack height is
//! the same along every path into an instruction.

use super::{Chunk, OpCode};
use crate::value::{CaptureKind, Function};
use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
  #[error("unknown opcode at {0}")]
  UnknownOpcode(usize),
  #[error("instruction at {0} is missing operands")]
  NotEnoughParameters(usize),
  #[error("constant {constant} referenced at {position} does not exist")]
  UnknownConstant { position: usize, constant: usize },
  #[error("global name {name} referenced at {position} does not exist")]
  UnknownGlobalName { position: usize, name: usize },
  #[error("function {function} referenced at {position} does not exist")]
  UnknownFunction { position: usize, function: usize },
  #[error("jump at {0} does not land on an instruction")]
  UnknownLocation(usize),
  #[error("{kind} {index} referenced at {position} does not exist")]
  UnknownStorage {
    position: usize,
    kind: &'static str,
    index: usize,
  },
  #[error("instruction at {0} reads more values than are on the stack")]
  StackUnderflow(usize),
  #[error("stack height at {position} is {found} on one path and {expected} on another")]
  StackHeightMismatch {
    position: usize,
    expected: usize,
    found: usize,
  },
  #[error("function '{0}' captures a cell which does not exist")]
  UnknownCapture(String),
  #[error("execution can run past the end of the code")]
  MissingReturn,
}

/// How many values the instruction reads from the top of the stack.
fn inputs(opcode: OpCode, operand: usize) -> usize {
  match opcode {
    OpCode::Add
    | OpCode::Subtract
    | OpCode::Multiply
    | OpCode::Divide
    | OpCode::IntegerDivide
    | OpCode::Remainder
    | OpCode::Power
    | OpCode::Equal
    | OpCode::NotEqual
    | OpCode::Greater
    | OpCode::Less
    | OpCode::GreaterEqual
    | OpCode::LessEqual
    | OpCode::GetIndex => 2,

    OpCode::Negate
    | OpCode::Not
    | OpCode::ToBoolean
    | OpCode::Pop
    | OpCode::DefineGlobal
    | OpCode::SetGlobal
    | OpCode::SetLocal
    | OpCode::DefineCell
    | OpCode::SetCell
    | OpCode::SetUpvalue
    | OpCode::JumpIfFalse
    | OpCode::Return
    | OpCode::MatchArray
    | OpCode::MatchArrayAtLeast
    | OpCode::ArrayElement
    | OpCode::ArraySlice
    | OpCode::Print => 1,

    OpCode::SetIndex | OpCode::ForPrepare | OpCode::ForCondition => 3,

    OpCode::PopBelow | OpCode::Call | OpCode::TailCall => operand + 1,
    OpCode::Array | OpCode::ArrayLong => operand,
    OpCode::Dictionary | OpCode::DictionaryLong => operand * 2,

    OpCode::Constant
    | OpCode::ConstantLong
    | OpCode::Null
    | OpCode::True
    | OpCode::False
    | OpCode::GetGlobal
    | OpCode::GetLocal
    | OpCode::GetCell
    | OpCode::GetUpvalue
    | OpCode::Jump
    | OpCode::Loop
    | OpCode::Closure
    | OpCode::NoMatch => 0,
  }
}

struct Instruction {
  opcode: OpCode,
  operand: usize,
  next: usize,
}

fn decode(chunk: &Chunk, position: usize) -> Result<Instruction, Error> {
  let opcode = chunk.get(position).ok_or(Error::UnknownOpcode(position))?;
  let next = position + opcode.number_of_bytes();

  if next > chunk.length() {
    return Err(Error::NotEnoughParameters(position));
  }

  let operand = chunk
    .get_operand(opcode, position)
    .ok_or(Error::NotEnoughParameters(position))?;

  Ok(Instruction {
    opcode,
    operand,
    next,
  })
}

impl Function {
  fn check_operand(&self, position: usize, instruction: &Instruction) -> Result<(), Error> {
    let chunk = &self.chunk;
    let operand = instruction.operand;

    let storage = |kind, length: usize| {
      if operand < length {
        Ok(())
      } else {
        Err(Error::UnknownStorage {
          position,
          kind,
          index: operand,
        })
      }
    };

    match instruction.opcode {
      OpCode::Constant | OpCode::ConstantLong if operand >= chunk.constants.len() => {
        Err(Error::UnknownConstant {
          position,
          constant: operand,
        })
      }
      OpCode::DefineGlobal | OpCode::GetGlobal | OpCode::SetGlobal
        if operand >= chunk.strings.len() =>
      {
        Err(Error::UnknownGlobalName {
          position,
          name: operand,
        })
      }
      OpCode::Closure if operand >= chunk.functions.len() => Err(Error::UnknownFunction {
        position,
        function: operand,
      }),
      OpCode::DefineCell | OpCode::GetCell | OpCode::SetCell => {
        storage("cell", usize::from(self.cells))
      }
      OpCode::GetUpvalue | OpCode::SetUpvalue => storage("upvalue", self.captures.len()),
      _ => Ok(()),
    }
  }

  fn jump_target(&self, position: usize, instruction: &Instruction) -> Result<Option<usize>, Error> {
    let target = match instruction.opcode {
      OpCode::Jump | OpCode::JumpIfFalse => instruction.next + instruction.operand,
      OpCode::Loop => instruction
        .next
        .checked_sub(instruction.operand)
        .ok_or(Error::UnknownLocation(position))?,
      _ => return Ok(None),
    };

    if target >= self.chunk.length() {
      return Err(Error::UnknownLocation(position));
    }

    Ok(Some(target))
  }

  fn check_captures(&self) -> Result<(), Error> {
    for function in &self.chunk.functions {
      let valid = function.captures.iter().all(|(index, kind)| match kind {
        CaptureKind::Local => *index < self.cells,
        CaptureKind::Upvalue => usize::from(*index) < self.captures.len(),
      });

      if !valid {
        return Err(Error::UnknownCapture(function.name.to_string()));
      }
    }

    Ok(())
  }

  /// Verify this function and every function nested inside it.
  pub fn verify(&self) -> Result<(), Error> {
    let chunk = &self.chunk;
    let mut heights: Vec<Option<usize>> = vec![None; chunk.length()];
    let mut starts = vec![false; chunk.length()];

    let mut position = 0;
    while position < chunk.length() {
      starts[position] = true;
      position = decode(chunk, position)?.next;
    }

    let mut pending = vec![(0, usize::from(self.arity))];
    if chunk.length() == 0 {
      return Err(Error::MissingReturn);
    }

    while let Some((position, height)) = pending.pop() {
      if position >= chunk.length() {
        return Err(Error::MissingReturn);
      }
      if !starts[position] {
        return Err(Error::UnknownLocation(position));
      }

      match heights[position] {
        Some(expected) if expected == height => continue,
        Some(expected) => {
          return Err(Error::StackHeightMismatch {
            position,
            expected,
            found: height,
          })
        }
        None => heights[position] = Some(height),
      }

      let instruction = decode(chunk, position)?;
      self.check_operand(position, &instruction)?;

      if height < inputs(instruction.opcode, instruction.operand) {
        return Err(Error::StackUnderflow(position));
      }
      if matches!(instruction.opcode, OpCode::GetLocal | OpCode::SetLocal)
        && instruction.operand >= height
      {
        return Err(Error::UnknownStorage {
          position,
          kind: "local",
          index: instruction.operand,
        });
      }

      let effect = instruction.opcode.stack_effect(instruction.operand);
      let after = height
        .checked_add_signed(effect)
        .ok_or(Error::StackUnderflow(position))?;

      if let Some(target) = self.jump_target(position, &instruction)? {
        pending.push((target, after));
      }
      if !instruction.opcode.is_terminator() {
        pending.push((instruction.next, after));
      }
    }

    self.check_captures()?;
    for function in &chunk.functions {
      function.verify()?;
    }

    Ok(())
  }
}

#[cfg(test)]
mod test {
  use super::Error;
  use crate::{
    chunk::{Chunk, OpCode},
    value::{CaptureKind, Captures, Function, Value},
  };

  fn function(code: Vec<u8>) -> Function {
    Function::script(
      Chunk {
        code,
        constants: vec![Value::from(1)],
        strings: vec!["a".into()],
        ..Chunk::new()
      },
      1,
    )
  }

  #[test]
  fn accepts_balanced_code() {
    let code = vec![
      OpCode::True as u8,
      OpCode::JumpIfFalse as u8,
      0,
      6,
      OpCode::Pop as u8,
      OpCode::Constant as u8,
      0,
      OpCode::Jump as u8,
      0,
      2,
      OpCode::Pop as u8,
      OpCode::Null as u8,
      OpCode::Return as u8,
    ];
    assert_eq!(function(code).verify(), Ok(()));
  }

  #[test]
  fn invalid_opcode() {
    assert_eq!(function(vec![245]).verify(), Err(Error::UnknownOpcode(0)));
    assert_eq!(
      function(vec![OpCode::Null as u8, 200]).verify(),
      Err(Error::UnknownOpcode(1))
    );
  }

  #[test]
  fn correct_opcode_parameters() {
    for opcode in [OpCode::Array, OpCode::Constant, OpCode::Jump, OpCode::Call] {
      assert_eq!(
        function(vec![opcode as u8]).verify(),
        Err(Error::NotEnoughParameters(0))
      );
    }
  }

  #[test]
  fn unknown_constant_and_global() {
    assert!(matches!(
      function(vec![OpCode::Constant as u8, 5, OpCode::Return as u8]).verify(),
      Err(Error::UnknownConstant { .. })
    ));
    assert!(matches!(
      function(vec![OpCode::Null as u8, OpCode::SetGlobal as u8, 0, 5, OpCode::Return as u8])
        .verify(),
      Err(Error::UnknownGlobalName { .. })
    ));
  }

  #[test]
  fn jump_locations_exist() {
    assert_eq!(
      function(vec![OpCode::Jump as u8, 0, 5]).verify(),
      Err(Error::UnknownLocation(0))
    );
    assert_eq!(
      function(vec![OpCode::Loop as u8, 0, 9]).verify(),
      Err(Error::UnknownLocation(0))
    );
  }

  #[test]
  fn detects_underflow_and_mismatched_heights() {
    assert_eq!(
      function(vec![OpCode::Add as u8, OpCode::Return as u8]).verify(),
      Err(Error::StackUnderflow(0))
    );

    // the false branch reaches the join with one value fewer
    let code = vec![
      OpCode::True as u8,
      OpCode::JumpIfFalse as u8,
      0,
      1,
      OpCode::Null as u8,
      OpCode::Return as u8,
    ];
    assert!(matches!(
      function(code).verify(),
      Err(Error::StackHeightMismatch { .. })
    ));
  }

  #[test]
  fn falling_off_the_end() {
    assert_eq!(
      function(vec![OpCode::Null as u8]).verify(),
      Err(Error::MissingReturn)
    );
  }

  #[test]
  fn captures_must_exist() {
    let inner = Function {
      name: "inner".into(),
      captures: Captures::from_slice(&[(3, CaptureKind::Local)]),
      chunk: Chunk {
        code: vec![OpCode::Null as u8, OpCode::Return as u8],
        ..Chunk::new()
      },
      ..Default::default()
    };
    let mut outer = function(vec![OpCode::Closure as u8, 0, OpCode::Return as u8]);
    outer.chunk.functions.push(inner.into());

    assert_eq!(
      outer.verify(),
      Err(Error::UnknownCapture("inner".to_string()))
    );
  }
}
