use super::{Chunk, OpCode};
use std::fmt;

impl fmt::Debug for Chunk {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "          ╭─[Bytecode]")?;

    let mut position: usize = 0;
    let mut last_line_number = 0;

    while position < self.code.len() {
      let line_number = self.get_line_number(position);
      if line_number == last_line_number {
        write!(f, "\n     {position:0>4} │ ")?;
      } else {
        write!(f, "\n{line_number:<4} {position:0>4} │ ")?;
        last_line_number = line_number;
      }

      position = disassemble_instruction(f, self, position)?;
    }
    write!(f, "\n──────────╯")?;

    for function in &self.functions {
      write!(f, "\n\n{function:?}\n{:?}", function.chunk)?;
    }

    Ok(())
  }
}

fn disassemble_instruction(
  f: &mut fmt::Formatter<'_>,
  chunk: &Chunk,
  position: usize,
) -> Result<usize, fmt::Error> {
  let Some(instruction) = chunk.get(position) else {
    write!(f, "Unknown OpCode")?;
    return Ok(position + 1);
  };

  match instruction {
    OpCode::Constant | OpCode::ConstantLong => constant_instruction(f, chunk, instruction, position),
    OpCode::DefineGlobal | OpCode::GetGlobal | OpCode::SetGlobal => {
      string_instruction(f, chunk, instruction, position)
    }
    OpCode::Jump | OpCode::JumpIfFalse => jump_instruction(f, chunk, instruction, 1, position),
    OpCode::Loop => jump_instruction(f, chunk, instruction, -1, position),
    OpCode::Closure => function_instruction(f, chunk, position),
    _ => operand_instruction(f, chunk, instruction, position),
  }
}

fn name(instruction: OpCode) -> &'static str {
  match instruction {
    OpCode::Constant => "Constant",
    OpCode::ConstantLong => "Constant Long",
    OpCode::Null => "Null",
    OpCode::True => "True",
    OpCode::False => "False",
    OpCode::Add => "Add",
    OpCode::Subtract => "Subtract",
    OpCode::Multiply => "Multiply",
    OpCode::Divide => "Divide",
    OpCode::IntegerDivide => "Integer Divide",
    OpCode::Remainder => "Remainder",
    OpCode::Power => "Power",
    OpCode::Negate => "Negate",
    OpCode::Not => "Not",
    OpCode::ToBoolean => "To Boolean",
    OpCode::Equal => "Equal",
    OpCode::NotEqual => "Not Equal",
    OpCode::Greater => "Greater",
    OpCode::Less => "Less",
    OpCode::GreaterEqual => "Greater Equal",
    OpCode::LessEqual => "Less Equal",
    OpCode::Pop => "Pop",
    OpCode::PopBelow => "Pop Below",
    OpCode::DefineGlobal => "Define Global",
    OpCode::GetGlobal => "Get Global",
    OpCode::SetGlobal => "Set Global",
    OpCode::GetLocal => "Get Local",
    OpCode::SetLocal => "Set Local",
    OpCode::DefineCell => "Define Cell",
    OpCode::GetCell => "Get Cell",
    OpCode::SetCell => "Set Cell",
    OpCode::GetUpvalue => "Get Upvalue",
    OpCode::SetUpvalue => "Set Upvalue",
    OpCode::Jump => "Jump",
    OpCode::JumpIfFalse => "Jump If False",
    OpCode::Loop => "Loop",
    OpCode::Call => "Call",
    OpCode::TailCall => "Tail Call",
    OpCode::Return => "Return",
    OpCode::Closure => "Closure",
    OpCode::Array => "Array",
    OpCode::ArrayLong => "Array Long",
    OpCode::Dictionary => "Dictionary",
    OpCode::DictionaryLong => "Dictionary Long",
    OpCode::GetIndex => "Get Index",
    OpCode::SetIndex => "Set Index",
    OpCode::MatchArray => "Match Array",
    OpCode::MatchArrayAtLeast => "Match Array At Least",
    OpCode::ArrayElement => "Array Element",
    OpCode::ArraySlice => "Array Slice",
    OpCode::NoMatch => "No Match",
    OpCode::ForPrepare => "For Prepare",
    OpCode::ForCondition => "For Condition",
    OpCode::Print => "Print",
  }
}

fn operand_instruction(
  f: &mut fmt::Formatter<'_>,
  chunk: &Chunk,
  instruction: OpCode,
  position: usize,
) -> Result<usize, fmt::Error> {
  write!(f, "{}", name(instruction))?;

  if instruction.number_of_bytes() > 1 {
    match chunk.get_operand(instruction, position) {
      Some(operand) => write!(f, " {operand}")?,
      None => write!(f, " ?")?,
    }
  }

  Ok(position + instruction.number_of_bytes())
}

fn constant_instruction(
  f: &mut fmt::Formatter<'_>,
  chunk: &Chunk,
  instruction: OpCode,
  position: usize,
) -> Result<usize, fmt::Error> {
  let location = chunk.get_operand(instruction, position).unwrap_or(usize::MAX);

  match chunk.get_constant(location) {
    Some(constant) => write!(f, "{} {constant:?} ({location})", name(instruction))?,
    None => write!(f, "{} ?", name(instruction))?,
  }

  Ok(position + instruction.number_of_bytes())
}

fn string_instruction(
  f: &mut fmt::Formatter<'_>,
  chunk: &Chunk,
  instruction: OpCode,
  position: usize,
) -> Result<usize, fmt::Error> {
  let location = chunk.get_operand(instruction, position).unwrap_or(usize::MAX);

  match chunk.get_string(location) {
    Some(string) => write!(f, "{} {string} ({location})", name(instruction))?,
    None => write!(f, "{} ?", name(instruction))?,
  }

  Ok(position + instruction.number_of_bytes())
}

fn function_instruction(
  f: &mut fmt::Formatter<'_>,
  chunk: &Chunk,
  position: usize,
) -> Result<usize, fmt::Error> {
  let location = chunk.get_operand(OpCode::Closure, position).unwrap_or(usize::MAX);

  match chunk.get_function(location) {
    Some(function) => write!(f, "Closure {function:?} ({location})")?,
    None => write!(f, "Closure ?")?,
  }

  Ok(position + 2)
}

fn jump_instruction(
  f: &mut fmt::Formatter<'_>,
  chunk: &Chunk,
  instruction: OpCode,
  direction: i8,
  position: usize,
) -> Result<usize, fmt::Error> {
  let jump = chunk.get_long_value(position + 1).unwrap_or(0);

  write!(
    f,
    "{} {}",
    name(instruction),
    i32::from(jump) * i32::from(direction)
  )?;
  Ok(position + 3)
}
