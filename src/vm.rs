use crate::{
  builtins,
  chunk::OpCode,
  diagnostic::{Diagnostic, DiagnosticKind, Fault},
  value::{indexing, CaptureKind, Cell, Closure, Function, NativeFunction, Value},
};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::{
  collections::{hash_map::Entry, BTreeMap},
  fmt,
  io::{self, Write},
  mem,
  rc::Rc,
};
use tracing::{debug, trace};

fn invalid_bytecode() -> Fault {
  Fault::new(
    DiagnosticKind::InvalidBytecode,
    "Bytecode refers to an instruction, operand or value which does not exist",
  )
}

macro_rules! get_safe {
  ( $x:expr ) => {
    match $x {
      Some(value) => value,
      None => break Err(invalid_bytecode()),
    }
  };
}

macro_rules! try_fault {
  ( $x:expr ) => {
    match $x {
      Ok(value) => value,
      Err(fault) => break Err(fault),
    }
  };
}

macro_rules! get_two_values {
  ( $y:expr ) => {
    (get_safe!($y.pop()), get_safe!($y.pop()))
  };
}

macro_rules! binary_operation {
  ( $vm:expr, $operation:ident ) => {{
    let (right, left) = get_two_values!($vm.stack);
    $vm.stack.push(try_fault!(left.$operation(&right)));
  }};
}

/// Limits applied while running.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Config {
  /// Most call frames alive at once. Tail calls do not add frames.
  pub max_frames: usize,
}
impl Default for Config {
  fn default() -> Self {
    Self { max_frames: 65_536 }
  }
}

/// State which outlives a single run: global variables and where `print`
/// writes to.
pub struct Environment {
  globals: FxHashMap<Rc<str>, Value>,
  output: Box<dyn Write>,
}
impl Environment {
  pub fn new() -> Self {
    Self::with_output(io::stdout())
  }

  pub fn with_output(output: impl Write + 'static) -> Self {
    let mut environment = Self {
      globals: FxHashMap::default(),
      output: Box::new(output),
    };
    builtins::register(&mut environment);
    environment
  }

  pub fn define_global(&mut self, name: &str, value: impl Into<Value>) {
    self.globals.insert(Rc::from(name), value.into());
  }

  pub fn define_native(&mut self, function: NativeFunction) {
    self.define_global(function.name, function);
  }

  pub fn get_global(&self, name: &str) -> Option<Value> {
    self.globals.get(name).cloned()
  }
}
impl Default for Environment {
  fn default() -> Self {
    Self::new()
  }
}
impl fmt::Debug for Environment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut names: Vec<_> = self.globals.keys().collect();
    names.sort();
    f.debug_struct("Environment").field("globals", &names).finish()
  }
}

struct CallFrame {
  closure: Rc<Closure>,
  cells: Vec<Cell>,
  /// Where to continue once the callee returns. Only kept up to date while the
  /// frame is suspended.
  ip: usize,
  /// Stack position of the first local. The callee sits just below it.
  base: usize,
}
impl CallFrame {
  fn new(closure: Rc<Closure>, base: usize) -> Self {
    let cells = (0..closure.function.cells).map(|_| Cell::default()).collect();

    Self {
      closure,
      cells,
      ip: 0,
      base,
    }
  }

  fn function(&self) -> &Function {
    &self.closure.function
  }
}

pub struct VM {
  stack: Vec<Value>,
  frames: Vec<CallFrame>,
  config: Config,
}

impl VM {
  pub fn new() -> Self {
    Self::with_config(Config::default())
  }

  pub fn with_config(config: Config) -> Self {
    Self {
      stack: Vec::with_capacity(256),
      frames: Vec::with_capacity(16),
      config,
    }
  }

  /// Run a compiled script against the environment. Globals defined before a
  /// fault stay defined.
  pub fn run(
    &mut self,
    function: &Rc<Function>,
    environment: &mut Environment,
  ) -> Result<Value, Diagnostic> {
    self.stack.clear();
    self.frames.clear();

    let closure = Rc::new(Closure::new(Rc::clone(function), SmallVec::new()));
    self.stack.push(Value::Closure(Rc::clone(&closure)));
    let mut frame = CallFrame::new(closure, self.stack.len());

    let mut ip = 0;
    let result = self.execute(&mut frame, &mut ip, environment);

    result.map_err(|fault| {
      let diagnostic = self.locate(fault, &frame, ip);
      debug!(
        kind = %diagnostic.kind,
        line = diagnostic.line,
        "{}",
        diagnostic.message
      );

      self.stack.clear();
      self.frames.clear();
      diagnostic
    })
  }

  fn locate(&self, fault: Fault, frame: &CallFrame, ip: usize) -> Diagnostic {
    let line = frame.function().chunk.get_line_number(ip);
    let trace = self
      .frames
      .iter()
      .rev()
      .map(|frame| {
        frame
          .function()
          .chunk
          .get_line_number(frame.ip.saturating_sub(1))
      })
      .collect();

    fault.into_diagnostic(line, trace)
  }

  fn call_depth_exceeded(&self) -> Option<Fault> {
    if self.frames.len() + 2 > self.config.max_frames {
      Some(Fault::new(
        DiagnosticKind::StackOverflow,
        format!(
          "Maximum call depth of {} frames exceeded",
          self.config.max_frames
        ),
      ))
    } else {
      None
    }
  }

  fn call_native(&mut self, function: &NativeFunction, arg_count: usize) -> Result<(), Fault> {
    let start = self
      .stack
      .len()
      .checked_sub(arg_count)
      .ok_or_else(invalid_bytecode)?;
    let args = self.stack.split_off(start);
    self.stack.pop();

    trace!(function = function.name, "calling native function");
    let result = function.call(&args)?;
    self.stack.push(result);
    Ok(())
  }

  #[allow(clippy::too_many_lines)]
  fn execute(
    &mut self,
    frame: &mut CallFrame,
    ip: &mut usize,
    environment: &mut Environment,
  ) -> Result<Value, Fault> {
    loop {
      let chunk = &frame.function().chunk;
      let instruction = get_safe!(chunk.get(*ip));
      let operand = get_safe!(chunk.get_operand(instruction, *ip));
      let mut next = *ip + instruction.number_of_bytes();

      match instruction {
        OpCode::Constant | OpCode::ConstantLong => {
          let constant = get_safe!(chunk.get_constant(operand));
          self.stack.push(constant);
        }
        OpCode::Null => self.stack.push(Value::Null),
        OpCode::True => self.stack.push(Value::from(true)),
        OpCode::False => self.stack.push(Value::from(false)),

        OpCode::Add => binary_operation!(self, add),
        OpCode::Subtract => binary_operation!(self, subtract),
        OpCode::Multiply => binary_operation!(self, multiply),
        OpCode::Divide => binary_operation!(self, divide),
        OpCode::IntegerDivide => binary_operation!(self, integer_divide),
        OpCode::Remainder => binary_operation!(self, remainder),
        OpCode::Power => binary_operation!(self, power),
        OpCode::Negate => {
          let value = get_safe!(self.stack.pop());
          self.stack.push(try_fault!(value.negate()));
        }
        OpCode::Not => {
          let value = get_safe!(self.stack.pop());
          self.stack.push(Value::from(value.is_falsy()));
        }
        OpCode::ToBoolean => {
          let value = get_safe!(self.stack.pop());
          self.stack.push(Value::from(!value.is_falsy()));
        }
        OpCode::Equal => {
          let (right, left) = get_two_values!(self.stack);
          self.stack.push(Value::from(left == right));
        }
        OpCode::NotEqual => {
          let (right, left) = get_two_values!(self.stack);
          self.stack.push(Value::from(left != right));
        }
        OpCode::Greater => binary_operation!(self, greater),
        OpCode::Less => binary_operation!(self, less),
        OpCode::GreaterEqual => binary_operation!(self, greater_equal),
        OpCode::LessEqual => binary_operation!(self, less_equal),

        OpCode::Pop => {
          get_safe!(self.stack.pop());
        }
        OpCode::PopBelow => {
          let value = get_safe!(self.stack.pop());
          let length = get_safe!(self.stack.len().checked_sub(operand));
          self.stack.truncate(length);
          self.stack.push(value);
        }

        OpCode::DefineGlobal => {
          let name = get_safe!(chunk.get_string(operand));
          let value = get_safe!(self.stack.last()).clone();
          environment.globals.insert(name, value);
        }
        OpCode::GetGlobal => {
          let name = get_safe!(chunk.get_string(operand));

          match environment.globals.get(&name) {
            Some(value) => self.stack.push(value.clone()),
            None => {
              break Err(Fault::new(
                DiagnosticKind::UndefinedVariable,
                format!("Undefined variable '{name}'"),
              ))
            }
          }
        }
        OpCode::SetGlobal => {
          let name = get_safe!(chunk.get_string(operand));
          let value = get_safe!(self.stack.last()).clone();

          if let Entry::Occupied(mut entry) = environment.globals.entry(Rc::clone(&name)) {
            entry.insert(value);
          } else {
            break Err(
              Fault::new(
                DiagnosticKind::UndefinedVariable,
                format!("Cannot reassign undefined variable '{name}'"),
              )
              .with_suggestion(format!("Declare it first with `let {name} = ...`")),
            );
          }
        }
        OpCode::GetLocal => {
          let value = get_safe!(self.stack.get(frame.base + operand)).clone();
          self.stack.push(value);
        }
        OpCode::SetLocal => {
          let value = get_safe!(self.stack.last()).clone();
          *get_safe!(self.stack.get_mut(frame.base + operand)) = value;
        }
        OpCode::DefineCell => {
          let value = get_safe!(self.stack.pop());
          *get_safe!(frame.cells.get_mut(operand)) = Cell::new(value);
        }
        OpCode::GetCell => {
          let value = get_safe!(frame.cells.get(operand)).get();
          self.stack.push(value);
        }
        OpCode::SetCell => {
          let value = get_safe!(self.stack.last()).clone();
          get_safe!(frame.cells.get(operand)).set(value);
        }
        OpCode::GetUpvalue => {
          let value = get_safe!(frame.closure.upvalues.get(operand)).get();
          self.stack.push(value);
        }
        OpCode::SetUpvalue => {
          let value = get_safe!(self.stack.last()).clone();
          get_safe!(frame.closure.upvalues.get(operand)).set(value);
        }

        OpCode::Jump => next += operand,
        OpCode::JumpIfFalse => {
          if get_safe!(self.stack.last()).is_falsy() {
            next += operand;
          }
        }
        OpCode::Loop => next = get_safe!(next.checked_sub(operand)),

        OpCode::Call | OpCode::TailCall => {
          let position = get_safe!(self.stack.len().checked_sub(operand + 1));
          let callee = get_safe!(self.stack.get(position)).clone();

          match &callee {
            Value::Closure(closure) => {
              try_fault!(closure.function.check_arg_count(operand));

              if instruction == OpCode::TailCall {
                trace!(function = %closure.function.name, "tail call");
                self.stack.drain(frame.base - 1..position);
                *frame = CallFrame::new(Rc::clone(closure), frame.base);
              } else {
                if let Some(fault) = self.call_depth_exceeded() {
                  break Err(fault);
                }

                trace!(
                  function = %closure.function.name,
                  depth = self.frames.len() + 1,
                  "call"
                );
                let caller = CallFrame::new(Rc::clone(closure), position + 1);
                let mut caller = mem::replace(frame, caller);
                caller.ip = next;
                self.frames.push(caller);
              }

              next = 0;
            }
            Value::NativeFunction(native) => try_fault!(self.call_native(native, operand)),
            other => {
              break Err(Fault::type_mismatch(format!(
                "Cannot call a value of type {}",
                other.get_type()
              )))
            }
          }
        }
        OpCode::Return => {
          let result = get_safe!(self.stack.pop());
          self.stack.truncate(frame.base.saturating_sub(1));

          match self.frames.pop() {
            Some(caller) => {
              *frame = caller;
              next = frame.ip;
              self.stack.push(result);
            }
            None => break Ok(result),
          }
        }
        OpCode::Closure => {
          let function = Rc::clone(get_safe!(chunk.get_function(operand)));
          let upvalues = function
            .captures
            .iter()
            .map(|(index, kind)| match kind {
              CaptureKind::Local => frame.cells.get(usize::from(*index)).cloned(),
              CaptureKind::Upvalue => frame.closure.upvalues.get(usize::from(*index)).cloned(),
            })
            .collect::<Option<SmallVec<_>>>();

          let closure = Closure::new(function, get_safe!(upvalues));
          self.stack.push(Value::from(closure));
        }

        OpCode::Array | OpCode::ArrayLong => {
          let start = get_safe!(self.stack.len().checked_sub(operand));
          let items = self.stack.split_off(start);
          self.stack.push(Value::array(items));
        }
        OpCode::Dictionary | OpCode::DictionaryLong => {
          let start = get_safe!(self.stack.len().checked_sub(operand * 2));
          let items = self.stack.split_off(start);

          let entries = items
            .chunks_exact(2)
            .map(|entry| match entry {
              [Value::String(key), value] => Ok((Rc::clone(key), value.clone())),
              [key, _] => Err(Fault::type_mismatch(format!(
                "Dictionary keys must be strings, got {}",
                key.get_type()
              ))),
              _ => Err(invalid_bytecode()),
            })
            .collect::<Result<BTreeMap<_, _>, _>>();

          self.stack.push(Value::dictionary(try_fault!(entries)));
        }
        OpCode::GetIndex => {
          let (index, target) = get_two_values!(self.stack);
          self.stack.push(try_fault!(indexing::get_index(&target, &index)));
        }
        OpCode::SetIndex => {
          let value = get_safe!(self.stack.pop());
          let (index, target) = get_two_values!(self.stack);
          try_fault!(indexing::set_index(&target, &index, value.clone()));
          self.stack.push(value);
        }

        OpCode::MatchArray | OpCode::MatchArrayAtLeast => {
          let value = get_safe!(self.stack.pop());
          let matches = value.as_array().map_or(false, |array| {
            let length = array.borrow().len();
            if instruction == OpCode::MatchArray {
              length == operand
            } else {
              length >= operand
            }
          });
          self.stack.push(Value::from(matches));
        }
        OpCode::ArrayElement => {
          let value = get_safe!(self.stack.pop());
          let element = value
            .as_array()
            .and_then(|array| array.borrow().get(operand).cloned());
          self.stack.push(get_safe!(element));
        }
        OpCode::ArraySlice => {
          let value = get_safe!(self.stack.pop());
          let rest = value
            .as_array()
            .and_then(|array| array.borrow().get(operand..).map(<[Value]>::to_vec));
          self.stack.push(Value::array(get_safe!(rest)));
        }
        OpCode::NoMatch => {
          break Err(Fault::new(
            DiagnosticKind::NonExhaustiveMatch,
            "No matching case found",
          ))
        }

        OpCode::ForPrepare => {
          let first = get_safe!(self.stack.len().checked_sub(3));
          let [start, end, step] = get_safe!(self.stack.get(first..)) else {
            break Err(invalid_bytecode());
          };

          let fault = if !start.is_number() {
            Some(Fault::type_mismatch("Start value must be a number"))
          } else if !end.is_number() {
            Some(Fault::type_mismatch("End value must be a number"))
          } else if !step.is_number() {
            Some(Fault::type_mismatch("Step value must be a number"))
          } else if step.as_number() == Some(0.0) {
            Some(Fault::new(
              DiagnosticKind::InvalidLoopStep,
              "Step cannot be zero",
            ))
          } else {
            None
          };

          if let Some(fault) = fault {
            break Err(fault);
          }
        }
        OpCode::ForCondition => {
          let (step, end) = get_two_values!(self.stack);
          let counter = get_safe!(self.stack.pop());

          let (Some(counter), Some(end), Some(step)) =
            (counter.as_number(), end.as_number(), step.as_number())
          else {
            break Err(Fault::type_mismatch("Loop counter must be a number"));
          };

          let running = (step > 0.0 && counter <= end) || (step < 0.0 && counter >= end);
          self.stack.push(Value::from(running));
        }
        OpCode::Print => {
          let value = get_safe!(self.stack.last());
          if let Err(error) = writeln!(environment.output, "{value}") {
            debug!("could not write printed value: {error}");
          }
        }
      }

      #[cfg(feature = "debug-stack")]
      debug!(
        target: "flux::stack",
        "{:0>4} │ {}",
        *ip,
        self
          .stack
          .iter()
          .map(|item| format!("{item:?}"))
          .collect::<Vec<_>>()
          .join(", ")
      );

      *ip = next;
    }
  }
}

impl Default for VM {
  fn default() -> Self {
    Self::new()
  }
}

/// Run a compiled script with the default limits.
pub fn run(function: &Rc<Function>, environment: &mut Environment) -> Result<Value, Diagnostic> {
  VM::new().run(function, environment)
}

#[cfg(test)]
mod test {
  use super::{Config, Environment, VM};
  use crate::{
    ast::{BinaryOperator, Expression as E, Program},
    chunk::{Chunk, OpCode},
    compiler::compile,
    diagnostic::DiagnosticKind,
    value::{Function, Value},
  };
  use std::rc::Rc;

  fn run(body: Vec<E>) -> Result<Value, crate::diagnostic::Diagnostic> {
    let function = compile(&Program::new(body))?;
    VM::new().run(&function, &mut Environment::default())
  }

  fn countdown(n: f64) -> Vec<E> {
    vec![
      E::function(
        "countdown",
        &["n"],
        E::if_(
          E::binary(BinaryOperator::Equal, E::variable("n"), E::number(0.0)),
          E::string("done"),
          Some(E::call(
            E::variable("countdown"),
            vec![E::binary(
              BinaryOperator::Minus,
              E::variable("n"),
              E::number(1.0),
            )],
          )),
        ),
      ),
      E::call(E::variable("countdown"), vec![E::number(n)]),
    ]
  }

  #[test]
  fn evaluates_arithmetic() {
    let result = run(vec![E::binary(
      BinaryOperator::Multiply,
      E::binary(BinaryOperator::Plus, E::number(1.0), E::number(2.0)),
      E::number(4.0),
    )]);

    assert_eq!(result, Ok(Value::from(12)));
  }

  #[test]
  fn tail_calls_do_not_use_frames() {
    let function = compile(&Program::new(countdown(10_000.0))).unwrap();
    let mut vm = VM::with_config(Config { max_frames: 4 });

    let result = vm.run(&function, &mut Environment::default());
    assert_eq!(result, Ok(Value::from("done")));
  }

  #[test]
  fn deep_recursion_is_a_stack_overflow() {
    // `1 + sum(n - 1)` keeps a frame alive for every call
    let body = vec![
      E::function(
        "sum",
        &["n"],
        E::if_(
          E::binary(BinaryOperator::Equal, E::variable("n"), E::number(0.0)),
          E::number(0.0),
          Some(E::binary(
            BinaryOperator::Plus,
            E::number(1.0),
            E::call(
              E::variable("sum"),
              vec![E::binary(
                BinaryOperator::Minus,
                E::variable("n"),
                E::number(1.0),
              )],
            ),
          )),
        ),
      ),
      E::call(E::variable("sum"), vec![E::number(100.0)]),
    ];
    let function = compile(&Program::new(body)).unwrap();

    let mut vm = VM::with_config(Config { max_frames: 50 });
    let error = vm.run(&function, &mut Environment::default()).unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::StackOverflow);

    let result = VM::new().run(&function, &mut Environment::default());
    assert_eq!(result, Ok(Value::from(100)));
  }

  #[test]
  fn faults_report_line_and_callers() {
    let body = vec![
      E::function(
        "fail",
        &[],
        E::binary(BinaryOperator::Divide, E::number(1.0), E::number(0.0)).at(2),
      )
      .at(1),
      E::binary(
        BinaryOperator::Plus,
        E::call(E::variable("fail"), vec![]).at(4),
        E::number(1.0),
      )
      .at(4),
    ];

    let error = run(body).unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::DivisionByZero);
    assert_eq!(error.line, 2);
    assert_eq!(error.trace, vec![4]);
  }

  #[test]
  fn calling_non_functions_and_wrong_arity() {
    let error = run(vec![E::call(E::number(3.0), vec![])]).unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::TypeMismatch);

    let error = run(vec![
      E::function("id", &["x"], E::variable("x")),
      E::call(E::variable("id"), vec![]),
    ])
    .unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::ArityMismatch);
    assert_eq!(error.message, "Function 'id' expected 1 arguments but got 0");
  }

  #[test]
  fn undefined_names_fault_when_evaluated() {
    let error = run(vec![E::variable("missing")]).unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::UndefinedVariable);
    assert_eq!(error.message, "Undefined variable 'missing'");

    let error = run(vec![E::assign("missing", E::number(1.0))]).unwrap_err();
    assert_eq!(
      error.message,
      "Cannot reassign undefined variable 'missing'"
    );

    // never evaluated, so never a fault
    let result = run(vec![E::if_(
      E::boolean(false),
      E::variable("missing"),
      Some(E::number(2.0)),
    )]);
    assert_eq!(result, Ok(Value::from(2)));
  }

  #[test]
  fn for_loop_checks_its_bounds() {
    let error = run(vec![E::for_(
      "i",
      E::number(1.0),
      E::number(3.0),
      Some(E::number(0.0)),
      E::variable("i"),
    )])
    .unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::InvalidLoopStep);

    let error = run(vec![E::for_(
      "i",
      E::string("a"),
      E::number(3.0),
      None,
      E::variable("i"),
    )])
    .unwrap_err();
    assert_eq!(error.message, "Start value must be a number");
  }

  #[test]
  fn globals_survive_faults() {
    let mut environment = Environment::default();
    let function = compile(&Program::new(vec![
      E::let_("kept", E::number(1.0)),
      E::binary(BinaryOperator::Remainder, E::number(10.0), E::number(0.0)),
    ]))
    .unwrap();

    let error = VM::new().run(&function, &mut environment).unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::DivisionByZero);
    assert_eq!(environment.get_global("kept"), Some(Value::from(1)));
  }

  #[test]
  fn corrupt_bytecode_is_a_diagnostic() {
    let mut chunk = Chunk::new();
    chunk.write_opcode(OpCode::Constant, 1);
    chunk.write_value(7, 1);
    chunk.write_opcode(OpCode::Return, 1);
    let function = Rc::new(Function::script(chunk.finalize(), 0));

    let error = VM::new()
      .run(&function, &mut Environment::default())
      .unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::InvalidBytecode);

    let function = Rc::new(Function::script(Chunk::new(), 0));
    let error = VM::new()
      .run(&function, &mut Environment::default())
      .unwrap_err();
    assert_eq!(error.kind, DiagnosticKind::InvalidBytecode);
  }
}
