use super::Value;
use crate::{chunk::Chunk, diagnostic::Fault};
use smallvec::SmallVec;
use std::{cell::RefCell, fmt, rc::Rc};

/// A single mutable storage location shared by every closure that captured it.
#[derive(Clone, Default)]
pub struct Cell(Rc<RefCell<Value>>);
impl Cell {
  pub fn new(value: Value) -> Self {
    Self(Rc::new(RefCell::new(value)))
  }

  pub fn get(&self) -> Value {
    self.0.borrow().clone()
  }

  pub fn set(&self, value: Value) {
    *self.0.borrow_mut() = value;
  }

  pub fn ptr_eq(&self, other: &Self) -> bool {
    Rc::ptr_eq(&self.0, &other.0)
  }
}
impl fmt::Debug for Cell {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "Cell({:?})", self.0.borrow())
  }
}

/// Where a closure finds a captured cell when it is created.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CaptureKind {
  /// A cell of the frame creating the closure.
  Local,
  /// An upvalue of the closure creating the closure.
  Upvalue,
}

pub type Captures = SmallVec<[(u8, CaptureKind); 8]>;

/// A compiled function prototype. Immutable after compilation.
#[derive(Clone, PartialEq)]
pub struct Function {
  pub name: Rc<str>,
  pub arity: u8,
  /// Number of cells a frame of this function owns.
  pub cells: u8,
  pub captures: Captures,
  pub chunk: Chunk,
}
impl Function {
  pub fn script(chunk: Chunk, cells: u8) -> Self {
    Self {
      name: Rc::from("<script>"),
      arity: 0,
      cells,
      captures: Captures::new(),
      chunk,
    }
  }

  pub fn check_arg_count(&self, provided: usize) -> Result<(), Fault> {
    if usize::from(self.arity) == provided {
      Ok(())
    } else {
      Err(Fault::arity(&self.name, self.arity.into(), provided))
    }
  }
}
impl Default for Function {
  fn default() -> Self {
    Self::script(Chunk::new(), 0)
  }
}
impl fmt::Debug for Function {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "<function {}>", self.name)
  }
}

#[derive(Clone)]
pub struct Closure {
  pub function: Rc<Function>,
  pub(crate) upvalues: SmallVec<[Cell; 4]>,
}
impl Closure {
  pub fn new(function: Rc<Function>, upvalues: SmallVec<[Cell; 4]>) -> Self {
    Self { function, upvalues }
  }
}

pub type NativeResult = Result<Value, Fault>;

pub struct NativeFunction {
  pub name: &'static str,
  pub arity: u8,
  pub func: fn(args: &[Value]) -> NativeResult,
}
impl NativeFunction {
  pub fn new(name: &'static str, arity: u8, func: fn(args: &[Value]) -> NativeResult) -> Self {
    Self { name, arity, func }
  }

  pub fn call(&self, args: &[Value]) -> NativeResult {
    if usize::from(self.arity) != args.len() {
      return Err(Fault::arity(self.name, self.arity.into(), args.len()));
    }

    (self.func)(args)
  }
}
