mod functions;
pub mod indexing;
mod operators;

pub use functions::{Captures, CaptureKind, Cell, Closure, Function, NativeFunction, NativeResult};
use rustc_hash::FxHashSet;
use std::{cell::RefCell, collections::BTreeMap, fmt, mem, rc::Rc};

pub type Array = Rc<RefCell<Vec<Value>>>;
pub type Dictionary = Rc<RefCell<BTreeMap<Rc<str>, Value>>>;

#[derive(Clone, Default)]
pub enum Value {
  #[default]
  Null,
  Boolean(bool),
  Number(f64),
  String(Rc<str>),
  Array(Array),
  Dictionary(Dictionary),
  Closure(Rc<Closure>),
  NativeFunction(Rc<NativeFunction>),
}

impl Value {
  pub fn is_falsy(&self) -> bool {
    match self {
      Self::Null => true,
      Self::Boolean(value) => !value,
      Self::Number(value) => *value == 0.0,
      Self::String(value) => value.is_empty(),
      Self::Array(_) | Self::Dictionary(_) | Self::Closure(_) | Self::NativeFunction(_) => false,
    }
  }

  pub fn get_type(&self) -> &'static str {
    match self {
      Self::Null => "nil",
      Self::Boolean(_) => "boolean",
      Self::Number(_) => "number",
      Self::String(_) => "string",
      Self::Array(_) => "array",
      Self::Dictionary(_) => "dictionary",
      Self::Closure(_) | Self::NativeFunction(_) => "function",
    }
  }

  pub fn is_number(&self) -> bool {
    matches!(self, Self::Number(_))
  }

  pub fn as_number(&self) -> Option<f64> {
    match self {
      Self::Number(number) => Some(*number),
      _ => None,
    }
  }

  pub fn as_array(&self) -> Option<&Array> {
    match self {
      Self::Array(array) => Some(array),
      _ => None,
    }
  }

  pub fn array(items: Vec<Value>) -> Self {
    Self::Array(Rc::new(RefCell::new(items)))
  }

  pub fn dictionary(items: BTreeMap<Rc<str>, Value>) -> Self {
    Self::Dictionary(Rc::new(RefCell::new(items)))
  }

  fn format(&self, f: &mut fmt::Formatter, nested: bool) -> fmt::Result {
    let mut seen = FxHashSet::default();
    let mut pending = vec![Piece::Value(self.clone(), nested)];

    while let Some(piece) = pending.pop() {
      let value = match piece {
        Piece::Text(text) => {
          f.write_str(text)?;
          continue;
        }
        Piece::Key(key) => {
          write!(f, "{key:?}: ")?;
          continue;
        }
        Piece::Leave(pointer) => {
          seen.remove(&pointer);
          continue;
        }
        Piece::Value(value, nested) => {
          match &value {
            Self::Null => write!(f, "nil")?,
            Self::Boolean(value) => write!(f, "{value}")?,
            Self::Number(value) => write!(f, "{value}")?,
            Self::String(value) if nested => write!(f, "{value:?}")?,
            Self::String(value) => write!(f, "{value}")?,
            Self::Closure(value) => write!(f, "<function {}>", value.function.name)?,
            Self::NativeFunction(value) => write!(f, "<function {}>", value.name)?,
            Self::Array(_) | Self::Dictionary(_) => {}
          }
          value
        }
      };

      match &value {
        Self::Array(items) => {
          let pointer = Rc::as_ptr(items).cast::<()>();
          if !seen.insert(pointer) {
            f.write_str("[...]")?;
            continue;
          }

          f.write_str("[")?;
          pending.push(Piece::Leave(pointer));
          pending.push(Piece::Text("]"));
          for (index, item) in items.borrow().iter().enumerate().rev() {
            pending.push(Piece::Value(item.clone(), true));
            if index > 0 {
              pending.push(Piece::Text(", "));
            }
          }
        }
        Self::Dictionary(entries) => {
          let pointer = Rc::as_ptr(entries).cast::<()>();
          if !seen.insert(pointer) {
            f.write_str("{...}")?;
            continue;
          }

          f.write_str("{")?;
          pending.push(Piece::Leave(pointer));
          pending.push(Piece::Text("}"));
          for (index, (key, item)) in entries.borrow().iter().enumerate().rev() {
            pending.push(Piece::Value(item.clone(), true));
            pending.push(Piece::Key(Rc::clone(key)));
            if index > 0 {
              pending.push(Piece::Text(", "));
            }
          }
        }
        _ => {}
      }
    }

    Ok(())
  }
}

/// Work item for rendering nested values without recursion.
enum Piece {
  Value(Value, bool),
  Key(Rc<str>),
  Text(&'static str),
  Leave(*const ()),
}

/// Compare two collections element by element. A pair of collections already
/// under comparison is assumed equal, so cyclic values terminate.
fn structurally_equal(left: &Value, right: &Value) -> bool {
  let mut seen = FxHashSet::default();
  let mut pending = vec![(left.clone(), right.clone())];

  while let Some((left, right)) = pending.pop() {
    match (&left, &right) {
      (Value::Array(left), Value::Array(right)) => {
        let pair = (Rc::as_ptr(left).cast::<()>(), Rc::as_ptr(right).cast::<()>());
        if Rc::ptr_eq(left, right) || !seen.insert(pair) {
          continue;
        }

        let (left, right) = (left.borrow(), right.borrow());
        if left.len() != right.len() {
          return false;
        }
        pending.extend(left.iter().cloned().zip(right.iter().cloned()));
      }
      (Value::Dictionary(left), Value::Dictionary(right)) => {
        let pair = (Rc::as_ptr(left).cast::<()>(), Rc::as_ptr(right).cast::<()>());
        if Rc::ptr_eq(left, right) || !seen.insert(pair) {
          continue;
        }

        let (left, right) = (left.borrow(), right.borrow());
        if left.len() != right.len() {
          return false;
        }
        for ((left_key, left), (right_key, right)) in left.iter().zip(right.iter()) {
          if left_key != right_key {
            return false;
          }
          pending.push((left.clone(), right.clone()));
        }
      }
      (left, right) => {
        if left != right {
          return false;
        }
      }
    }
  }

  true
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (Self::Null, Self::Null) => true,
      (Self::Boolean(value), Self::Boolean(other)) => value == other,
      (Self::Number(value), Self::Number(other)) => {
        value == other || (value - other).abs() < f64::EPSILON
      }
      (Self::String(value), Self::String(other)) => value == other,
      (Self::Array(_), Self::Array(_)) | (Self::Dictionary(_), Self::Dictionary(_)) => {
        structurally_equal(self, other)
      }
      (Self::Closure(value), Self::Closure(other)) => Rc::ptr_eq(value, other),
      (Self::NativeFunction(value), Self::NativeFunction(other)) => Rc::ptr_eq(value, other),
      _ => false,
    }
  }
}

// Unshared collections hand their items to a work list instead of dropping
// them recursively, so long chains free in constant stack.
impl Drop for Value {
  fn drop(&mut self) {
    fn take_items(value: &mut Value, pending: &mut Vec<Value>) {
      match value {
        Value::Array(items) => {
          if let Some(items) = Rc::get_mut(items) {
            pending.append(items.get_mut());
          }
        }
        Value::Dictionary(entries) => {
          if let Some(entries) = Rc::get_mut(entries) {
            pending.extend(mem::take(entries.get_mut()).into_values());
          }
        }
        _ => {}
      }
    }

    let mut pending = Vec::new();
    take_items(self, &mut pending);
    while let Some(mut value) = pending.pop() {
      take_items(&mut value, &mut pending);
    }
  }
}

impl fmt::Display for Value {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    self.format(f, false)
  }
}
impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    self.format(f, true)
  }
}

impl From<bool> for Value {
  fn from(value: bool) -> Self {
    Self::Boolean(value)
  }
}
impl From<f64> for Value {
  fn from(value: f64) -> Self {
    Self::Number(value)
  }
}
impl From<i32> for Value {
  fn from(value: i32) -> Self {
    Self::Number(f64::from(value))
  }
}
impl From<usize> for Value {
  #[allow(clippy::cast_precision_loss)]
  fn from(value: usize) -> Self {
    Self::Number(value as f64)
  }
}
impl From<&str> for Value {
  fn from(value: &str) -> Self {
    Self::String(Rc::from(value))
  }
}
impl From<String> for Value {
  fn from(value: String) -> Self {
    Self::String(Rc::from(value))
  }
}
impl From<Rc<str>> for Value {
  fn from(value: Rc<str>) -> Self {
    Self::String(value)
  }
}
impl From<Vec<Value>> for Value {
  fn from(value: Vec<Value>) -> Self {
    Self::array(value)
  }
}
impl From<Closure> for Value {
  fn from(value: Closure) -> Self {
    Self::Closure(Rc::new(value))
  }
}
impl From<NativeFunction> for Value {
  fn from(value: NativeFunction) -> Self {
    Self::NativeFunction(Rc::new(value))
  }
}
impl From<()> for Value {
  fn from(_: ()) -> Self {
    Self::Null
  }
}
