use super::Value;
use crate::diagnostic::{DiagnosticKind, Fault};

macro_rules! numeric_operands {
  ( $left:expr, $right:expr, $operator:expr ) => {
    match ($left, $right) {
      (Value::Number(left), Value::Number(right)) => (*left, *right),
      (left, right) => {
        return Err(Fault::type_mismatch(format!(
          "Operands of '{}' must be numbers, got {} and {}",
          $operator,
          left.get_type(),
          right.get_type()
        )))
      }
    }
  };
}

macro_rules! check_divisor {
  ( $right:expr, $message:expr ) => {
    if $right == 0.0 {
      return Err(Fault::new(DiagnosticKind::DivisionByZero, $message));
    }
  };
}

impl Value {
  fn is_stringifiable(&self) -> bool {
    matches!(
      self,
      Self::Number(_) | Self::Boolean(_) | Self::Closure(_) | Self::NativeFunction(_)
    )
  }

  pub fn add(&self, other: &Self) -> Result<Self, Fault> {
    match (self, other) {
      (Self::Number(left), Self::Number(right)) => Ok(Self::Number(left + right)),
      (Self::String(left), Self::String(right)) => Ok(format!("{left}{right}").into()),
      (Self::String(left), right) if right.is_stringifiable() => Ok(format!("{left}{right}").into()),
      (left, Self::String(right)) if left.is_stringifiable() => Ok(format!("{left}{right}").into()),
      (left, right) => Err(Fault::type_mismatch(format!(
        "Operands of '+' must be two numbers, two strings, or a string and another type, got {} and {}",
        left.get_type(),
        right.get_type()
      ))),
    }
  }

  pub fn subtract(&self, other: &Self) -> Result<Self, Fault> {
    let (left, right) = numeric_operands!(self, other, "-");
    Ok(Self::Number(left - right))
  }

  pub fn multiply(&self, other: &Self) -> Result<Self, Fault> {
    let (left, right) = numeric_operands!(self, other, "*");
    Ok(Self::Number(left * right))
  }

  pub fn divide(&self, other: &Self) -> Result<Self, Fault> {
    let (left, right) = numeric_operands!(self, other, "/");
    check_divisor!(right, "Division by zero");
    Ok(Self::Number(left / right))
  }

  pub fn integer_divide(&self, other: &Self) -> Result<Self, Fault> {
    let (left, right) = numeric_operands!(self, other, "//");
    check_divisor!(right, "Integer division by zero");
    Ok(Self::Number((left / right).floor()))
  }

  /// Remainder with the sign of the divisor.
  pub fn remainder(&self, other: &Self) -> Result<Self, Fault> {
    let (left, right) = numeric_operands!(self, other, "rem");
    check_divisor!(right, "Remainder by zero");
    Ok(Self::Number(left - right * (left / right).floor()))
  }

  pub fn power(&self, other: &Self) -> Result<Self, Fault> {
    let (left, right) = numeric_operands!(self, other, "**");
    Ok(Self::Number(left.powf(right)))
  }

  pub fn negate(&self) -> Result<Self, Fault> {
    match self {
      Self::Number(value) => Ok(Self::Number(-value)),
      _ => Err(Fault::type_mismatch(format!(
        "Operand of '-' must be a number, got {}",
        self.get_type()
      ))),
    }
  }

  pub fn less(&self, other: &Self) -> Result<Self, Fault> {
    self.compare(other, "<", |ordering| ordering.is_lt())
  }

  pub fn greater(&self, other: &Self) -> Result<Self, Fault> {
    self.compare(other, ">", |ordering| ordering.is_gt())
  }

  pub fn less_equal(&self, other: &Self) -> Result<Self, Fault> {
    self.compare(other, "<=", |ordering| ordering.is_le())
  }

  pub fn greater_equal(&self, other: &Self) -> Result<Self, Fault> {
    self.compare(other, ">=", |ordering| ordering.is_ge())
  }

  fn compare(
    &self,
    other: &Self,
    operator: &str,
    test: fn(std::cmp::Ordering) -> bool,
  ) -> Result<Self, Fault> {
    let ordering = match (self, other) {
      (Self::Number(left), Self::Number(right)) => left.partial_cmp(right),
      (Self::String(left), Self::String(right)) => Some(left.cmp(right)),
      (left, right) => {
        return Err(Fault::type_mismatch(format!(
          "Operands of '{operator}' must be two numbers or two strings, got {} and {}",
          left.get_type(),
          right.get_type()
        )))
      }
    };

    // comparisons involving NaN are always false
    Ok(Self::Boolean(ordering.map_or(false, test)))
  }
}
