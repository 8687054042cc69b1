use super::Value;
use crate::diagnostic::{DiagnosticKind, Fault};

#[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
fn calculate_index(index: &Value, length: usize) -> Result<usize, Fault> {
  let Value::Number(number) = index else {
    return Err(Fault::type_mismatch(format!(
      "Array index must be a number, got {}",
      index.get_type()
    )));
  };

  if number.fract() != 0.0 {
    return Err(Fault::type_mismatch(format!(
      "Array index must be an integer, got {number}"
    )));
  }

  if *number < 0.0 || *number >= length as f64 {
    return Err(Fault::new(
      DiagnosticKind::IndexOutOfBounds,
      format!("Array index {number} out of bounds for length {length}"),
    ));
  }

  Ok(*number as usize)
}

fn dictionary_key(index: &Value) -> Result<&str, Fault> {
  match index {
    Value::String(key) => Ok(key),
    _ => Err(Fault::type_mismatch(format!(
      "Dictionary key must be a string, got {}",
      index.get_type()
    ))),
  }
}

/// Read `target[index]`.
pub fn get_index(target: &Value, index: &Value) -> Result<Value, Fault> {
  match target {
    Value::Array(array) => {
      let array = array.borrow();
      let index = calculate_index(index, array.len())?;
      Ok(array[index].clone())
    }
    Value::Dictionary(dictionary) => {
      let key = dictionary_key(index)?;
      dictionary.borrow().get(key).cloned().ok_or_else(|| {
        Fault::new(
          DiagnosticKind::KeyNotFound,
          format!("Key '{key}' not found in dictionary"),
        )
      })
    }
    Value::String(string) => {
      let length = string.chars().count();
      let index = calculate_index(index, length)?;
      Ok(string.chars().nth(index).map(String::from).into())
    }
    _ => Err(Fault::type_mismatch(format!(
      "Cannot index non-array type: {}",
      target.get_type()
    ))),
  }
}

/// Write `target[index] = value`. Arrays must already have the slot,
/// dictionaries insert missing keys.
pub fn set_index(target: &Value, index: &Value, value: Value) -> Result<(), Fault> {
  match target {
    Value::Array(array) => {
      let mut array = array.borrow_mut();
      let index = calculate_index(index, array.len())?;
      array[index] = value;
      Ok(())
    }
    Value::Dictionary(dictionary) => {
      let key = dictionary_key(index)?;
      dictionary.borrow_mut().insert(key.into(), value);
      Ok(())
    }
    _ => Err(Fault::type_mismatch(format!(
      "Cannot assign into an index of type: {}",
      target.get_type()
    ))),
  }
}

impl From<Option<String>> for Value {
  fn from(value: Option<String>) -> Self {
    value.map_or(Self::Null, Self::from)
  }
}

#[cfg(test)]
mod test {
  use super::{get_index, set_index};
  use crate::{diagnostic::DiagnosticKind, value::Value};
  use std::collections::BTreeMap;

  #[test]
  fn reads_array_elements() {
    let array = Value::from(vec![Value::from(1), Value::from(2)]);

    assert_eq!(get_index(&array, &Value::from(1)), Ok(Value::from(2)));
    assert_eq!(
      get_index(&array, &Value::from(2)).map_err(|fault| fault.kind),
      Err(DiagnosticKind::IndexOutOfBounds)
    );
    assert_eq!(
      get_index(&array, &Value::from(-1)).map_err(|fault| fault.kind),
      Err(DiagnosticKind::IndexOutOfBounds)
    );
    assert_eq!(
      get_index(&array, &Value::from(0.5)).map_err(|fault| fault.kind),
      Err(DiagnosticKind::TypeMismatch)
    );
  }

  #[test]
  fn writes_are_visible_through_every_reference() {
    let array = Value::from(vec![Value::from(1)]);
    let alias = array.clone();

    set_index(&array, &Value::from(0), Value::from("x")).unwrap();
    assert_eq!(alias.to_string(), "[\"x\"]");
  }

  #[test]
  fn dictionaries_insert_missing_keys() {
    let dictionary = Value::dictionary(BTreeMap::new());

    assert_eq!(
      get_index(&dictionary, &Value::from("a")).map_err(|fault| fault.kind),
      Err(DiagnosticKind::KeyNotFound)
    );
    set_index(&dictionary, &Value::from("a"), Value::from(3)).unwrap();
    assert_eq!(get_index(&dictionary, &Value::from("a")), Ok(Value::from(3)));
  }

  #[test]
  fn strings_index_by_character() {
    let string = Value::from("héllo");

    assert_eq!(get_index(&string, &Value::from(1)), Ok(Value::from("é")));
    assert_eq!(
      set_index(&string, &Value::from(1), Value::from("a")).map_err(|fault| fault.kind),
      Err(DiagnosticKind::TypeMismatch)
    );
  }

  #[test]
  fn numbers_are_not_indexable() {
    assert_eq!(
      get_index(&Value::from(1), &Value::from(0)).map_err(|fault| fault.kind),
      Err(DiagnosticKind::TypeMismatch)
    );
  }
}
