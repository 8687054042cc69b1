//! Native functions available in every environment.

use crate::{
  diagnostic::Fault,
  value::{NativeFunction, NativeResult, Value},
  vm::Environment,
};

pub fn register(environment: &mut Environment) {
  environment.define_native(NativeFunction::new("len", 1, len));
  environment.define_native(NativeFunction::new("push", 2, push));
  environment.define_native(NativeFunction::new("keys", 1, keys));
  environment.define_native(NativeFunction::new("str", 1, str));
}

fn argument_count(name: &str, expected: usize, args: &[Value]) -> Fault {
  Fault::arity(name, expected, args.len())
}

fn len(args: &[Value]) -> NativeResult {
  let [value] = args else {
    return Err(argument_count("len", 1, args));
  };

  match value {
    Value::String(string) => Ok(Value::from(string.chars().count())),
    Value::Array(array) => Ok(Value::from(array.borrow().len())),
    Value::Dictionary(dictionary) => Ok(Value::from(dictionary.borrow().len())),
    other => Err(Fault::type_mismatch(format!(
      "Cannot get the length of type {}",
      other.get_type()
    ))),
  }
}

fn push(args: &[Value]) -> NativeResult {
  let [target, value] = args else {
    return Err(argument_count("push", 2, args));
  };

  match target {
    Value::Array(array) => {
      array.borrow_mut().push(value.clone());
      Ok(target.clone())
    }
    other => Err(Fault::type_mismatch(format!(
      "Can only push to an array, got {}",
      other.get_type()
    ))),
  }
}

fn keys(args: &[Value]) -> NativeResult {
  let [value] = args else {
    return Err(argument_count("keys", 1, args));
  };

  match value {
    Value::Dictionary(dictionary) => {
      let keys = dictionary
        .borrow()
        .keys()
        .map(|key| Value::String(key.clone()))
        .collect();
      Ok(Value::array(keys))
    }
    other => Err(Fault::type_mismatch(format!(
      "Can only get the keys of a dictionary, got {}",
      other.get_type()
    ))),
  }
}

fn str(args: &[Value]) -> NativeResult {
  let [value] = args else {
    return Err(argument_count("str", 1, args));
  };

  Ok(Value::from(value.to_string()))
}
