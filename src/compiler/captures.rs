use crate::ast::{Expr, Expression, Visitor};
use rustc_hash::FxHashSet;

/// Collects every name read or assigned inside a function nested within the
/// scanned code. Locals with these names have to live in cells. Names a nested
/// function declares itself are included too, which only costs a cell.
#[derive(Default)]
struct CaptureScanner {
  depth: usize,
  names: FxHashSet<String>,
}

impl Visitor for CaptureScanner {
  fn visit_function(&mut self, _function: &Expression, body: &Expression) {
    self.depth += 1;
    self.visit_expression(body);
    self.depth -= 1;
  }

  fn exit_expression(&mut self, expression: &Expression) {
    if self.depth == 0 {
      return;
    }

    if let Expr::Variable { name } | Expr::Assign { name, .. } = &expression.expr {
      self.names.insert(name.clone());
    }
  }
}

pub fn captured_names<'e>(body: impl IntoIterator<Item = &'e Expression>) -> FxHashSet<String> {
  let mut scanner = CaptureScanner::default();
  body
    .into_iter()
    .for_each(|expression| scanner.visit_expression(expression));

  scanner.names
}

#[cfg(test)]
mod test {
  use super::captured_names;
  use crate::ast::{BinaryOperator, Expression as E};

  #[test]
  fn only_names_inside_nested_functions() {
    let body = vec![
      E::let_("count", E::number(0.0)),
      E::let_("unused", E::number(1.0)),
      E::lambda(
        &[],
        E::block(vec![
          E::assign(
            "count",
            E::binary(BinaryOperator::Plus, E::variable("count"), E::number(1.0)),
          ),
          E::variable("step"),
        ]),
      ),
    ];

    let names = captured_names(&body);
    assert!(names.contains("count"));
    assert!(names.contains("step"));
    assert!(!names.contains("unused"));
  }

  #[test]
  fn looks_through_every_level_of_nesting() {
    let body = E::lambda(&[], E::lambda(&[], E::variable("deep")));
    assert!(captured_names([&body]).contains("deep"));

    let recursive = E::function("loop", &["n"], E::call(E::variable("loop"), vec![]));
    assert!(captured_names([&recursive]).contains("loop"));
  }
}
