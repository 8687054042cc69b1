//! The program tree handed to the compiler by an external parser.
//!
//! Every node is an [`Expression`], so every construct (including loops, `let` and
//! function definitions) produces exactly one value when run.

use std::fmt;
use std::ops::Deref;

pub type LineNumber = u32;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOperator {
  Plus,
  Minus,
  Multiply,
  Divide,
  IntegerDivide,
  Remainder,
  Power,
  Equal,
  NotEqual,
  Greater,
  GreaterEqual,
  Less,
  LessEqual,
  And,
  Or,
}
impl fmt::Display for BinaryOperator {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Self::Plus => write!(f, "+"),
      Self::Minus => write!(f, "-"),
      Self::Multiply => write!(f, "*"),
      Self::Divide => write!(f, "/"),
      Self::IntegerDivide => write!(f, "//"),
      Self::Remainder => write!(f, "rem"),
      Self::Power => write!(f, "**"),
      Self::Equal => write!(f, "=="),
      Self::NotEqual => write!(f, "!="),
      Self::Greater => write!(f, ">"),
      Self::GreaterEqual => write!(f, ">="),
      Self::Less => write!(f, "<"),
      Self::LessEqual => write!(f, "<="),
      Self::And => write!(f, "and"),
      Self::Or => write!(f, "or"),
    }
  }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOperator {
  Not,
  Minus,
}
impl fmt::Display for UnaryOperator {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Self::Not => write!(f, "not"),
      Self::Minus => write!(f, "-"),
    }
  }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Literal {
  Number(f64),
  Boolean(bool),
  String(String),
  Nil,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Pattern {
  /// Matches when the value equals the literal.
  Literal(Literal),
  /// `_`, matches anything without binding.
  Wildcard,
  /// Matches anything and binds it to the name.
  Binding(String),
  /// `[a, b]` matches arrays of exactly that length, `[a, *rest]` of at least
  /// the number of listed items. `rest` is bound to a new array of the remainder.
  Array {
    items: Vec<Pattern>,
    rest: Option<String>,
  },
}

#[derive(Clone, Debug, PartialEq)]
pub struct MatchArm {
  pub pattern: Pattern,
  pub body: Expression,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
  Literal(Literal),
  Variable {
    name: String,
  },
  Binary {
    operator: BinaryOperator,
    left: Box<Expression>,
    right: Box<Expression>,
  },
  Unary {
    operator: UnaryOperator,
    expression: Box<Expression>,
  },
  Let {
    name: String,
    value: Box<Expression>,
  },
  Assign {
    name: String,
    value: Box<Expression>,
  },
  Block {
    body: Vec<Expression>,
  },
  If {
    condition: Box<Expression>,
    then: Box<Expression>,
    otherwise: Option<Box<Expression>>,
  },
  While {
    condition: Box<Expression>,
    body: Box<Expression>,
  },
  For {
    variable: String,
    start: Box<Expression>,
    end: Box<Expression>,
    step: Option<Box<Expression>>,
    body: Box<Expression>,
  },
  RepeatUntil {
    body: Box<Expression>,
    condition: Box<Expression>,
  },
  Break,
  Continue,
  Function {
    name: Option<String>,
    parameters: Vec<String>,
    body: Box<Expression>,
  },
  Call {
    callee: Box<Expression>,
    arguments: Vec<Expression>,
  },
  Return {
    expression: Option<Box<Expression>>,
  },
  Array {
    items: Vec<Expression>,
  },
  Dictionary {
    items: Vec<(Expression, Expression)>,
  },
  Index {
    expression: Box<Expression>,
    index: Box<Expression>,
  },
  IndexAssign {
    expression: Box<Expression>,
    index: Box<Expression>,
    value: Box<Expression>,
  },
  Match {
    scrutinee: Box<Expression>,
    arms: Vec<MatchArm>,
  },
  Print {
    expression: Box<Expression>,
  },
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expression {
  pub expr: Expr,
  pub line: LineNumber,
}
impl Deref for Expression {
  type Target = Expr;
  fn deref(&self) -> &Expr {
    &self.expr
  }
}
impl From<Expr> for Expression {
  fn from(expr: Expr) -> Self {
    Self { expr, line: 0 }
  }
}

/// A whole parsed input: one file or one REPL entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Program {
  pub body: Vec<Expression>,
}
impl Program {
  pub fn new(body: Vec<Expression>) -> Self {
    Self { body }
  }
}

fn boxed(expression: impl Into<Expression>) -> Box<Expression> {
  Box::new(expression.into())
}

// Constructors for hosts building trees by hand. Nodes start on line 0 and are
// placed with `at`.
impl Expression {
  #[must_use]
  pub fn at(mut self, line: LineNumber) -> Self {
    self.line = line;
    self
  }

  pub fn number(value: f64) -> Self {
    Expr::Literal(Literal::Number(value)).into()
  }

  pub fn boolean(value: bool) -> Self {
    Expr::Literal(Literal::Boolean(value)).into()
  }

  pub fn string(value: &str) -> Self {
    Expr::Literal(Literal::String(value.to_string())).into()
  }

  pub fn nil() -> Self {
    Expr::Literal(Literal::Nil).into()
  }

  pub fn variable(name: &str) -> Self {
    Expr::Variable {
      name: name.to_string(),
    }
    .into()
  }

  pub fn binary(operator: BinaryOperator, left: Self, right: Self) -> Self {
    Expr::Binary {
      operator,
      left: boxed(left),
      right: boxed(right),
    }
    .into()
  }

  pub fn unary(operator: UnaryOperator, expression: Self) -> Self {
    Expr::Unary {
      operator,
      expression: boxed(expression),
    }
    .into()
  }

  pub fn let_(name: &str, value: Self) -> Self {
    Expr::Let {
      name: name.to_string(),
      value: boxed(value),
    }
    .into()
  }

  pub fn assign(name: &str, value: Self) -> Self {
    Expr::Assign {
      name: name.to_string(),
      value: boxed(value),
    }
    .into()
  }

  pub fn block(body: Vec<Self>) -> Self {
    Expr::Block { body }.into()
  }

  pub fn if_(condition: Self, then: Self, otherwise: Option<Self>) -> Self {
    Expr::If {
      condition: boxed(condition),
      then: boxed(then),
      otherwise: otherwise.map(boxed),
    }
    .into()
  }

  pub fn while_(condition: Self, body: Self) -> Self {
    Expr::While {
      condition: boxed(condition),
      body: boxed(body),
    }
    .into()
  }

  pub fn for_(variable: &str, start: Self, end: Self, step: Option<Self>, body: Self) -> Self {
    Expr::For {
      variable: variable.to_string(),
      start: boxed(start),
      end: boxed(end),
      step: step.map(boxed),
      body: boxed(body),
    }
    .into()
  }

  pub fn repeat_until(body: Self, condition: Self) -> Self {
    Expr::RepeatUntil {
      body: boxed(body),
      condition: boxed(condition),
    }
    .into()
  }

  pub fn break_() -> Self {
    Expr::Break.into()
  }

  pub fn continue_() -> Self {
    Expr::Continue.into()
  }

  pub fn function(name: &str, parameters: &[&str], body: Self) -> Self {
    Expr::Function {
      name: Some(name.to_string()),
      parameters: parameters.iter().map(ToString::to_string).collect(),
      body: boxed(body),
    }
    .into()
  }

  pub fn lambda(parameters: &[&str], body: Self) -> Self {
    Expr::Function {
      name: None,
      parameters: parameters.iter().map(ToString::to_string).collect(),
      body: boxed(body),
    }
    .into()
  }

  pub fn call(callee: Self, arguments: Vec<Self>) -> Self {
    Expr::Call {
      callee: boxed(callee),
      arguments,
    }
    .into()
  }

  pub fn return_(expression: Option<Self>) -> Self {
    Expr::Return {
      expression: expression.map(boxed),
    }
    .into()
  }

  pub fn array(items: Vec<Self>) -> Self {
    Expr::Array { items }.into()
  }

  pub fn dictionary(items: Vec<(Self, Self)>) -> Self {
    Expr::Dictionary { items }.into()
  }

  pub fn index(expression: Self, index: Self) -> Self {
    Expr::Index {
      expression: boxed(expression),
      index: boxed(index),
    }
    .into()
  }

  pub fn index_assign(expression: Self, index: Self, value: Self) -> Self {
    Expr::IndexAssign {
      expression: boxed(expression),
      index: boxed(index),
      value: boxed(value),
    }
    .into()
  }

  pub fn match_(scrutinee: Self, arms: Vec<MatchArm>) -> Self {
    Expr::Match {
      scrutinee: boxed(scrutinee),
      arms,
    }
    .into()
  }

  pub fn print(expression: Self) -> Self {
    Expr::Print {
      expression: boxed(expression),
    }
    .into()
  }
}

impl MatchArm {
  pub fn new(pattern: Pattern, body: Expression) -> Self {
    Self { pattern, body }
  }
}

impl Pattern {
  pub fn binding(name: &str) -> Self {
    Self::Binding(name.to_string())
  }

  pub fn empty_array() -> Self {
    Self::Array {
      items: Vec::new(),
      rest: None,
    }
  }

  /// `[head, *tail]`
  pub fn head_tail(head: &str, tail: &str) -> Self {
    Self::Array {
      items: vec![Self::binding(head)],
      rest: Some(tail.to_string()),
    }
  }

  pub fn bound_names(&self) -> Vec<&str> {
    match self {
      Self::Literal(_) | Self::Wildcard => Vec::new(),
      Self::Binding(name) => vec![name.as_str()],
      Self::Array { items, rest } => items
        .iter()
        .flat_map(Self::bound_names)
        .chain(rest.as_deref())
        .collect(),
    }
  }
}

pub trait Visitor {
  fn visit(&mut self, program: &Program) {
    program.body.iter().for_each(|e| self.visit_expression(e));
  }

  fn visit_expression(&mut self, expression: &Expression) {
    match &expression.expr {
      Expr::Literal(_) | Expr::Variable { .. } | Expr::Break | Expr::Continue => {}
      Expr::Unary { expression, .. }
      | Expr::Let {
        value: expression, ..
      }
      | Expr::Assign {
        value: expression, ..
      }
      | Expr::Print { expression } => self.visit_expression(expression),
      Expr::Binary { left, right, .. } => {
        self.visit_expression(left);
        self.visit_expression(right);
      }
      Expr::Block { body } | Expr::Array { items: body } => {
        body.iter().for_each(|e| self.visit_expression(e));
      }
      Expr::If {
        condition,
        then,
        otherwise,
      } => {
        self.visit_expression(condition);
        self.visit_expression(then);
        if let Some(otherwise) = otherwise {
          self.visit_expression(otherwise);
        }
      }
      Expr::While { condition, body } | Expr::RepeatUntil { body, condition } => {
        self.visit_expression(condition);
        self.visit_expression(body);
      }
      Expr::For {
        start,
        end,
        step,
        body,
        ..
      } => {
        self.visit_expression(start);
        self.visit_expression(end);
        if let Some(step) = step {
          self.visit_expression(step);
        }
        self.visit_expression(body);
      }
      Expr::Function { body, .. } => self.visit_function(expression, body),
      Expr::Call { callee, arguments } => {
        self.visit_expression(callee);
        arguments.iter().for_each(|a| self.visit_expression(a));
      }
      Expr::Return { expression } => {
        if let Some(expression) = expression {
          self.visit_expression(expression);
        }
      }
      Expr::Dictionary { items } => {
        for (key, value) in items {
          self.visit_expression(key);
          self.visit_expression(value);
        }
      }
      Expr::Index { expression, index } => {
        self.visit_expression(expression);
        self.visit_expression(index);
      }
      Expr::IndexAssign {
        expression,
        index,
        value,
      } => {
        self.visit_expression(expression);
        self.visit_expression(index);
        self.visit_expression(value);
      }
      Expr::Match { scrutinee, arms } => {
        self.visit_expression(scrutinee);
        arms.iter().for_each(|arm| self.visit_expression(&arm.body));
      }
    }

    self.exit_expression(expression);
  }

  fn visit_function(&mut self, _function: &Expression, body: &Expression) {
    self.visit_expression(body);
  }

  fn exit_expression(&mut self, _expression: &Expression) {}
}
