//! Runtime faults as values.
//!
//! Nothing in the compiler or VM aborts the host: every fault becomes a
//! [`Diagnostic`] which the driver prints before accepting more input.

use crate::ast::LineNumber;
use ariadne::{Label, Report, ReportKind, Source};
use std::{fmt, ops::Range};
use thiserror::Error;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum DiagnosticKind {
  DivisionByZero,
  UndefinedVariable,
  TypeMismatch,
  ArityMismatch,
  NonExhaustiveMatch,
  SyntaxError,
  IndexOutOfBounds,
  KeyNotFound,
  InvalidLoopStep,
  StackOverflow,
  CompileError,
  InvalidBytecode,
}
impl DiagnosticKind {
  pub fn get_title(self) -> &'static str {
    match self {
      Self::DivisionByZero => "Division By Zero",
      Self::UndefinedVariable => "Undefined Variable",
      Self::TypeMismatch => "Type Mismatch",
      Self::ArityMismatch => "Arity Mismatch",
      Self::NonExhaustiveMatch => "Non-Exhaustive Match",
      Self::SyntaxError => "Syntax Error",
      Self::IndexOutOfBounds => "Index Out Of Bounds",
      Self::KeyNotFound => "Key Not Found",
      Self::InvalidLoopStep => "Invalid Loop Step",
      Self::StackOverflow => "Stack Overflow",
      Self::CompileError => "Compile Error",
      Self::InvalidBytecode => "Invalid Bytecode",
    }
  }

  fn default_suggestion(self) -> &'static str {
    match self {
      Self::DivisionByZero => "Check that the divisor is not zero before dividing",
      Self::UndefinedVariable => "Declare the variable with `let` before using it",
      Self::TypeMismatch => "Check the types of the values used by this operation",
      Self::ArityMismatch => "Pass as many arguments as the function has parameters",
      Self::NonExhaustiveMatch => "Add a final arm with `_` to handle every other value",
      Self::SyntaxError => "Check the code near this line for typos",
      Self::IndexOutOfBounds => "Check the index against `len` before accessing the array",
      Self::KeyNotFound => "Check the key exists with `keys` before reading it",
      Self::InvalidLoopStep => "Use a non-zero number as the step of a `for` loop",
      Self::StackOverflow => {
        "Make the recursive call the last thing the function does so it runs in constant space"
      }
      Self::CompileError | Self::InvalidBytecode => "This is likely an error with the language",
    }
  }
}
impl fmt::Display for DiagnosticKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.get_title())
  }
}

/// A fault raised by a value operation, before the VM attaches its location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fault {
  pub kind: DiagnosticKind,
  pub message: String,
  pub suggestion: Option<String>,
}
impl Fault {
  pub fn new(kind: DiagnosticKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
      suggestion: None,
    }
  }

  #[must_use]
  pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
    self.suggestion = Some(suggestion.into());
    self
  }

  pub fn type_mismatch(message: impl Into<String>) -> Self {
    Self::new(DiagnosticKind::TypeMismatch, message)
  }

  pub fn arity(name: &str, expected: usize, received: usize) -> Self {
    Self::new(
      DiagnosticKind::ArityMismatch,
      format!("Function '{name}' expected {expected} arguments but got {received}"),
    )
  }

  pub fn into_diagnostic(self, line: LineNumber, trace: Vec<LineNumber>) -> Diagnostic {
    let suggestion = self
      .suggestion
      .unwrap_or_else(|| self.kind.default_suggestion().to_string());

    Diagnostic {
      kind: self.kind,
      message: self.message,
      line,
      suggestion,
      trace,
    }
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message} (line {line})")]
pub struct Diagnostic {
  pub kind: DiagnosticKind,
  pub message: String,
  pub line: LineNumber,
  pub suggestion: String,
  /// Lines of the calls still active when the fault happened, innermost first.
  pub trace: Vec<LineNumber>,
}

impl Diagnostic {
  pub fn new(kind: DiagnosticKind, message: impl Into<String>, line: LineNumber) -> Self {
    Fault::new(kind, message).into_diagnostic(line, Vec::new())
  }

  /// Wraps a fault reported by the external parser so it travels the same path
  /// as runtime faults.
  pub fn syntax_error(message: impl Into<String>, line: LineNumber) -> Self {
    Self::new(DiagnosticKind::SyntaxError, message, line)
  }

  /// Render a report pointing at the faulting line of `source`.
  pub fn render(&self, name: &str, source: &str) -> String {
    let span = line_span(source, self.line);
    let mut output = Vec::new();

    let mut report = Report::build(ReportKind::Error, name, span.start)
      .with_message(format!("{}: {}", self.kind, self.message))
      .with_label(Label::new((name, span)).with_message(&self.message))
      .with_note(&self.suggestion);

    for line in self.trace.iter().filter(|line| **line != self.line) {
      report = report.with_label(
        Label::new((name, line_span(source, *line))).with_message("called from here"),
      );
    }

    let written = report
      .finish()
      .write((name, Source::from(source)), &mut output);

    match written {
      Ok(()) => String::from_utf8_lossy(&output).into_owned(),
      Err(_) => format!("{self}\n{}", self.suggestion),
    }
  }
}

fn line_span(source: &str, line: LineNumber) -> Range<usize> {
  let mut start = 0;

  for (number, text) in source.split_inclusive('\n').enumerate() {
    if number + 1 == line as usize {
      return start..start + text.trim_end().len();
    }
    start += text.len();
  }

  0..0
}
