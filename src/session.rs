//! A long-lived evaluation context, fed one parsed input at a time.

use crate::{
  ast::Program,
  compiler::compile,
  diagnostic::Diagnostic,
  value::Value,
  vm::{Config, Environment, VM},
};
use std::io::Write;
use tracing::debug;

#[derive(Debug, Default)]
pub struct Session {
  environment: Environment,
  config: Config,
}

impl Session {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_config(config: Config) -> Self {
    Self {
      environment: Environment::new(),
      config,
    }
  }

  /// Send the output of `print` somewhere other than stdout.
  #[must_use]
  pub fn with_output(mut self, output: impl Write + 'static) -> Self {
    self.environment = Environment::with_output(output);
    self
  }

  pub fn environment(&self) -> &Environment {
    &self.environment
  }

  pub fn environment_mut(&mut self) -> &mut Environment {
    &mut self.environment
  }

  pub fn get_global(&self, name: &str) -> Option<Value> {
    self.environment.get_global(name)
  }

  /// Compile and run one input. A fault ends the input but leaves the session
  /// usable; globals set before the fault keep their new values.
  pub fn evaluate(&mut self, program: &Program) -> Result<Value, Diagnostic> {
    let function = compile(program)?;
    debug!(statements = program.body.len(), "evaluating input");

    VM::with_config(self.config).run(&function, &mut self.environment)
  }

  /// Evaluate the result of the external parser, passing its faults through.
  pub fn evaluate_parsed(
    &mut self,
    program: Result<Program, Diagnostic>,
  ) -> Result<Value, Diagnostic> {
    self.evaluate(&program?)
  }
}
