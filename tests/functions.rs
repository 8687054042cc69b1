use flux::Config;
use flux_test::*;

fn counter_factory() -> E {
  E::function(
    "make_counter",
    &[],
    E::block(vec![
      E::let_("count", num(0.0)),
      E::lambda(
        &[],
        E::block(vec![
          E::assign("count", bin(Op::Plus, var("count"), num(1.0))),
          var("count"),
        ]),
      ),
    ]),
  )
}

fn countdown() -> E {
  E::function(
    "countdown",
    &["n", "total"],
    E::if_(
      bin(Op::Equal, var("n"), num(0.0)),
      var("total"),
      Some(call(
        "countdown",
        vec![
          bin(Op::Minus, var("n"), num(1.0)),
          bin(Op::Plus, var("total"), num(1.0)),
        ],
      )),
    ),
  )
}

flux_test!(function_call
  [
    E::function("add", &["a", "b"], bin(Op::Plus, var("a"), var("b"))),
    E::let_("result", call("add", vec![num(2.0), num(5.0)])),
  ],
  result == 7
);

flux_test!(immediately_invoked_lambda
  [E::call(
    E::lambda(&["a", "b"], bin(Op::Multiply, var("a"), var("b"))),
    vec![num(3.0), num(4.0)],
  )]
  => 12
);

flux_test!(counters_do_not_interfere
  [
    counter_factory(),
    E::let_("a", call("make_counter", vec![])),
    E::let_("b", call("make_counter", vec![])),
    E::let_("first", call("a", vec![])),
    E::let_("second", call("a", vec![])),
    E::let_("other", call("b", vec![])),
  ],
  first == 1,
  second == 2,
  other == 1
);

flux_test!(closures_share_captured_cells
  [
    E::function(
      "pair",
      &[],
      E::block(vec![
        E::let_("n", num(0.0)),
        array(vec![
          E::lambda(&[], E::assign("n", bin(Op::Plus, var("n"), num(1.0)))),
          E::lambda(&[], var("n")),
        ]),
      ]),
    ),
    E::let_("p", call("pair", vec![])),
    E::call(E::index(var("p"), num(0.0)), vec![]),
    E::call(E::index(var("p"), num(0.0)), vec![]),
    E::let_("seen", E::call(E::index(var("p"), num(1.0)), vec![])),
  ],
  seen == 2
);

flux_test!(captures_through_several_levels
  [
    E::function(
      "outer",
      &[],
      E::block(vec![
        E::let_("x", num(1.0)),
        E::lambda(
          &[],
          E::lambda(
            &[],
            E::block(vec![
              E::assign("x", bin(Op::Plus, var("x"), num(1.0))),
              var("x"),
            ]),
          ),
        ),
      ]),
    ),
    E::let_("inner", E::call(call("outer", vec![]), vec![])),
    E::call(var("inner"), vec![]),
    E::let_("result", E::call(var("inner"), vec![])),
  ],
  result == 3
);

flux_test!(captured_parameters
  [
    E::function(
      "adder",
      &["n"],
      E::lambda(&["x"], bin(Op::Plus, var("x"), var("n"))),
    ),
    E::let_("add_five", call("adder", vec![num(5.0)])),
    E::let_("result", call("add_five", vec![num(10.0)])),
  ],
  result == 15
);

flux_test!(recursion
  [
    E::function(
      "fib",
      &["n"],
      E::if_(
        bin(Op::Less, var("n"), num(2.0)),
        var("n"),
        Some(bin(
          Op::Plus,
          call("fib", vec![bin(Op::Minus, var("n"), num(1.0))]),
          call("fib", vec![bin(Op::Minus, var("n"), num(2.0))]),
        )),
      ),
    ),
    E::let_("result", call("fib", vec![num(15.0)])),
  ],
  result == 610
);

flux_test!(local_recursive_function
  [E::block(vec![
    E::function(
      "fact",
      &["n"],
      E::if_(
        bin(Op::LessEqual, var("n"), num(1.0)),
        num(1.0),
        Some(bin(
          Op::Multiply,
          var("n"),
          call("fact", vec![bin(Op::Minus, var("n"), num(1.0))]),
        )),
      ),
    ),
    call("fact", vec![num(5.0)]),
  ])]
  => 120
);

flux_test!(sibling_functions_call_later_siblings
  [
    E::function(
      "outer",
      &[],
      E::block(vec![
        E::function("a", &[], call("b", vec![])),
        E::function("b", &[], num(1.0)),
        call("a", vec![]),
      ]),
    ),
    E::let_("result", call("outer", vec![])),
  ],
  result == 1
);

flux_test!(local_mutual_recursion
  [E::block(vec![
    E::function(
      "even",
      &["n"],
      E::if_(
        bin(Op::Equal, var("n"), num(0.0)),
        E::boolean(true),
        Some(call("odd", vec![bin(Op::Minus, var("n"), num(1.0))])),
      ),
    ),
    E::function(
      "odd",
      &["n"],
      E::if_(
        bin(Op::Equal, var("n"), num(0.0)),
        E::boolean(false),
        Some(call("even", vec![bin(Op::Minus, var("n"), num(1.0))])),
      ),
    ),
    call("even", vec![num(10_001.0)]),
  ])]
  => false
);

flux_test!(early_return
  [
    E::function(
      "sign",
      &["x"],
      E::block(vec![
        E::if_(
          bin(Op::Greater, var("x"), num(0.0)),
          E::return_(Some(string("positive"))),
          None,
        ),
        string("not positive"),
      ]),
    ),
    E::let_("a", call("sign", vec![num(1.0)])),
    E::let_("b", call("sign", vec![num(-1.0)])),
  ],
  a == "positive",
  b == "not positive"
);

flux_test!(empty_return_is_nil
  [
    E::function("nothing", &[], E::return_(None)),
    E::let_("result", bin(Op::Equal, call("nothing", vec![]), E::nil())),
  ],
  result == true
);

flux_test!(names_resolve_when_called
  [
    E::function("get", &[], var("later")),
    E::let_("later", num(5.0)),
    E::let_("result", call("get", vec![])),
  ],
  result == 5
);

flux_test!(tail_recursion_runs_in_constant_space
  [
    countdown(),
    E::let_("result", call("countdown", vec![num(100_000.0), num(0.0)])),
  ],
  result == 100_000
);

flux_test!(mutual_tail_calls
  [
    E::function(
      "even",
      &["n"],
      E::if_(
        bin(Op::Equal, var("n"), num(0.0)),
        E::boolean(true),
        Some(call("odd", vec![bin(Op::Minus, var("n"), num(1.0))])),
      ),
    ),
    E::function(
      "odd",
      &["n"],
      E::if_(
        bin(Op::Equal, var("n"), num(0.0)),
        E::boolean(false),
        Some(call("even", vec![bin(Op::Minus, var("n"), num(1.0))])),
      ),
    ),
    E::let_("result", call("even", vec![num(100_001.0)])),
  ],
  result == false
);

flux_test!(wrong_argument_count
  [
    E::function("one", &["a"], var("a")),
    call("one", vec![num(1.0), num(2.0)]),
  ]
  => Err(ArityMismatch)
);

flux_test!(calling_a_number
  [E::call(num(1.0), vec![])]
  => Err(TypeMismatch)
);

#[test]
fn tail_calls_keep_the_frame_stack_small() {
  let mut session = Session::with_config(Config { max_frames: 3 });
  let program = Program::new(vec![
    countdown(),
    call("countdown", vec![num(100_000.0), num(0.0)]),
  ]);

  assert_eq!(session.evaluate(&program), Ok(Value::from(100_000)));
}

#[test]
fn deep_non_tail_recursion_overflows() {
  let mut session = Session::new();
  let program = Program::new(vec![
    E::function(
      "depth",
      &["n"],
      E::if_(
        bin(Op::Equal, var("n"), num(0.0)),
        num(0.0),
        Some(bin(
          Op::Plus,
          num(1.0),
          call("depth", vec![bin(Op::Minus, var("n"), num(1.0))]),
        )),
      ),
    ),
    call("depth", vec![num(1_000_000.0)]),
  ]);

  let error = session.evaluate(&program).unwrap_err();
  assert_eq!(error.kind, DiagnosticKind::StackOverflow);

  let result = session.evaluate(&Program::new(vec![call("depth", vec![num(10.0)])]));
  assert_eq!(result, Ok(Value::from(10)));
}
