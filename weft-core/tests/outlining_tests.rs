//! End-to-end tests for the outlining pass.
//!
//! Each test builds a module with repeated instruction sequences, runs the
//! pass, and checks the synthesized callees, the replaced call sites, and
//! the invariants the filter pipeline guarantees.

use weft_core::outlining;
use weft_core::{BinaryOp, ExprId, ExprKind, Function, Literal, Module, Pass, PassOptions, Type};

fn reachable(func: &Function) -> Vec<ExprId> {
    match func.body {
        Some(body) => func.arena.postorder(body),
        None => vec![],
    }
}

fn count_kind(func: &Function, pred: impl Fn(&ExprKind) -> bool) -> usize {
    reachable(func)
        .into_iter()
        .filter(|&id| pred(func.arena.kind(id)))
        .count()
}

fn has_kind(func: &Function, pred: impl Fn(&ExprKind) -> bool) -> bool {
    count_kind(func, pred) > 0
}

fn calls_to(func: &Function, target: &str) -> usize {
    count_kind(func, |k| matches!(k, ExprKind::Call { target: t, .. } if t == target))
}

fn push_import(module: &mut Module, name: &str, params: Vec<Type>, results: Vec<Type>) {
    let mut f = Function::new(name, params, results);
    f.body = None;
    module.functions.push(f);
}

/// (func $name (block (drop (i32.add (call $producer) (i32.const k)))))
fn tail_func(name: &str, producer: &str, k: i32) -> Function {
    let mut f = Function::new(name, vec![], vec![]);
    let call = f.arena.alloc(
        ExprKind::Call {
            target: producer.into(),
            operands: vec![],
            is_return: false,
        },
        Type::I32,
    );
    let c = f.arena.alloc(
        ExprKind::Const {
            literal: Literal::I32(k),
        },
        Type::I32,
    );
    let add = f.arena.alloc(
        ExprKind::Binary {
            op: BinaryOp::I32Add,
            left: call,
            right: c,
        },
        Type::I32,
    );
    let dropped = f.arena.alloc(ExprKind::Drop { value: add }, Type::None);
    let body = f.arena.alloc(
        ExprKind::Block {
            name: None,
            list: vec![dropped],
        },
        Type::None,
    );
    f.body = Some(body);
    f
}

/// Two functions ending in the same const/add/drop tail share one outlined
/// callee with signature (i32) -> ().
#[test]
fn test_identical_tails_outline_once() {
    let mut module = Module::new();
    push_import(&mut module, "imp_a", vec![], vec![Type::I32]);
    push_import(&mut module, "imp_b", vec![], vec![Type::I32]);
    // Different producers keep the repeat to exactly const/add/drop.
    module.functions.push(tail_func("f", "imp_a", 10));
    module.functions.push(tail_func("g", "imp_b", 10));

    let stats = outlining::run(&mut module, &PassOptions::default()).unwrap();
    assert_eq!(stats.functions_created, 1);
    assert_eq!(stats.sequences_replaced, 2);

    // The callee moved to the front of the function list.
    let callee = &module.functions[0];
    assert!(callee.name.starts_with("outline$"));
    assert_eq!(callee.params, vec![Type::I32]);
    assert!(callee.results.is_empty());

    // Its body is drop(add(param, 10)).
    let body = callee.body.unwrap();
    match callee.arena.kind(body) {
        ExprKind::Drop { value } => match callee.arena.kind(*value) {
            ExprKind::Binary {
                op: BinaryOp::I32Add,
                left,
                right,
            } => {
                assert!(matches!(
                    callee.arena.kind(*left),
                    ExprKind::LocalGet { index: 0 }
                ));
                assert!(matches!(
                    callee.arena.kind(*right),
                    ExprKind::Const {
                        literal: Literal::I32(10)
                    }
                ));
            }
            other => panic!("expected add in callee, got {other:?}"),
        },
        other => panic!("expected drop in callee, got {other:?}"),
    }

    // Both originals now call it, with their own producers feeding the
    // argument.
    let name = module.functions[0].name.clone();
    for orig in ["f", "g"] {
        let func = module.get_function(orig).unwrap();
        assert_eq!(calls_to(func, &name), 1);
        assert!(!has_kind(func, |k| matches!(k, ExprKind::Binary { .. })));
        assert!(!has_kind(func, |k| matches!(k, ExprKind::Drop { .. })));
    }
}

/// Three occurrences inside one function become three calls to one
/// callee.
#[test]
fn test_repeats_within_one_function() {
    let mut module = Module::new();
    push_import(&mut module, "imp", vec![], vec![Type::I32]);

    let mut f = Function::new("f", vec![], vec![]);
    let mut items = Vec::new();
    for _ in 0..3 {
        let call = f.arena.alloc(
            ExprKind::Call {
                target: "imp".into(),
                operands: vec![],
                is_return: false,
            },
            Type::I32,
        );
        let c = f.arena.alloc(
            ExprKind::Const {
                literal: Literal::I32(7),
            },
            Type::I32,
        );
        let add = f.arena.alloc(
            ExprKind::Binary {
                op: BinaryOp::I32Add,
                left: call,
                right: c,
            },
            Type::I32,
        );
        let dropped = f.arena.alloc(ExprKind::Drop { value: add }, Type::None);
        items.push(dropped);
    }
    let body = f.arena.alloc(
        ExprKind::Block {
            name: None,
            list: items,
        },
        Type::None,
    );
    f.body = Some(body);
    module.functions.push(f);

    let stats = outlining::run(&mut module, &PassOptions::default()).unwrap();
    assert_eq!(stats.functions_created, 1);
    assert_eq!(stats.sequences_replaced, 3);

    let callee_name = module.functions[0].name.clone();
    assert!(callee_name.starts_with("outline$"));
    // The whole repeat, producer included, moved into the callee.
    let callee = &module.functions[0];
    assert!(callee.params.is_empty());
    assert!(callee.results.is_empty());
    assert_eq!(calls_to(callee, "imp"), 1);

    let f = module.get_function("f").unwrap();
    assert_eq!(calls_to(f, &callee_name), 3);
    assert_eq!(calls_to(f, "imp"), 0);
}

/// Sequences touching locals are rejected: the callee would read or write
/// the wrong function's locals.
#[test]
fn test_local_accesses_are_not_outlined() {
    let mut module = Module::new();
    for name in ["f", "g"] {
        let mut f = Function::new(name, vec![Type::I32], vec![]);
        let get = f.arena.alloc(ExprKind::LocalGet { index: 0 }, Type::I32);
        let c = f.arena.alloc(
            ExprKind::Const {
                literal: Literal::I32(10),
            },
            Type::I32,
        );
        let add = f.arena.alloc(
            ExprKind::Binary {
                op: BinaryOp::I32Add,
                left: get,
                right: c,
            },
            Type::I32,
        );
        let dropped = f.arena.alloc(ExprKind::Drop { value: add }, Type::None);
        f.body = Some(dropped);
        module.functions.push(f);
    }

    let stats = outlining::run(&mut module, &PassOptions::default()).unwrap();
    assert_eq!(stats.functions_created, 0);
    assert!(module.functions.iter().all(|f| !f.name.starts_with("outline$")));
    // The originals are untouched.
    let f = module.get_function("f").unwrap();
    assert!(has_kind(f, |k| matches!(k, ExprKind::LocalGet { .. })));
    assert!(has_kind(f, |k| matches!(k, ExprKind::Binary { .. })));
}

/// Sequences containing a return are rejected.
#[test]
fn test_returns_are_not_outlined() {
    let mut module = Module::new();
    push_import(&mut module, "imp", vec![], vec![Type::I32]);
    for name in ["f", "g"] {
        let mut f = Function::new(name, vec![], vec![]);
        let call = f.arena.alloc(
            ExprKind::Call {
                target: "imp".into(),
                operands: vec![],
                is_return: false,
            },
            Type::I32,
        );
        let dropped = f.arena.alloc(ExprKind::Drop { value: call }, Type::None);
        let ret = f.arena.alloc(ExprKind::Return { value: None }, Type::Unreachable);
        let body = f.arena.alloc(
            ExprKind::Block {
                name: None,
                list: vec![dropped, ret],
            },
            Type::None,
        );
        f.body = Some(body);
        module.functions.push(f);
    }

    let stats = outlining::run(&mut module, &PassOptions::default()).unwrap();
    assert_eq!(stats.functions_created, 0);
}

/// An unreachable-ended repeat keeps the unreachable type at each call
/// site.
#[test]
fn test_unreachable_tail_preserved_at_call_sites() {
    let mut module = Module::new();
    push_import(&mut module, "imp", vec![], vec![Type::I32]);
    for name in ["f", "g"] {
        let mut f = Function::new(name, vec![], vec![]);
        let call = f.arena.alloc(
            ExprKind::Call {
                target: "imp".into(),
                operands: vec![],
                is_return: false,
            },
            Type::I32,
        );
        let dropped = f.arena.alloc(ExprKind::Drop { value: call }, Type::None);
        let trap = f.arena.alloc(ExprKind::Unreachable, Type::Unreachable);
        let body = f.arena.alloc(
            ExprKind::Block {
                name: None,
                list: vec![dropped, trap],
            },
            Type::None,
        );
        f.body = Some(body);
        module.functions.push(f);
    }

    let stats = outlining::run(&mut module, &PassOptions::default()).unwrap();
    assert_eq!(stats.functions_created, 1);

    let callee_name = module.functions[0].name.clone();
    // The callee carries the trap.
    assert!(has_kind(&module.functions[0], |k| matches!(
        k,
        ExprKind::Unreachable
    )));
    // Each call site is followed by an unreachable to keep its old type.
    for orig in ["f", "g"] {
        let func = module.get_function(orig).unwrap();
        assert_eq!(calls_to(func, &callee_name), 1);
        assert!(has_kind(func, |k| matches!(k, ExprKind::Unreachable)));
    }
}

/// Whatever is outlined, no callee may contain a branch, a return, or a
/// local access taken from the original program.
#[test]
fn test_callees_contain_no_branches_or_locals() {
    let mut module = Module::new();
    push_import(&mut module, "imp", vec![], vec![Type::I32]);
    module.functions.push(tail_func("f", "imp", 3));
    module.functions.push(tail_func("g", "imp", 3));
    // A function with control flow and locals around a repeated tail.
    for name in ["h", "i"] {
        let mut f = Function::new(name, vec![Type::I32], vec![]);
        let cond = f.arena.alloc(ExprKind::LocalGet { index: 0 }, Type::I32);
        let call = f.arena.alloc(
            ExprKind::Call {
                target: "imp".into(),
                operands: vec![],
                is_return: false,
            },
            Type::I32,
        );
        let drop_call = f.arena.alloc(ExprKind::Drop { value: call }, Type::None);
        let iff = f.arena.alloc(
            ExprKind::If {
                condition: cond,
                if_true: drop_call,
                if_false: None,
            },
            Type::None,
        );
        let call2 = f.arena.alloc(
            ExprKind::Call {
                target: "imp".into(),
                operands: vec![],
                is_return: false,
            },
            Type::I32,
        );
        let c = f.arena.alloc(
            ExprKind::Const {
                literal: Literal::I32(3),
            },
            Type::I32,
        );
        let add = f.arena.alloc(
            ExprKind::Binary {
                op: BinaryOp::I32Add,
                left: call2,
                right: c,
            },
            Type::I32,
        );
        let drop_add = f.arena.alloc(ExprKind::Drop { value: add }, Type::None);
        let body = f.arena.alloc(
            ExprKind::Block {
                name: None,
                list: vec![iff, drop_add],
            },
            Type::None,
        );
        f.body = Some(body);
        module.functions.push(f);
    }

    outlining::run(&mut module, &PassOptions::default()).unwrap();

    for func in module.functions.iter().filter(|f| f.name.starts_with("outline$")) {
        assert!(!has_kind(func, |k| k.is_branch()));
        assert!(!has_kind(func, |k| matches!(
            k,
            ExprKind::LocalSet { .. } | ExprKind::LocalTee { .. }
        )));
        // The only local reads are the parameter forwarding gets the
        // builder synthesized.
        for id in reachable(func) {
            if let ExprKind::LocalGet { index } = func.arena.kind(id) {
                assert!((*index as usize) < func.params.len());
            }
        }
    }
}

/// Repeats inside nested control flow outline within their scope.
#[test]
fn test_outlines_inside_nested_scopes() {
    let mut module = Module::new();
    push_import(&mut module, "imp", vec![], vec![Type::I32]);
    for name in ["f", "g"] {
        let mut f = Function::new(name, vec![Type::I32], vec![]);
        let cond = f.arena.alloc(ExprKind::LocalGet { index: 0 }, Type::I32);
        let call = f.arena.alloc(
            ExprKind::Call {
                target: "imp".into(),
                operands: vec![],
                is_return: false,
            },
            Type::I32,
        );
        let c = f.arena.alloc(
            ExprKind::Const {
                literal: Literal::I32(5),
            },
            Type::I32,
        );
        let add = f.arena.alloc(
            ExprKind::Binary {
                op: BinaryOp::I32Add,
                left: call,
                right: c,
            },
            Type::I32,
        );
        let dropped = f.arena.alloc(ExprKind::Drop { value: add }, Type::None);
        let iff = f.arena.alloc(
            ExprKind::If {
                condition: cond,
                if_true: dropped,
                if_false: None,
            },
            Type::None,
        );
        f.body = Some(iff);
        module.functions.push(f);
    }

    let stats = outlining::run(&mut module, &PassOptions::default()).unwrap();
    assert_eq!(stats.functions_created, 1);

    let callee_name = module.functions[0].name.clone();
    for orig in ["f", "g"] {
        let func = module.get_function(orig).unwrap();
        // The if survives; its arm is now (a block around) the call.
        assert!(has_kind(func, |k| matches!(k, ExprKind::If { .. })));
        assert_eq!(calls_to(func, &callee_name), 1);
    }
}

/// The pass factory runs through the `Pass` trait.
#[test]
fn test_pass_factory_runs() {
    let mut module = Module::new();
    push_import(&mut module, "imp", vec![], vec![Type::I32]);
    module.functions.push(tail_func("f", "imp", 2));
    module.functions.push(tail_func("g", "imp", 2));

    let mut pass = weft_core::create_outlining_pass();
    assert_eq!(pass.name(), "outlining");
    pass.run(&mut module, &PassOptions::default()).unwrap();
    assert!(module.functions[0].name.starts_with("outline$"));
}
