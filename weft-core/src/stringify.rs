//! Stringified program traversal and the substring filter pipeline.
//!
//! To find repeated instruction sequences with a linear substring search,
//! the module is flattened into a string of 32-bit symbols: one symbol per
//! instruction, interned so that identical instructions share a symbol, and
//! one globally unique symbol per control-flow separator (function starts,
//! scope starts, else/catch arms, scope ends). Because separators never
//! repeat, no repeated substring can span a control-flow boundary — the
//! traversal visits each scope's surface as one contiguous run, with nested
//! scopes deferred to the end.
//!
//! Control-flow structures occupy a surface position in their enclosing
//! scope; they are emitted there as unique symbols as well, so repeated
//! substrings consist purely of straight-line instructions.

use std::collections::VecDeque;

use rustc_hash::FxHashMap;

use crate::stack::{SignatureKind, StackSignature};
use crate::suffix_tree::RepeatedSubstring;
use crate::{ExprArena, ExprId, ExprKind, Function, HeapType, Literal, Module, RefType, Type};

/// One step of the stringified traversal of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrEvent {
    /// The function scope opens
    FuncStart,
    /// A deferred scope's contents begin
    ScopeStart(ExprId),
    /// The else arm of the current if scope begins
    Else,
    /// A catch arm of the current try scope begins
    Catch {
        /// Index into the try's catch list
        arm: usize,
    },
    /// The catch-all arm of the current try scope begins
    CatchAll,
    /// The current scope closes
    End,
    /// An instruction at its surface position
    Expr(ExprId),
}

/// The stringified traversal of one function: the surface of each scope is
/// visited in full before any nested scope's contents.
pub fn stringify_function(func: &Function) -> Vec<StrEvent> {
    let mut events = vec![StrEvent::FuncStart];
    let Some(body) = func.body else {
        return events;
    };
    let arena = &func.arena;
    let mut deferred: VecDeque<ExprId> = VecDeque::new();
    surface(arena, body, &mut events, &mut deferred);
    events.push(StrEvent::End);

    while let Some(scope) = deferred.pop_front() {
        events.push(StrEvent::ScopeStart(scope));
        match arena.kind(scope) {
            ExprKind::Block { list, .. } => {
                for &item in list {
                    surface(arena, item, &mut events, &mut deferred);
                }
            }
            ExprKind::Loop { body, .. } => {
                surface(arena, *body, &mut events, &mut deferred);
            }
            ExprKind::If {
                if_true, if_false, ..
            } => {
                surface(arena, *if_true, &mut events, &mut deferred);
                if let Some(if_false) = if_false {
                    events.push(StrEvent::Else);
                    surface(arena, *if_false, &mut events, &mut deferred);
                }
            }
            ExprKind::Try {
                body,
                catch_bodies,
                catch_all,
                ..
            } => {
                surface(arena, *body, &mut events, &mut deferred);
                for (arm, &catch) in catch_bodies.iter().enumerate() {
                    events.push(StrEvent::Catch { arm });
                    surface(arena, catch, &mut events, &mut deferred);
                }
                if let Some(catch_all) = catch_all {
                    events.push(StrEvent::CatchAll);
                    surface(arena, *catch_all, &mut events, &mut deferred);
                }
            }
            ExprKind::TryTable { body, .. } => {
                surface(arena, *body, &mut events, &mut deferred);
            }
            other => unreachable!("deferred non-scope {other:?}"),
        }
        events.push(StrEvent::End);
    }
    events
}

/// Emit the shallow post-order surface of `item`, deferring nested scopes.
fn surface(arena: &ExprArena, item: ExprId, events: &mut Vec<StrEvent>, deferred: &mut VecDeque<ExprId>) {
    let kind = arena.kind(item);
    if kind.is_control_flow() {
        // Value children outside the scope (an if condition) surface
        // before the structure itself.
        if let ExprKind::If { condition, .. } = kind {
            surface(arena, *condition, events, deferred);
        }
        events.push(StrEvent::Expr(item));
        deferred.push_back(item);
        return;
    }
    for child in arena.child_ids(item) {
        surface(arena, child, events, deferred);
    }
    events.push(StrEvent::Expr(item));
}

/// The stringified module: symbols, back-pointers to expressions, and the
/// function boundaries for [`ModuleString::make_relative`].
#[derive(Debug, Default)]
pub struct ModuleString {
    /// One interned symbol per position
    pub hash_string: Vec<u32>,
    /// The originating instruction of each position; `None` for separators
    /// (and for control-flow surface symbols, which behave as separators)
    pub exprs: Vec<Option<(usize, ExprId)>>,
    /// (global position of the function-start symbol, function index)
    func_starts: Vec<(usize, usize)>,
}

impl ModuleString {
    /// Stringify every defined function of `module`.
    pub fn build(module: &Module) -> ModuleString {
        let mut out = ModuleString::default();
        let mut interner: FxHashMap<SymbolKey, u32> = FxHashMap::default();
        let mut next: u32 = 0;
        for (fidx, func) in module.functions.iter().enumerate() {
            if func.is_import() {
                continue;
            }
            out.func_starts.push((out.hash_string.len(), fidx));
            for event in stringify_function(func) {
                match event {
                    StrEvent::Expr(id) if !func.arena.kind(id).is_control_flow() => {
                        let key = symbol_key(func, id);
                        let symbol = *interner.entry(key).or_insert_with(|| {
                            let s = next;
                            next += 1;
                            s
                        });
                        out.hash_string.push(symbol);
                        out.exprs.push(Some((fidx, id)));
                    }
                    _ => {
                        // Separators and control-flow surface positions:
                        // a fresh symbol every time, so nothing matches
                        // across them.
                        out.hash_string.push(next);
                        next += 1;
                        out.exprs.push(None);
                    }
                }
            }
        }
        out
    }

    /// Map a global position to its owning function and the 0-based event
    /// position within that function.
    pub fn make_relative(&self, global: usize) -> Option<(usize, usize)> {
        let at = self
            .func_starts
            .partition_point(|&(start, _)| start <= global)
            .checked_sub(1)?;
        let (start, fidx) = self.func_starts[at];
        Some((fidx, global - start))
    }
}

/// Identity of one instruction for interning: opcode, immediates, result
/// type, and operand types. Operand types are included so that matched
/// sequences are stack-compatible at every occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SymbolKey {
    tag: u16,
    imms: Vec<u64>,
    names: Vec<String>,
    ty: Type,
    child_tys: Vec<Type>,
}

fn encode_heap(heap: HeapType) -> u64 {
    match heap {
        HeapType::Any => 1 << 32,
        HeapType::Eq => 2 << 32,
        HeapType::Struct => 3 << 32,
        HeapType::Array => 4 << 32,
        HeapType::None => 5 << 32,
        HeapType::Def(d) => (6 << 32) | d.0 as u64,
    }
}

fn encode_ref(r: RefType) -> u64 {
    encode_heap(r.heap) | (r.nullable as u64) << 40
}

fn encode_literal(lit: Literal) -> (u64, u64) {
    match lit {
        Literal::I32(v) => (0, v as u32 as u64),
        Literal::I64(v) => (1, v as u64),
        Literal::F32(bits) => (2, bits as u64),
        Literal::F64(bits) => (3, bits),
    }
}

fn symbol_key(func: &Function, id: ExprId) -> SymbolKey {
    use ExprKind::*;
    let arena = &func.arena;
    let mut key = SymbolKey {
        tag: 0,
        imms: vec![],
        names: vec![],
        ty: arena.ty(id),
        child_tys: arena.child_ids(id).iter().map(|&c| arena.ty(c)).collect(),
    };
    match arena.kind(id) {
        Break {
            label,
            value,
            condition,
        } => {
            key.tag = 1;
            key.names.push(label.clone());
            key.imms
                .push(value.is_some() as u64 | (condition.is_some() as u64) << 1);
        }
        Switch {
            labels,
            default,
            value,
            ..
        } => {
            key.tag = 2;
            key.names.extend(labels.iter().cloned());
            key.names.push(default.clone());
            key.imms.push(value.is_some() as u64);
        }
        LocalGet { index } => {
            key.tag = 3;
            key.imms.push(*index as u64);
        }
        LocalSet { index, .. } => {
            key.tag = 4;
            key.imms.push(*index as u64);
        }
        LocalTee { index, .. } => {
            key.tag = 5;
            key.imms.push(*index as u64);
        }
        Drop { .. } => key.tag = 6,
        Call {
            target, is_return, ..
        } => {
            key.tag = 7;
            key.names.push(target.clone());
            key.imms.push(*is_return as u64);
        }
        Const { literal } => {
            key.tag = 8;
            let (t, bits) = encode_literal(*literal);
            key.imms.push(t);
            key.imms.push(bits);
        }
        Unreachable => key.tag = 9,
        Nop => key.tag = 10,
        Pop => key.tag = 11,
        Return { value } => {
            key.tag = 12;
            key.imms.push(value.is_some() as u64);
        }
        Binary { op, .. } => {
            key.tag = 13;
            key.imms.push(*op as u64);
        }
        RefNull { heap } => {
            key.tag = 14;
            key.imms.push(encode_heap(*heap));
        }
        RefIsNull { .. } => key.tag = 15,
        RefEq { .. } => key.tag = 16,
        RefAsNonNull { .. } => key.tag = 17,
        RefTest { cast_ty, .. } => {
            key.tag = 18;
            key.imms.push(encode_ref(*cast_ty));
        }
        RefCast { desc, .. } => {
            key.tag = 19;
            key.imms.push(desc.is_some() as u64);
        }
        RefGetDesc { .. } => key.tag = 20,
        StructNew { ty, operands, desc } => {
            key.tag = 21;
            key.imms.push(ty.0 as u64);
            key.imms.push(operands.len() as u64);
            key.imms.push(desc.is_some() as u64);
        }
        StructGet { index, signed, .. } => {
            key.tag = 22;
            key.imms.push(*index as u64);
            key.imms.push(*signed as u64);
        }
        StructSet { index, .. } => {
            key.tag = 23;
            key.imms.push(*index as u64);
        }
        StructRmw { op, index, .. } => {
            key.tag = 24;
            key.imms.push(*op as u64);
            key.imms.push(*index as u64);
        }
        StructCmpxchg { index, .. } => {
            key.tag = 25;
            key.imms.push(*index as u64);
        }
        ArrayNew { ty, init, .. } => {
            key.tag = 26;
            key.imms.push(ty.0 as u64);
            key.imms.push(init.is_some() as u64);
        }
        ArrayNewFixed { ty, values } => {
            key.tag = 27;
            key.imms.push(ty.0 as u64);
            key.imms.push(values.len() as u64);
        }
        ArrayGet { signed, .. } => {
            key.tag = 28;
            key.imms.push(*signed as u64);
        }
        ArraySet { .. } => key.tag = 29,
        ArrayRmw { op, .. } => {
            key.tag = 30;
            key.imms.push(*op as u64);
        }
        ArrayCmpxchg { .. } => key.tag = 31,
        Block { .. } | Loop { .. } | If { .. } | Try { .. } | TryTable { .. } => {
            unreachable!("control flow is emitted as unique symbols")
        }
    }
    key
}

// ---------------------------------------------------------------------------
// Substring filter pipeline
// ---------------------------------------------------------------------------

/// Remove any substring that is a subrange of a strictly longer one at the
/// same offsets (every occurrence shifted by one common delta).
pub fn dedupe(substrings: Vec<RepeatedSubstring>) -> Vec<RepeatedSubstring> {
    let keep = |a: &RepeatedSubstring| {
        !substrings.iter().any(|b| {
            if b.length <= a.length || b.start_indices.len() < a.start_indices.len() {
                return false;
            }
            b.start_indices.iter().any(|&b0| {
                let Some(delta) = a.start_indices[0].checked_sub(b0) else {
                    return false;
                };
                if delta + a.length > b.length {
                    return false;
                }
                a.start_indices.iter().all(|&s| {
                    s >= delta && b.start_indices.binary_search(&(s - delta)).is_ok()
                })
            })
        })
    };
    substrings.iter().filter(|a| keep(a)).cloned().collect()
}

/// Thin each substring's occurrences to a non-overlapping subset, greedy by
/// ascending start. Substrings left with fewer than two occurrences drop
/// out.
pub fn filter_overlaps(substrings: Vec<RepeatedSubstring>) -> Vec<RepeatedSubstring> {
    substrings
        .into_iter()
        .filter_map(|mut sub| {
            let mut kept = Vec::with_capacity(sub.start_indices.len());
            let mut next_free = 0usize;
            for &start in &sub.start_indices {
                if start >= next_free || kept.is_empty() {
                    next_free = start + sub.length;
                    kept.push(start);
                }
            }
            sub.start_indices = kept;
            (sub.start_indices.len() >= 2).then_some(sub)
        })
        .collect()
}

fn reject_containing(
    substrings: Vec<RepeatedSubstring>,
    module_string: &ModuleString,
    module: &Module,
    mut unwanted: impl FnMut(&ExprKind) -> bool,
) -> Vec<RepeatedSubstring> {
    substrings
        .into_iter()
        .filter(|sub| {
            let start = sub.start_indices[0];
            (start..start + sub.length).all(|pos| match module_string.exprs[pos] {
                Some((fidx, id)) => !unwanted(module.functions[fidx].arena.kind(id)),
                None => true,
            })
        })
        .collect()
}

/// Drop substrings containing a branch, return, or try_table: the branch
/// target would not travel with the outlined code.
pub fn filter_branches(
    substrings: Vec<RepeatedSubstring>,
    module_string: &ModuleString,
    module: &Module,
) -> Vec<RepeatedSubstring> {
    reject_containing(substrings, module_string, module, |kind| {
        kind.is_branch() || matches!(kind, ExprKind::TryTable { .. })
    })
}

/// Drop substrings containing a local.set or local.tee: returning written
/// values from the outlined function is not supported.
pub fn filter_local_sets(
    substrings: Vec<RepeatedSubstring>,
    module_string: &ModuleString,
    module: &Module,
) -> Vec<RepeatedSubstring> {
    reject_containing(substrings, module_string, module, |kind| {
        matches!(kind, ExprKind::LocalSet { .. } | ExprKind::LocalTee { .. })
    })
}

/// Drop substrings containing a local.get: passing local values into the
/// outlined function as arguments is not supported.
pub fn filter_local_gets(
    substrings: Vec<RepeatedSubstring>,
    module_string: &ModuleString,
    module: &Module,
) -> Vec<RepeatedSubstring> {
    reject_containing(substrings, module_string, module, |kind| {
        matches!(kind, ExprKind::LocalGet { .. })
    })
}

/// Drop substrings whose stack signature cannot become a function
/// signature: more than one result (no tuple types in the IR), or a `pop`
/// (only meaningful as the first instruction of a catch).
pub fn filter_signatures(
    substrings: Vec<RepeatedSubstring>,
    module_string: &ModuleString,
    module: &Module,
) -> Vec<RepeatedSubstring> {
    substrings
        .into_iter()
        .filter(|sub| {
            let start = sub.start_indices[0];
            let mut sig = StackSignature::empty();
            for pos in start..start + sub.length {
                match module_string.exprs[pos] {
                    Some((fidx, id)) => {
                        let func = &module.functions[fidx];
                        if matches!(func.arena.kind(id), ExprKind::Pop) {
                            return false;
                        }
                        sig.append(&StackSignature::of_expr(&func.arena, id));
                    }
                    None => return false,
                }
            }
            sig.results.len() <= 1
                && (sig.kind == SignatureKind::Fixed || sig.results.is_empty())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, Function};

    fn linear_func(name: &str, k: i32) -> Function {
        // (func (drop (i32.add (call $imp) (i32.const k))))
        let mut f = Function::new(name, vec![], vec![]);
        let a = &mut f.arena;
        let call = a.alloc(
            ExprKind::Call {
                target: "imp".into(),
                operands: vec![],
                is_return: false,
            },
            Type::I32,
        );
        let c = a.alloc(
            ExprKind::Const {
                literal: Literal::I32(k),
            },
            Type::I32,
        );
        let add = a.alloc(
            ExprKind::Binary {
                op: BinaryOp::I32Add,
                left: call,
                right: c,
            },
            Type::I32,
        );
        let d = a.alloc(ExprKind::Drop { value: add }, Type::None);
        let body = a.alloc(
            ExprKind::Block {
                name: None,
                list: vec![d],
            },
            Type::None,
        );
        f.body = Some(body);
        f
    }

    #[test]
    fn test_identical_instructions_share_symbols() {
        let mut module = Module::new();
        module.functions.push(linear_func("f", 10));
        module.functions.push(linear_func("g", 10));
        let ms = ModuleString::build(&module);
        // Each function contributes: FuncStart, block surface symbol,
        // End(func), ScopeStart, call, const, add, drop, End.
        assert_eq!(ms.hash_string.len(), 18);
        let f = &ms.hash_string[..9];
        let g = &ms.hash_string[9..];
        // The straight-line tail matches symbol for symbol.
        assert_eq!(f[4..8], g[4..8]);
        // Separators never match anything.
        assert_ne!(f[0], g[0]);
        assert_ne!(f[3], g[3]);
    }

    #[test]
    fn test_make_relative_round_trips() {
        let mut module = Module::new();
        module.functions.push(linear_func("f", 1));
        module.functions.push(linear_func("g", 2));
        let ms = ModuleString::build(&module);
        for (pos, expr) in ms.exprs.iter().enumerate() {
            let (fidx, rel) = ms.make_relative(pos).unwrap();
            if let Some((owner, id)) = expr {
                assert_eq!(fidx, *owner);
                // The rel-th event of the owning function is this
                // expression.
                let events = stringify_function(&module.functions[fidx]);
                assert_eq!(events[rel], StrEvent::Expr(*id));
            }
        }
    }

    #[test]
    fn test_dedupe_removes_contained_substring() {
        let long = RepeatedSubstring {
            length: 3,
            start_indices: vec![4, 10],
        };
        let short = RepeatedSubstring {
            length: 2,
            start_indices: vec![5, 11],
        };
        let out = dedupe(vec![long.clone(), short]);
        assert_eq!(out, vec![long]);
    }

    #[test]
    fn test_dedupe_keeps_substring_at_new_offsets() {
        let long = RepeatedSubstring {
            length: 3,
            start_indices: vec![4, 10],
        };
        // Occurs somewhere the long one does not.
        let short = RepeatedSubstring {
            length: 2,
            start_indices: vec![5, 20],
        };
        let out = dedupe(vec![long, short]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_filter_overlaps_thins_self_overlap() {
        let sub = RepeatedSubstring {
            length: 4,
            start_indices: vec![0, 2, 8],
        };
        let out = filter_overlaps(vec![sub]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_indices, vec![0, 8]);
    }

    #[test]
    fn test_filter_overlaps_drops_single_survivor() {
        let sub = RepeatedSubstring {
            length: 4,
            start_indices: vec![0, 2],
        };
        assert!(filter_overlaps(vec![sub]).is_empty());
    }
}
