//! Stack Analysis Module
//!
//! Compositional stack type analysis for instruction sequences.
//!
//! A [`StackSignature`] characterizes how an instruction sequence interacts
//! with the value stack:
//! - `params`: types consumed from the surrounding stack, bottom first
//! - `results`: types left on the surrounding stack, bottom first
//! - `kind`: whether the signature is `Fixed` (deterministic) or
//!   `Polymorphic` (the sequence contains unreachable code and can match
//!   any outer stack below its params)
//!
//! Outlining folds the shallow signatures of an instruction range to obtain
//! the `(params) -> (results)` signature of the function the range is
//! promoted into: consumption beyond what the range itself produced grows
//! the params (the deficit), and whatever remains at the end is the
//! results (the surplus).

use crate::{ExprArena, ExprId, Type};

/// Kind of stack signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// Deterministic: consumes exactly `params`, produces exactly `results`
    Fixed,
    /// Contains unreachable code; consumes anything below its params
    Polymorphic,
}

/// The stack type `[params] -> [results]` of an instruction sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackSignature {
    /// Types consumed from the outer stack, bottom first
    pub params: Vec<Type>,
    /// Types produced onto the outer stack, bottom first
    pub results: Vec<Type>,
    /// Whether the signature includes polymorphic behavior
    pub kind: SignatureKind,
}

impl StackSignature {
    /// The empty signature `[] -> []`.
    pub fn empty() -> StackSignature {
        StackSignature {
            params: vec![],
            results: vec![],
            kind: SignatureKind::Fixed,
        }
    }

    /// The shallow signature of a single expression: it consumes its
    /// children's values and produces its own (if concrete). An
    /// unreachable-typed expression produces nothing and makes the
    /// signature polymorphic.
    pub fn of_expr(arena: &ExprArena, id: ExprId) -> StackSignature {
        let params: Vec<Type> = arena
            .child_ids(id)
            .iter()
            .map(|&c| arena.ty(c))
            .filter(|t| t.is_concrete())
            .collect();
        let (results, kind) = match arena.ty(id) {
            Type::Unreachable => (vec![], SignatureKind::Polymorphic),
            Type::None => (vec![], SignatureKind::Fixed),
            concrete => (vec![concrete], SignatureKind::Fixed),
        };
        StackSignature {
            params,
            results,
            kind,
        }
    }

    /// Extend this signature with `next` executed afterwards. Values `next`
    /// consumes beyond our results become additional params (unless we are
    /// already polymorphic, in which case the dead consumption is
    /// absorbed).
    pub fn append(&mut self, next: &StackSignature) {
        let give = self.results.len().min(next.params.len());
        let deficit = next.params.len() - give;
        self.results.truncate(self.results.len() - give);
        if self.kind == SignatureKind::Fixed && deficit > 0 {
            // The unmet consumption sits below our existing params.
            let mut params = next.params[..deficit].to_vec();
            params.extend(self.params.iter().copied());
            self.params = params;
        }
        self.results.extend(next.results.iter().copied());
        if next.kind == SignatureKind::Polymorphic {
            self.kind = SignatureKind::Polymorphic;
            // Nothing survives unreachable code except what it produces.
            self.results = next.results.clone();
        }
    }

    /// Fold the shallow signatures of an expression range.
    pub fn of_range<'a>(
        arena: &ExprArena,
        range: impl IntoIterator<Item = &'a ExprId>,
    ) -> StackSignature {
        let mut sig = StackSignature::empty();
        for &id in range {
            sig.append(&StackSignature::of_expr(arena, id));
        }
        sig
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, ExprKind, Literal};

    fn const_i32(arena: &mut ExprArena, v: i32) -> ExprId {
        arena.alloc(
            ExprKind::Const {
                literal: Literal::I32(v),
            },
            Type::I32,
        )
    }

    #[test]
    fn test_const_add_drop_folds_to_one_param() {
        // [i32.const k, i32.add, drop] consumes one value from outside the
        // range and leaves nothing: (i32) -> ().
        let mut arena = ExprArena::new();
        let outside = const_i32(&mut arena, 1);
        let k = const_i32(&mut arena, 10);
        let add = arena.alloc(
            ExprKind::Binary {
                op: BinaryOp::I32Add,
                left: outside,
                right: k,
            },
            Type::I32,
        );
        let drop = arena.alloc(ExprKind::Drop { value: add }, Type::None);

        let sig = StackSignature::of_range(&arena, &[k, add, drop]);
        assert_eq!(sig.params, vec![Type::I32]);
        assert!(sig.results.is_empty());
        assert_eq!(sig.kind, SignatureKind::Fixed);
    }

    #[test]
    fn test_surplus_becomes_results() {
        let mut arena = ExprArena::new();
        let a = const_i32(&mut arena, 1);
        let b = const_i32(&mut arena, 2);
        let sig = StackSignature::of_range(&arena, &[a, b]);
        assert!(sig.params.is_empty());
        assert_eq!(sig.results, vec![Type::I32, Type::I32]);
    }

    #[test]
    fn test_unreachable_makes_polymorphic() {
        let mut arena = ExprArena::new();
        let a = const_i32(&mut arena, 1);
        let u = arena.alloc(ExprKind::Unreachable, Type::Unreachable);
        let sig = StackSignature::of_range(&arena, &[a, u]);
        assert_eq!(sig.kind, SignatureKind::Polymorphic);
        assert!(sig.results.is_empty());
    }

    #[test]
    fn test_deficit_preserves_stack_order() {
        // add consuming two outside values: params bottom-first.
        let mut arena = ExprArena::new();
        let l = const_i32(&mut arena, 1);
        let r = const_i32(&mut arena, 2);
        let add = arena.alloc(
            ExprKind::Binary {
                op: BinaryOp::I32Add,
                left: l,
                right: r,
            },
            Type::I32,
        );
        let sig = StackSignature::of_range(&arena, &[add]);
        assert_eq!(sig.params, vec![Type::I32, Type::I32]);
        assert_eq!(sig.results, vec![Type::I32]);
    }
}
