//! Expression construction helpers and bottom-up re-typing.
//!
//! [`Builder`] wraps a function and allocates correctly-typed expressions
//! into its arena; it is the constructor interface the heap-to-local
//! rewriters consume. [`refinalize_function`] recomputes expression types
//! bottom-up after a rewrite changes a subexpression's type.

use rustc_hash::FxHashMap;

use crate::{
    BinaryOp, ExprId, ExprKind, Field, Function, HeapType, Literal, Packing, RefType, Type,
    TypeDefKind, TypeId, TypeStore,
};

/// Allocates expressions into a function's arena, computing result types at
/// construction time.
pub struct Builder<'a> {
    /// The function being built into
    pub func: &'a mut Function,
}

impl<'a> Builder<'a> {
    /// A builder over `func`.
    pub fn new(func: &'a mut Function) -> Builder<'a> {
        Builder { func }
    }

    /// Append a fresh local of type `ty` and return its index.
    pub fn add_var(&mut self, ty: Type) -> u32 {
        self.func.add_local(ty)
    }

    /// An unnamed block. The type is the last element's type (or none for
    /// an empty block).
    pub fn make_block(&mut self, list: Vec<ExprId>) -> ExprId {
        let ty = match list.last() {
            Some(&last) => self.func.arena.ty(last),
            None => Type::None,
        };
        self.func.arena.alloc(ExprKind::Block { name: None, list }, ty)
    }

    /// A two-element block typed by its second element.
    pub fn make_sequence(&mut self, first: ExprId, second: ExprId) -> ExprId {
        self.make_block(vec![first, second])
    }

    /// `drop` of `value`.
    pub fn make_drop(&mut self, value: ExprId) -> ExprId {
        let ty = if self.func.arena.ty(value) == Type::Unreachable {
            Type::Unreachable
        } else {
            Type::None
        };
        self.func.arena.alloc(ExprKind::Drop { value }, ty)
    }

    /// `local.get` of a local with type `ty`.
    pub fn make_local_get(&mut self, index: u32, ty: Type) -> ExprId {
        self.func.arena.alloc(ExprKind::LocalGet { index }, ty)
    }

    /// `local.set` of `value` into local `index`.
    pub fn make_local_set(&mut self, index: u32, value: ExprId) -> ExprId {
        let ty = if self.func.arena.ty(value) == Type::Unreachable {
            Type::Unreachable
        } else {
            Type::None
        };
        self.func.arena.alloc(ExprKind::LocalSet { index, value }, ty)
    }

    /// A constant.
    pub fn make_const(&mut self, literal: Literal) -> ExprId {
        self.func.arena.alloc(ExprKind::Const { literal }, literal.ty())
    }

    /// A null reference typed `(ref null heap)`.
    pub fn make_ref_null(&mut self, heap: HeapType) -> ExprId {
        self.func
            .arena
            .alloc(ExprKind::RefNull { heap }, Type::Ref(RefType::nullable(heap)))
    }

    /// `ref.as_non_null` of `value`.
    pub fn make_ref_as_non_null(&mut self, value: ExprId) -> ExprId {
        let ty = match self.func.arena.ty(value) {
            Type::Ref(r) => Type::Ref(RefType::non_null(r.heap)),
            Type::Unreachable => Type::Unreachable,
            other => other,
        };
        self.func.arena.alloc(ExprKind::RefAsNonNull { value }, ty)
    }

    /// `ref.eq` of two references.
    pub fn make_ref_eq(&mut self, left: ExprId, right: ExprId) -> ExprId {
        self.func.arena.alloc(ExprKind::RefEq { left, right }, Type::I32)
    }

    /// An if. Without an else arm the type is none; with one, an
    /// unreachable arm defers to the other arm's type.
    pub fn make_if(&mut self, condition: ExprId, if_true: ExprId, if_false: Option<ExprId>) -> ExprId {
        let ty = match if_false {
            None => Type::None,
            Some(f) => {
                let t_ty = self.func.arena.ty(if_true);
                let f_ty = self.func.arena.ty(f);
                if t_ty == Type::Unreachable {
                    f_ty
                } else if f_ty == Type::Unreachable {
                    t_ty
                } else {
                    t_ty
                }
            }
        };
        self.func.arena.alloc(
            ExprKind::If {
                condition,
                if_true,
                if_false,
            },
            ty,
        )
    }

    /// A two-operand arithmetic expression.
    pub fn make_binary(&mut self, op: BinaryOp, left: ExprId, right: ExprId) -> ExprId {
        self.func
            .arena
            .alloc(ExprKind::Binary { op, left, right }, op.result_type())
    }

    /// `unreachable`.
    pub fn make_unreachable(&mut self) -> ExprId {
        self.func.arena.alloc(ExprKind::Unreachable, Type::Unreachable)
    }

    /// `struct.new` of `ty` (empty operands = defaulted fields).
    pub fn make_struct_new(
        &mut self,
        ty: TypeId,
        operands: Vec<ExprId>,
        desc: Option<ExprId>,
    ) -> ExprId {
        self.func.arena.alloc(
            ExprKind::StructNew { ty, operands, desc },
            Type::Ref(RefType::non_null(HeapType::Def(ty))),
        )
    }

    /// `struct.get` yielding `ty`.
    pub fn make_struct_get(&mut self, index: u32, reference: ExprId, ty: Type, signed: bool) -> ExprId {
        self.func.arena.alloc(
            ExprKind::StructGet {
                reference,
                index,
                signed,
            },
            ty,
        )
    }

    /// `struct.set`.
    pub fn make_struct_set(&mut self, index: u32, reference: ExprId, value: ExprId) -> ExprId {
        self.func.arena.alloc(
            ExprKind::StructSet {
                reference,
                index,
                value,
            },
            Type::None,
        )
    }

    /// `ref.cast` (or `ref.cast_desc` when `desc` is given) to `ty`.
    pub fn make_ref_cast(&mut self, reference: ExprId, desc: Option<ExprId>, ty: RefType) -> ExprId {
        self.func
            .arena
            .alloc(ExprKind::RefCast { reference, desc }, Type::Ref(ty))
    }

    /// The default value of a field: a numeric zero or a typed null.
    pub fn make_zero(&mut self, ty: Type) -> ExprId {
        match ty {
            Type::Ref(r) => self.make_ref_null(r.heap),
            numeric => {
                let lit = Literal::zero(numeric);
                self.make_const(lit)
            }
        }
    }

    /// Read `value` as field contents: packed fields are widened from their
    /// storage with a mask (unsigned) or a shift pair (signed).
    pub fn make_packed_field_get(&mut self, value: ExprId, field: &Field, signed: bool) -> ExprId {
        let bits = match field.packing {
            Packing::None => return value,
            Packing::I8 => 8,
            Packing::I16 => 16,
        };
        if signed {
            let shift = self.make_const(Literal::I32(32 - bits));
            let shifted = self.make_binary(BinaryOp::I32Shl, value, shift);
            let shift2 = self.make_const(Literal::I32(32 - bits));
            self.make_binary(BinaryOp::I32ShrS, shifted, shift2)
        } else {
            let mask = self.make_const(Literal::I32((1 << bits) - 1));
            self.make_binary(BinaryOp::I32And, value, mask)
        }
    }
}

/// Recompute every expression type in `func` bottom-up. Needed after a
/// rewrite replaces a subexpression with one of a different type (casts
/// removed, unreachables introduced, reference types widened to nullable).
pub fn refinalize_function(func: &mut Function, types: &TypeStore) {
    let Some(body) = func.body else {
        return;
    };
    let order = func.arena.postorder(body);
    // Branch value types, collected at each branch before its target block
    // is reached (postorder guarantees the ordering).
    let mut sent: FxHashMap<String, Vec<Type>> = FxHashMap::default();
    for id in order {
        let ty = compute_type(func, types, &mut sent, id);
        func.arena.set_ty(id, ty);
    }
}

fn any_unreachable(func: &Function, children: &[ExprId]) -> bool {
    children
        .iter()
        .any(|&c| func.arena.ty(c) == Type::Unreachable)
}

fn compute_type(
    func: &Function,
    types: &TypeStore,
    sent: &mut FxHashMap<String, Vec<Type>>,
    id: ExprId,
) -> Type {
    use ExprKind::*;
    let arena = &func.arena;
    let current = arena.ty(id);
    match arena.kind(id) {
        Block { name, list } => {
            let sent_tys = name
                .as_ref()
                .and_then(|n| sent.remove(n))
                .unwrap_or_default();
            let last_ty = list.last().map(|&l| arena.ty(l)).unwrap_or(Type::None);
            if sent_tys.is_empty() {
                // A concrete final value types the block; otherwise any
                // unreachable element makes the block unreachable.
                if last_ty.is_concrete() {
                    last_ty
                } else if any_unreachable(func, list) {
                    Type::Unreachable
                } else {
                    Type::None
                }
            } else {
                let mut cands: Vec<Type> =
                    sent_tys.into_iter().filter(|t| t.is_concrete()).collect();
                if last_ty.is_concrete() {
                    cands.push(last_ty);
                }
                match cands.split_first() {
                    Some((&first, rest)) => rest.iter().fold(first, |a, &b| types.lub(a, b)),
                    None => Type::None,
                }
            }
        }
        Loop { body, .. } => arena.ty(*body),
        If {
            condition,
            if_true,
            if_false,
        } => {
            if arena.ty(*condition) == Type::Unreachable {
                return Type::Unreachable;
            }
            match if_false {
                None => Type::None,
                Some(f) => {
                    let t_ty = arena.ty(*if_true);
                    let f_ty = arena.ty(*f);
                    if t_ty == Type::Unreachable && f_ty == Type::Unreachable {
                        Type::Unreachable
                    } else {
                        types.lub(t_ty, f_ty)
                    }
                }
            }
        }
        Break {
            label,
            value,
            condition,
        } => {
            if let Some(v) = value {
                let vt = arena.ty(*v);
                if vt.is_concrete() {
                    sent.entry(label.clone()).or_default().push(vt);
                }
            }
            match condition {
                None => Type::Unreachable,
                Some(c) => {
                    if arena.ty(*c) == Type::Unreachable
                        || value.map(|v| arena.ty(v)) == Some(Type::Unreachable)
                    {
                        Type::Unreachable
                    } else {
                        value.map(|v| arena.ty(v)).unwrap_or(Type::None)
                    }
                }
            }
        }
        Switch {
            labels,
            default,
            value,
            ..
        } => {
            if let Some(v) = value {
                let vt = arena.ty(*v);
                if vt.is_concrete() {
                    for label in labels.iter().chain([default]) {
                        sent.entry(label.clone()).or_default().push(vt);
                    }
                }
            }
            Type::Unreachable
        }
        Try {
            body,
            catch_bodies,
            catch_all,
            ..
        } => {
            let mut ty = arena.ty(*body);
            for c in catch_bodies.iter().chain(catch_all.iter()) {
                ty = types.lub(ty, arena.ty(*c));
            }
            ty
        }
        TryTable { body, .. } => arena.ty(*body),
        LocalGet { index } => func.local_type(*index),
        LocalSet { value, .. } => {
            if arena.ty(*value) == Type::Unreachable {
                Type::Unreachable
            } else {
                Type::None
            }
        }
        LocalTee { value, .. } => arena.ty(*value),
        Drop { value } => {
            if arena.ty(*value) == Type::Unreachable {
                Type::Unreachable
            } else {
                Type::None
            }
        }
        Call {
            operands,
            is_return,
            ..
        } => {
            if *is_return || any_unreachable(func, operands) {
                Type::Unreachable
            } else {
                current
            }
        }
        Const { literal } => literal.ty(),
        Unreachable => Type::Unreachable,
        Nop => Type::None,
        Pop => current,
        Return { .. } => Type::Unreachable,
        Binary { op, left, right } => {
            if any_unreachable(func, &[*left, *right]) {
                Type::Unreachable
            } else {
                op.result_type()
            }
        }
        RefNull { heap } => Type::Ref(RefType::nullable(*heap)),
        RefIsNull { value } => {
            if arena.ty(*value) == Type::Unreachable {
                Type::Unreachable
            } else {
                Type::I32
            }
        }
        RefEq { left, right } => {
            if any_unreachable(func, &[*left, *right]) {
                Type::Unreachable
            } else {
                Type::I32
            }
        }
        RefAsNonNull { value } => match arena.ty(*value) {
            Type::Unreachable => Type::Unreachable,
            Type::Ref(r) => Type::Ref(RefType::non_null(r.heap)),
            _ => current,
        },
        RefTest { reference, .. } => {
            if arena.ty(*reference) == Type::Unreachable {
                Type::Unreachable
            } else {
                Type::I32
            }
        }
        RefCast { reference, desc } => {
            if arena.ty(*reference) == Type::Unreachable
                || desc.map(|d| arena.ty(d)) == Some(Type::Unreachable)
            {
                Type::Unreachable
            } else {
                current
            }
        }
        RefGetDesc { reference } => {
            if arena.ty(*reference) == Type::Unreachable {
                Type::Unreachable
            } else {
                current
            }
        }
        StructNew { ty, operands, desc } => {
            let mut children = operands.clone();
            children.extend(desc.iter().copied());
            if any_unreachable(func, &children) {
                Type::Unreachable
            } else {
                Type::Ref(RefType::non_null(HeapType::Def(*ty)))
            }
        }
        StructGet {
            reference, index, ..
        } => struct_field_type(func, types, *reference, *index, current),
        StructSet {
            reference, value, ..
        } => {
            if any_unreachable(func, &[*reference, *value]) {
                Type::Unreachable
            } else {
                Type::None
            }
        }
        StructRmw {
            reference,
            index,
            value,
            ..
        } => {
            if any_unreachable(func, &[*reference, *value]) {
                Type::Unreachable
            } else {
                struct_field_type(func, types, *reference, *index, current)
            }
        }
        StructCmpxchg {
            reference,
            index,
            expected,
            replacement,
        } => {
            if any_unreachable(func, &[*reference, *expected, *replacement]) {
                Type::Unreachable
            } else {
                struct_field_type(func, types, *reference, *index, current)
            }
        }
        ArrayNew { ty, init, size } => {
            let mut children: Vec<ExprId> = init.iter().copied().collect();
            children.push(*size);
            if any_unreachable(func, &children) {
                Type::Unreachable
            } else {
                Type::Ref(RefType::non_null(HeapType::Def(*ty)))
            }
        }
        ArrayNewFixed { ty, values } => {
            if any_unreachable(func, values) {
                Type::Unreachable
            } else {
                Type::Ref(RefType::non_null(HeapType::Def(*ty)))
            }
        }
        ArrayGet {
            reference, index, ..
        } => {
            if any_unreachable(func, &[*reference, *index]) {
                Type::Unreachable
            } else {
                array_element_type(func, types, *reference, current)
            }
        }
        ArraySet {
            reference,
            index,
            value,
        } => {
            if any_unreachable(func, &[*reference, *index, *value]) {
                Type::Unreachable
            } else {
                Type::None
            }
        }
        ArrayRmw {
            reference,
            index,
            value,
            ..
        } => {
            if any_unreachable(func, &[*reference, *index, *value]) {
                Type::Unreachable
            } else {
                array_element_type(func, types, *reference, current)
            }
        }
        ArrayCmpxchg {
            reference,
            index,
            expected,
            replacement,
        } => {
            if any_unreachable(func, &[*reference, *index, *expected, *replacement]) {
                Type::Unreachable
            } else {
                array_element_type(func, types, *reference, current)
            }
        }
    }
}

fn struct_field_type(
    func: &Function,
    types: &TypeStore,
    reference: ExprId,
    index: u32,
    current: Type,
) -> Type {
    match func.arena.ty(reference) {
        Type::Unreachable => Type::Unreachable,
        Type::Ref(r) => match r.heap {
            HeapType::Def(d) => match &types.def(d).kind {
                TypeDefKind::Struct(fields) => fields[index as usize].ty,
                TypeDefKind::Array(_) => current,
            },
            _ => current,
        },
        _ => current,
    }
}

fn array_element_type(func: &Function, types: &TypeStore, reference: ExprId, current: Type) -> Type {
    match func.arena.ty(reference) {
        Type::Unreachable => Type::Unreachable,
        Type::Ref(r) => match r.heap {
            HeapType::Def(d) => match &types.def(d).kind {
                TypeDefKind::Array(elem) => elem.ty,
                TypeDefKind::Struct(_) => current,
            },
            _ => current,
        },
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Field;

    #[test]
    fn test_packed_get_unsigned_masks() {
        let mut f = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut f);
        let v = b.make_const(Literal::I32(0x1ff));
        let field = Field {
            ty: Type::I32,
            packing: Packing::I8,
            mutable: true,
        };
        let got = b.make_packed_field_get(v, &field, false);
        match f.arena.kind(got) {
            ExprKind::Binary {
                op: BinaryOp::I32And,
                right,
                ..
            } => match f.arena.kind(*right) {
                ExprKind::Const {
                    literal: Literal::I32(mask),
                } => assert_eq!(*mask, 0xff),
                other => panic!("expected mask constant, got {other:?}"),
            },
            other => panic!("expected and, got {other:?}"),
        }
    }

    #[test]
    fn test_packed_get_signed_shifts() {
        let mut f = Function::new("f", vec![], vec![]);
        let mut b = Builder::new(&mut f);
        let v = b.make_const(Literal::I32(0x80));
        let field = Field {
            ty: Type::I32,
            packing: Packing::I8,
            mutable: true,
        };
        let got = b.make_packed_field_get(v, &field, true);
        assert!(matches!(
            f.arena.kind(got),
            ExprKind::Binary {
                op: BinaryOp::I32ShrS,
                ..
            }
        ));
    }

    #[test]
    fn test_refinalize_propagates_unreachable() {
        let mut f = Function::new("f", vec![], vec![]);
        let types = TypeStore::new();
        let mut b = Builder::new(&mut f);
        let u = b.make_unreachable();
        let d = f.arena.alloc(ExprKind::Drop { value: u }, Type::None);
        let body = f.arena.alloc(
            ExprKind::Block {
                name: None,
                list: vec![d],
            },
            Type::None,
        );
        f.body = Some(body);
        refinalize_function(&mut f, &types);
        assert_eq!(f.arena.ty(d), Type::Unreachable);
        assert_eq!(f.arena.ty(body), Type::Unreachable);
    }

    #[test]
    fn test_refinalize_block_with_branch_value() {
        // (block $b (br $b (i32.const 1)) (unreachable-tail)) has type i32.
        let mut f = Function::new("f", vec![], vec![Type::I32]);
        let types = TypeStore::new();
        let a = &mut f.arena;
        let c = a.alloc(
            ExprKind::Const {
                literal: Literal::I32(1),
            },
            Type::I32,
        );
        let br = a.alloc(
            ExprKind::Break {
                label: "b".into(),
                value: Some(c),
                condition: None,
            },
            Type::Unreachable,
        );
        let tail = a.alloc(ExprKind::Unreachable, Type::Unreachable);
        let block = a.alloc(
            ExprKind::Block {
                name: Some("b".into()),
                list: vec![br, tail],
            },
            Type::None,
        );
        f.body = Some(block);
        refinalize_function(&mut f, &types);
        assert_eq!(f.arena.ty(block), Type::I32);
    }
}
