//! Heap-to-Local Optimization
//!
//! Finds GC heap allocations that never escape the function that performs
//! them, and lowers the allocation's data into locals: one local per struct
//! field (plus one for the descriptor, if present). The allocation itself,
//! and every operation on it, disappears.
//!
//! For example, a function that boxes a counter on the heap:
//!
//! ```text
//! ref = new Boxed(42)
//! do {
//!   ref.set(ref.get() + 1)
//! } while (import(ref.get()))
//! ```
//!
//! becomes a function with a plain i32 local incremented in the loop. The
//! struct type, the allocation, and all field accesses are gone.
//!
//! Two properties must be proven before rewriting an allocation:
//!
//! - **It does not escape.** A reference that reaches a call, a return, a
//!   store into another object, or the function result must be kept as a
//!   real heap object.
//! - **It is used exclusively.** Every `local.get` that may observe the
//!   allocation must observe only the allocation. If a get might also read
//!   another value (two sets merging at a join), the rewrite would need
//!   runtime disambiguation, which this pass does not attempt.
//!
//! Arrays are handled by normalization: a non-escaping array allocation of
//! statically known small size, accessed only at constant indices, is
//! structurally a struct, so it is first converted into one
//! ([`Array2Struct`]) and then lowered like any other struct
//! ([`Struct2Local`]).

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::{
    branches_sent_by_parent, BranchTargets, LocalGraph, ParentMap, SetSource, UniqueQueue,
};
use crate::builder::{refinalize_function, Builder};
use crate::{
    immediate_fallthrough, BinaryOp, ExprId, ExprKind, Field, Function, HeapType, Literal, Module,
    PassOptions, RefType, RmwOp, Type, TypeDefKind, TypeId, TypeStore,
};
use anyhow::Result;

/// Statistics about a heap-to-local run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Heap2LocalStats {
    /// Struct allocations lowered into locals
    pub structs_lowered: usize,
    /// Array allocations normalized to structs and lowered
    pub arrays_lowered: usize,
}

/// Run the pass over every defined function.
pub fn run(module: &mut Module, options: &PassOptions) -> Result<Heap2LocalStats> {
    let mut stats = Heap2LocalStats::default();
    let Module { types, functions } = module;
    for func in functions.iter_mut() {
        if !func.is_import() {
            optimize_function(func, types, options, &mut stats);
        }
    }
    Ok(stats)
}

/// Interactions between a child and a parent, with regard to the behavior
/// of a candidate allocation flowing in on the child edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interaction {
    /// The parent may let the allocation escape (e.g. a call).
    Escapes,
    /// The parent consumes the allocation safely and nothing of it flows
    /// further (e.g. a struct.get reads from it and is done with the
    /// reference).
    FullyConsumes,
    /// The allocation is exactly the value flowing out of the parent (e.g.
    /// a block whose final value is the child).
    Flows,
    /// The parent forwards a value that may or may not be the allocation
    /// (e.g. a block with branches carrying other values). Not exclusive,
    /// so not optimizable.
    Mixes,
}

/// Escape analysis for one allocation. On a non-escaping verdict, the
/// recorded interactions and sets drive the rewriters; on an escaping
/// verdict they may be partial and the allocation is simply skipped.
struct EscapeAnalyzer<'a> {
    local_graph: &'a LocalGraph,
    parents: &'a ParentMap,
    branch_targets: &'a BranchTargets,
    options: &'a PassOptions,

    /// The local.sets observed to receive the allocation.
    sets: FxHashSet<ExprId>,
    /// Every expression the allocation reaches, mapped to the interaction
    /// there. Absent means no interaction.
    reached: FxHashMap<ExprId, Interaction>,
}

impl<'a> EscapeAnalyzer<'a> {
    fn new(
        local_graph: &'a LocalGraph,
        parents: &'a ParentMap,
        branch_targets: &'a BranchTargets,
        options: &'a PassOptions,
    ) -> EscapeAnalyzer<'a> {
        EscapeAnalyzer {
            local_graph,
            parents,
            branch_targets,
            options,
            sets: FxHashSet::default(),
            reached: FxHashMap::default(),
        }
    }

    /// Whether `allocation` escapes `func`.
    fn escapes(&mut self, allocation: ExprId, func: &Function, types: &TypeStore) -> bool {
        // A worklist of flows from children to parents. An entry means the
        // child has been cleared to hold the allocation; what remains is to
        // check the parent and the flow between them.
        let mut flows: UniqueQueue<(ExprId, Option<ExprId>)> = UniqueQueue::new();
        flows.push((allocation, self.parents.get(allocation)));

        while let Some((child, parent)) = flows.pop() {
            let interaction = self.classify(allocation, parent, child, func, types);
            match interaction {
                Interaction::Escapes | Interaction::Mixes => return true,
                Interaction::FullyConsumes | Interaction::Flows => {}
            }
            let parent = parent.expect("no-parent case classified as escaping");

            if interaction == Interaction::Flows {
                // The value flows through the parent; look further at the
                // grandparent.
                flows.push((parent, self.parents.get(parent)));
            }

            if matches!(
                func.arena.kind(parent),
                ExprKind::LocalSet { .. } | ExprKind::LocalTee { .. }
            ) {
                // One of the sets we are written to. Note it for the
                // exclusivity check, and chase the gets that may read it.
                self.sets.insert(parent);
                for &get in self.local_graph.influences(parent) {
                    flows.push((get, self.parents.get(get)));
                }
            }

            // Branches carrying the child reach their target scopes.
            for label in branches_sent_by_parent(&func.arena, parent, child) {
                match self.branch_targets.target(&label) {
                    Some(target) => flows.push((child, Some(target))),
                    None => return true,
                }
            }

            self.reached.insert(child, Interaction::Flows);
            self.reached.insert(parent, interaction);
        }

        !self.gets_are_exclusive_to_sets()
    }

    /// Classify the interaction at `parent` given that `child` holds the
    /// allocation.
    fn classify(
        &self,
        allocation: ExprId,
        parent: Option<ExprId>,
        child: ExprId,
        func: &Function,
        types: &TypeStore,
    ) -> Interaction {
        // No parent: we are the function body, flowing to the caller.
        let Some(parent) = parent else {
            return Interaction::Escapes;
        };
        let arena = &func.arena;
        let alloc_ty = arena.ty(allocation);

        // Assume escaping unless certain otherwise; fully-consuming only
        // when certain.
        let mut escapes = true;
        let mut fully_consumes = false;

        match arena.kind(parent) {
            ExprKind::Block { .. } | ExprKind::Loop { .. } => {
                escapes = false;
                // The value may continue through the scope; mixing is
                // checked below.
            }
            // For the value to flow through an if, both arms would have to
            // be the allocation, which a single allocation cannot be.
            ExprKind::If { .. } => return Interaction::Mixes,
            ExprKind::Drop { .. } => {
                escapes = false;
                fully_consumes = true;
            }
            ExprKind::Break { .. } | ExprKind::Switch { .. } => {
                escapes = false;
            }
            // Locals do not escape by themselves; the analysis tracks
            // where they are used.
            ExprKind::LocalGet { .. } | ExprKind::LocalSet { .. } | ExprKind::LocalTee { .. } => {
                escapes = false;
            }
            ExprKind::RefIsNull { .. } | ExprKind::RefEq { .. } | ExprKind::RefTest { .. } => {
                // Compared, but nothing more.
                escapes = false;
                fully_consumes = true;
            }
            ExprKind::RefAsNonNull { .. } => {
                // It is our allocation flowing through, so it is not null:
                // no trap, and the value continues.
                escapes = false;
            }
            ExprKind::RefCast { reference, .. } => {
                escapes = false;
                if *reference == child {
                    // A failing cast traps instead of forwarding the
                    // value.
                    if !types.is_sub_type(alloc_ty, arena.ty(parent)) {
                        fully_consumes = true;
                    }
                } else {
                    // The child is (or originally was) the descriptor
                    // operand, which the cast only inspects.
                    fully_consumes = true;
                }
            }
            ExprKind::RefGetDesc { .. } => {
                escapes = false;
                fully_consumes = true;
            }
            ExprKind::StructSet { reference, .. } => {
                // The reference does not escape, but a stored value goes
                // into memory and might.
                if *reference == child {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::StructGet { .. } => {
                escapes = false;
                fully_consumes = true;
            }
            ExprKind::StructRmw { reference, .. } => {
                if *reference == child {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::StructCmpxchg {
                reference,
                expected,
                ..
            } => {
                if *reference == child || *expected == child {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::ArraySet {
                reference, index, ..
            } => {
                // Nonconstant indexes escape our ability to analyze.
                if is_const(arena, *index) && *reference == child {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::ArrayGet { index, .. } => {
                if is_const(arena, *index) {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::ArrayRmw {
                reference, index, ..
            } => {
                if is_const(arena, *index) && *reference == child {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            ExprKind::ArrayCmpxchg {
                reference,
                index,
                expected,
                ..
            } => {
                if is_const(arena, *index) && (*reference == child || *expected == child) {
                    escapes = false;
                    fully_consumes = true;
                }
            }
            // Calls, returns, other allocations, EH scopes: all escape.
            _ => {}
        }

        if escapes {
            return Interaction::Escapes;
        }

        // A parent with a non-reference type cannot flow the allocation
        // onward, so by definition it fully consumes it.
        if fully_consumes || !arena.ty(parent).is_ref() {
            return Interaction::FullyConsumes;
        }

        // Check for mixing. If the child is the immediate fallthrough of
        // the parent, no other value can be mixed in.
        if immediate_fallthrough(arena, parent, self.options) == Some(child) {
            return Interaction::Flows;
        }

        // Likewise if the child branches to the parent, it is the sole
        // branch, and no final value exits the block at the end.
        if let ExprKind::Block {
            name: Some(name),
            list,
        } = arena.kind(parent)
        {
            let branches = self.branch_targets.branches(name);
            if branches.len() == 1 && sent_value(arena, branches[0]) == Some(child) {
                if list.last().map(|&l| arena.ty(l)) == Some(Type::Unreachable) {
                    return Interaction::Flows;
                }
            }
        }

        Interaction::Mixes
    }

    /// Assuming the recorded sets write exactly the allocation, verify that
    /// every get reading from them cannot read anything else.
    fn gets_are_exclusive_to_sets(&self) -> bool {
        let mut gets = FxHashSet::default();
        for &set in &self.sets {
            for &get in self.local_graph.influences(set) {
                gets.insert(get);
            }
        }
        for get in gets {
            for source in self.local_graph.sources(get) {
                match source {
                    SetSource::Entry => return false,
                    SetSource::Set(set) => {
                        if !self.sets.contains(set) {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// On replacement, carry the old expression's interaction over to its
    /// drop-in replacement. Replacements that are unreachable represent
    /// code we proved will trap, which the allocation no longer interacts
    /// with.
    fn apply_old_interaction(&mut self, old: ExprId, replacement: ExprId, replacement_ty: Type) {
        debug_assert!(self.reached.contains_key(&old));
        if replacement_ty != Type::Unreachable {
            if let Some(interaction) = self.reached.get(&old).copied() {
                self.reached.insert(replacement, interaction);
            }
        }
    }

    fn interaction(&self, id: ExprId) -> Option<Interaction> {
        self.reached.get(&id).copied()
    }
}

fn is_const(arena: &crate::ExprArena, id: ExprId) -> bool {
    matches!(arena.kind(id), ExprKind::Const { .. })
}

fn const_index(arena: &crate::ExprArena, id: ExprId) -> Option<u32> {
    match arena.kind(id) {
        ExprKind::Const {
            literal: Literal::I32(v),
        } => Some(*v as u32),
        ExprKind::Const {
            literal: Literal::I64(v),
        } => Some(*v as u32),
        _ => None,
    }
}

fn sent_value(arena: &crate::ExprArena, branch: ExprId) -> Option<ExprId> {
    match arena.kind(branch) {
        ExprKind::Break { value, .. } => *value,
        ExprKind::Switch { value, .. } => *value,
        _ => None,
    }
}

/// Rewrites a proven non-escaping struct allocation into locals, one per
/// field plus one for the descriptor.
struct Struct2Local<'a, 'g> {
    allocation: ExprId,
    alloc_ty: Type,
    alloc_heap: HeapType,
    analyzer: &'a mut EscapeAnalyzer<'g>,
    types: &'a TypeStore,
    fields: Vec<Field>,
    /// Type of the descriptor operand, if the allocation carries one.
    desc_ty: Option<Type>,
    /// One local per field, then one for the descriptor.
    local_indexes: Vec<u32>,
    refinalize: bool,
}

impl<'a, 'g> Struct2Local<'a, 'g> {
    fn rewrite(
        allocation: ExprId,
        analyzer: &'a mut EscapeAnalyzer<'g>,
        func: &mut Function,
        types: &'a TypeStore,
    ) {
        let alloc_ty = func.arena.ty(allocation);
        let (def, desc) = match func.arena.kind(allocation) {
            ExprKind::StructNew { ty, desc, .. } => (*ty, *desc),
            other => panic!("expected struct.new allocation, got {other:?}"),
        };
        let fields = types.struct_fields(def).to_vec();
        let desc_ty = desc.map(|d| func.arena.ty(d));

        // Locals for the fields and descriptor; they live for the rest of
        // the function.
        let mut local_indexes = Vec::with_capacity(fields.len() + 1);
        for field in &fields {
            local_indexes.push(func.add_local(field.ty));
        }
        if let Some(dt) = desc_ty {
            local_indexes.push(func.add_local(dt.with_nullable()));
        }

        let mut pass = Struct2Local {
            allocation,
            alloc_ty,
            alloc_heap: HeapType::Def(def),
            analyzer,
            types,
            fields,
            desc_ty,
            local_indexes,
            refinalize: false,
        };

        let body = func.body.expect("rewriting a defined function");
        for (id, parent) in func.arena.postorder_with_parents(body) {
            pass.visit(id, parent, func);
        }
        if pass.refinalize {
            refinalize_function(func, types);
        }
    }

    fn replace(&mut self, func: &mut Function, old: ExprId, parent: Option<ExprId>, new: ExprId) {
        self.analyzer
            .apply_old_interaction(old, new, func.arena.ty(new));
        match parent {
            Some(parent) => {
                let patched = func.arena.replace_child(parent, old, new);
                debug_assert!(patched, "parent slot not found");
            }
            None => func.body = Some(new),
        }
    }

    fn desc_local(&self) -> u32 {
        self.local_indexes[self.fields.len()]
    }

    fn desc_local_ty(&self) -> Type {
        self.desc_ty.expect("allocation has a descriptor").with_nullable()
    }

    fn visit(&mut self, id: ExprId, parent: Option<ExprId>, func: &mut Function) {
        let kind = func.arena.kind(id).clone();
        match kind {
            ExprKind::Block { .. } | ExprKind::Loop { .. } => {
                // The allocation passes through: the type must become
                // nullable, because operations like ref.as_non_null of it
                // are removed and a null now stands in for the value.
                // Everything downstream is being rewritten to not care.
                if self.analyzer.interaction(id) == Some(Interaction::Flows) {
                    let ty = func.arena.ty(id);
                    debug_assert!(ty.is_ref());
                    func.arena.set_ty(id, ty.with_nullable());
                }
            }
            ExprKind::Break {
                value, condition, ..
            } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                // A br_if the allocation flows through may change type now
                // that the value is nullable.
                if condition.is_some() {
                    if let Some(v) = value {
                        func.arena.set_ty(id, func.arena.ty(v));
                    }
                }
            }
            ExprKind::LocalSet { value, .. } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                // No need to store the reference anywhere.
                let new = Builder::new(func).make_drop(value);
                self.replace(func, id, parent, new);
            }
            ExprKind::LocalTee { value, .. } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                self.replace(func, id, parent, value);
            }
            ExprKind::LocalGet { .. } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                // Remaining uses of this get only drop it, so the value
                // does not matter; a null avoids reading a local whose set
                // was removed.
                let heap = match func.arena.ty(id) {
                    Type::Ref(r) => r.heap,
                    other => panic!("local.get of allocation has type {other:?}"),
                };
                let new = Builder::new(func).make_ref_null(heap);
                self.replace(func, id, parent, new);
            }
            ExprKind::StructNew { .. } => {
                if id == self.allocation {
                    self.lower_allocation(id, parent, func);
                }
            }
            ExprKind::RefIsNull { .. } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                // The allocation is not null.
                let mut b = Builder::new(func);
                let dropped = b.make_drop(id);
                let zero = b.make_const(Literal::I32(0));
                let new = b.make_sequence(dropped, zero);
                self.replace(func, id, parent, new);
            }
            ExprKind::RefEq { left, right } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                if func.arena.ty(id) == Type::Unreachable {
                    // The result does not matter; leave it to DCE.
                    return;
                }
                // Compared to itself: 1. Compared to anything else: 0,
                // since the reference never escapes to another value.
                let result = (self.analyzer.interaction(left) == Some(Interaction::Flows)
                    && self.analyzer.interaction(right) == Some(Interaction::Flows))
                    as i32;
                let mut b = Builder::new(func);
                let dl = b.make_drop(left);
                let dr = b.make_drop(right);
                let c = b.make_const(Literal::I32(result));
                let new = b.make_block(vec![dl, dr, c]);
                self.replace(func, id, parent, new);
            }
            ExprKind::RefAsNonNull { value } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                // Proven to hold our allocation: cannot trap.
                self.replace(func, id, parent, value);
            }
            ExprKind::RefTest {
                reference, cast_ty, ..
            } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                // The test operates on the allocation, whose type we know
                // precisely; the outcome is static.
                let result = self.types.is_sub_type(self.alloc_ty, Type::Ref(cast_ty)) as i32;
                let mut b = Builder::new(func);
                let dropped = b.make_drop(reference);
                let c = b.make_const(Literal::I32(result));
                let new = b.make_sequence(dropped, c);
                self.replace(func, id, parent, new);
            }
            ExprKind::RefCast { reference, desc } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                self.lower_ref_cast(id, parent, reference, desc, func);
            }
            ExprKind::RefGetDesc { reference } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                let ty = self.desc_local_ty();
                if ty != func.arena.ty(id) {
                    // We know the exact allocation flowing in, so we know
                    // the descriptor more precisely than the static type.
                    self.refinalize = true;
                }
                let desc_local = self.desc_local();
                let mut b = Builder::new(func);
                let dropped = b.make_drop(reference);
                let value = b.make_local_get(desc_local, ty);
                let new = b.make_sequence(dropped, value);
                self.replace(func, id, parent, new);
            }
            ExprKind::StructGet {
                reference,
                index,
                signed,
            } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                let field = self.fields[index as usize];
                if field.ty != func.arena.ty(id) {
                    // The reference arriving here is more refined than the
                    // static type of the get.
                    self.refinalize = true;
                }
                let local = self.local_indexes[index as usize];
                let mut b = Builder::new(func);
                let dropped = b.make_drop(reference);
                let mut value = b.make_local_get(local, field.ty);
                value = b.make_packed_field_get(value, &field, signed);
                // No fence: the object is unobservable to other threads.
                let new = b.make_sequence(dropped, value);
                self.replace(func, id, parent, new);
            }
            ExprKind::StructSet {
                reference,
                index,
                value,
            } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                let local = self.local_indexes[index as usize];
                let mut b = Builder::new(func);
                let dropped = b.make_drop(reference);
                let set = b.make_local_set(local, value);
                let new = b.make_sequence(dropped, set);
                self.replace(func, id, parent, new);
            }
            ExprKind::StructRmw {
                op,
                reference,
                index,
                value,
            } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                self.lower_rmw(id, parent, op, reference, index, value, func);
            }
            ExprKind::StructCmpxchg {
                reference,
                index,
                expected,
                replacement,
            } => {
                // The allocation cannot be the stored replacement if we got
                // this far, but it might flow only into `expected`, in
                // which case the cmpxchg still operates on a real struct
                // and stays as it is.
                if self.analyzer.interaction(reference) != Some(Interaction::Flows) {
                    return;
                }
                self.lower_cmpxchg(id, parent, reference, index, expected, replacement, func);
            }
            _ => {}
        }
    }

    /// Replace the allocation site itself: stage the operand values in temp
    /// locals, copy them into the field locals, and yield a typed null.
    fn lower_allocation(&mut self, id: ExprId, parent: Option<ExprId>, func: &mut Function) {
        let (operands, desc) = match func.arena.kind(id) {
            ExprKind::StructNew { operands, desc, .. } => (operands.clone(), *desc),
            _ => unreachable!(),
        };
        let with_default = operands.is_empty();
        let num_fields = self.fields.len();
        let mut contents = Vec::new();

        // The locals representing the fields may already hold values (we
        // might be in a loop), and the new operand values may read them.
        // Stage every nontrivial value in a temp local first, and only
        // copy into the field locals once all are computed.
        let mut temp_indexes = Vec::new();
        if !with_default {
            for field in &self.fields {
                temp_indexes.push(func.add_local(field.ty));
            }
        }
        if desc.is_some() {
            temp_indexes.push(func.add_local(self.desc_local_ty()));
        }

        let mut b = Builder::new(func);
        if !with_default {
            for (i, _) in self.fields.iter().enumerate() {
                let set = b.make_local_set(temp_indexes[i], operands[i]);
                contents.push(set);
            }
        }
        if let Some(d) = desc {
            // Preserve the trap on null descriptors.
            let mut value = d;
            if matches!(b.func.arena.ty(d), Type::Ref(r) if r.nullable) {
                value = b.make_ref_as_non_null(d);
            }
            let set = b.make_local_set(*temp_indexes.last().unwrap(), value);
            contents.push(set);
        }

        for (i, field) in self.fields.clone().iter().enumerate() {
            let value = if with_default {
                b.make_zero(field.ty)
            } else {
                b.make_local_get(temp_indexes[i], field.ty)
            };
            let set = b.make_local_set(self.local_indexes[i], value);
            contents.push(set);
        }
        if desc.is_some() {
            let ty = self.desc_local_ty();
            let get = b.make_local_get(*temp_indexes.last().unwrap(), ty);
            let set = b.make_local_set(self.local_indexes[num_fields], get);
            contents.push(set);
        }

        // The allocation becomes a typed null: the expression keeps a
        // reference type for the flows downstream, all of which are being
        // rewritten to tolerate it.
        let null = b.make_ref_null(self.alloc_heap);
        contents.push(null);
        let new = b.make_block(contents);
        self.replace(func, id, parent, new);
    }

    fn lower_ref_cast(
        &mut self,
        id: ExprId,
        parent: Option<ExprId>,
        reference: ExprId,
        desc: Option<ExprId>,
        func: &mut Function,
    ) {
        if let Some(desc) = desc {
            let alloc_is_ref = self.analyzer.interaction(reference) == Some(Interaction::Flows);
            let alloc_is_desc = self.analyzer.interaction(desc) == Some(Interaction::Flows);
            if self.desc_ty.is_none() || alloc_is_desc {
                // Either the allocation has no descriptor (so a descriptor
                // cast of it must fail), or the allocation flows in as the
                // descriptor, which cannot have described the cast value
                // without having escaped.
                let cast_ty = func.arena.ty(id);
                if alloc_is_desc && !alloc_is_ref && matches!(cast_ty, Type::Ref(r) if r.nullable) {
                    // A null value may still pass the cast. Reuse this
                    // expression as a plain cast to null, using a scratch
                    // local to move the reference past the descriptor and
                    // keep evaluation order.
                    let ref_ty = func.arena.ty(reference);
                    let scratch = func.add_local(ref_ty);
                    let mut b = Builder::new(func);
                    let set = b.make_local_set(scratch, reference);
                    let dropped = b.make_drop(desc);
                    let get = b.make_local_get(scratch, ref_ty);
                    match func.arena.kind_mut(id) {
                        ExprKind::RefCast { reference, desc } => {
                            *reference = get;
                            *desc = None;
                        }
                        _ => unreachable!(),
                    }
                    let nullability = match cast_ty {
                        Type::Ref(r) => r.nullable,
                        _ => unreachable!(),
                    };
                    func.arena.set_ty(
                        id,
                        Type::Ref(RefType {
                            heap: HeapType::None,
                            nullable: nullability,
                        }),
                    );
                    let mut b = Builder::new(func);
                    let new = b.make_block(vec![set, dropped, id]);
                    self.replace(func, id, parent, new);
                } else {
                    // The cast rejects non-null values, and ours is not
                    // null: certain trap.
                    let mut b = Builder::new(func);
                    let dr = b.make_drop(reference);
                    let dd = b.make_drop(desc);
                    let u = b.make_unreachable();
                    let new = b.make_block(vec![dr, dd, u]);
                    self.replace(func, id, parent, new);
                }
            } else {
                debug_assert!(alloc_is_ref);
                // The cast succeeds iff the given descriptor is the
                // allocation's own, and traps otherwise.
                let ty = self.desc_local_ty();
                let desc_local = self.desc_local();
                let alloc_heap = self.alloc_heap;
                let mut b = Builder::new(func);
                let dropped = b.make_drop(reference);
                let stored = b.make_local_get(desc_local, ty);
                let eq = b.make_ref_eq(desc, stored);
                let null = b.make_ref_null(alloc_heap);
                let trap = b.make_unreachable();
                let iff = b.make_if(eq, null, Some(trap));
                let new = b.make_sequence(dropped, iff);
                self.replace(func, id, parent, new);
            }
        } else {
            // A plain cast of the allocation: the outcome is static.
            if self.types.is_sub_type(self.alloc_ty, func.arena.ty(id)) {
                // A no-op once the allocation is gone.
                self.replace(func, id, parent, reference);
            } else {
                let mut b = Builder::new(func);
                let dropped = b.make_drop(reference);
                let u = b.make_unreachable();
                let new = b.make_sequence(dropped, u);
                self.replace(func, id, parent, new);
            }
        }

        // Either an unreachable appeared, or a cast was replaced by its
        // less-refined operand; both require recomputing parent types.
        self.refinalize = true;
    }

    fn lower_rmw(
        &mut self,
        id: ExprId,
        parent: Option<ExprId>,
        op: RmwOp,
        reference: ExprId,
        index: u32,
        value: ExprId,
        func: &mut Function,
    ) {
        let ty = func.arena.ty(id);
        debug_assert_eq!(ty, self.fields[index as usize].ty);
        debug_assert!(!self.fields[index as usize].is_packed());

        // One scratch holds the old value to return; another holds the
        // evaluated operand in case its evaluation touches the field.
        let old_scratch = func.add_local(ty);
        let val_scratch = func.add_local(ty);
        let local = self.local_indexes[index as usize];

        let mut b = Builder::new(func);
        let dropped = b.make_drop(reference);
        let stash_val = b.make_local_set(val_scratch, value);
        let old_get = b.make_local_get(local, ty);
        let stash_old = b.make_local_set(old_scratch, old_get);

        let new_val = match op {
            RmwOp::Xchg => b.make_local_get(val_scratch, ty),
            _ => {
                let binop = rmw_binary_op(ty, op);
                let l = b.make_local_get(local, ty);
                let r = b.make_local_get(val_scratch, ty);
                b.make_binary(binop, l, r)
            }
        };
        let store = b.make_local_set(local, new_val);
        let unstash = b.make_local_get(old_scratch, ty);
        let new = b.make_block(vec![dropped, stash_val, stash_old, store, unstash]);
        self.replace(func, id, parent, new);
    }

    fn lower_cmpxchg(
        &mut self,
        id: ExprId,
        parent: Option<ExprId>,
        reference: ExprId,
        index: u32,
        expected: ExprId,
        replacement: ExprId,
        func: &mut Function,
    ) {
        let ty = func.arena.ty(id);
        debug_assert_eq!(ty, self.fields[index as usize].ty);
        debug_assert!(!self.fields[index as usize].is_packed());

        let old_scratch = func.add_local(ty);
        let expected_scratch = func.add_local(ty);
        let replacement_scratch = func.add_local(ty);
        let local = self.local_indexes[index as usize];

        let mut b = Builder::new(func);
        let dropped = b.make_drop(reference);
        let stash_exp = b.make_local_set(expected_scratch, expected);
        let stash_rep = b.make_local_set(replacement_scratch, replacement);
        let old_get = b.make_local_get(local, ty);
        let stash_old = b.make_local_set(old_scratch, old_get);

        let lhs = b.make_local_get(local, ty);
        let rhs = b.make_local_get(expected_scratch, ty);
        let pred = if ty.is_ref() {
            b.make_ref_eq(lhs, rhs)
        } else {
            b.make_binary(eq_op(ty), lhs, rhs)
        };
        let rep_get = b.make_local_get(replacement_scratch, ty);
        let exchange = b.make_local_set(local, rep_get);
        let iff = b.make_if(pred, exchange, None);
        let unstash = b.make_local_get(old_scratch, ty);
        let new = b.make_block(vec![dropped, stash_exp, stash_rep, stash_old, iff, unstash]);
        self.replace(func, id, parent, new);
    }
}

fn rmw_binary_op(ty: Type, op: RmwOp) -> BinaryOp {
    match (ty, op) {
        (Type::I32, RmwOp::Add) => BinaryOp::I32Add,
        (Type::I32, RmwOp::Sub) => BinaryOp::I32Sub,
        (Type::I32, RmwOp::And) => BinaryOp::I32And,
        (Type::I32, RmwOp::Or) => BinaryOp::I32Or,
        (Type::I32, RmwOp::Xor) => BinaryOp::I32Xor,
        (Type::I64, RmwOp::Add) => BinaryOp::I64Add,
        (Type::I64, RmwOp::Sub) => BinaryOp::I64Sub,
        (Type::I64, RmwOp::And) => BinaryOp::I64And,
        (Type::I64, RmwOp::Or) => BinaryOp::I64Or,
        (Type::I64, RmwOp::Xor) => BinaryOp::I64Xor,
        _ => unreachable!("rmw on {ty:?} with {op:?}"),
    }
}

fn eq_op(ty: Type) -> BinaryOp {
    match ty {
        Type::I32 => BinaryOp::I32Eq,
        Type::I64 => BinaryOp::I64Eq,
        _ => unreachable!("cmpxchg equality on {ty:?}"),
    }
}

/// Normalizes a non-escaping, small, constant-indexed array allocation into
/// an equivalent struct allocation, which [`Struct2Local`] then lowers.
struct Array2Struct<'a, 'g> {
    allocation: ExprId,
    analyzer: &'a mut EscapeAnalyzer<'g>,
    /// Type of the allocation before the conversion; casts and tests must
    /// be judged against it.
    original_ty: Type,
    struct_ty: TypeId,
    num_fields: u32,
    refinalize: bool,
}

impl<'a, 'g> Array2Struct<'a, 'g> {
    /// Convert and return the replacement `struct.new`.
    fn convert(
        allocation: ExprId,
        analyzer: &'a mut EscapeAnalyzer<'g>,
        func: &mut Function,
        types: &mut TypeStore,
    ) -> ExprId {
        let original_ty = func.arena.ty(allocation);
        let array_def = match original_ty {
            Type::Ref(RefType {
                heap: HeapType::Def(d),
                ..
            }) => d,
            other => panic!("array allocation of type {other:?}"),
        };
        let element = types.array_element(array_def);
        let num_fields = array_new_size(func, allocation);
        let struct_ty = types.add_struct(vec![element; num_fields as usize]);

        // Generate the struct.new replacing the array allocation.
        let (struct_new, replacement) = match func.arena.kind(allocation).clone() {
            ExprKind::ArrayNew { init: None, .. } => {
                let mut b = Builder::new(func);
                let sn = b.make_struct_new(struct_ty, vec![], None);
                (sn, sn)
            }
            ExprKind::ArrayNew {
                init: Some(init), ..
            } => {
                // The same fill value goes into every slot: stage it in a
                // local and read it once per field.
                let local = func.add_local(element.ty);
                let mut b = Builder::new(func);
                let set = b.make_local_set(local, init);
                let gets: Vec<ExprId> = (0..num_fields)
                    .map(|_| b.make_local_get(local, element.ty))
                    .collect();
                let sn = b.make_struct_new(struct_ty, gets, None);
                let rep = b.make_sequence(set, sn);
                (sn, rep)
            }
            ExprKind::ArrayNewFixed { values, .. } => {
                let mut b = Builder::new(func);
                let sn = b.make_struct_new(struct_ty, values, None);
                (sn, sn)
            }
            other => panic!("bad array allocation {other:?}"),
        };

        // The new expressions flow the allocation; the struct lowering
        // depends on the analysis to know that.
        analyzer.reached.insert(struct_new, Interaction::Flows);
        analyzer.reached.insert(replacement, Interaction::Flows);

        let mut pass = Array2Struct {
            allocation,
            analyzer,
            original_ty,
            struct_ty,
            num_fields,
            refinalize: false,
        };

        // Everywhere the allocation reached, the array type becomes the
        // struct type. Casts keep their old type: they are judged against
        // it below, before being replaced.
        let array_heap = HeapType::Def(array_def);
        let reached_ids: Vec<ExprId> = pass.analyzer.reached.keys().copied().collect();
        for id in reached_ids {
            if matches!(func.arena.kind(id), ExprKind::RefCast { .. }) {
                continue;
            }
            if let Type::Ref(r) = func.arena.ty(id) {
                if types.heap_is_sub(array_heap, r.heap) {
                    if r.heap != array_heap {
                        // The type was generalized along the way; narrowing
                        // it here refines, so parents must be recomputed.
                        pass.refinalize = true;
                    }
                    func.arena.set_ty(
                        id,
                        Type::Ref(RefType {
                            heap: HeapType::Def(struct_ty),
                            nullable: r.nullable,
                        }),
                    );
                }
            }
        }

        let body = func.body.expect("rewriting a defined function");
        for (id, parent) in func.arena.postorder_with_parents(body) {
            pass.visit(id, parent, replacement, func, types);
        }
        if pass.refinalize {
            refinalize_function(func, types);
        }
        struct_new
    }

    fn replace(&mut self, func: &mut Function, old: ExprId, parent: Option<ExprId>, new: ExprId) {
        self.analyzer
            .apply_old_interaction(old, new, func.arena.ty(new));
        match parent {
            Some(parent) => {
                let patched = func.arena.replace_child(parent, old, new);
                debug_assert!(patched, "parent slot not found");
            }
            None => func.body = Some(new),
        }
    }

    fn visit(
        &mut self,
        id: ExprId,
        parent: Option<ExprId>,
        replacement: ExprId,
        func: &mut Function,
        types: &TypeStore,
    ) {
        let kind = func.arena.kind(id).clone();
        match kind {
            ExprKind::ArrayNew { .. } | ExprKind::ArrayNewFixed { .. } => {
                if id == self.allocation {
                    self.replace(func, id, parent, replacement);
                }
            }
            ExprKind::ArrayGet {
                reference,
                index,
                signed,
            } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                let idx = const_index(&func.arena, index).expect("analyzed index is constant");
                if idx >= self.num_fields {
                    // Out of bounds: this access traps.
                    let mut b = Builder::new(func);
                    let dropped = b.make_drop(reference);
                    let u = b.make_unreachable();
                    let new = b.make_sequence(dropped, u);
                    self.replace(func, id, parent, new);
                    self.refinalize = true;
                    return;
                }
                let ty = func.arena.ty(id);
                let mut b = Builder::new(func);
                let new = b.make_struct_get(idx, reference, ty, signed);
                self.replace(func, id, parent, new);
            }
            ExprKind::ArraySet {
                reference,
                index,
                value,
            } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                let idx = const_index(&func.arena, index).expect("analyzed index is constant");
                if idx >= self.num_fields {
                    let mut b = Builder::new(func);
                    let dr = b.make_drop(reference);
                    let dv = b.make_drop(value);
                    let u = b.make_unreachable();
                    let new = b.make_block(vec![dr, dv, u]);
                    self.replace(func, id, parent, new);
                    self.refinalize = true;
                    return;
                }
                let mut b = Builder::new(func);
                let new = b.make_struct_set(idx, reference, value);
                self.replace(func, id, parent, new);
            }
            ExprKind::ArrayRmw {
                op,
                reference,
                index,
                value,
            } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                let idx = const_index(&func.arena, index).expect("analyzed index is constant");
                if idx >= self.num_fields {
                    let mut b = Builder::new(func);
                    let dr = b.make_drop(reference);
                    let dv = b.make_drop(value);
                    let u = b.make_unreachable();
                    let new = b.make_block(vec![dr, dv, u]);
                    self.replace(func, id, parent, new);
                    self.refinalize = true;
                    return;
                }
                let ty = func.arena.ty(id);
                let new = func.arena.alloc(
                    ExprKind::StructRmw {
                        op,
                        reference,
                        index: idx,
                        value,
                    },
                    ty,
                );
                self.replace(func, id, parent, new);
            }
            ExprKind::ArrayCmpxchg {
                reference,
                index,
                expected,
                replacement: rep,
            } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                let idx = const_index(&func.arena, index).expect("analyzed index is constant");
                if idx >= self.num_fields {
                    let mut b = Builder::new(func);
                    let dr = b.make_drop(reference);
                    let de = b.make_drop(expected);
                    let dp = b.make_drop(rep);
                    let u = b.make_unreachable();
                    let new = b.make_block(vec![dr, de, dp, u]);
                    self.replace(func, id, parent, new);
                    self.refinalize = true;
                    return;
                }
                let ty = func.arena.ty(id);
                let new = func.arena.alloc(
                    ExprKind::StructCmpxchg {
                        reference,
                        index: idx,
                        expected,
                        replacement: rep,
                    },
                    ty,
                );
                self.replace(func, id, parent, new);
            }
            ExprKind::RefTest { cast_ty, .. } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                // Judged against the array type the allocation had before
                // this conversion; as a struct the answer would differ.
                let result = types.is_sub_type(self.original_ty, Type::Ref(cast_ty)) as i32;
                let mut b = Builder::new(func);
                let dropped = b.make_drop(id);
                let c = b.make_const(Literal::I32(result));
                let new = b.make_sequence(dropped, c);
                self.replace(func, id, parent, new);
            }
            ExprKind::RefCast { .. } => {
                if self.analyzer.interaction(id).is_none() {
                    return;
                }
                if !types.is_sub_type(self.original_ty, func.arena.ty(id)) {
                    // The cast fails on the original array type: trap.
                    let mut b = Builder::new(func);
                    let dropped = b.make_drop(id);
                    let u = b.make_unreachable();
                    let new = b.make_sequence(dropped, u);
                    self.replace(func, id, parent, new);
                } else {
                    // The cast succeeds; it now produces the struct. The
                    // reference is removed by the struct lowering later, so
                    // non-nullable is fine here.
                    func.arena
                        .set_ty(id, Type::Ref(RefType::non_null(HeapType::Def(self.struct_ty))));
                }
                self.refinalize = true;
            }
            _ => {}
        }
    }
}

fn array_new_size(func: &Function, allocation: ExprId) -> u32 {
    match func.arena.kind(allocation) {
        ExprKind::ArrayNew { size, .. } => {
            const_index(&func.arena, *size).expect("candidate size is a constant")
        }
        ExprKind::ArrayNewFixed { values, .. } => values.len() as u32,
        other => panic!("bad array allocation {other:?}"),
    }
}

/// Arrays above this size stay on the heap: very large "constant" sizes
/// appear in the wild (and would blow up the local count), and moving a
/// sizable aggregate into locals is not always profitable.
const MAX_ARRAY_SIZE: u32 = 20;

fn optimize_function(
    func: &mut Function,
    types: &mut TypeStore,
    options: &PassOptions,
    stats: &mut Heap2LocalStats,
) {
    let body = func.body.expect("defined function");

    // Find the candidate allocations, ignoring unreachable ones that DCE
    // will remove anyhow.
    let mut struct_news = Vec::new();
    let mut array_news = Vec::new();
    let mut has_pop = false;
    for id in func.arena.postorder(body) {
        match func.arena.kind(id) {
            ExprKind::StructNew { .. } => {
                if func.arena.ty(id) != Type::Unreachable {
                    struct_news.push(id);
                }
            }
            ExprKind::ArrayNew { size, .. } => {
                if func.arena.ty(id) != Type::Unreachable {
                    if let Some(n) = const_index(&func.arena, *size) {
                        if n < MAX_ARRAY_SIZE {
                            array_news.push(id);
                        }
                    }
                }
            }
            ExprKind::ArrayNewFixed { values, .. } => {
                if func.arena.ty(id) != Type::Unreachable
                    && (values.len() as u32) < MAX_ARRAY_SIZE
                {
                    array_news.push(id);
                }
            }
            ExprKind::Pop => has_pop = true,
            _ => {}
        }
    }

    let mut optimized = false;

    // Lower non-escaping arrays into structs first, so the rest of the
    // pass deals with structs alone.
    for allocation in array_news {
        if !can_handle_as_locals(func.arena.ty(allocation), types) {
            continue;
        }
        let parents = ParentMap::build(func);
        let graph = LocalGraph::build(func);
        let targets = BranchTargets::build(func);
        let mut analyzer = EscapeAnalyzer::new(&graph, &parents, &targets, options);
        if !analyzer.escapes(allocation, func, types) {
            let struct_new = Array2Struct::convert(allocation, &mut analyzer, func, types);
            Struct2Local::rewrite(struct_new, &mut analyzer, func, types);
            optimized = true;
            stats.arrays_lowered += 1;
        }
    }

    for allocation in struct_news {
        if !can_handle_as_locals(func.arena.ty(allocation), types) {
            continue;
        }
        let parents = ParentMap::build(func);
        let graph = LocalGraph::build(func);
        let targets = BranchTargets::build(func);
        let mut analyzer = EscapeAnalyzer::new(&graph, &parents, &targets, options);
        if !analyzer.escapes(allocation, func, types) {
            Struct2Local::rewrite(allocation, &mut analyzer, func, types);
            optimized = true;
            stats.structs_lowered += 1;
        }
    }

    // Everything above wraps code in blocks, which may have pushed a pop
    // out of its catch's first position.
    if has_pop && optimized {
        handle_block_nested_pops(func);
    }
}

/// Whether the allocation's data can live in locals.
fn can_handle_as_locals(ty: Type, types: &TypeStore) -> bool {
    let def = match ty {
        Type::Ref(RefType {
            heap: HeapType::Def(d),
            ..
        }) => d,
        _ => return false,
    };
    match &types.def(def).kind {
        TypeDefKind::Struct(fields) => fields.iter().all(can_handle_as_local),
        TypeDefKind::Array(elem) => can_handle_as_local(elem),
    }
}

fn can_handle_as_local(field: &Field) -> bool {
    match field.ty {
        Type::I32 | Type::I64 | Type::F32 | Type::F64 => true,
        // A local must be default-initializable, so only nullable
        // references qualify.
        Type::Ref(r) => r.nullable,
        Type::None | Type::Unreachable => false,
    }
}

/// Re-normalize catch bodies whose `pop` is no longer the first thing that
/// executes: stash the popped value in a fresh local right at the top and
/// read the local where the pop used to be.
fn handle_block_nested_pops(func: &mut Function) {
    let Some(body) = func.body else {
        return;
    };
    let tries: Vec<ExprId> = func
        .arena
        .postorder(body)
        .into_iter()
        .filter(|&id| matches!(func.arena.kind(id), ExprKind::Try { .. }))
        .collect();
    for try_id in tries {
        let catch_roots: Vec<ExprId> = match func.arena.kind(try_id) {
            ExprKind::Try {
                catch_bodies,
                catch_all,
                ..
            } => catch_bodies.iter().chain(catch_all.iter()).copied().collect(),
            _ => unreachable!(),
        };
        for root in catch_roots {
            let Some((pop, pop_parent)) = find_pop(func, root) else {
                continue;
            };
            if pop_is_first(func, root, pop) {
                continue;
            }
            let ty = func.arena.ty(pop);
            let local = func.add_local(ty);
            let get = func.arena.alloc(ExprKind::LocalGet { index: local }, ty);
            match pop_parent {
                Some(p) => {
                    func.arena.replace_child(p, pop, get);
                }
                None => unreachable!("a first-position pop needs no fixup"),
            }
            let fresh_pop = func.arena.alloc(ExprKind::Pop, ty);
            let mut b = Builder::new(func);
            let set = b.make_local_set(local, fresh_pop);
            let new_root = b.make_sequence(set, root);
            func.arena.replace_child(try_id, root, new_root);
        }
    }
}

fn find_pop(func: &Function, root: ExprId) -> Option<(ExprId, Option<ExprId>)> {
    func.arena
        .postorder_with_parents(root)
        .into_iter()
        .find(|&(id, _)| matches!(func.arena.kind(id), ExprKind::Pop))
}

fn pop_is_first(func: &Function, root: ExprId, pop: ExprId) -> bool {
    let mut cur = root;
    loop {
        if cur == pop {
            return true;
        }
        match func.arena.kind(cur) {
            ExprKind::Block { list, .. } if !list.is_empty() => cur = list[0],
            _ => return false,
        }
    }
}
