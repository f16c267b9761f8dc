//! Stack-machine IR builders for reconstruction.
//!
//! Reconstruction re-emits a function from its stringified traversal, which
//! visits scopes sequentially rather than nested. Two builders cooperate:
//!
//! - [`InPlaceBuilder`] rebuilds the host function inside its own arena.
//!   Instructions re-pop their children from a value stack, so code whose
//!   neighborhood changed (a sequence replaced by a call) re-links
//!   correctly, and untouched code re-links to exactly what it had.
//!   Control-flow structures are pushed complete at their surface position
//!   and have their interiors re-filled when their deferred scope events
//!   arrive.
//! - [`OutlinedBuilder`] builds an outlined callee in a fresh arena by
//!   shallow-copying each visited instruction and re-popping its children
//!   from the callee's own stack, which starts as `local.get` of each
//!   parameter.
//!
//! Any inconsistency (an impossible pop, a mismatched scope) is an internal
//! error: reconstruction must abort, not guess.

use anyhow::{bail, Result};

use crate::{child_slots_mut, ExprId, ExprKind, Function, Type};

/// Which arm of a scope is currently being filled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Main,
    Else,
    Catch(usize),
    CatchAll,
}

#[derive(Debug)]
enum ScopeSlot {
    FuncRoot,
    Scope(ExprId),
}

#[derive(Debug)]
struct Scope {
    slot: ScopeSlot,
    region: Region,
    items: Vec<ExprId>,
    unreachable: bool,
}

impl Scope {
    fn new(slot: ScopeSlot) -> Scope {
        Scope {
            slot,
            region: Region::Main,
            items: Vec::new(),
            unreachable: false,
        }
    }
}

/// Pop a value off `items`, packaging trailing effect-only instructions
/// behind a scratch local when the value sits beneath them, and
/// manufacturing an `unreachable` placeholder in dead code.
fn pop_value(func: &mut Function, items: &mut Vec<ExprId>, in_unreachable: bool) -> Result<ExprId> {
    let mut split = items.len();
    while split > 0 {
        if func.arena.ty(items[split - 1]).is_concrete() {
            break;
        }
        split -= 1;
    }
    if split == 0 {
        if in_unreachable {
            return Ok(func.arena.alloc(ExprKind::Unreachable, Type::Unreachable));
        }
        bail!("reconstruction popped an empty value stack");
    }
    let value = items[split - 1];
    if split == items.len() {
        items.pop();
        return Ok(value);
    }
    // Effect-only instructions executed after the value: keep their order
    // with a scratch local.
    let trailing: Vec<ExprId> = items.drain(split..).collect();
    items.pop();
    let ty = func.arena.ty(value);
    let scratch = func.add_local(ty);
    let set = func
        .arena
        .alloc(ExprKind::LocalSet { index: scratch, value }, Type::None);
    let get = func.arena.alloc(ExprKind::LocalGet { index: scratch }, ty);
    let mut list = vec![set];
    list.extend(trailing);
    list.push(get);
    Ok(func.arena.alloc(ExprKind::Block { name: None, list }, ty))
}

/// Wrap a scope's items into a single expression.
fn package(func: &mut Function, items: Vec<ExprId>) -> ExprId {
    if items.len() == 1 {
        return items[0];
    }
    let ty = items
        .last()
        .map(|&l| func.arena.ty(l))
        .unwrap_or(Type::None);
    func.arena.alloc(ExprKind::Block { name: None, list: items }, ty)
}

/// Rebuilds a function in place from its stringified event stream.
pub struct InPlaceBuilder<'f> {
    func: &'f mut Function,
    scopes: Vec<Scope>,
    pending_body: Option<ExprId>,
}

impl<'f> InPlaceBuilder<'f> {
    /// A builder over `func`.
    pub fn new(func: &'f mut Function) -> InPlaceBuilder<'f> {
        InPlaceBuilder {
            func,
            scopes: Vec::new(),
            pending_body: None,
        }
    }

    /// Read access to the function being rebuilt.
    pub fn func(&self) -> &Function {
        self.func
    }

    /// Open the function scope.
    pub fn visit_function_start(&mut self) -> Result<()> {
        self.scopes.clear();
        self.pending_body = None;
        self.scopes.push(Scope::new(ScopeSlot::FuncRoot));
        Ok(())
    }

    fn scope_mut(&mut self) -> Result<&mut Scope> {
        match self.scopes.last_mut() {
            Some(s) => Ok(s),
            None => bail!("no open scope during reconstruction"),
        }
    }

    fn push(&mut self, id: ExprId) -> Result<()> {
        let unreachable = self.func.arena.ty(id) == Type::Unreachable;
        let scope = self.scope_mut()?;
        scope.items.push(id);
        if unreachable {
            scope.unreachable = true;
        }
        Ok(())
    }

    /// Push an already-built expression onto the current scope's stack.
    pub fn push_synthetic(&mut self, id: ExprId) -> Result<()> {
        self.push(id)
    }

    fn pop(&mut self) -> Result<ExprId> {
        let scope = match self.scopes.last_mut() {
            Some(s) => s,
            None => bail!("no open scope during reconstruction"),
        };
        pop_value(self.func, &mut scope.items, scope.unreachable)
    }

    fn pop_children(&mut self, count: usize) -> Result<Vec<ExprId>> {
        let mut popped = Vec::with_capacity(count);
        for _ in 0..count {
            popped.push(self.pop()?);
        }
        popped.reverse();
        Ok(popped)
    }

    /// Re-emit one instruction at its surface position. Control-flow
    /// structures are pushed complete (an if re-pops its condition); their
    /// interiors are rebuilt later, when their scope events arrive.
    pub fn visit(&mut self, id: ExprId) -> Result<()> {
        enum Shape {
            Complete,
            If,
            Break(Type),
            Switch(Type),
            Plain(usize),
        }
        let shape = match self.func.arena.kind(id) {
            ExprKind::Block { .. }
            | ExprKind::Loop { .. }
            | ExprKind::Try { .. }
            | ExprKind::TryTable { .. } => Shape::Complete,
            ExprKind::If { .. } => Shape::If,
            ExprKind::Break { value, .. } => {
                Shape::Break(value.map(|v| self.func.arena.ty(v)).unwrap_or(Type::None))
            }
            ExprKind::Switch { value, .. } => {
                Shape::Switch(value.map(|v| self.func.arena.ty(v)).unwrap_or(Type::None))
            }
            other => Shape::Plain(crate::child_ids_of(other).len()),
        };
        match shape {
            Shape::Complete => self.push(id),
            Shape::If => {
                let condition = self.pop()?;
                match self.func.arena.kind_mut(id) {
                    ExprKind::If { condition: slot, .. } => *slot = condition,
                    _ => unreachable!(),
                }
                self.push(id)
            }
            Shape::Break(ty) => self.visit_break_with_type(id, ty),
            Shape::Switch(ty) => self.visit_switch_with_type(id, ty),
            Shape::Plain(count) => {
                let popped = self.pop_children(count)?;
                for (slot, v) in child_slots_mut(self.func.arena.kind_mut(id))
                    .into_iter()
                    .zip(popped)
                {
                    *slot = v;
                }
                self.push(id)
            }
        }
    }

    /// Re-emit a break, with the type its value had in the original body.
    pub fn visit_break_with_type(&mut self, id: ExprId, ty: Type) -> Result<()> {
        let (has_value, has_condition) = match self.func.arena.kind(id) {
            ExprKind::Break {
                value, condition, ..
            } => (value.is_some(), condition.is_some()),
            other => bail!("visit_break_with_type on {other:?}"),
        };
        let condition = if has_condition { Some(self.pop()?) } else { None };
        let value = if has_value { Some(self.pop()?) } else { None };
        match self.func.arena.kind_mut(id) {
            ExprKind::Break {
                value: vslot,
                condition: cslot,
                ..
            } => {
                *vslot = value;
                *cslot = condition;
            }
            _ => unreachable!(),
        }
        let new_ty = if has_condition {
            if has_value {
                ty
            } else {
                Type::None
            }
        } else {
            Type::Unreachable
        };
        self.func.arena.set_ty(id, new_ty);
        self.push(id)
    }

    /// Re-emit a br_table, with the type its value had in the original
    /// body.
    pub fn visit_switch_with_type(&mut self, id: ExprId, _ty: Type) -> Result<()> {
        let has_value = match self.func.arena.kind(id) {
            ExprKind::Switch { value, .. } => value.is_some(),
            other => bail!("visit_switch_with_type on {other:?}"),
        };
        let condition = self.pop()?;
        let value = if has_value { Some(self.pop()?) } else { None };
        match self.func.arena.kind_mut(id) {
            ExprKind::Switch {
                value: vslot,
                condition: cslot,
                ..
            } => {
                *vslot = value;
                *cslot = condition;
            }
            _ => unreachable!(),
        }
        self.func.arena.set_ty(id, Type::Unreachable);
        self.push(id)
    }

    /// Begin re-filling a block's interior.
    pub fn visit_block_start(&mut self, id: ExprId) -> Result<()> {
        self.scopes.push(Scope::new(ScopeSlot::Scope(id)));
        Ok(())
    }

    /// Begin re-filling a loop's interior.
    pub fn visit_loop_start(&mut self, id: ExprId) -> Result<()> {
        self.scopes.push(Scope::new(ScopeSlot::Scope(id)));
        Ok(())
    }

    /// Begin re-filling an if's arms. The condition is popped, as a parser
    /// would; the caller re-pushes the already-installed condition first.
    pub fn visit_if_start(&mut self, id: ExprId) -> Result<()> {
        let condition = self.pop()?;
        match self.func.arena.kind_mut(id) {
            ExprKind::If { condition: slot, .. } => *slot = condition,
            other => bail!("visit_if_start on {other:?}"),
        }
        self.scopes.push(Scope::new(ScopeSlot::Scope(id)));
        Ok(())
    }

    /// Begin re-filling a try's arms.
    pub fn visit_try_start(&mut self, id: ExprId) -> Result<()> {
        self.scopes.push(Scope::new(ScopeSlot::Scope(id)));
        Ok(())
    }

    /// Begin re-filling a try_table's body.
    pub fn visit_try_table_start(&mut self, id: ExprId) -> Result<()> {
        self.scopes.push(Scope::new(ScopeSlot::Scope(id)));
        Ok(())
    }

    /// Move to the else arm of the current if scope.
    pub fn visit_else(&mut self) -> Result<()> {
        let scope = self.scope_mut()?;
        if scope.region != Region::Main {
            bail!("else outside an if main arm");
        }
        let items = std::mem::take(&mut scope.items);
        scope.region = Region::Else;
        scope.unreachable = false;
        let id = match scope.slot {
            ScopeSlot::Scope(id) => id,
            ScopeSlot::FuncRoot => bail!("else at function scope"),
        };
        let arm = package(self.func, items);
        match self.func.arena.kind_mut(id) {
            ExprKind::If { if_true, .. } => *if_true = arm,
            other => bail!("else on {other:?}"),
        }
        Ok(())
    }

    /// Move to catch arm `arm` of the current try scope.
    pub fn visit_catch(&mut self, arm: usize) -> Result<()> {
        self.finish_try_region()?;
        let scope = self.scope_mut()?;
        scope.region = Region::Catch(arm);
        scope.unreachable = false;
        Ok(())
    }

    /// Move to the catch-all arm of the current try scope.
    pub fn visit_catch_all(&mut self) -> Result<()> {
        self.finish_try_region()?;
        let scope = self.scope_mut()?;
        scope.region = Region::CatchAll;
        scope.unreachable = false;
        Ok(())
    }

    fn finish_try_region(&mut self) -> Result<()> {
        let scope = self.scope_mut()?;
        let items = std::mem::take(&mut scope.items);
        let region = scope.region;
        let id = match scope.slot {
            ScopeSlot::Scope(id) => id,
            ScopeSlot::FuncRoot => bail!("catch at function scope"),
        };
        let filled = package(self.func, items);
        match (self.func.arena.kind_mut(id), region) {
            (ExprKind::Try { body, .. }, Region::Main) => *body = filled,
            (ExprKind::Try { catch_bodies, .. }, Region::Catch(i)) => catch_bodies[i] = filled,
            (other, _) => bail!("catch on {other:?}"),
        }
        Ok(())
    }

    /// Close the current scope. A deferred scope's node was already linked
    /// at its surface position; the function scope records the body for
    /// [`InPlaceBuilder::build`].
    pub fn visit_end(&mut self) -> Result<()> {
        let Some(mut scope) = self.scopes.pop() else {
            bail!("end without an open scope");
        };
        let items = std::mem::take(&mut scope.items);
        match scope.slot {
            ScopeSlot::FuncRoot => {
                self.pending_body = Some(package(self.func, items));
            }
            ScopeSlot::Scope(id) => {
                let region = scope.region;
                if let ExprKind::Block { .. } = self.func.arena.kind(id) {
                    match self.func.arena.kind_mut(id) {
                        ExprKind::Block { list, .. } => *list = items,
                        _ => unreachable!(),
                    }
                    return Ok(());
                }
                let filled = package(self.func, items);
                match (self.func.arena.kind_mut(id), region) {
                    (ExprKind::Loop { body, .. }, Region::Main) => *body = filled,
                    (ExprKind::If { if_true, .. }, Region::Main) => *if_true = filled,
                    (ExprKind::If { if_false, .. }, Region::Else) => *if_false = Some(filled),
                    (ExprKind::Try { body, .. }, Region::Main) => *body = filled,
                    (ExprKind::Try { catch_bodies, .. }, Region::Catch(i)) => {
                        catch_bodies[i] = filled
                    }
                    (ExprKind::Try { catch_all, .. }, Region::CatchAll) => {
                        *catch_all = Some(filled)
                    }
                    (ExprKind::TryTable { body, .. }, Region::Main) => *body = filled,
                    (other, _) => bail!("end on {other:?}"),
                }
            }
        }
        Ok(())
    }

    /// Emit a call to `name`, popping its arguments.
    pub fn make_call(&mut self, name: &str, params: &[Type], results: &[Type]) -> Result<ExprId> {
        let operands = self.pop_children(params.len())?;
        let ty = results.first().copied().unwrap_or(Type::None);
        let call = self.func.arena.alloc(
            ExprKind::Call {
                target: name.to_string(),
                operands,
                is_return: false,
            },
            ty,
        );
        self.push(call)?;
        Ok(call)
    }

    /// Emit an `unreachable`.
    pub fn make_unreachable(&mut self) -> Result<ExprId> {
        let u = self.func.arena.alloc(ExprKind::Unreachable, Type::Unreachable);
        self.push(u)?;
        Ok(u)
    }

    /// Install the finished body. Errors if scopes remain open.
    pub fn build(&mut self) -> Result<()> {
        if !self.scopes.is_empty() {
            bail!("function ended with {} open scopes", self.scopes.len());
        }
        match self.pending_body.take() {
            Some(body) => {
                self.func.body = Some(body);
                Ok(())
            }
            None => bail!("function ended without a body"),
        }
    }
}

/// Builds an outlined callee by copying visited instructions into a fresh
/// function.
pub struct OutlinedBuilder {
    func: Function,
    items: Vec<ExprId>,
    unreachable: bool,
}

impl OutlinedBuilder {
    /// Start the callee with its computed signature.
    pub fn start(name: String, params: Vec<Type>, results: Vec<Type>) -> OutlinedBuilder {
        OutlinedBuilder {
            func: Function::new(name, params, results),
            items: Vec::new(),
            unreachable: false,
        }
    }

    fn push(&mut self, id: ExprId) {
        if self.func.arena.ty(id) == Type::Unreachable {
            self.unreachable = true;
        }
        self.items.push(id);
    }

    /// `local.get` of parameter `index`.
    pub fn make_local_get(&mut self, index: u32) -> Result<ExprId> {
        let ty = self.func.local_type(index);
        let get = self.func.arena.alloc(ExprKind::LocalGet { index }, ty);
        self.push(get);
        Ok(get)
    }

    /// Copy one instruction from the host function, re-popping its
    /// children from the callee's stack.
    pub fn visit(&mut self, src: &Function, id: ExprId) -> Result<()> {
        let kind = src.arena.kind(id);
        if kind.is_control_flow() {
            bail!("control flow cannot be outlined");
        }
        let mut kind = kind.clone();
        let count = crate::child_ids_of(&kind).len();
        let mut popped = Vec::with_capacity(count);
        for _ in 0..count {
            popped.push(pop_value(&mut self.func, &mut self.items, self.unreachable)?);
        }
        popped.reverse();
        for (slot, v) in child_slots_mut(&mut kind).into_iter().zip(popped) {
            *slot = v;
        }
        let copied = self.func.arena.alloc(kind, src.arena.ty(id));
        self.push(copied);
        Ok(())
    }

    /// Close the callee and return it.
    pub fn finish(mut self) -> Function {
        let items = std::mem::take(&mut self.items);
        let body = package(&mut self.func, items);
        self.func.body = Some(body);
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinaryOp, Literal};

    #[test]
    fn test_pop_packages_trailing_effects() {
        // Stack: [const 1, call(none)] — popping the value must keep the
        // call's position after the const.
        let mut f = Function::new("f", vec![], vec![]);
        let c = f.arena.alloc(
            ExprKind::Const {
                literal: Literal::I32(1),
            },
            Type::I32,
        );
        let call = f.arena.alloc(
            ExprKind::Call {
                target: "effect".into(),
                operands: vec![],
                is_return: false,
            },
            Type::None,
        );
        let mut items = vec![c, call];
        let v = pop_value(&mut f, &mut items, false).unwrap();
        assert!(items.is_empty());
        match f.arena.kind(v) {
            ExprKind::Block { list, .. } => {
                assert_eq!(list.len(), 3);
                assert!(matches!(f.arena.kind(list[0]), ExprKind::LocalSet { .. }));
                assert_eq!(list[1], call);
                assert!(matches!(f.arena.kind(list[2]), ExprKind::LocalGet { .. }));
            }
            other => panic!("expected packaged block, got {other:?}"),
        }
        assert_eq!(f.arena.ty(v), Type::I32);
    }

    #[test]
    fn test_pop_in_dead_code_manufactures_placeholder() {
        let mut f = Function::new("f", vec![], vec![]);
        let mut items = vec![];
        let v = pop_value(&mut f, &mut items, true).unwrap();
        assert!(matches!(f.arena.kind(v), ExprKind::Unreachable));
    }

    #[test]
    fn test_pop_underflow_is_fatal() {
        let mut f = Function::new("f", vec![], vec![]);
        let mut items = vec![];
        assert!(pop_value(&mut f, &mut items, false).is_err());
    }

    #[test]
    fn test_outlined_builder_rebuilds_operand_chain() {
        // Callee for [const 10, add, drop] with one i32 param.
        let mut host = Function::new("host", vec![], vec![]);
        let k = host.arena.alloc(
            ExprKind::Const {
                literal: Literal::I32(10),
            },
            Type::I32,
        );
        let lhs = host.arena.alloc(
            ExprKind::Const {
                literal: Literal::I32(0),
            },
            Type::I32,
        );
        let add = host.arena.alloc(
            ExprKind::Binary {
                op: BinaryOp::I32Add,
                left: lhs,
                right: k,
            },
            Type::I32,
        );
        let drop = host.arena.alloc(ExprKind::Drop { value: add }, Type::None);

        let mut ob = OutlinedBuilder::start("outline$0".into(), vec![Type::I32], vec![]);
        ob.make_local_get(0).unwrap();
        ob.visit(&host, k).unwrap();
        ob.visit(&host, add).unwrap();
        ob.visit(&host, drop).unwrap();
        let callee = ob.finish();

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
                other => panic!("expected add, got {other:?}"),
            },
            other => panic!("expected drop, got {other:?}"),
        }
    }
}
