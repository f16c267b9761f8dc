//! Per-function analyses shared by the passes: the parent side table, the
//! branch-target map, and the local-variable data-flow graph.
//!
//! All three own plain maps keyed by [`ExprId`]; none holds a borrow of the
//! function it was built from, so a pass may mutate the function while the
//! analyses of the pre-mutation body are still alive. They go stale on any
//! rewrite and must be rebuilt before the next analysis.

use std::collections::VecDeque;
use std::hash::Hash;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{ExprArena, ExprId, ExprKind, Function};

/// For each expression, the unique expression containing it. Function body
/// roots have no entry.
#[derive(Debug, Default)]
pub struct ParentMap {
    parents: FxHashMap<ExprId, ExprId>,
}

impl ParentMap {
    /// Build the side table for `func`'s body.
    pub fn build(func: &Function) -> ParentMap {
        let mut parents = FxHashMap::default();
        if let Some(body) = func.body {
            for (id, parent) in func.arena.postorder_with_parents(body) {
                if let Some(p) = parent {
                    parents.insert(id, p);
                }
            }
        }
        ParentMap { parents }
    }

    /// The parent of `id`, or `None` for the body root (and for nodes
    /// detached since the map was built).
    pub fn get(&self, id: ExprId) -> Option<ExprId> {
        self.parents.get(&id).copied()
    }
}

/// Maps branch-label names to their target scope expressions, and back to
/// the branch expressions that reference them.
#[derive(Debug, Default)]
pub struct BranchTargets {
    target_of: FxHashMap<String, ExprId>,
    branches_of: FxHashMap<String, Vec<ExprId>>,
}

impl BranchTargets {
    /// Build the map for `func`'s body. Labels are assumed unique within a
    /// function.
    pub fn build(func: &Function) -> BranchTargets {
        let mut out = BranchTargets::default();
        let Some(body) = func.body else {
            return out;
        };
        for id in func.arena.postorder(body) {
            match func.arena.kind(id) {
                ExprKind::Block {
                    name: Some(name), ..
                }
                | ExprKind::Loop {
                    name: Some(name), ..
                } => {
                    out.target_of.insert(name.clone(), id);
                }
                ExprKind::Break { label, .. } => {
                    out.branches_of.entry(label.clone()).or_default().push(id);
                }
                ExprKind::Switch {
                    labels, default, ..
                } => {
                    let mut seen = FxHashSet::default();
                    for label in labels.iter().chain([default]) {
                        if seen.insert(label.clone()) {
                            out.branches_of.entry(label.clone()).or_default().push(id);
                        }
                    }
                }
                ExprKind::TryTable { catches, .. } => {
                    // Exception edges count as branches to their labels.
                    let mut seen = FxHashSet::default();
                    for catch in catches {
                        if seen.insert(catch.label.clone()) {
                            out.branches_of
                                .entry(catch.label.clone())
                                .or_default()
                                .push(id);
                        }
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// The scope expression a label names.
    pub fn target(&self, name: &str) -> Option<ExprId> {
        self.target_of.get(name).copied()
    }

    /// Every branch expression referencing `name`.
    pub fn branches(&self, name: &str) -> &[ExprId] {
        self.branches_of.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The labels to which `parent` sends `child` as the branch value.
pub fn branches_sent_by_parent(arena: &ExprArena, parent: ExprId, child: ExprId) -> Vec<String> {
    match arena.kind(parent) {
        ExprKind::Break {
            label,
            value: Some(v),
            ..
        } if *v == child => vec![label.clone()],
        ExprKind::Switch {
            labels,
            default,
            value: Some(v),
            ..
        } if *v == child => {
            let mut out = Vec::new();
            let mut seen = FxHashSet::default();
            for label in labels.iter().chain([default]) {
                if seen.insert(label.clone()) {
                    out.push(label.clone());
                }
            }
            out
        }
        _ => vec![],
    }
}

/// A value source observable at a `local.get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SetSource {
    /// The parameter or default value the local holds at function entry
    Entry,
    /// A `local.set` / `local.tee` expression
    Set(ExprId),
}

type LocalSets = FxHashSet<SetSource>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct FlowState {
    live: bool,
    locals: Vec<LocalSets>,
}

impl FlowState {
    fn entry(num_locals: usize) -> FlowState {
        let mut one = LocalSets::default();
        one.insert(SetSource::Entry);
        FlowState {
            live: true,
            locals: vec![one; num_locals],
        }
    }

    fn dead(num_locals: usize) -> FlowState {
        FlowState {
            live: false,
            locals: vec![LocalSets::default(); num_locals],
        }
    }

    fn merge_from(&mut self, other: &FlowState) {
        if !other.live {
            return;
        }
        if !self.live {
            *self = other.clone();
            return;
        }
        for (mine, theirs) in self.locals.iter_mut().zip(&other.locals) {
            mine.extend(theirs.iter().copied());
        }
    }
}

/// Reaching-definitions data flow for locals: for each `local.get`, the
/// sets (or the entry value) it may read; for each `local.set`/`local.tee`,
/// the gets it may influence.
#[derive(Debug, Default)]
pub struct LocalGraph {
    get_sources: FxHashMap<ExprId, Vec<SetSource>>,
    set_influences: FxHashMap<ExprId, Vec<ExprId>>,
}

impl LocalGraph {
    /// Build the graph for `func`'s body.
    pub fn build(func: &Function) -> LocalGraph {
        let mut builder = GraphBuilder {
            func,
            buckets: FxHashMap::default(),
            get_sources: FxHashMap::default(),
        };
        if let Some(body) = func.body {
            let mut state = FlowState::entry(func.num_locals());
            builder.eval(body, &mut state);
        }

        let mut graph = LocalGraph::default();
        for (get, sources) in builder.get_sources {
            for source in &sources {
                if let SetSource::Set(set) = source {
                    graph.set_influences.entry(*set).or_default().push(get);
                }
            }
            let mut sources: Vec<SetSource> = sources.into_iter().collect();
            sources.sort();
            graph.get_sources.insert(get, sources);
        }
        for gets in graph.set_influences.values_mut() {
            gets.sort();
            gets.dedup();
        }
        graph
    }

    /// The sources a `local.get` may read. Empty for gets in dead code.
    pub fn sources(&self, get: ExprId) -> &[SetSource] {
        self.get_sources.get(&get).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The gets a `local.set`/`local.tee` may influence.
    pub fn influences(&self, set: ExprId) -> &[ExprId] {
        self.set_influences
            .get(&set)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

struct GraphBuilder<'f> {
    func: &'f Function,
    /// Per-label merge bucket for states carried by branches.
    buckets: FxHashMap<String, FlowState>,
    get_sources: FxHashMap<ExprId, LocalSets>,
}

impl GraphBuilder<'_> {
    fn arena(&self) -> &ExprArena {
        &self.func.arena
    }

    fn num_locals(&self) -> usize {
        self.func.num_locals()
    }

    fn eval(&mut self, id: ExprId, state: &mut FlowState) {
        let kind = self.arena().kind(id).clone();
        match kind {
            ExprKind::Block { name, list } => {
                if let Some(name) = &name {
                    self.buckets
                        .insert(name.clone(), FlowState::dead(self.num_locals()));
                }
                for item in list {
                    self.eval(item, state);
                }
                if let Some(name) = &name {
                    let bucket = self.buckets.remove(name).expect("bucket registered above");
                    state.merge_from(&bucket);
                }
            }
            ExprKind::Loop { name, body } => match name {
                Some(name) => {
                    // Branches back to the loop re-enter the body; iterate
                    // to a fixpoint over the entry state.
                    let mut entry = state.clone();
                    loop {
                        self.buckets
                            .insert(name.clone(), FlowState::dead(self.num_locals()));
                        let mut exit = entry.clone();
                        self.eval(body, &mut exit);
                        let bucket = self.buckets.remove(&name).expect("bucket registered above");
                        let mut next_entry = entry.clone();
                        next_entry.merge_from(&bucket);
                        if next_entry == entry {
                            *state = exit;
                            break;
                        }
                        entry = next_entry;
                    }
                }
                None => self.eval(body, state),
            },
            ExprKind::If {
                condition,
                if_true,
                if_false,
            } => {
                self.eval(condition, state);
                let mut taken = state.clone();
                self.eval(if_true, &mut taken);
                match if_false {
                    Some(if_false) => {
                        let mut not_taken = state.clone();
                        self.eval(if_false, &mut not_taken);
                        taken.merge_from(&not_taken);
                        *state = taken;
                    }
                    None => state.merge_from(&taken),
                }
            }
            ExprKind::Break {
                label,
                value,
                condition,
            } => {
                if let Some(value) = value {
                    self.eval(value, state);
                }
                let conditional = condition.is_some();
                if let Some(condition) = condition {
                    self.eval(condition, state);
                }
                self.send_to(&label, state);
                if !conditional {
                    state.live = false;
                }
            }
            ExprKind::Switch {
                labels,
                default,
                value,
                condition,
            } => {
                if let Some(value) = value {
                    self.eval(value, state);
                }
                self.eval(condition, state);
                for label in labels.iter().chain([&default]) {
                    self.send_to(label, state);
                }
                state.live = false;
            }
            ExprKind::Try {
                body,
                catch_bodies,
                catch_all,
                ..
            } => {
                // A throw may interrupt the body at any point, so a catch
                // observes the entry state plus any set the body contains.
                let catch_entry = self.exceptional_state(state, body);
                self.eval(body, state);
                for catch in catch_bodies.iter().chain(catch_all.iter()) {
                    let mut s = catch_entry.clone();
                    self.eval(*catch, &mut s);
                    state.merge_from(&s);
                }
            }
            ExprKind::TryTable { body, catches } => {
                let exc = self.exceptional_state(state, body);
                for catch in &catches {
                    self.send_to(&catch.label, &exc);
                }
                self.eval(body, state);
            }
            ExprKind::Return { value } => {
                if let Some(value) = value {
                    self.eval(value, state);
                }
                state.live = false;
            }
            ExprKind::Unreachable => {
                state.live = false;
            }
            ExprKind::LocalSet { index, value } | ExprKind::LocalTee { index, value } => {
                self.eval(value, state);
                if state.live {
                    let slot = &mut state.locals[index as usize];
                    slot.clear();
                    slot.insert(SetSource::Set(id));
                }
            }
            ExprKind::LocalGet { index } => {
                let entry = self.get_sources.entry(id).or_default();
                if state.live {
                    entry.extend(state.locals[index as usize].iter().copied());
                }
            }
            other => {
                for child in crate::child_ids_of(&other) {
                    self.eval(child, state);
                }
            }
        }
    }

    fn send_to(&mut self, label: &str, state: &FlowState) {
        if let Some(bucket) = self.buckets.get_mut(label) {
            let mut merged = bucket.clone();
            merged.merge_from(state);
            *bucket = merged;
        }
    }

    /// The state observable on the exceptional edge out of `body`: the
    /// incoming state plus every set the body may have performed.
    fn exceptional_state(&self, state: &FlowState, body: ExprId) -> FlowState {
        let mut exc = state.clone();
        if !exc.live {
            return exc;
        }
        for id in self.arena().postorder(body) {
            if let ExprKind::LocalSet { index, .. } | ExprKind::LocalTee { index, .. } =
                self.arena().kind(id)
            {
                exc.locals[*index as usize].insert(SetSource::Set(id));
            }
        }
        exc
    }
}

/// A worklist that yields each pushed item at most once, ever. Re-pushing
/// an item that was already popped has no effect.
#[derive(Debug)]
pub struct UniqueQueue<T> {
    queue: VecDeque<T>,
    seen: FxHashSet<T>,
}

impl<T: Hash + Eq + Clone> UniqueQueue<T> {
    /// An empty queue.
    pub fn new() -> UniqueQueue<T> {
        UniqueQueue {
            queue: VecDeque::new(),
            seen: FxHashSet::default(),
        }
    }

    /// Enqueue `item` unless it was ever enqueued before.
    pub fn push(&mut self, item: T) {
        if self.seen.insert(item.clone()) {
            self.queue.push_back(item);
        }
    }

    /// Dequeue the next item.
    pub fn pop(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    /// Whether the queue is drained.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Hash + Eq + Clone> Default for UniqueQueue<T> {
    fn default() -> Self {
        UniqueQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Literal, Type};

    /// (func (param i32) (local i32)
    ///   (local.set 1 (i32.const 1))
    ///   (block $b
    ///     (br_if $b (local.get 0))
    ///     (local.set 1 (i32.const 2)))
    ///   (drop (local.get 1)))
    fn two_sets_one_get() -> (Function, ExprId, ExprId, ExprId) {
        let mut f = Function::new("f", vec![Type::I32], vec![]);
        f.add_local(Type::I32);
        let a = &mut f.arena;
        let c1 = a.alloc(
            ExprKind::Const {
                literal: Literal::I32(1),
            },
            Type::I32,
        );
        let set1 = a.alloc(ExprKind::LocalSet { index: 1, value: c1 }, Type::None);
        let cond = a.alloc(ExprKind::LocalGet { index: 0 }, Type::I32);
        let br = a.alloc(
            ExprKind::Break {
                label: "b".into(),
                value: None,
                condition: Some(cond),
            },
            Type::None,
        );
        let c2 = a.alloc(
            ExprKind::Const {
                literal: Literal::I32(2),
            },
            Type::I32,
        );
        let set2 = a.alloc(ExprKind::LocalSet { index: 1, value: c2 }, Type::None);
        let block = a.alloc(
            ExprKind::Block {
                name: Some("b".into()),
                list: vec![br, set2],
            },
            Type::None,
        );
        let get = a.alloc(ExprKind::LocalGet { index: 1 }, Type::I32);
        let drop = a.alloc(ExprKind::Drop { value: get }, Type::None);
        let body = a.alloc(
            ExprKind::Block {
                name: None,
                list: vec![set1, block, drop],
            },
            Type::None,
        );
        f.body = Some(body);
        (f, set1, set2, get)
    }

    #[test]
    fn test_get_sees_both_reaching_sets() {
        let (f, set1, set2, get) = two_sets_one_get();
        let graph = LocalGraph::build(&f);
        let sources = graph.sources(get);
        assert!(sources.contains(&SetSource::Set(set1)));
        assert!(sources.contains(&SetSource::Set(set2)));
        assert!(!sources.contains(&SetSource::Entry));
        assert_eq!(graph.influences(set1), &[get]);
        assert_eq!(graph.influences(set2), &[get]);
    }

    #[test]
    fn test_set_shadowed_by_later_set() {
        // set1 then set2 in straight line: only set2 reaches the get.
        let mut f = Function::new("f", vec![], vec![]);
        f.add_local(Type::I32);
        let a = &mut f.arena;
        let c1 = a.alloc(
            ExprKind::Const {
                literal: Literal::I32(1),
            },
            Type::I32,
        );
        let set1 = a.alloc(ExprKind::LocalSet { index: 0, value: c1 }, Type::None);
        let c2 = a.alloc(
            ExprKind::Const {
                literal: Literal::I32(2),
            },
            Type::I32,
        );
        let set2 = a.alloc(ExprKind::LocalSet { index: 0, value: c2 }, Type::None);
        let get = a.alloc(ExprKind::LocalGet { index: 0 }, Type::I32);
        let drop = a.alloc(ExprKind::Drop { value: get }, Type::None);
        let body = a.alloc(
            ExprKind::Block {
                name: None,
                list: vec![set1, set2, drop],
            },
            Type::None,
        );
        f.body = Some(body);

        let graph = LocalGraph::build(&f);
        assert_eq!(graph.sources(get), &[SetSource::Set(set2)]);
        assert!(graph.influences(set1).is_empty());
    }

    #[test]
    fn test_get_in_loop_sees_set_from_previous_iteration() {
        // (loop $l (drop (local.get 0)) (local.set 0 ..) (br_if $l ..))
        let mut f = Function::new("f", vec![Type::I32], vec![]);
        let a = &mut f.arena;
        let get = a.alloc(ExprKind::LocalGet { index: 0 }, Type::I32);
        let drop = a.alloc(ExprKind::Drop { value: get }, Type::None);
        let c = a.alloc(
            ExprKind::Const {
                literal: Literal::I32(7),
            },
            Type::I32,
        );
        let set = a.alloc(ExprKind::LocalSet { index: 0, value: c }, Type::None);
        let cond = a.alloc(
            ExprKind::Const {
                literal: Literal::I32(1),
            },
            Type::I32,
        );
        let br = a.alloc(
            ExprKind::Break {
                label: "l".into(),
                value: None,
                condition: Some(cond),
            },
            Type::None,
        );
        let inner = a.alloc(
            ExprKind::Block {
                name: None,
                list: vec![drop, set, br],
            },
            Type::None,
        );
        let looped = a.alloc(
            ExprKind::Loop {
                name: Some("l".into()),
                body: inner,
            },
            Type::None,
        );
        f.body = Some(looped);

        let graph = LocalGraph::build(&f);
        let sources = graph.sources(get);
        assert!(sources.contains(&SetSource::Entry));
        assert!(sources.contains(&SetSource::Set(set)));
    }

    #[test]
    fn test_unique_queue_never_repeats() {
        let mut q = UniqueQueue::new();
        q.push(1);
        q.push(2);
        q.push(1);
        assert_eq!(q.pop(), Some(1));
        q.push(1);
        assert_eq!(q.pop(), Some(2));
        assert!(q.is_empty());
    }
}
