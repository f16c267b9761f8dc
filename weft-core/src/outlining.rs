//! Outlining Optimization
//!
//! Detects instruction sequences repeated across the module, promotes each
//! unique repeat to a freshly synthesized function, and replaces every
//! occurrence with a call:
//!
//! 1. Stringify the module into a symbol string ([`crate::stringify`]).
//! 2. Mine the maximal repeated substrings ([`crate::suffix_tree`]).
//! 3. Filter: dedupe contained repeats, thin overlapping occurrences, and
//!    reject substrings that cannot be outlined (branches, local accesses,
//!    pops, unrepresentable signatures).
//! 4. Synthesize one callee per surviving substring, its signature the
//!    folded stack signature of the range.
//! 5. Reconstruct each affected function, replacing every occurrence with
//!    a call; the first occurrence's instructions become the callee body.
//!
//! Reconstruction traverses scopes in stringified order rather than
//! nested, so block types that depend on branch targets cannot be
//! finalized on the fly; a module-wide refinalize pass runs at the end.

use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::builder::refinalize_function;
use crate::ir_builder::{InPlaceBuilder, OutlinedBuilder};
use crate::stack::StackSignature;
use crate::stringify::{
    dedupe, filter_branches, filter_local_gets, filter_local_sets, filter_overlaps,
    filter_signatures, stringify_function, ModuleString, StrEvent,
};
use crate::suffix_tree::{repeated_substrings, RepeatedSubstring};
use crate::{ExprKind, Function, Module, PassOptions, Type};

/// Statistics about an outlining run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutliningStats {
    /// Outlined functions added to the module
    pub functions_created: usize,
    /// Occurrences replaced by calls
    pub sequences_replaced: usize,
}

/// One occurrence of a repeat inside a specific function, in
/// function-relative stringified positions.
#[derive(Debug, Clone)]
struct OutliningSequence {
    start_idx: usize,
    /// Exclusive
    end_idx: usize,
    callee: String,
    /// The last instruction is unreachable-typed; the replacement call
    /// must be followed by an `unreachable` to preserve the type.
    ends_unreachable: bool,
}

/// Run the pass over the module.
pub fn run(module: &mut Module, _options: &PassOptions) -> Result<OutliningStats> {
    let module_string = ModuleString::build(module);
    let substrings = repeated_substrings(&module_string.hash_string);
    let substrings = dedupe(substrings);
    let substrings = filter_overlaps(substrings);
    let substrings = filter_branches(substrings, &module_string, module);
    let substrings = filter_local_sets(substrings, &module_string, module);
    let substrings = filter_local_gets(substrings, &module_string, module);
    let substrings = filter_signatures(substrings, &module_string, module);

    let (seq_by_func, created) = make_sequences(module, &substrings, &module_string);
    let mut stats = OutliningStats::default();
    outline(module, seq_by_func, &mut stats)?;

    // A callee whose every occurrence lost the per-function overlap
    // tiebreak never got a body; drop it again.
    let mut alive = 0usize;
    module.functions.retain(|f| {
        let keep = f.body.is_some() || !created.contains(&f.name);
        if keep && created.contains(&f.name) {
            alive += 1;
        }
        keep
    });
    stats.functions_created = alive;

    // Deterministic output: outlined functions first.
    move_outlined_functions(module, alive);

    // Reconstruction could not finalize branch-dependent block types; fix
    // the whole module now.
    refinalize_module(module);
    Ok(stats)
}

/// Synthesize the callees and convert program-relative substring positions
/// into function-relative sequences.
fn make_sequences(
    module: &mut Module,
    substrings: &[RepeatedSubstring],
    module_string: &ModuleString,
) -> (Vec<(usize, Vec<OutliningSequence>)>, FxHashSet<String>) {
    let mut by_func: FxHashMap<usize, Vec<OutliningSequence>> = FxHashMap::default();
    let mut created = FxHashSet::default();
    for substring in substrings {
        // The callee signature is the stack signature of the outlined
        // range; any occurrence serves, they are symbol-identical.
        let start = substring.start_indices[0];
        let mut sig = StackSignature::empty();
        for pos in start..start + substring.length {
            let (fidx, id) = module_string.exprs[pos].expect("filters exclude separators");
            sig.append(&StackSignature::of_expr(&module.functions[fidx].arena, id));
        }
        let name = module.unique_function_name("outline$");
        module
            .functions
            .push(Function::new(name.clone(), sig.params, sig.results));
        created.insert(name.clone());

        for &occurrence in &substring.start_indices {
            let (fidx, rel) = module_string
                .make_relative(occurrence)
                .expect("occurrence inside a function");
            let (last_fidx, last_id) = module_string.exprs[occurrence + substring.length - 1]
                .expect("filters exclude separators");
            let ends_unreachable =
                module.functions[last_fidx].arena.ty(last_id) == Type::Unreachable;
            by_func.entry(fidx).or_default().push(OutliningSequence {
                start_idx: rel,
                end_idx: rel + substring.length,
                callee: name.clone(),
                ends_unreachable,
            });
        }
    }

    // The reconstruction walker scans each function once with a counter,
    // so its sequences must be sorted by start, and overlapping sequences
    // from different substrings cannot both be honored.
    let mut out: Vec<(usize, Vec<OutliningSequence>)> = by_func.into_iter().collect();
    out.sort_by_key(|(fidx, _)| *fidx);
    for (_, seqs) in &mut out {
        seqs.sort_by_key(|s| s.start_idx);
        let mut next_free = 0usize;
        seqs.retain(|s| {
            if s.start_idx >= next_free {
                next_free = s.end_idx;
                true
            } else {
                false
            }
        });
    }
    (out, created)
}

fn outline(
    module: &mut Module,
    seq_by_func: Vec<(usize, Vec<OutliningSequence>)>,
    stats: &mut OutliningStats,
) -> Result<()> {
    let callee_sigs: FxHashMap<String, (Vec<Type>, Vec<Type>)> = module
        .functions
        .iter()
        .map(|f| (f.name.clone(), (f.params.clone(), f.results.clone())))
        .collect();
    let mut built: FxHashSet<String> = FxHashSet::default();

    for (fidx, sequences) in seq_by_func {
        let events = stringify_function(&module.functions[fidx]);
        // Take the function out so the walker owns it alongside the
        // module-level callee table.
        let mut func = std::mem::replace(
            &mut module.functions[fidx],
            Function::new(String::new(), vec![], vec![]),
        );
        let mut walker = ReconstructWalker {
            existing: InPlaceBuilder::new(&mut func),
            outlined: None,
            finished: Vec::new(),
            sequences,
            seq_counter: 0,
            instr_counter: 0,
            state: ReconstructState::NotInSeq,
            calls_made: 0,
            callee_sigs: &callee_sigs,
            built: &mut built,
        };
        let result = walker.walk(&events);
        let finished = std::mem::take(&mut walker.finished);
        stats.sequences_replaced += walker.calls_made;
        drop(walker);
        module.functions[fidx] = func;
        result?;
        for callee in finished {
            let idx = module
                .func_index(&callee.name)
                .expect("callee registered in make_sequences");
            module.functions[idx] = callee;
        }
    }
    Ok(())
}

/// Which builder receives the instructions being walked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconstructState {
    /// Not being outlined: instructions go to the existing function.
    NotInSeq,
    /// First occurrence of a repeat: instructions go to the callee.
    InSeq,
    /// Later occurrence of an already-built repeat: instructions drop.
    InSkipSeq,
}

struct ReconstructWalker<'a, 'f> {
    existing: InPlaceBuilder<'f>,
    outlined: Option<OutlinedBuilder>,
    finished: Vec<Function>,
    sequences: Vec<OutliningSequence>,
    seq_counter: usize,
    instr_counter: usize,
    state: ReconstructState,
    calls_made: usize,
    callee_sigs: &'a FxHashMap<String, (Vec<Type>, Vec<Type>)>,
    built: &'a mut FxHashSet<String>,
}

impl ReconstructWalker<'_, '_> {
    fn walk(&mut self, events: &[StrEvent]) -> Result<()> {
        for &event in events {
            match event {
                StrEvent::FuncStart => {
                    self.existing.visit_function_start()?;
                    self.instr_counter = 0;
                    self.seq_counter = 0;
                    self.state = ReconstructState::NotInSeq;
                }
                StrEvent::Expr(id) => {
                    self.instr_counter += 1;
                    self.maybe_begin_seq()?;
                    match self.state {
                        ReconstructState::NotInSeq => self.existing.visit(id)?,
                        ReconstructState::InSeq => {
                            let outlined =
                                self.outlined.as_mut().expect("builder exists while in-seq");
                            outlined.visit(self.existing.func(), id)?;
                        }
                        ReconstructState::InSkipSeq => {}
                    }
                    if self.state != ReconstructState::NotInSeq {
                        self.maybe_end_seq();
                    }
                }
                separator => {
                    self.instr_counter += 1;
                    debug_assert_eq!(
                        self.state,
                        ReconstructState::NotInSeq,
                        "separator inside an outlined sequence"
                    );
                    self.visit_separator(separator)?;
                }
            }
        }
        self.existing.build()
    }

    fn visit_separator(&mut self, separator: StrEvent) -> Result<()> {
        match separator {
            StrEvent::ScopeStart(id) => {
                enum S {
                    Block,
                    Loop,
                    If(crate::ExprId),
                    Try,
                    TryTable,
                }
                let s = match self.existing.func().arena.kind(id) {
                    ExprKind::Block { .. } => S::Block,
                    ExprKind::Loop { .. } => S::Loop,
                    ExprKind::If { condition, .. } => S::If(*condition),
                    ExprKind::Try { .. } => S::Try,
                    ExprKind::TryTable { .. } => S::TryTable,
                    other => unreachable!("scope start on {other:?}"),
                };
                match s {
                    S::Block => self.existing.visit_block_start(id),
                    S::Loop => self.existing.visit_loop_start(id),
                    S::If(condition) => {
                        // The correct condition was installed when the
                        // outer scope was visited; re-push it for the
                        // start handler to pop.
                        self.existing.push_synthetic(condition)?;
                        self.existing.visit_if_start(id)
                    }
                    S::Try => self.existing.visit_try_start(id),
                    S::TryTable => self.existing.visit_try_table_start(id),
                }
            }
            StrEvent::Else => self.existing.visit_else(),
            StrEvent::Catch { arm } => self.existing.visit_catch(arm),
            StrEvent::CatchAll => self.existing.visit_catch_all(),
            StrEvent::End => self.existing.visit_end(),
            StrEvent::FuncStart | StrEvent::Expr(_) => unreachable!(),
        }
    }

    fn curr_state(&self) -> ReconstructState {
        if self.seq_counter < self.sequences.len() {
            let seq = &self.sequences[self.seq_counter];
            if self.instr_counter >= seq.start_idx && self.instr_counter < seq.end_idx {
                return if self.built.contains(&seq.callee) {
                    ReconstructState::InSkipSeq
                } else {
                    ReconstructState::InSeq
                };
            }
        }
        ReconstructState::NotInSeq
    }

    fn maybe_begin_seq(&mut self) -> Result<()> {
        let next = self.curr_state();
        if next != self.state {
            match next {
                ReconstructState::NotInSeq => {}
                ReconstructState::InSeq => self.transition_to_in_seq()?,
                ReconstructState::InSkipSeq => self.transition_to_in_skip_seq()?,
            }
        }
        self.state = next;
        Ok(())
    }

    fn replace_with_call(&mut self, seq_index: usize) -> Result<()> {
        let (callee, ends_unreachable) = {
            let seq = &self.sequences[seq_index];
            (seq.callee.clone(), seq.ends_unreachable)
        };
        let (params, results) = self.callee_sigs[&callee].clone();
        self.existing.make_call(&callee, &params, &results)?;
        self.calls_made += 1;
        // Keep the unreachable type in the original scope when the moved
        // tail was unreachable.
        if ends_unreachable {
            self.existing.make_unreachable()?;
        }
        Ok(())
    }

    fn transition_to_in_seq(&mut self) -> Result<()> {
        let callee = self.sequences[self.seq_counter].callee.clone();
        let (params, results) = self.callee_sigs[&callee].clone();
        self.replace_with_call(self.seq_counter)?;
        let mut outlined = OutlinedBuilder::start(callee, params.clone(), results);
        for i in 0..params.len() {
            outlined.make_local_get(i as u32)?;
        }
        self.outlined = Some(outlined);
        Ok(())
    }

    fn transition_to_in_skip_seq(&mut self) -> Result<()> {
        self.replace_with_call(self.seq_counter)
    }

    fn maybe_end_seq(&mut self) {
        if self.instr_counter + 1 == self.sequences[self.seq_counter].end_idx {
            if self.state == ReconstructState::InSeq {
                let callee = self
                    .outlined
                    .take()
                    .expect("builder exists while in-seq")
                    .finish();
                self.built.insert(callee.name.clone());
                self.finished.push(callee);
            }
            self.seq_counter += 1;
            self.state = ReconstructState::NotInSeq;
        }
    }
}

/// Move the outlined callees to the front of the function list, preserving
/// their creation order.
fn move_outlined_functions(module: &mut Module, outlined_count: usize) {
    module.functions.rotate_right(outlined_count);
}

fn refinalize_module(module: &mut Module) {
    let Module { types, functions } = module;
    for func in functions.iter_mut() {
        if !func.is_import() {
            refinalize_function(func, types);
        }
    }
}
