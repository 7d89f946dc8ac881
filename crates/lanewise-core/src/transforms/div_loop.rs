//! Divergent loop transform.
//!
//! A loop whose exit condition differs per lane is rewritten so that every
//! lane runs `max(per-lane trip count)` iterations. A live mask on the
//! header tracks which lanes are still iterating; the latch keeps looping
//! while any lane is live. Lanes that leave early have their live-out
//! values frozen by selects at the point they leave, and their memory
//! operations in later iterations run under a false predicate.

use std::collections::HashSet;

use crate::analysis::{divergence, DivergenceInfo, LoopId, Shape};
use crate::context::VectorizationContext;
use crate::error::CoreError;
use crate::ir::{BinOp, BlockId, Op, Type, ValueId, VoteKind};

use super::mask_expander::MaskExpander;
use super::util::{append_edge_arg, edge_args, predicate_lanes, replace_uses_where, thread_value};
use super::Feasibility;

const STAGE: &str = "divergent loop transform";

/// Structure of a loop that passed the capability checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivLoopPlan {
    pub header: BlockId,
    pub preheader: BlockId,
    pub latch: BlockId,
    /// `(exiting, exit)` edges in block order.
    pub exits: Vec<(BlockId, BlockId)>,
}

/// How a tracker changes where a lane leaves the loop.
#[derive(Clone, Copy)]
enum Update {
    /// `select(mask, value, current)`
    Capture { mask: ValueId, value: ValueId },
    /// `current | mask`
    Accumulate { mask: ValueId },
}

pub struct DivLoopTransform<'a> {
    ctx: &'a mut VectorizationContext,
}

impl<'a> DivLoopTransform<'a> {
    pub fn new(ctx: &'a mut VectorizationContext) -> Self {
        Self { ctx }
    }

    /// Every exit of the loop is a two-way conditional branch with one
    /// target inside and one outside the loop, taken from the loop's own
    /// nesting level.
    pub fn can_handle_exit_condition(&mut self, header: BlockId) -> bool {
        let an = self.ctx.analyses().clone();
        let Some(id) = an.loops.loop_with_header(header) else {
            return false;
        };
        self.check_exits(id).is_ok()
    }

    pub fn can_transform_loop(&mut self, header: BlockId) -> bool {
        self.plan(header).is_committed()
    }

    /// Run the capability checks. A committed plan is guaranteed to
    /// transform.
    pub fn plan(&mut self, header: BlockId) -> Feasibility<DivLoopPlan> {
        match self.check(header) {
            Ok(plan) => Feasibility::Committed(plan),
            Err(reason) => Feasibility::Rejected(reason),
        }
    }

    fn check_exits(&mut self, id: LoopId) -> Result<Vec<(BlockId, BlockId)>, String> {
        let an = self.ctx.analyses().clone();
        let l = an.loops.get(id);
        let exits = an.loops.exit_edges(id, &an.cfg);
        if exits.is_empty() {
            return Err(format!("loop at {} never exits", l.header));
        }
        for &(exiting, _) in &exits {
            if an.loops.loop_for(exiting) != Some(id) {
                return Err(format!("{exiting} leaves from a nested loop"));
            }
            match self.ctx.func.terminator_op(exiting) {
                Some(Op::BrIf {
                    then_target,
                    else_target,
                    ..
                }) if l.contains(*then_target) != l.contains(*else_target) => {}
                _ => return Err(format!("exit condition of {exiting} is not a two-way branch")),
            }
        }
        Ok(exits)
    }

    fn check(&mut self, header: BlockId) -> Result<DivLoopPlan, String> {
        let an = self.ctx.analyses().clone();
        let id = an
            .loops
            .loop_with_header(header)
            .ok_or_else(|| format!("{header} is not a loop header"))?;
        let l = an.loops.get(id);
        let preheader = an
            .loops
            .preheader(id, &self.ctx.func, &an.cfg)
            .ok_or_else(|| format!("loop at {header} has no preheader"))?;
        let latch = l
            .latch()
            .ok_or_else(|| format!("loop at {header} has {} latches", l.latches.len()))?;
        for &block in &l.blocks {
            match self.ctx.func.terminator_op(block) {
                None => return Err(format!("{block} has no terminator")),
                Some(Op::Return(_)) => return Err(format!("{block} returns from inside the loop")),
                Some(_) => {}
            }
        }
        let exits = self.check_exits(id)?;
        match self.ctx.func.terminator_op(latch) {
            Some(Op::Br { target, .. }) if *target == header => {}
            Some(Op::BrIf {
                then_target,
                else_target,
                ..
            }) if (*then_target == header && !l.contains(*else_target))
                || (*else_target == header && !l.contains(*then_target)) => {}
            _ => return Err(format!("latch {latch} does not branch back unconditionally or exit")),
        }

        let info = DivergenceInfo {
            func: &self.ctx.func,
            cfg: &an.cfg,
            pdom: &an.pdom,
            loops: &an.loops,
        };
        if !info.is_divergent_loop(&self.ctx.shapes, id) {
            return Err(format!("loop at {header} exits uniformly"));
        }
        if self.ctx.masks.block_mask(header).is_some()
            && !self.ctx.masks.pending_headers.contains_key(&header)
        {
            return Err(format!("live mask of {header} is already closed"));
        }
        Ok(DivLoopPlan {
            header,
            preheader,
            latch,
            exits,
        })
    }

    /// Rewrite the loop. Returns its header, which stays the header.
    pub fn transform(&mut self, plan: DivLoopPlan) -> BlockId {
        let DivLoopPlan {
            header,
            preheader,
            latch,
            exits,
        } = plan;
        let an = self.ctx.analyses().clone();
        let id = an
            .loops
            .loop_with_header(header)
            .unwrap_or_else(|| panic!("committed plan for {header}, which heads no loop"));
        let l = an.loops.get(id).clone();
        let order: Vec<BlockId> = an
            .cfg
            .reverse_post_order(self.ctx.func.entry)
            .into_iter()
            .filter(|b| l.contains(*b))
            .collect();

        // Masks must be read off the original branches before rewiring.
        let mut expander = MaskExpander::new(self.ctx);
        for &block in &order {
            expander.request_mask(block);
        }
        let entry_mask = expander.request_edge_mask(preheader, header);
        let exit_masks: Vec<ValueId> = exits
            .iter()
            .map(|&(exiting, exit)| expander.request_edge_mask(exiting, exit))
            .collect();
        let live_next = expander
            .close_header(header)
            .unwrap_or_else(|| panic!("loop at {header} has no open live mask"));
        let no_lanes = expander.const_false();

        let ctx = &mut *self.ctx;
        let tracker = |ctx: &mut VectorizationContext, ty: Type, init: ValueId, updates: Vec<(BlockId, Update)>| {
            let param = ctx.func.add_block_param(header, ty);
            ctx.shapes.set(param, Shape::Varying);
            append_edge_arg(&mut ctx.func, preheader, header, init);
            let out = thread_value(ctx, &an.cfg, &order, param, ty, |ctx, block, current| {
                let mut value = None;
                for &(at, update) in &updates {
                    if at != block {
                        continue;
                    }
                    let cur = value.unwrap_or(current);
                    let (op, ty) = match update {
                        Update::Capture { mask, value } => (
                            Op::Select {
                                cond: mask,
                                on_true: value,
                                on_false: cur,
                            },
                            ty,
                        ),
                        Update::Accumulate { mask } => (Op::Binary(BinOp::Or, cur, mask), Type::Bool),
                    };
                    let v = ctx.func.insert_before_terminator(block, op, ty);
                    ctx.shapes.set(v, Shape::Varying);
                    value = Some(v);
                }
                value
            });
            let last = out[&latch];
            append_edge_arg(&mut ctx.func, latch, header, last);
            last
        };

        // Which exit each lane took, only needed to dispatch between several.
        let mut exited = Vec::new();
        if exits.len() > 1 {
            for (k, &(exiting, _)) in exits.iter().enumerate() {
                let updates = vec![(exiting, Update::Accumulate { mask: exit_masks[k] })];
                exited.push(tracker(ctx, Type::Bool, no_lanes, updates));
            }
        }

        // Values passed to exit blocks, frozen where each lane leaves.
        let mut exit_args = Vec::with_capacity(exits.len());
        for (k, &(exiting, exit)) in exits.iter().enumerate() {
            let mut frozen = Vec::new();
            for value in edge_args(&ctx.func, exiting, exit) {
                let ty = ctx.func.value_type(value);
                let init = ctx.func.insert_before_terminator(preheader, Op::Undef(ty), ty);
                ctx.shapes.set(init, Shape::Uniform);
                let updates = vec![(exiting, Update::Capture { mask: exit_masks[k], value })];
                frozen.push(tracker(ctx, ty, init, updates));
            }
            exit_args.push(frozen);
        }

        // Values defined in the loop and used after it.
        let defs = ctx.func.def_blocks();
        let mut live_outs = Vec::new();
        for &block in &order {
            let mut defined = ctx.func.param_values(block);
            defined.extend(ctx.func.blocks[block].insts.iter().filter_map(|&i| ctx.func.insts[i].result));
            for value in defined {
                if ctx.func.uses_of(value).iter().any(|(b, _)| !l.contains(*b)) {
                    live_outs.push(value);
                }
            }
        }
        let mut finals = Vec::with_capacity(live_outs.len());
        for &value in &live_outs {
            let ty = ctx.func.value_type(value);
            let def = defs[&value];
            let updates: Vec<(BlockId, Update)> = exits
                .iter()
                .zip(&exit_masks)
                .filter(|((exiting, _), _)| an.dom.dominates(def, *exiting))
                .map(|(&(exiting, _), &mask)| (exiting, Update::Capture { mask, value }))
                .collect();
            let init = ctx.func.insert_before_terminator(preheader, Op::Undef(ty), ty);
            ctx.shapes.set(init, Shape::Uniform);
            finals.push(tracker(ctx, ty, init, updates));
        }

        // Exiting branches fall through to their in-loop successor.
        for &(exiting, _) in &exits {
            let Some(Op::BrIf {
                then_target,
                then_args,
                else_target,
                else_args,
                ..
            }) = ctx.func.terminator_op(exiting).cloned()
            else {
                panic!("exit {exiting} lost its conditional branch");
            };
            let (target, args) = if l.contains(then_target) {
                (then_target, then_args)
            } else {
                (else_target, else_args)
            };
            ctx.func.set_terminator(exiting, Op::Br { target, args });
        }

        let any = ctx
            .func
            .insert_before_terminator(
                latch,
                Op::Vote {
                    kind: VoteKind::Any,
                    value: live_next,
                    mask: None,
                },
                Type::Bool,
            );
        ctx.shapes.set(any, Shape::Uniform);
        let back_args = edge_args(&ctx.func, latch, header);
        let new_exit = ctx.func.create_block();
        ctx.func.set_terminator(
            latch,
            Op::BrIf {
                cond: any,
                then_target: header,
                then_args: back_args,
                else_target: new_exit,
                else_args: Vec::new(),
            },
        );

        let mut dispatch = vec![new_exit];
        let mut current = new_exit;
        for (k, (&(_, exit), args)) in exits.iter().zip(exit_args).enumerate() {
            if k + 1 == exits.len() {
                ctx.func.set_terminator(current, Op::Br { target: exit, args });
            } else {
                let next = ctx.func.create_block();
                ctx.func.set_terminator(
                    current,
                    Op::BrIf {
                        cond: exited[k],
                        then_target: exit,
                        then_args: args,
                        else_target: next,
                        else_args: Vec::new(),
                    },
                );
                dispatch.push(next);
                current = next;
            }
        }

        let outside: HashSet<BlockId> = dispatch.iter().copied().collect();
        for (&value, &last) in live_outs.iter().zip(&finals) {
            replace_uses_where(&mut ctx.func, value, last, |b| {
                !l.contains(b) && !outside.contains(&b)
            });
        }

        // After the loop every lane that entered it is active again.
        ctx.masks.blocks.insert(new_exit, entry_mask);
        ctx.masks.edges.insert((latch, new_exit), entry_mask);
        for &(exiting, exit) in &exits {
            ctx.masks.edges.remove(&(exiting, exit));
            ctx.masks.blocks.remove(&exit);
        }

        let mut predicated = 0;
        for &block in &order {
            let mask = ctx.masks.block_mask(block).expect("requested above");
            if !ctx.masks.is_true(mask) {
                predicated += predicate_lanes(&mut ctx.func, block, mask);
            }
        }

        if ctx.in_region(header) {
            for &block in &dispatch {
                ctx.add_to_region(block);
            }
        }
        ctx.invalidate();
        // Retired lanes now load zero, so predicated loads may differ per lane.
        let widened = if predicated == 0 {
            0
        } else {
            divergence::refine(&ctx.func, &mut ctx.shapes)
        };
        tracing::debug!(
            %header,
            exits = exits.len(),
            live_outs = live_outs.len(),
            predicated,
            widened,
            "unified divergent loop trip count"
        );
        header
    }

    /// Transform every divergent loop in the region, innermost first.
    /// Returns how many loops were rewritten.
    pub fn transform_divergent_loops(&mut self) -> Result<usize, CoreError> {
        let mut done: HashSet<BlockId> = HashSet::new();
        loop {
            let an = self.ctx.analyses().clone();
            let region_entry = self.ctx.region.as_ref().map(|r| r.entry);
            let info = DivergenceInfo {
                func: &self.ctx.func,
                cfg: &an.cfg,
                pdom: &an.pdom,
                loops: &an.loops,
            };
            let next = an.loops.innermost_first().into_iter().find(|&id| {
                let l = an.loops.get(id);
                !done.contains(&l.header)
                    && Some(l.header) != region_entry
                    && l.blocks.iter().all(|&b| self.ctx.in_region(b))
                    && info.is_divergent_loop(&self.ctx.shapes, id)
            });
            let Some(id) = next else {
                return Ok(done.len());
            };
            let header = an.loops.get(id).header;
            let plan = self.plan(header).into_result(STAGE)?;
            self.transform(plan);
            done.insert(header);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::analysis::{divergence, ShapeMap};
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::interp::{run_lanes_scalar, EvalError, Evaluator, Scalar};
    use crate::ir::{CmpKind, Function, FunctionSig};

    /// Running sum of `0..n`, stored to `base + i` before each step.
    ///
    /// ```text
    /// entry(n, base): br h(0, 0)
    /// h(i, s):  br_if i < n, body, exit(s)
    /// body:     store(base + i, s); br h(i + 1, s + i)
    /// exit(r):  ret r
    /// ```
    fn stored_sum() -> (Function, BlockId) {
        let sig = FunctionSig {
            params: vec![Type::Int(64), Type::Int(64)],
            return_ty: Type::Int(64),
        };
        let mut fb = FunctionBuilder::new("stored_sum", sig);
        let n = fb.param(0);
        let base = fb.param(1);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64), Type::Int(64)]);
        let body = fb.create_block();
        let (exit, ep) = fb.create_block_with_params(&[Type::Int(64)]);
        fb.br(h, &[zero, zero]);

        fb.switch_to_block(h);
        let (i, s) = (hp[0], hp[1]);
        let c = fb.cmp(CmpKind::Lt, i, n);
        fb.br_if(c, body, &[], exit, &[s]);

        fb.switch_to_block(body);
        let addr = fb.add(base, i);
        fb.store(addr, s);
        let one = fb.const_int(1);
        let i1 = fb.add(i, one);
        let s1 = fb.add(s, i);
        fb.br(h, &[i1, s1]);

        fb.switch_to_block(exit);
        fb.ret(Some(ep[0]));
        (fb.build(), h)
    }

    /// Linear search with two ways out.
    ///
    /// ```text
    /// entry(n, key, base): br h(0)
    /// h(i):      br_if i < n, body, miss
    /// body:      x = load(base + i); br_if x == key, found(i), latch
    /// latch:     br h(i + 1)
    /// miss:      ret -1
    /// found(k):  ret k
    /// ```
    fn search() -> (Function, BlockId) {
        let sig = FunctionSig {
            params: vec![Type::Int(64), Type::Int(64), Type::Int(64)],
            return_ty: Type::Int(64),
        };
        let mut fb = FunctionBuilder::new("search", sig);
        let n = fb.param(0);
        let key = fb.param(1);
        let base = fb.param(2);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64)]);
        let body = fb.create_block();
        let latch = fb.create_block();
        let miss = fb.create_block();
        let (found, fp) = fb.create_block_with_params(&[Type::Int(64)]);
        fb.br(h, &[zero]);

        fb.switch_to_block(h);
        let i = hp[0];
        let c = fb.cmp(CmpKind::Lt, i, n);
        fb.br_if(c, body, &[], miss, &[]);

        fb.switch_to_block(body);
        let addr = fb.add(base, i);
        let x = fb.load(addr, Type::Int(64));
        let hit = fb.cmp(CmpKind::Eq, x, key);
        fb.br_if(hit, found, &[i], latch, &[]);

        fb.switch_to_block(latch);
        let one = fb.const_int(1);
        let i1 = fb.add(i, one);
        fb.br(h, &[i1]);

        fb.switch_to_block(miss);
        let none = fb.const_int(-1);
        fb.ret(Some(none));

        fb.switch_to_block(found);
        fb.ret(Some(fp[0]));
        (fb.build(), h)
    }

    /// Sum of the loaded values below five.
    ///
    /// ```text
    /// entry(n, base): br h(0, 0)
    /// h(i, s):   br_if i < n, body, exit
    /// body:      x = load(base + i); br_if x < 5, bump, latch(s)
    /// bump:      br latch(s + x)
    /// latch(t):  br h(i + 1, t)
    /// exit:      ret s
    /// ```
    fn guarded_sum() -> (Function, BlockId, BlockId, ValueId) {
        let sig = FunctionSig {
            params: vec![Type::Int(64), Type::Int(64)],
            return_ty: Type::Int(64),
        };
        let mut fb = FunctionBuilder::new("guarded_sum", sig);
        let n = fb.param(0);
        let base = fb.param(1);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64), Type::Int(64)]);
        let body = fb.create_block();
        let bump = fb.create_block();
        let (latch, lp) = fb.create_block_with_params(&[Type::Int(64)]);
        let exit = fb.create_block();
        fb.br(h, &[zero, zero]);

        fb.switch_to_block(h);
        let (i, s) = (hp[0], hp[1]);
        let c = fb.cmp(CmpKind::Lt, i, n);
        fb.br_if(c, body, &[], exit, &[]);

        fb.switch_to_block(body);
        let addr = fb.add(base, i);
        let x = fb.load(addr, Type::Int(64));
        let five = fb.const_int(5);
        let small = fb.cmp(CmpKind::Lt, x, five);
        fb.br_if(small, bump, &[], latch, &[s]);

        fb.switch_to_block(bump);
        let s1 = fb.add(s, x);
        fb.br(latch, &[s1]);

        fb.switch_to_block(latch);
        let one = fb.const_int(1);
        let i1 = fb.add(i, one);
        fb.br(h, &[i1, lp[0]]);

        fb.switch_to_block(exit);
        fb.ret(Some(s));
        (fb.build(), h, body, x)
    }

    fn varying_context(func: Function) -> VectorizationContext {
        let params = vec![Shape::Varying; func.sig.params.len()];
        let shapes = divergence::analyze(&func, &params);
        VectorizationContext::new(func, shapes)
    }

    fn transformed(func: Function, header: BlockId) -> VectorizationContext {
        let mut ctx = varying_context(func);
        let mut t = DivLoopTransform::new(&mut ctx);
        let plan = t.plan(header).into_result(STAGE).unwrap();
        assert_eq!(t.transform(plan), header);
        ctx
    }

    fn ints(xs: &[i64]) -> Vec<Scalar> {
        xs.iter().map(|&x| Scalar::Int(x)).collect()
    }

    /// One argument list per lane, transposed from per-parameter columns.
    fn per_lane(columns: &[Vec<Scalar>]) -> Vec<Vec<Scalar>> {
        (0..columns[0].len())
            .map(|lane| columns.iter().map(|c| c[lane]).collect())
            .collect()
    }

    #[test]
    fn divergent_exit_needs_the_transform() {
        let (func, h) = stored_sum();
        let args = [ints(&[1, 3, 0, 2]), ints(&[0, 100, 200, 300])];
        let err = Evaluator::new(&func, 4).run(&args, BTreeMap::new()).unwrap_err();
        assert_eq!(err, EvalError::DivergentBranch(h));
    }

    #[test]
    fn lanes_run_the_longest_trip_count() {
        let (func, h) = stored_sum();
        let original = func.clone();
        let ctx = transformed(func, h);

        let args = [ints(&[1, 4, 0, 2]), ints(&[0, 100, 200, 300])];
        let exec = Evaluator::new(&ctx.func, 4).run(&args, BTreeMap::new()).unwrap();
        let (expected, memory) = run_lanes_scalar(&original, &per_lane(&args), BTreeMap::new()).unwrap();

        let got: Vec<Option<Scalar>> = exec.ret.clone().unwrap().into_iter().map(Some).collect();
        assert_eq!(got, expected);
        assert_eq!(got[1], Some(Scalar::Int(6)));
        assert_eq!(exec.memory, memory, "finished lanes must not store");
        assert_eq!(exec.visits_of(h), 5, "four iterations and the final test");
    }

    #[test]
    fn predicated_loads_become_varying() {
        let (func, h, body, x) = guarded_sum();
        let shapes = divergence::analyze(&func, &[Shape::Varying, Shape::Uniform]);
        assert!(shapes.is_uniform(x), "the address is uniform before masking");
        assert!(!shapes.is_divergent_branch(&func, body));

        let mut ctx = VectorizationContext::new(func, shapes);
        let mut t = DivLoopTransform::new(&mut ctx);
        let plan = t.plan(h).into_result(STAGE).unwrap();
        t.transform(plan);

        let def = ctx.func.defining_inst(x).unwrap();
        assert!(matches!(ctx.func.insts[def].op, Op::Load { mask: Some(_), .. }));
        assert_eq!(ctx.shapes.get(x), Shape::Varying);
        assert!(ctx.shapes.is_divergent_branch(&ctx.func, body));
    }

    #[test]
    fn scalar_results_are_unchanged() {
        let (func, h) = stored_sum();
        let original = func.clone();
        let ctx = transformed(func, h);
        for n in 0..5 {
            let args = [ints(&[n]), ints(&[0])];
            let before = Evaluator::new(&original, 1).run(&args, BTreeMap::new()).unwrap();
            let after = Evaluator::new(&ctx.func, 1).run(&args, BTreeMap::new()).unwrap();
            assert_eq!(before.ret, after.ret, "n = {n}");
            assert_eq!(before.memory, after.memory, "n = {n}");
        }
    }

    #[test]
    fn latch_branches_on_any_live_lane() {
        let (func, h) = stored_sum();
        let mut ctx = transformed(func, h);
        assert_eq!(ctx.func.terminator_op(h).map(|op| matches!(op, Op::Br { .. })), Some(true));
        let an = ctx.analyses().clone();
        let id = an.loops.loop_with_header(h).unwrap();
        let latch = an.loops.get(id).latch().unwrap();
        let Some(Op::BrIf { cond, then_target, .. }) = ctx.func.terminator_op(latch) else {
            panic!("latch must branch conditionally");
        };
        assert_eq!(*then_target, h);
        let def = ctx.func.defining_inst(*cond).unwrap();
        assert!(matches!(ctx.func.insts[def].op, Op::Vote { kind: VoteKind::Any, .. }));
        assert!(ctx.shapes.is_uniform(*cond));
        assert!(ctx.masks().pending_headers.is_empty());
    }

    #[test]
    fn several_exits_dispatch_through_a_cascade() {
        let (func, h) = search();
        let original = func.clone();
        let mut ctx = transformed(func, h);

        let data = [4, 8, 15, 16, 23, 42];
        let memory: BTreeMap<i64, Scalar> = data
            .iter()
            .enumerate()
            .map(|(i, &v)| (100 + i as i64, Scalar::Int(v)))
            .collect();
        for (n, key) in [(6, 15), (6, 5), (2, 15), (0, 4), (6, 42)] {
            let args = [ints(&[n]), ints(&[key]), ints(&[100])];
            let before = Evaluator::new(&original, 1).run(&args, memory.clone()).unwrap();
            let after = Evaluator::new(&ctx.func, 1).run(&args, memory.clone()).unwrap();
            assert_eq!(before.ret, after.ret, "n = {n}, key = {key}");
        }

        // The loop now leaves only through its latch.
        let an = ctx.analyses().clone();
        let id = an.loops.loop_with_header(h).unwrap();
        let exits = an.loops.exit_edges(id, &an.cfg);
        assert_eq!(exits.len(), 1);
        let (_, new_exit) = exits[0];
        assert!(matches!(ctx.func.terminator_op(new_exit), Some(Op::BrIf { .. })));
    }

    #[test]
    fn all_divergent_loops_are_rewritten_once() {
        let (func, _) = stored_sum();
        let mut ctx = varying_context(func);
        assert_eq!(DivLoopTransform::new(&mut ctx).transform_divergent_loops().unwrap(), 1);
        assert_eq!(DivLoopTransform::new(&mut ctx).transform_divergent_loops().unwrap(), 0);
    }

    #[test]
    fn uniform_loop_is_rejected() {
        let (func, h) = stored_sum();
        let shapes = divergence::analyze(&func, &[Shape::Uniform, Shape::Uniform]);
        let mut ctx = VectorizationContext::new(func, shapes);
        let mut t = DivLoopTransform::new(&mut ctx);
        assert!(t.can_handle_exit_condition(h));
        assert!(!t.can_transform_loop(h));
        let Feasibility::Rejected(reason) = t.plan(h) else {
            panic!("uniform loop must be rejected");
        };
        assert!(reason.contains("uniformly"));
    }

    #[test]
    fn non_header_is_rejected() {
        let (func, _) = stored_sum();
        let entry = func.entry;
        let mut ctx = varying_context(func);
        let err = DivLoopTransform::new(&mut ctx).plan(entry).into_result(STAGE).unwrap_err();
        assert!(matches!(err, CoreError::Infeasible { stage: STAGE, .. }));
    }

    #[test]
    fn two_latches_are_rejected() {
        // entry(n): br h(0)
        // h(i):  br_if i < n, a, exit
        // a:     br_if i < 3, h(i + 1), b
        // b:     br h(i + 2)
        let sig = FunctionSig {
            params: vec![Type::Int(64)],
            return_ty: Type::Void,
        };
        let mut fb = FunctionBuilder::new("two_latches", sig);
        let n = fb.param(0);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64)]);
        let a = fb.create_block();
        let b = fb.create_block();
        let exit = fb.create_block();
        fb.br(h, &[zero]);
        fb.switch_to_block(h);
        let c = fb.cmp(CmpKind::Lt, hp[0], n);
        fb.br_if(c, a, &[], exit, &[]);
        fb.switch_to_block(a);
        let three = fb.const_int(3);
        let small = fb.cmp(CmpKind::Lt, hp[0], three);
        let one = fb.const_int(1);
        let i1 = fb.add(hp[0], one);
        fb.br_if(small, h, &[i1], b, &[]);
        fb.switch_to_block(b);
        let two = fb.const_int(2);
        let i2 = fb.add(hp[0], two);
        fb.br(h, &[i2]);
        fb.switch_to_block(exit);
        fb.ret(None);

        let mut ctx = VectorizationContext::new(fb.build(), ShapeMap::new());
        let Feasibility::Rejected(reason) = DivLoopTransform::new(&mut ctx).plan(h) else {
            panic!("two latches must be rejected");
        };
        assert!(reason.contains("2 latches"), "{reason}");
    }
}
