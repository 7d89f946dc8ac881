//! Linearization of divergent acyclic regions.
//!
//! For each block `B` ending in a divergent branch, the blocks executed
//! under that branch (everything reachable from `B` before its immediate
//! post-dominator) are laid out in one chain that every lane walks. Block
//! parameters at joins become select chains over the incoming edge masks,
//! join masks become ORs, and memory operations take their block's mask as
//! predicate. Loops inside the region are treated as single nodes.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::analysis::{divergence, DivergenceInfo, Shape};
use crate::context::{Analyses, VectorizationContext};
use crate::ir::{BinOp, BlockId, Op, Type, ValueId};

use super::mask_expander::MaskExpander;
use super::util::{edge_args, predicate_lanes, replace_uses_where, retarget_edge};

/// A schedulable unit: a plain block, or a whole loop entered at its header.
#[derive(Debug, Clone)]
struct Node {
    entry: BlockId,
    blocks: Vec<BlockId>,
    is_loop: bool,
}

pub struct Linearizer<'a> {
    ctx: &'a mut VectorizationContext,
}

impl<'a> Linearizer<'a> {
    pub fn new(ctx: &'a mut VectorizationContext) -> Self {
        Self { ctx }
    }

    /// Linearize every divergent branch in the region, outermost first.
    /// Returns the number of branches removed.
    pub fn run(&mut self) -> usize {
        let mut count = 0;
        loop {
            let an = self.ctx.analyses().clone();
            let next = an
                .cfg
                .reverse_post_order(self.ctx.func.entry)
                .into_iter()
                .find(|&b| {
                    self.ctx.in_region(b) && self.ctx.shapes.is_divergent_branch(&self.ctx.func, b)
                });
            let Some(branch) = next else {
                break;
            };
            if an.pdom.idom(branch).is_none() {
                self.unify_returns(&an, branch);
                self.ctx.invalidate();
                continue;
            }
            self.linearize_branch(&an, branch);
            self.ctx.invalidate();
            count += 1;
        }
        tracing::debug!(count, "linearized divergent branches");
        count
    }

    fn region_of(&self, an: &Analyses, branch: BlockId) -> HashSet<BlockId> {
        let info = DivergenceInfo {
            func: &self.ctx.func,
            cfg: &an.cfg,
            pdom: &an.pdom,
            loops: &an.loops,
        };
        info.divergent_region(branch)
    }

    /// Route every return under `branch` through one new exit block, so the
    /// branch gets a post-dominator.
    fn unify_returns(&mut self, an: &Analyses, branch: BlockId) {
        let region = self.region_of(an, branch);
        let mut returns: Vec<BlockId> = region
            .iter()
            .copied()
            .filter(|&b| matches!(self.ctx.func.terminator_op(b), Some(Op::Return(_))))
            .collect();
        returns.sort();
        assert!(
            !returns.is_empty(),
            "divergent branch at {branch} neither reconverges nor returns"
        );

        let func = &mut self.ctx.func;
        let exit = func.create_block();
        let ret_ty = func.sig.return_ty;
        let ret_param = (ret_ty != Type::Void).then(|| func.add_block_param(exit, ret_ty));
        for &block in &returns {
            let Some(Op::Return(value)) = func.terminator_op(block).cloned() else {
                unreachable!("filtered on return terminators");
            };
            let args = match (value, ret_param) {
                (Some(v), Some(_)) => vec![v],
                (None, None) => Vec::new(),
                _ => panic!("{block} returns a value that does not match the signature"),
            };
            func.set_terminator(block, Op::Br { target: exit, args });
        }
        func.set_terminator(exit, Op::Return(ret_param));
        if let Some(p) = ret_param {
            self.ctx.shapes.set(p, Shape::Varying);
        }
        if self.ctx.in_region(branch) {
            self.ctx.add_to_region(exit);
        }
        tracing::debug!(%branch, %exit, returns = returns.len(), "unified returns");
    }

    fn linearize_branch(&mut self, an: &Analyses, branch: BlockId) {
        let post = an
            .pdom
            .idom(branch)
            .unwrap_or_else(|| panic!("{branch} has no post-dominator after return unification"));
        let region = self.region_of(an, branch);
        let rpo_index: HashMap<BlockId, usize> = an
            .cfg
            .reverse_post_order(self.ctx.func.entry)
            .into_iter()
            .enumerate()
            .map(|(i, b)| (b, i))
            .collect();

        // Collapse loops nested in the region.
        let mut node_of: HashMap<BlockId, BlockId> = HashMap::new();
        let mut nodes: HashMap<BlockId, Node> = HashMap::new();
        for &block in &region {
            let outermost = an
                .loops
                .iter()
                .filter(|(_, l)| l.contains(block) && !l.contains(branch))
                .min_by_key(|(_, l)| l.depth)
                .map(|(_, l)| l);
            match outermost {
                Some(l) => {
                    assert!(
                        l.blocks.iter().all(|b| region.contains(b)),
                        "loop at {} straddles the region of {branch}",
                        l.header
                    );
                    node_of.insert(block, l.header);
                    nodes.entry(l.header).or_insert_with(|| Node {
                        entry: l.header,
                        blocks: l.blocks.iter().copied().collect(),
                        is_loop: true,
                    });
                }
                None => {
                    node_of.insert(block, block);
                    nodes.insert(
                        block,
                        Node {
                            entry: block,
                            blocks: vec![block],
                            is_loop: false,
                        },
                    );
                }
            }
        }

        // Edges between nodes, and each loop's single way out.
        let mut succs: HashMap<BlockId, BTreeSet<BlockId>> = HashMap::new();
        let mut indegree: HashMap<BlockId, usize> = nodes.keys().map(|&n| (n, 0)).collect();
        let mut loop_exit: HashMap<BlockId, (BlockId, BlockId)> = HashMap::new();
        for node in nodes.values() {
            let members: HashSet<BlockId> = node.blocks.iter().copied().collect();
            let mut leaving = Vec::new();
            for &block in &node.blocks {
                for &succ in an.cfg.succs(block) {
                    if members.contains(&succ) {
                        continue;
                    }
                    leaving.push((block, succ));
                    if succ == post {
                        continue;
                    }
                    let target = *node_of
                        .get(&succ)
                        .unwrap_or_else(|| panic!("region of {branch} leaks from {block} to {succ}"));
                    if succs.entry(node.entry).or_default().insert(target) {
                        *indegree.get_mut(&target).expect("every node has a degree") += 1;
                    }
                }
            }
            if node.is_loop {
                assert_eq!(
                    leaving.len(),
                    1,
                    "loop at {} in the region of {branch} has {} exit edges",
                    node.entry,
                    leaving.len()
                );
                loop_exit.insert(node.entry, leaving[0]);
            }
            for &pred in an.cfg.preds(node.entry) {
                assert!(
                    pred == branch || members.contains(&pred) || region.contains(&pred),
                    "{} is entered from {pred}, outside the region of {branch}",
                    node.entry
                );
            }
        }

        // Kahn's algorithm, ties broken by reverse post-order.
        let mut ready: BTreeSet<(usize, BlockId)> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| (rpo_index[&n], n))
            .collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some((_, node)) = ready.pop_first() {
            order.push(node);
            for &succ in succs.get(&node).into_iter().flatten() {
                let d = indegree.get_mut(&succ).expect("every node has a degree");
                *d -= 1;
                if *d == 0 {
                    ready.insert((rpo_index[&succ], succ));
                }
            }
        }
        assert_eq!(order.len(), nodes.len(), "region of {branch} is cyclic");
        let position: HashMap<BlockId, usize> =
            order.iter().enumerate().map(|(i, &n)| (n, i + 1)).collect();

        // Masks must be read off the original branches.
        let mut expander = MaskExpander::new(self.ctx);
        let mut joins: Vec<BlockId> = order
            .iter()
            .copied()
            .filter(|n| !nodes[n].is_loop)
            .collect();
        joins.push(post);
        for &block in &region {
            expander.request_mask(block);
        }
        let branch_mask = expander.request_mask(branch);
        expander.request_mask(post);
        let mut incoming: HashMap<BlockId, Vec<(BlockId, ValueId)>> = HashMap::new();
        for &join in &joins {
            if expander.context().func.blocks[join].params.is_empty() {
                continue;
            }
            let mut preds: Vec<BlockId> = an
                .cfg
                .unique_preds(join)
                .into_iter()
                .filter(|&p| p == branch || region.contains(&p))
                .collect();
            preds.sort_by_key(|p| (position.get(&node_of.get(p).copied().unwrap_or(*p)).copied().unwrap_or(0), rpo_index[p]));
            let edges = preds
                .into_iter()
                .map(|p| (p, expander.request_edge_mask(p, join)))
                .collect();
            incoming.insert(join, edges);
        }
        expander.finish();

        let ctx = &mut *self.ctx;

        // Arguments each loop node is entered with, taken from its preheader.
        let mut entry_args: HashMap<BlockId, Vec<ValueId>> = HashMap::new();
        for &n in &order {
            if nodes[&n].is_loop {
                let pre = an
                    .cfg
                    .unique_preds(n)
                    .into_iter()
                    .find(|p| !nodes[&n].blocks.contains(p))
                    .unwrap_or_else(|| panic!("loop at {n} has no entry edge"));
                entry_args.insert(n, edge_args(&ctx.func, pre, n));
            }
        }

        // Merges for joins inside the region, at the top of the join.
        let mut merged_params = Vec::new();
        for &n in &order {
            let Some(edges) = incoming.get(&n) else {
                continue;
            };
            let mut at = 0;
            let merges = merge_params(ctx, n, edges, |ctx, op, ty| {
                let v = ctx.func.insert_at(n, at, op, ty);
                at += 1;
                v
            });
            merged_params.push((n, merges));
        }

        // Merges for the post-dominator go in a block of their own.
        let tail = match incoming.get(&post) {
            Some(edges) => {
                let merge_block = ctx.func.create_block();
                ctx.func.set_terminator(
                    merge_block,
                    Op::Br {
                        target: post,
                        args: Vec::new(),
                    },
                );
                let merges = merge_params(ctx, post, edges, |ctx, op, ty| {
                    ctx.func.insert_before_terminator(merge_block, op, ty)
                });
                let args = merges.into_iter().map(|(_, v)| v).collect();
                ctx.func.set_terminator(merge_block, Op::Br { target: post, args });
                ctx.masks.blocks.insert(merge_block, branch_mask);
                if ctx.in_region(branch) {
                    ctx.add_to_region(merge_block);
                }
                merge_block
            }
            None => post,
        };

        // Chain the nodes.
        let args_for = |n: BlockId| entry_args.get(&n).cloned().unwrap_or_default();
        let first = order.first().copied().unwrap_or(tail);
        ctx.func.set_terminator(
            branch,
            Op::Br {
                target: first,
                args: args_for(first),
            },
        );
        for (i, &n) in order.iter().enumerate() {
            let next = order.get(i + 1).copied().unwrap_or(tail);
            if let Some(&(exiting, exit)) = loop_exit.get(&n) {
                retarget_edge(&mut ctx.func, exiting, exit, next, args_for(next));
            } else {
                assert!(
                    !matches!(ctx.func.terminator_op(n), Some(Op::Return(_))),
                    "{n} returns inside the region of {branch}"
                );
                ctx.func.set_terminator(
                    n,
                    Op::Br {
                        target: next,
                        args: args_for(next),
                    },
                );
            }
        }

        // Joins inside the region no longer take parameters.
        for (n, merges) in merged_params {
            for (param, value) in merges {
                replace_uses_where(&mut ctx.func, param, value, |_| true);
                remap_mask(ctx, param, value);
            }
            ctx.func.blocks[n].params.clear();
        }

        let mut predicated = 0;
        for &block in &region {
            if let Some(mask) = ctx.masks.block_mask(block) {
                if !ctx.masks.is_true(mask) {
                    predicated += predicate_lanes(&mut ctx.func, block, mask);
                }
            }
        }
        let widened = if predicated == 0 {
            0
        } else {
            divergence::refine(&ctx.func, &mut ctx.shapes)
        };
        tracing::debug!(
            %branch,
            %post,
            nodes = order.len(),
            predicated,
            widened,
            "linearized divergent region"
        );
    }
}

/// Build one merged value per parameter of `join` from its incoming edges.
///
/// Mask parameters are ORed. Other parameters become a select chain where
/// the earliest edge whose mask holds wins and the last edge is the default.
fn merge_params(
    ctx: &mut VectorizationContext,
    join: BlockId,
    edges: &[(BlockId, ValueId)],
    mut emit: impl FnMut(&mut VectorizationContext, Op, Type) -> ValueId,
) -> Vec<(ValueId, ValueId)> {
    let params = ctx.func.blocks[join].params.clone();
    let args: Vec<Vec<ValueId>> = edges
        .iter()
        .map(|&(pred, _)| edge_args(&ctx.func, pred, join))
        .collect();
    let mut merges = Vec::with_capacity(params.len());
    for (i, param) in params.iter().enumerate() {
        let values: Vec<ValueId> = args.iter().map(|a| a[i]).collect();
        let Some((&last, rest)) = values.split_last() else {
            panic!("{join} has parameters but no incoming edge");
        };
        let mut merged = last;
        if ctx.masks.is_mask_param(param.value) {
            for &v in rest.iter().rev() {
                let shape = ctx.shapes.get(v).join(ctx.shapes.get(merged));
                merged = emit(ctx, Op::Binary(BinOp::Or, v, merged), Type::Bool);
                ctx.shapes.set(merged, shape);
            }
        } else {
            for (&v, &(_, mask)) in rest.iter().zip(edges).rev() {
                let shape = ctx.shapes.get(v).join(ctx.shapes.get(merged)).join(ctx.shapes.get(mask));
                merged = emit(
                    ctx,
                    Op::Select {
                        cond: mask,
                        on_true: v,
                        on_false: merged,
                    },
                    param.ty,
                );
                ctx.shapes.set(merged, shape);
            }
        }
        merges.push((param.value, merged));
    }
    merges
}

/// Point cached masks that were `old` at `new`.
fn remap_mask(ctx: &mut VectorizationContext, old: ValueId, new: ValueId) {
    for v in ctx.masks.blocks.values_mut().chain(ctx.masks.edges.values_mut()) {
        if *v == old {
            *v = new;
        }
    }
}
