//! Lane shapes and a conservative reference oracle that computes them.
//!
//! The vectorizer core only reads shapes, except for the values it creates
//! itself. Any analysis that fills a [`ShapeMap`] can drive it; [`analyze`]
//! is the one used when the caller has nothing better.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ir::{BlockId, Function, Op, ValueId};

use super::cfg::{Cfg, DomTree};
use super::loops::{LoopForest, LoopId};

/// How a value (or a block's control) behaves across lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shape {
    /// Same on every lane.
    Uniform,
    /// May differ per lane; control flow is unaffected.
    Varying,
    /// The block's branch may send lanes different ways.
    DivergentControl,
}

impl Shape {
    /// Least upper bound for values: anything non-uniform is varying.
    pub fn join(self, other: Shape) -> Shape {
        if self == Shape::Uniform && other == Shape::Uniform {
            Shape::Uniform
        } else {
            Shape::Varying
        }
    }
}

/// Per-value shapes. Values without an entry are treated as varying.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShapeMap {
    values: HashMap<ValueId, Shape>,
}

impl ShapeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, value: ValueId) -> Shape {
        self.values.get(&value).copied().unwrap_or(Shape::Varying)
    }

    pub fn set(&mut self, value: ValueId, shape: Shape) {
        self.values.insert(value, shape);
    }

    pub fn is_uniform(&self, value: ValueId) -> bool {
        self.get(value) == Shape::Uniform
    }

    /// Control shape of `block`, derived from its terminator.
    pub fn block_shape(&self, func: &Function, block: BlockId) -> Shape {
        match func.terminator_op(block) {
            Some(Op::BrIf {
                cond,
                then_target,
                else_target,
                ..
            }) if then_target != else_target && !self.is_uniform(*cond) => {
                Shape::DivergentControl
            }
            _ => Shape::Uniform,
        }
    }

    pub fn is_divergent_branch(&self, func: &Function, block: BlockId) -> bool {
        self.block_shape(func, block) == Shape::DivergentControl
    }
}

/// Structural queries shared by the oracle and the transforms.
pub struct DivergenceInfo<'a> {
    pub func: &'a Function,
    pub cfg: &'a Cfg,
    pub pdom: &'a DomTree,
    pub loops: &'a LoopForest,
}

impl DivergenceInfo<'_> {
    /// Blocks reachable from `from` without taking a back edge and without
    /// entering `stop`.
    fn forward_reach(&self, from: BlockId, stop: Option<BlockId>) -> HashSet<BlockId> {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(block) = stack.pop() {
            if Some(block) == stop || !seen.insert(block) {
                continue;
            }
            for &succ in self.cfg.succs(block) {
                if !self.loops.is_back_edge(block, succ) {
                    stack.push(succ);
                }
            }
        }
        seen
    }

    /// Blocks executed under the divergent branch of `block`: reachable from
    /// its successors before its immediate post-dominator.
    pub fn divergent_region(&self, block: BlockId) -> HashSet<BlockId> {
        let stop = self.pdom.idom(block);
        let mut region = HashSet::new();
        for &succ in self.cfg.succs(block) {
            if !self.loops.is_back_edge(block, succ) {
                region.extend(self.forward_reach(succ, stop));
            }
        }
        region
    }

    /// Join points of `block`'s two sides, where values from both meet.
    pub fn sync_joins(&self, block: BlockId) -> HashSet<BlockId> {
        let stop = self.pdom.idom(block);
        let succs = self.cfg.succs(block);
        if succs.len() != 2 || succs[0] == succs[1] {
            return HashSet::new();
        }
        let reach = |s: BlockId| {
            if self.loops.is_back_edge(block, s) {
                return HashSet::new();
            }
            let mut r = self.forward_reach(s, stop);
            if let Some(p) = stop {
                // The post-dominator is where both sides reconverge.
                if self.reaches(s, p) {
                    r.insert(p);
                }
            }
            r
        };
        let left = reach(succs[0]);
        let right = reach(succs[1]);
        left.intersection(&right).copied().collect()
    }

    fn reaches(&self, from: BlockId, to: BlockId) -> bool {
        self.forward_reach(from, None).contains(&to)
    }

    /// A loop is divergent when lanes may leave it in different iterations
    /// or through different exits.
    pub fn is_divergent_loop(&self, shapes: &ShapeMap, id: LoopId) -> bool {
        let l = self.loops.get(id);
        let exiting: HashSet<BlockId> = self
            .loops
            .exit_edges(id, self.cfg)
            .into_iter()
            .map(|(x, _)| x)
            .collect();
        if exiting.iter().any(|&x| shapes.is_divergent_branch(self.func, x)) {
            return true;
        }
        l.blocks
            .iter()
            .filter(|&&b| shapes.is_divergent_branch(self.func, b))
            .any(|&d| {
                let region = self.divergent_region(d);
                exiting.iter().any(|x| region.contains(x))
            })
    }
}

/// Conservative shape analysis. `params` gives the shape of each function
/// parameter; everything else is derived to a fixpoint.
pub fn analyze(func: &Function, params: &[Shape]) -> ShapeMap {
    let mut shapes = ShapeMap::new();
    for value in func.def_blocks().keys() {
        shapes.set(*value, Shape::Uniform);
    }
    for (param, shape) in func.blocks[func.entry].params.iter().zip(params) {
        shapes.set(param.value, Shape::Uniform.join(*shape));
    }
    refine(func, &mut shapes);
    shapes
}

/// Widen `shapes` to a fixpoint after a rewrite. Shapes only ever move from
/// uniform to varying, so entries set by a caller survive unless one of
/// their inputs became varying. Returns how many values were widened.
pub fn refine(func: &Function, shapes: &mut ShapeMap) -> usize {
    let cfg = Cfg::build(func);
    let dom = DomTree::dominators(func, &cfg);
    let pdom = DomTree::post_dominators(func, &cfg);
    let loops = LoopForest::compute(func, &cfg, &dom);
    let info = DivergenceInfo {
        func,
        cfg: &cfg,
        pdom: &pdom,
        loops: &loops,
    };
    let defs = func.def_blocks();
    let mut widened = 0;

    loop {
        let mut changed = false;
        let mut mark = |shapes: &mut ShapeMap, value: ValueId| {
            if shapes.is_uniform(value) {
                shapes.set(value, Shape::Varying);
                widened += 1;
                changed = true;
            }
        };

        for (block_id, block) in func.blocks.iter() {
            for &inst_id in &block.insts {
                let inst = &func.insts[inst_id];
                if let Some(result) = inst.result {
                    let shape = match &inst.op {
                        Op::Const(_) | Op::Undef(_) | Op::Vote { .. } => Shape::Uniform,
                        Op::Extract { lane, .. } => shapes.get(*lane),
                        // Masked-off lanes read zero, so a varying mask
                        // makes the loaded value varying.
                        Op::Load { ptr, mask } => mask
                            .map_or(Shape::Uniform, |m| shapes.get(m))
                            .join(shapes.get(*ptr)),
                        op => op
                            .operands()
                            .into_iter()
                            .fold(Shape::Uniform, |acc, v| acc.join(shapes.get(v))),
                    };
                    if shape != Shape::Uniform {
                        mark(shapes, result);
                    }
                }
                // Varying arguments make the receiving parameter varying.
                let edges: Vec<(BlockId, Vec<ValueId>)> = match &inst.op {
                    Op::Br { target, args } => vec![(*target, args.clone())],
                    Op::BrIf {
                        then_target,
                        then_args,
                        else_target,
                        else_args,
                        ..
                    } => vec![
                        (*then_target, then_args.clone()),
                        (*else_target, else_args.clone()),
                    ],
                    _ => vec![],
                };
                for (target, args) in edges {
                    for (param, arg) in func.blocks[target].params.iter().zip(args) {
                        if !shapes.is_uniform(arg) {
                            mark(shapes, param.value);
                        }
                    }
                }
            }

            // Sync dependence: both sides of a divergent branch meet.
            if shapes.is_divergent_branch(func, block_id) {
                for join in info.sync_joins(block_id) {
                    for param in &func.blocks[join].params {
                        mark(shapes, param.value);
                    }
                }
            }
        }

        // Temporal divergence: values leaving a divergent loop.
        for (loop_id, l) in loops.iter() {
            if !info.is_divergent_loop(shapes, loop_id) {
                continue;
            }
            for (_, exit) in loops.exit_edges(loop_id, &cfg) {
                for param in &func.blocks[exit].params {
                    mark(shapes, param.value);
                }
            }
            for (block_id, block) in func.blocks.iter() {
                if l.contains(block_id) {
                    continue;
                }
                for &inst_id in &block.insts {
                    for operand in func.insts[inst_id].op.operands() {
                        if defs.get(&operand).is_some_and(|d| l.contains(*d)) {
                            mark(shapes, operand);
                        }
                    }
                }
            }
        }

        if !changed {
            return widened;
        }
    }
}
