//! Natural-loop forest.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::define_entity;
use crate::entity::PrimaryMap;
use crate::ir::{BlockId, Function};

use super::cfg::{Cfg, DomTree};

define_entity!(LoopId, "loop");

/// A natural loop: header, back-edge sources, and body (header included).
#[derive(Debug, Clone)]
pub struct Loop {
    pub header: BlockId,
    pub latches: Vec<BlockId>,
    pub blocks: BTreeSet<BlockId>,
    pub parent: Option<LoopId>,
    /// 1 for outermost loops.
    pub depth: usize,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }

    /// The unique back-edge source, if there is exactly one.
    pub fn latch(&self) -> Option<BlockId> {
        match self.latches.as_slice() {
            [latch] => Some(*latch),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoopForest {
    loops: PrimaryMap<LoopId, Loop>,
}

impl LoopForest {
    /// Detect natural loops via back edges (u→v where v dominates u); back
    /// edges sharing a header form one loop.
    pub fn compute(func: &Function, cfg: &Cfg, dom: &DomTree) -> Self {
        let mut by_header: HashMap<BlockId, (Vec<BlockId>, BTreeSet<BlockId>)> = HashMap::new();

        for block in func.blocks.keys() {
            if !dom.contains(block) {
                continue;
            }
            for &target in cfg.succs(block) {
                if !dom.dominates(target, block) {
                    continue;
                }
                let (latches, body) = by_header.entry(target).or_default();
                if !latches.contains(&block) {
                    latches.push(block);
                }
                body.insert(target);
                let mut queue = VecDeque::new();
                if body.insert(block) {
                    queue.push_back(block);
                }
                while let Some(cur) = queue.pop_front() {
                    for &pred in cfg.preds(cur) {
                        if dom.contains(pred) && body.insert(pred) {
                            queue.push_back(pred);
                        }
                    }
                }
            }
        }

        // Outer loops first so parents get smaller ids than children.
        let mut found: Vec<(BlockId, Vec<BlockId>, BTreeSet<BlockId>)> = by_header
            .into_iter()
            .map(|(h, (l, b))| (h, l, b))
            .collect();
        found.sort_by(|a, b| b.2.len().cmp(&a.2.len()).then(a.0.cmp(&b.0)));

        let mut loops: PrimaryMap<LoopId, Loop> = PrimaryMap::new();
        for (header, latches, blocks) in found {
            let parent = loops
                .iter()
                .filter(|(_, outer)| outer.header != header && outer.blocks.is_superset(&blocks))
                .min_by_key(|(_, outer)| outer.blocks.len())
                .map(|(id, _)| id);
            let depth = parent.map_or(1, |p| loops[p].depth + 1);
            loops.push(Loop {
                header,
                latches,
                blocks,
                parent,
                depth,
            });
        }

        LoopForest { loops }
    }

    pub fn get(&self, id: LoopId) -> &Loop {
        &self.loops[id]
    }

    pub fn iter(&self) -> impl Iterator<Item = (LoopId, &Loop)> {
        self.loops.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Innermost loop containing `block`.
    pub fn loop_for(&self, block: BlockId) -> Option<LoopId> {
        self.loops
            .iter()
            .filter(|(_, l)| l.contains(block))
            .max_by_key(|(_, l)| l.depth)
            .map(|(id, _)| id)
    }

    pub fn loop_with_header(&self, header: BlockId) -> Option<LoopId> {
        self.loops
            .iter()
            .find(|(_, l)| l.header == header)
            .map(|(id, _)| id)
    }

    /// Loops ordered deepest first; ties keep id order.
    pub fn innermost_first(&self) -> Vec<LoopId> {
        let mut ids: Vec<LoopId> = self.loops.keys().collect();
        ids.sort_by(|a, b| self.loops[*b].depth.cmp(&self.loops[*a].depth).then(a.cmp(b)));
        ids
    }

    /// Direct children of `id`.
    pub fn children(&self, id: LoopId) -> Vec<LoopId> {
        self.loops
            .iter()
            .filter(|(_, l)| l.parent == Some(id))
            .map(|(child, _)| child)
            .collect()
    }

    pub fn is_back_edge(&self, src: BlockId, dst: BlockId) -> bool {
        self.loops
            .values()
            .any(|l| l.header == dst && l.latches.contains(&src))
    }

    /// The single out-of-loop predecessor of the header, provided it
    /// branches unconditionally into the header.
    pub fn preheader(&self, id: LoopId, func: &Function, cfg: &Cfg) -> Option<BlockId> {
        let l = &self.loops[id];
        let outside: Vec<BlockId> = cfg
            .unique_preds(l.header)
            .into_iter()
            .filter(|p| !l.contains(*p))
            .collect();
        match outside.as_slice() {
            [pre] if cfg.succs(*pre) == [l.header].as_slice() && func.terminator(*pre).is_some() => Some(*pre),
            _ => None,
        }
    }

    /// Edges leaving the loop as `(exiting, exit)`, in block order.
    pub fn exit_edges(&self, id: LoopId, cfg: &Cfg) -> Vec<(BlockId, BlockId)> {
        let l = &self.loops[id];
        let mut edges = Vec::new();
        for &block in &l.blocks {
            for &succ in cfg.succs(block) {
                if !l.contains(succ) {
                    edges.push((block, succ));
                }
            }
        }
        edges
    }
}
