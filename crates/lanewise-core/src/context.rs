//! Per-attempt mutable state shared by every stage.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::analysis::{Cfg, DomTree, LoopForest, LoopId, ReductionTable, ShapeMap};
use crate::ir::{BlockId, Function, ValueId};

/// The part of the function being vectorized. `None` in the context means
/// whole-function mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub entry: BlockId,
    pub blocks: BTreeSet<BlockId>,
}

impl Region {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.contains(&block)
    }

    /// The body of a loop, entered at its header.
    pub fn for_loop(loops: &LoopForest, id: LoopId) -> Self {
        let l = loops.get(id);
        Region {
            entry: l.header,
            blocks: l.blocks.clone(),
        }
    }
}

/// CFG-derived analyses. Stale as soon as any edge changes.
#[derive(Debug, Clone)]
pub struct Analyses {
    pub cfg: Cfg,
    pub dom: DomTree,
    pub pdom: DomTree,
    pub loops: LoopForest,
}

impl Analyses {
    pub fn compute(func: &Function) -> Self {
        let cfg = Cfg::build(func);
        let dom = DomTree::dominators(func, &cfg);
        let pdom = DomTree::post_dominators(func, &cfg);
        let loops = LoopForest::compute(func, &cfg, &dom);
        Self {
            cfg,
            dom,
            pdom,
            loops,
        }
    }
}

/// Predicates materialized so far. Each block and each edge gets at most
/// one mask value.
#[derive(Debug, Clone, Default)]
pub struct MaskCache {
    pub(crate) blocks: HashMap<BlockId, ValueId>,
    pub(crate) edges: HashMap<(BlockId, BlockId), ValueId>,
    /// Block parameters that exist only to carry a join mask. They merge
    /// with OR rather than with a select chain.
    pub(crate) params: HashSet<ValueId>,
    /// Live-mask parameters of divergent loop headers still waiting for
    /// their back-edge argument.
    pub(crate) pending_headers: HashMap<BlockId, ValueId>,
    pub(crate) true_const: Option<ValueId>,
    pub(crate) false_const: Option<ValueId>,
}

impl MaskCache {
    pub fn block_mask(&self, block: BlockId) -> Option<ValueId> {
        self.blocks.get(&block).copied()
    }

    pub fn edge_mask(&self, src: BlockId, dst: BlockId) -> Option<ValueId> {
        self.edges.get(&(src, dst)).copied()
    }

    pub fn is_mask_param(&self, value: ValueId) -> bool {
        self.params.contains(&value)
    }

    /// Is `value` the all-lanes-active constant?
    pub fn is_true(&self, value: ValueId) -> bool {
        self.true_const == Some(value)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Everything a vectorization attempt mutates: the function, its shapes,
/// the mask cache, the reduction table and the (lazily rebuilt) dominance
/// analyses.
pub struct VectorizationContext {
    pub func: Function,
    pub shapes: ShapeMap,
    pub region: Option<Region>,
    pub reductions: ReductionTable,
    pub(crate) masks: MaskCache,
    analyses: Option<Analyses>,
}

impl VectorizationContext {
    pub fn new(func: Function, shapes: ShapeMap) -> Self {
        Self {
            func,
            shapes,
            region: None,
            reductions: ReductionTable::new(),
            masks: MaskCache::default(),
            analyses: None,
        }
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.region = Some(region);
        self
    }

    pub fn with_reductions(mut self, reductions: ReductionTable) -> Self {
        self.reductions = reductions;
        self
    }

    /// Current analyses, recomputed if a stage invalidated them.
    pub fn analyses(&mut self) -> &Analyses {
        let func = &self.func;
        self.analyses.get_or_insert_with(|| {
            tracing::trace!(func = %func.name, "recomputing dominance and loop info");
            Analyses::compute(func)
        })
    }

    /// Drop cached analyses after rewiring edges.
    pub fn invalidate(&mut self) {
        self.analyses = None;
    }

    pub fn masks(&self) -> &MaskCache {
        &self.masks
    }

    pub fn in_region(&self, block: BlockId) -> bool {
        self.region.as_ref().map_or(true, |r| r.contains(block))
    }

    /// Region blocks in reverse post-order (whole function when no region
    /// is set). Unreachable blocks are skipped.
    pub fn region_blocks(&mut self) -> Vec<BlockId> {
        let entry = self.func.entry;
        let rpo = self.analyses().cfg.reverse_post_order(entry);
        rpo.into_iter().filter(|b| self.in_region(*b)).collect()
    }

    /// Keep the region in sync with blocks a stage adds inside it.
    pub(crate) fn add_to_region(&mut self, block: BlockId) {
        if let Some(region) = &mut self.region {
            region.blocks.insert(block);
        }
    }

    pub fn into_function(self) -> Function {
        self.func
    }
}
