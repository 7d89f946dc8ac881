//! CFG edge maps and dominance.
//!
//! Every transform that rewires edges invalidates these; the context
//! rebuilds them on demand (see [`crate::context::VectorizationContext`]).

use std::collections::{HashMap, HashSet};

use crate::entity::EntityRef;
use crate::ir::{BlockId, Function, Op};

/// Successor blocks named by a terminator, in operand order.
pub fn branch_targets(op: &Op) -> Vec<BlockId> {
    match op {
        Op::Br { target, .. } => vec![*target],
        Op::BrIf {
            then_target,
            else_target,
            ..
        } => vec![*then_target, *else_target],
        _ => vec![],
    }
}

/// Predecessor and successor maps for a function's CFG.
///
/// Edges are listed once per terminator operand, so a `br_if` with both
/// targets equal contributes two edges.
#[derive(Debug, Clone)]
pub struct Cfg {
    succs: HashMap<BlockId, Vec<BlockId>>,
    preds: HashMap<BlockId, Vec<BlockId>>,
}

impl Cfg {
    pub fn build(func: &Function) -> Self {
        let mut succs: HashMap<BlockId, Vec<BlockId>> = HashMap::new();
        let mut preds: HashMap<BlockId, Vec<BlockId>> = HashMap::new();

        for block_id in func.blocks.keys() {
            succs.entry(block_id).or_default();
            preds.entry(block_id).or_default();
        }

        for block_id in func.blocks.keys() {
            if let Some(op) = func.terminator_op(block_id) {
                for target in branch_targets(op) {
                    succs.entry(block_id).or_default().push(target);
                    preds.entry(target).or_default().push(block_id);
                }
            }
        }

        Cfg { succs, preds }
    }

    pub fn succs(&self, block: BlockId) -> &[BlockId] {
        self.succs.get(&block).map_or(&[], Vec::as_slice)
    }

    pub fn preds(&self, block: BlockId) -> &[BlockId] {
        self.preds.get(&block).map_or(&[], Vec::as_slice)
    }

    /// Predecessors with duplicate edges collapsed, first-seen order.
    pub fn unique_preds(&self, block: BlockId) -> Vec<BlockId> {
        let mut seen = HashSet::new();
        self.preds(block)
            .iter()
            .copied()
            .filter(|p| seen.insert(*p))
            .collect()
    }

    /// Reverse post-order of the blocks reachable from `entry`.
    pub fn reverse_post_order(&self, entry: BlockId) -> Vec<BlockId> {
        let mut visited = HashSet::new();
        let mut post = Vec::new();
        // (block, next successor index)
        let mut stack: Vec<(BlockId, usize)> = vec![(entry, 0)];
        visited.insert(entry);
        while let Some((block, idx)) = stack.pop() {
            let succs = self.succs(block);
            if idx < succs.len() {
                stack.push((block, idx + 1));
                let succ = succs[idx];
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                post.push(block);
            }
        }
        post.reverse();
        post
    }

    pub fn exit_blocks(&self, func: &Function) -> Vec<BlockId> {
        func.blocks
            .keys()
            .filter(|&b| matches!(func.terminator_op(b), Some(Op::Return(_))))
            .collect()
    }
}

// -------------------------------------------------------------------------
// Dominator computation (Lengauer-Tarjan)
// -------------------------------------------------------------------------

/// Iterative path compression for the Lengauer-Tarjan union-find forest.
/// `usize::MAX` in `ancestor` means "root".
fn lt_compress(v: usize, ancestor: &mut [usize], label: &mut [usize], semi: &[usize]) {
    let mut path = Vec::new();
    let mut u = v;
    while ancestor[u] != usize::MAX && ancestor[ancestor[u]] != usize::MAX {
        path.push(u);
        u = ancestor[u];
    }
    for &node in path.iter().rev() {
        let a = ancestor[node];
        if semi[label[a]] < semi[label[node]] {
            label[node] = label[a];
        }
        ancestor[node] = ancestor[a];
    }
}

fn lt_eval(v: usize, ancestor: &mut [usize], label: &mut [usize], semi: &[usize]) -> usize {
    if ancestor[v] == usize::MAX {
        return v;
    }
    lt_compress(v, ancestor, label, semi);
    label[v]
}

/// Immediate dominators of every block reachable from `entry`, with the
/// entry mapped to itself. Serves both directions: post-dominators run it
/// over the reversed edge maps.
fn compute_idoms(
    entry: BlockId,
    preds: impl Fn(BlockId) -> Vec<BlockId>,
    succs: impl Fn(BlockId) -> Vec<BlockId>,
) -> HashMap<BlockId, BlockId> {
    let mut dfnum: HashMap<BlockId, usize> = HashMap::new();
    let mut vertex: Vec<BlockId> = Vec::new();
    let mut dfs_parent: Vec<usize> = Vec::new();

    let mut stack: Vec<(BlockId, usize)> = vec![(entry, usize::MAX)];
    while let Some((block, parent_df)) = stack.pop() {
        if dfnum.contains_key(&block) {
            continue;
        }
        let df = vertex.len();
        dfnum.insert(block, df);
        vertex.push(block);
        dfs_parent.push(parent_df);
        for succ in succs(block).into_iter().rev() {
            if !dfnum.contains_key(&succ) {
                stack.push((succ, df));
            }
        }
    }

    let n = vertex.len();
    let mut result = HashMap::with_capacity(n);
    result.insert(entry, entry);
    if n <= 1 {
        return result;
    }

    let mut semi: Vec<usize> = (0..n).collect();
    let mut idom_idx: Vec<usize> = vec![0; n];
    let mut ancestor: Vec<usize> = vec![usize::MAX; n];
    let mut label: Vec<usize> = (0..n).collect();
    let mut bucket: Vec<Vec<usize>> = vec![Vec::new(); n];

    for i in (1..n).rev() {
        let p = dfs_parent[i];
        for v in preds(vertex[i]) {
            if let Some(&v_df) = dfnum.get(&v) {
                let u = lt_eval(v_df, &mut ancestor, &mut label, &semi);
                if semi[u] < semi[i] {
                    semi[i] = semi[u];
                }
            }
        }
        bucket[semi[i]].push(i);
        ancestor[i] = p;

        for v in std::mem::take(&mut bucket[p]) {
            let u = lt_eval(v, &mut ancestor, &mut label, &semi);
            idom_idx[v] = if semi[u] < semi[v] { u } else { p };
        }
    }

    for i in 1..n {
        if idom_idx[i] != semi[i] {
            idom_idx[i] = idom_idx[idom_idx[i]];
        }
    }

    for i in 1..n {
        result.insert(vertex[i], vertex[idom_idx[i]]);
    }
    result
}

/// A dominator or post-dominator tree, stored as immediate-dominator links.
#[derive(Debug, Clone)]
pub struct DomTree {
    idom: HashMap<BlockId, BlockId>,
}

/// Sentinel node that every returning block flows into when computing
/// post-dominators.
fn virtual_exit() -> BlockId {
    BlockId::new(u32::MAX)
}

impl DomTree {
    pub fn dominators(func: &Function, cfg: &Cfg) -> Self {
        let idom = compute_idoms(
            func.entry,
            |b| cfg.preds(b).to_vec(),
            |b| cfg.succs(b).to_vec(),
        );
        DomTree { idom }
    }

    /// Post-dominators over the reversed CFG, rooted at a virtual exit that
    /// all returning blocks feed. Blocks whose only post-dominator is the
    /// virtual exit have no immediate post-dominator.
    pub fn post_dominators(func: &Function, cfg: &Cfg) -> Self {
        let exits = cfg.exit_blocks(func);
        let vexit = virtual_exit();
        let ipdom = compute_idoms(
            vexit,
            |b| {
                if b == vexit {
                    Vec::new()
                } else {
                    let mut p = cfg.succs(b).to_vec();
                    if exits.contains(&b) {
                        p.push(vexit);
                    }
                    p
                }
            },
            |b| {
                if b == vexit {
                    exits.clone()
                } else {
                    cfg.preds(b).to_vec()
                }
            },
        );
        let idom = ipdom
            .into_iter()
            .filter(|(k, v)| *k != vexit && *v != vexit)
            .collect();
        DomTree { idom }
    }

    /// Immediate (post-)dominator, `None` for the root or unreachable blocks.
    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(&block).copied().filter(|&d| d != block)
    }

    pub fn contains(&self, block: BlockId) -> bool {
        self.idom.contains_key(&block)
    }

    /// Does `a` (post-)dominate `b`? Reflexive.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut cur = b;
        loop {
            if cur == a {
                return true;
            }
            match self.idom.get(&cur) {
                Some(&parent) if parent != cur => cur = parent,
                _ => return false,
            }
        }
    }
}
