//! Recognition of loop-carried reductions.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::ir::{BinOp, BlockId, Constant, Function, Op, Type, ValueId};

use super::cfg::Cfg;
use super::loops::{Loop, LoopForest, LoopId};

/// Associative and commutative recurrence operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RedKind {
    Add,
    Mul,
    And,
    Or,
    Xor,
    Min,
    Max,
}

impl RedKind {
    pub fn from_binop(op: BinOp) -> Option<Self> {
        Some(match op {
            BinOp::Add => RedKind::Add,
            BinOp::Mul => RedKind::Mul,
            BinOp::And => RedKind::And,
            BinOp::Or => RedKind::Or,
            BinOp::Xor => RedKind::Xor,
            BinOp::Min => RedKind::Min,
            BinOp::Max => RedKind::Max,
            _ => return None,
        })
    }

    /// The op that combines two partial results.
    pub fn binop(self) -> BinOp {
        match self {
            RedKind::Add => BinOp::Add,
            RedKind::Mul => BinOp::Mul,
            RedKind::And => BinOp::And,
            RedKind::Or => BinOp::Or,
            RedKind::Xor => BinOp::Xor,
            RedKind::Min => BinOp::Min,
            RedKind::Max => BinOp::Max,
        }
    }

    /// Identity element of this kind at `ty`, if the kind applies to it.
    pub fn neutral(self, ty: Type) -> Option<Constant> {
        use Constant::{Bool, Float, Int};
        Some(match (self, ty) {
            (RedKind::Add | RedKind::Or | RedKind::Xor, Type::Int(_)) => Int(0),
            (RedKind::Add, Type::Float(_)) => Float(0.0),
            (RedKind::Or | RedKind::Xor | RedKind::Add | RedKind::Max, Type::Bool) => Bool(false),
            (RedKind::Mul, Type::Int(_)) => Int(1),
            (RedKind::Mul, Type::Float(_)) => Float(1.0),
            (RedKind::Mul | RedKind::And | RedKind::Min, Type::Bool) => Bool(true),
            (RedKind::And, Type::Int(_)) => Int(-1),
            (RedKind::Min, Type::Int(bits)) => Int(signed_max(bits)?),
            (RedKind::Min, Type::Float(_)) => Float(f64::INFINITY),
            (RedKind::Max, Type::Int(bits)) => Int(-signed_max(bits)? - 1),
            (RedKind::Max, Type::Float(_)) => Float(f64::NEG_INFINITY),
            _ => return None,
        })
    }
}

/// Largest value of a signed integer `bits` wide.
fn signed_max(bits: u16) -> Option<i64> {
    match bits {
        1..=63 => Some((1i64 << (bits - 1)) - 1),
        64 => Some(i64::MAX),
        _ => None,
    }
}

/// A recognized reduction: the header parameter accumulating it, its kind,
/// and the in-loop value the latch feeds back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reduction {
    pub header: BlockId,
    pub phi: ValueId,
    pub kind: RedKind,
    /// Value passed to `phi` on the back edge.
    pub latch_value: ValueId,
    /// Value passed to `phi` from the preheader.
    pub start: ValueId,
}

/// Reduction descriptors keyed by header parameter.
#[derive(Debug, Clone, Default)]
pub struct ReductionTable {
    by_phi: HashMap<ValueId, Reduction>,
}

impl ReductionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reduction: Reduction) {
        self.by_phi.insert(reduction.phi, reduction);
    }

    pub fn get(&self, phi: ValueId) -> Option<&Reduction> {
        self.by_phi.get(&phi)
    }

    pub fn len(&self) -> usize {
        self.by_phi.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_phi.is_empty()
    }
}

/// Argument `index` passed along the edge `src -> dst`.
pub(crate) fn edge_arg(func: &Function, src: BlockId, dst: BlockId, index: usize) -> Option<ValueId> {
    match func.terminator_op(src)? {
        Op::Br { target, args } if *target == dst => args.get(index).copied(),
        Op::BrIf {
            then_target,
            then_args,
            else_target,
            else_args,
            ..
        } => {
            if *then_target == dst {
                then_args.get(index).copied()
            } else if *else_target == dst {
                else_args.get(index).copied()
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Find reductions on the headers of every loop that has a preheader and a
/// single latch.
pub fn analyze(func: &Function, cfg: &Cfg, loops: &LoopForest) -> ReductionTable {
    let mut table = ReductionTable::new();
    for (loop_id, l) in loops.iter() {
        let (Some(latch), Some(pre)) = (l.latch(), loops.preheader(loop_id, func, cfg)) else {
            continue;
        };
        for (index, param) in func.blocks[l.header].params.iter().enumerate() {
            let (Some(start), Some(latch_value)) = (
                edge_arg(func, pre, l.header, index),
                edge_arg(func, latch, l.header, index),
            ) else {
                continue;
            };
            if let Some(kind) = match_chain(func, loops, loop_id, param.value, latch_value) {
                table.insert(Reduction {
                    header: l.header,
                    phi: param.value,
                    kind,
                    latch_value,
                    start,
                });
            }
        }
    }
    table
}

/// Walk back from `latch_value` to `phi` through ops of a single kind and
/// in-loop merges. Every in-loop use of a chain value must stay inside the
/// chain, otherwise the partial sums are observable and reassociation
/// would change results.
fn match_chain(
    func: &Function,
    loops: &LoopForest,
    loop_id: LoopId,
    phi: ValueId,
    latch_value: ValueId,
) -> Option<RedKind> {
    let l = loops.get(loop_id);
    let defs = func.def_blocks();
    let in_loop = |v: ValueId| defs.get(&v).is_some_and(|b| l.contains(*b));

    let mut depends: HashMap<ValueId, bool> = HashMap::new();
    let mut kind = None;
    let mut chain: HashSet<ValueId> = HashSet::new();
    let mut stack = vec![latch_value];

    while let Some(v) = stack.pop() {
        if v == phi || !chain.insert(v) {
            continue;
        }
        if !in_loop(v) {
            return None;
        }
        match func.defining_inst(v).map(|id| &func.insts[id].op) {
            Some(Op::Binary(op, a, b)) => {
                let k = RedKind::from_binop(*op)?;
                if *kind.get_or_insert(k) != k {
                    return None;
                }
                let da = depends_on(func, loops, loop_id, *a, phi, &mut depends);
                let db = depends_on(func, loops, loop_id, *b, phi, &mut depends);
                match (da, db) {
                    (true, false) => stack.push(*a),
                    (false, true) => stack.push(*b),
                    _ => return None,
                }
            }
            Some(Op::Select {
                cond,
                on_true,
                on_false,
            }) => {
                // A linearized join: each arm is the update of one path.
                if depends_on(func, loops, loop_id, *cond, phi, &mut depends) {
                    return None;
                }
                for arm in [*on_true, *on_false] {
                    if !depends_on(func, loops, loop_id, arm, phi, &mut depends) {
                        return None;
                    }
                    stack.push(arm);
                }
            }
            Some(_) => return None,
            None => {
                // A merge parameter inside the loop body.
                let block = *defs.get(&v)?;
                if block == l.header {
                    return None;
                }
                let index = func.blocks[block].params.iter().position(|p| p.value == v)?;
                let cfg = Cfg::build(func);
                for pred in cfg.unique_preds(block) {
                    let arg = edge_arg(func, pred, block, index)?;
                    if !depends_on(func, loops, loop_id, arg, phi, &mut depends) {
                        return None;
                    }
                    stack.push(arg);
                }
            }
        }
    }
    let kind = kind?;

    // Chain values may only feed each other (and the back edge).
    chain.insert(phi);
    for &v in &chain {
        for (block, inst) in func.uses_of(v) {
            if !l.contains(block) {
                continue;
            }
            let ok = match &func.insts[inst].op {
                Op::Binary(..) => func.insts[inst].result.is_some_and(|r| chain.contains(&r)),
                Op::Select { cond, .. } => {
                    *cond != v && func.insts[inst].result.is_some_and(|r| chain.contains(&r))
                }
                op @ (Op::Br { .. } | Op::BrIf { .. }) => {
                    branch_args_stay_in_chain(func, op, v, l, phi, &chain)
                }
                _ => false,
            };
            if !ok {
                return None;
            }
        }
    }
    Some(kind)
}

fn branch_args_stay_in_chain(
    func: &Function,
    op: &Op,
    v: ValueId,
    l: &Loop,
    phi: ValueId,
    chain: &HashSet<ValueId>,
) -> bool {
    let edges: Vec<(BlockId, &[ValueId])> = match op {
        Op::Br { target, args } => vec![(*target, args.as_slice())],
        Op::BrIf {
            cond,
            then_target,
            then_args,
            else_target,
            else_args,
        } => {
            if *cond == v {
                return false;
            }
            vec![
                (*then_target, then_args.as_slice()),
                (*else_target, else_args.as_slice()),
            ]
        }
        _ => return false,
    };
    edges.into_iter().all(|(target, args)| {
        args.iter().enumerate().all(|(i, &arg)| {
            // Values passed out of the loop are read after it, not per iteration.
            if arg != v || !l.contains(target) {
                return true;
            }
            let param = func.blocks[target].params[i].value;
            (target == l.header && param == phi) || (target != l.header && chain.contains(&param))
        })
    })
}

fn depends_on(
    func: &Function,
    loops: &LoopForest,
    loop_id: LoopId,
    v: ValueId,
    phi: ValueId,
    memo: &mut HashMap<ValueId, bool>,
) -> bool {
    if v == phi {
        return true;
    }
    if let Some(&d) = memo.get(&v) {
        return d;
    }
    // Break cycles through inner loops conservatively.
    memo.insert(v, false);
    let l = loops.get(loop_id);
    let result = match func.defining_inst(v) {
        Some(inst) => func.insts[inst]
            .op
            .operands()
            .into_iter()
            .any(|o| depends_on(func, loops, loop_id, o, phi, memo)),
        None => {
            let defs = func.def_blocks();
            match defs.get(&v) {
                Some(&block) if l.contains(block) && block != l.header => {
                    let index = func.blocks[block]
                        .params
                        .iter()
                        .position(|p| p.value == v)
                        .unwrap_or(usize::MAX);
                    let cfg = Cfg::build(func);
                    cfg.unique_preds(block).into_iter().any(|pred| {
                        edge_arg(func, pred, block, index)
                            .is_some_and(|a| depends_on(func, loops, loop_id, a, phi, memo))
                    })
                }
                _ => false,
            }
        }
    };
    memo.insert(v, result);
    result
}
