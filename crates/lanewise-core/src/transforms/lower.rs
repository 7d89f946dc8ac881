//! One-lane meaning of the cross-lane ops, for kernels that end up running
//! unvectorized.

use crate::ir::{BinOp, BlockId, Constant, Function, InstId, Op, Type, ValueId, VoteKind};

/// Rewrite every vote, extract and align in `func` to what it computes on a
/// single lane. A vote reads its one lane, inactive when the mask is off;
/// extract and align pass their value through. Returns the number of ops
/// rewritten.
pub fn lower_lane_ops(func: &mut Function) -> usize {
    let sites: Vec<(BlockId, InstId)> = func
        .blocks
        .iter()
        .flat_map(|(b, block)| block.insts.iter().map(move |&i| (b, i)))
        .collect();
    let mut lowered = 0;
    for (block, inst) in sites {
        let op = match func.insts[inst].op.clone() {
            Op::Extract { value, .. } | Op::Align { value, .. } => Op::Copy(value),
            Op::Vote { kind, value, mask } => {
                let set = match (kind, mask) {
                    (_, None) => value,
                    (VoteKind::All, Some(m)) => {
                        let off = insert_before(func, block, inst, Op::Not(m), Type::Bool);
                        insert_before(func, block, inst, Op::Binary(BinOp::Or, value, off), Type::Bool)
                    }
                    (_, Some(m)) => {
                        insert_before(func, block, inst, Op::Binary(BinOp::And, value, m), Type::Bool)
                    }
                };
                match kind {
                    VoteKind::Any | VoteKind::All => Op::Copy(set),
                    VoteKind::Ballot => {
                        let ty = kind.result_type();
                        let one = insert_before(func, block, inst, Op::Const(Constant::Int(1)), ty);
                        let zero = insert_before(func, block, inst, Op::Const(Constant::Int(0)), ty);
                        Op::Select {
                            cond: set,
                            on_true: one,
                            on_false: zero,
                        }
                    }
                }
            }
            _ => continue,
        };
        func.insts[inst].op = op;
        lowered += 1;
    }
    if lowered > 0 {
        tracing::debug!(function = %func.name, lowered, "lowered cross-lane ops to one lane");
    }
    lowered
}

fn insert_before(func: &mut Function, block: BlockId, anchor: InstId, op: Op, ty: Type) -> ValueId {
    let index = func.blocks[block]
        .insts
        .iter()
        .position(|&i| i == anchor)
        .unwrap_or_else(|| panic!("{anchor} is not placed in {block}"));
    func.insert_at(block, index, op, ty)
}
