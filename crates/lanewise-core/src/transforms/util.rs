//! Edge and use-list rewriting shared by the transforms.

use std::collections::{HashMap, HashSet};

use crate::analysis::{Cfg, Shape};
use crate::context::VectorizationContext;
use crate::ir::{BlockId, Function, Op, Type, ValueId};

/// Append `value` to the arguments passed on every `src -> dst` edge.
pub(crate) fn append_edge_arg(func: &mut Function, src: BlockId, dst: BlockId, value: ValueId) {
    let Some(term) = func.terminator(src) else {
        panic!("{src} has no terminator to carry an argument to {dst}");
    };
    let mut found = false;
    match &mut func.insts[term].op {
        Op::Br { target, args } if *target == dst => {
            args.push(value);
            found = true;
        }
        Op::BrIf {
            then_target,
            then_args,
            else_target,
            else_args,
            ..
        } => {
            if *then_target == dst {
                then_args.push(value);
                found = true;
            }
            if *else_target == dst {
                else_args.push(value);
                found = true;
            }
        }
        _ => {}
    }
    assert!(found, "no edge {src} -> {dst}");
}

/// Arguments on the (first) `src -> dst` edge.
pub(crate) fn edge_args(func: &Function, src: BlockId, dst: BlockId) -> Vec<ValueId> {
    match func.terminator_op(src) {
        Some(Op::Br { target, args }) if *target == dst => args.clone(),
        Some(Op::BrIf {
            then_target,
            then_args,
            else_target,
            else_args,
            ..
        }) => {
            if *then_target == dst {
                then_args.clone()
            } else if *else_target == dst {
                else_args.clone()
            } else {
                panic!("no edge {src} -> {dst}")
            }
        }
        _ => panic!("no edge {src} -> {dst}"),
    }
}

/// Point the `src -> old` edge at `new`, passing `args`.
pub(crate) fn retarget_edge(
    func: &mut Function,
    src: BlockId,
    old: BlockId,
    new: BlockId,
    new_args: Vec<ValueId>,
) {
    let Some(term) = func.terminator(src) else {
        panic!("{src} has no terminator");
    };
    match &mut func.insts[term].op {
        Op::Br { target, args } if *target == old => {
            *target = new;
            *args = new_args;
        }
        Op::BrIf {
            then_target,
            then_args,
            else_target,
            else_args,
            ..
        } if *then_target == old || *else_target == old => {
            if *then_target == old {
                *then_target = new;
                *then_args = new_args;
            } else {
                *else_target = new;
                *else_args = new_args;
            }
        }
        _ => panic!("no edge {src} -> {old}"),
    }
}

/// Rewrite every use of `old` in blocks accepted by `filter`.
pub(crate) fn replace_uses_where(
    func: &mut Function,
    old: ValueId,
    new: ValueId,
    filter: impl Fn(BlockId) -> bool,
) -> usize {
    let sites: Vec<_> = func
        .uses_of(old)
        .into_iter()
        .filter(|(block, _)| filter(*block))
        .collect();
    for &(_, inst) in &sites {
        func.replace_operand(inst, old, new);
    }
    sites.len()
}

/// Give every unpredicated load, store and vote in `block` the predicate
/// `mask`.
pub(crate) fn predicate_lanes(func: &mut Function, block: BlockId, mask: ValueId) -> usize {
    let mut count = 0;
    for &inst in &func.blocks[block].insts {
        if let Some(slot @ None) = func.insts[inst].op.mask_slot() {
            *slot = Some(mask);
            count += 1;
        }
    }
    count
}

/// Carry a value through the blocks of `order`, where every forward
/// predecessor of a block appears before it and `order[0]` starts with
/// `start`.
///
/// `update` may produce a new value at the end of a block. Blocks whose
/// predecessors deliver different values get a fresh parameter. Returns the
/// value live at the end of each block.
pub(crate) fn thread_value(
    ctx: &mut VectorizationContext,
    cfg: &Cfg,
    order: &[BlockId],
    start: ValueId,
    ty: Type,
    mut update: impl FnMut(&mut VectorizationContext, BlockId, ValueId) -> Option<ValueId>,
) -> HashMap<BlockId, ValueId> {
    let members: HashSet<BlockId> = order.iter().copied().collect();
    let mut out: HashMap<BlockId, ValueId> = HashMap::new();
    let mut pending = Vec::new();

    for (i, &block) in order.iter().enumerate() {
        let incoming = if i == 0 {
            start
        } else {
            let preds: Vec<BlockId> = cfg
                .unique_preds(block)
                .into_iter()
                .filter(|p| members.contains(p))
                .collect();
            match preds.as_slice() {
                [p] if out.contains_key(p) => out[p],
                _ => {
                    let param = ctx.func.add_block_param(block, ty);
                    ctx.shapes.set(param, Shape::Varying);
                    pending.push((block, preds));
                    param
                }
            }
        };
        let value = update(ctx, block, incoming).unwrap_or(incoming);
        out.insert(block, value);
    }

    for (block, preds) in pending {
        for pred in preds {
            append_edge_arg(&mut ctx.func, pred, block, out[&pred]);
        }
    }
    out
}

/// Replace argument `index` on every `src -> dst` edge.
pub(crate) fn set_edge_arg(func: &mut Function, src: BlockId, dst: BlockId, index: usize, value: ValueId) {
    let Some(term) = func.terminator(src) else {
        panic!("{src} has no terminator");
    };
    match &mut func.insts[term].op {
        Op::Br { target, args } if *target == dst => args[index] = value,
        Op::BrIf {
            then_target,
            then_args,
            else_target,
            else_args,
            ..
        } => {
            if *then_target == dst {
                then_args[index] = value;
            }
            if *else_target == dst {
                else_args[index] = value;
            }
        }
        _ => panic!("no edge {src} -> {dst}"),
    }
}
