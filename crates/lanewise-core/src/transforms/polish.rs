//! Peephole cleanup of mask arithmetic left behind by predication.

use std::collections::{HashMap, HashSet};

use crate::context::VectorizationContext;
use crate::ir::{BinOp, Constant, Function, Op, ValueId};

/// Folds `x & true`, `x | false`, their absorbing counterparts, selects on
/// a constant or between equal values, and double negation.
pub struct MaskPolish;

impl MaskPolish {
    /// Fold to a fixpoint. Returns the number of instructions removed.
    pub fn run(ctx: &mut VectorizationContext) -> usize {
        let mut removed = 0;
        loop {
            let folds = find_folds(&ctx.func);
            if folds.is_empty() {
                break;
            }
            let resolve = |mut v: ValueId| {
                while let Some(&next) = folds.get(&v) {
                    v = next;
                }
                v
            };
            let dead: HashSet<ValueId> = folds.keys().copied().collect();
            let func = &mut ctx.func;
            let placed: Vec<_> = func.blocks.values().flat_map(|b| b.insts.iter().copied()).collect();
            for inst in placed {
                func.insts[inst].op.visit_operands_mut(|v| *v = resolve(*v));
            }
            for block in func.blocks.values_mut() {
                let insts = &func.insts;
                block
                    .insts
                    .retain(|&i| insts[i].result.map_or(true, |r| !dead.contains(&r)));
            }
            for v in ctx.masks.blocks.values_mut().chain(ctx.masks.edges.values_mut()) {
                *v = resolve(*v);
            }
            removed += dead.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "polished mask arithmetic");
        }
        removed
    }
}

fn find_folds(func: &Function) -> HashMap<ValueId, ValueId> {
    let mut consts: HashMap<ValueId, bool> = HashMap::new();
    let mut ops: HashMap<ValueId, &Op> = HashMap::new();
    for block in func.blocks.values() {
        for &inst in &block.insts {
            let inst = &func.insts[inst];
            if let Some(r) = inst.result {
                if let Op::Const(Constant::Bool(b)) = inst.op {
                    consts.insert(r, b);
                }
                ops.insert(r, &inst.op);
            }
        }
    }
    let is = |v: ValueId, b: bool| consts.get(&v) == Some(&b);

    let mut folds = HashMap::new();
    for (&result, op) in &ops {
        let to = match **op {
            Op::Binary(BinOp::And, x, y) if is(y, true) || is(x, false) => Some(x),
            Op::Binary(BinOp::And, x, y) if is(x, true) || is(y, false) => Some(y),
            Op::Binary(BinOp::Or, x, y) if is(y, false) || is(x, true) => Some(x),
            Op::Binary(BinOp::Or, x, y) if is(x, false) || is(y, true) => Some(y),
            Op::Select {
                cond,
                on_true,
                on_false,
            } => {
                if is(cond, true) || on_true == on_false {
                    Some(on_true)
                } else if is(cond, false) {
                    Some(on_false)
                } else {
                    None
                }
            }
            Op::Not(inner) => match ops.get(&inner) {
                Some(Op::Not(x)) => Some(*x),
                _ => None,
            },
            _ => None,
        };
        if let Some(to) = to {
            folds.insert(result, to);
        }
    }
    folds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ShapeMap;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::{FunctionSig, Type};

    fn sig() -> FunctionSig {
        FunctionSig {
            params: vec![Type::Bool, Type::Int(64), Type::Int(64)],
            return_ty: Type::Int(64),
        }
    }

    #[test]
    fn folds_identities_and_double_negation() {
        let mut fb = FunctionBuilder::new("polish", sig());
        let m = fb.param(0);
        let t = fb.const_bool(true);
        let f = fb.const_bool(false);
        let a = fb.binary(BinOp::And, m, t);
        let o = fb.binary(BinOp::Or, f, a);
        let n1 = fb.not(o);
        let n2 = fb.not(n1);
        let (a1, a2) = (fb.param(1), fb.param(2));
        let x = fb.select(n2, a1, a2);
        fb.ret(Some(x));
        let func = fb.build();
        let entry = func.entry;
        let mut ctx = VectorizationContext::new(func, ShapeMap::new());

        // and, or, and the outer not fold away; the inner not is left dead.
        assert_eq!(MaskPolish::run(&mut ctx), 3);
        let sel = ctx.func.defining_inst(x).expect("select survives");
        assert!(matches!(ctx.func.insts[sel].op, Op::Select { cond, .. } if cond == m));
        assert_eq!(ctx.func.blocks[entry].insts.len(), 5);
    }

    #[test]
    fn select_on_constant_picks_a_side() {
        let mut fb = FunctionBuilder::new("pick", sig());
        let f = fb.const_bool(false);
        let a = fb.param(1);
        let b = fb.param(2);
        let x = fb.select(f, a, b);
        fb.ret(Some(x));
        let func = fb.build();
        let entry = func.entry;
        let mut ctx = VectorizationContext::new(func, ShapeMap::new());

        assert_eq!(MaskPolish::run(&mut ctx), 1);
        assert_eq!(ctx.func.terminator_op(entry), Some(&Op::Return(Some(b))));
    }

    #[test]
    fn leaves_varying_masks_alone() {
        let mut fb = FunctionBuilder::new("keep", sig());
        let m = fb.param(0);
        let n = fb.not(m);
        let a = fb.binary(BinOp::And, m, n);
        let (a1, a2) = (fb.param(1), fb.param(2));
        let x = fb.select(a, a1, a2);
        fb.ret(Some(x));
        let mut ctx = VectorizationContext::new(fb.build(), ShapeMap::new());
        assert_eq!(MaskPolish::run(&mut ctx), 0);
    }
}
