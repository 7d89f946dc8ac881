//! Reduction optimization.
//!
//! In-loop uses of a reduction's header parameter are restarted from the
//! kind's neutral element, and one combine of the old accumulator with the
//! iteration's partial result is placed where the latch value is computed.
//! Each iteration then builds its partial result independently and the
//! accumulator is touched once.

use crate::analysis::{Reduction, Shape};
use crate::context::VectorizationContext;
use crate::ir::{BlockId, Function, InstId, Op, Type, ValueId};

use super::util::{replace_uses_where, set_edge_arg};

pub struct ReductionOptimization<'a> {
    ctx: &'a mut VectorizationContext,
}

impl<'a> ReductionOptimization<'a> {
    pub fn new(ctx: &'a mut VectorizationContext) -> Self {
        Self { ctx }
    }

    /// Rewrite one reduction. Returns `false` when there is nothing to gain.
    pub fn optimize(&mut self, phi: ValueId, red: &Reduction) -> bool {
        if self.ctx.func.use_count(phi) <= 1 {
            return false;
        }
        let ty = self.ctx.func.value_type(phi);
        let Some(neutral) = red.kind.neutral(ty) else {
            tracing::debug!(%phi, kind = ?red.kind, %ty, "no neutral element, skipping");
            return false;
        };
        let latch = {
            let loops = &self.ctx.analyses().loops;
            let id = loops
                .loop_with_header(red.header)
                .unwrap_or_else(|| panic!("reduction {phi} on {}, which heads no loop", red.header));
            loops
                .get(id)
                .latch()
                .unwrap_or_else(|| panic!("reduction {phi} lives in a loop without a single latch"))
        };
        let index = self.ctx.func.blocks[red.header]
            .params
            .iter()
            .position(|p| p.value == phi)
            .unwrap_or_else(|| panic!("{phi} is not a parameter of {}", red.header));

        let func = &mut self.ctx.func;
        let neutral_value = func.insert_at(func.entry, 0, Op::Const(neutral), ty);
        self.ctx.shapes.set(neutral_value, Shape::Uniform);

        let ctx = &mut *self.ctx;
        let region = ctx.region.clone();
        let in_region = |b| region.as_ref().map_or(true, |r| r.contains(b));
        let restarted = restart_uses(&mut ctx.func, phi, neutral_value, in_region);

        let op = Op::Binary(red.kind.binop(), phi, red.latch_value);
        let combine = match ctx.func.defining_inst(red.latch_value) {
            Some(inst) => ctx.func.insert_after(inst, op, ty),
            None => {
                let block = *ctx
                    .func
                    .def_blocks()
                    .get(&red.latch_value)
                    .unwrap_or_else(|| panic!("latch value {} of {phi} is not defined", red.latch_value));
                ctx.func.insert_at(block, 0, op, ty)
            }
        };
        ctx.shapes.set(combine, ctx.shapes.get(phi));

        replace_uses_where(&mut ctx.func, red.latch_value, combine, |b| !in_region(b));
        set_edge_arg(&mut ctx.func, latch, red.header, index, combine);

        tracing::debug!(%phi, kind = ?red.kind, restarted, %combine, "optimized reduction");
        true
    }

    /// Optimize every reduction on the region entry's parameters. Only
    /// applies when a region is set; whole-function vectorization has no
    /// loop whose iterations become lanes. Returns the number of chains
    /// rewritten.
    pub fn run(&mut self) -> usize {
        let Some(entry) = self.ctx.region.as_ref().map(|r| r.entry) else {
            tracing::debug!("reduction optimization needs a region, skipping");
            return 0;
        };
        let mut optimized = 0;
        for phi in self.ctx.func.param_values(entry) {
            let Some(red) = self.ctx.reductions.get(phi).cloned() else {
                continue;
            };
            if self.optimize(phi, &red) {
                optimized += 1;
            }
        }
        tracing::info!(optimized, "optimized {optimized} reduction chains");
        optimized
    }
}

/// Replace the uses of `phi` inside the region with `neutral`. Arguments
/// carried out of the region keep `phi`: past the loop it holds the total.
fn restart_uses(
    func: &mut Function,
    phi: ValueId,
    neutral: ValueId,
    in_region: impl Fn(BlockId) -> bool,
) -> usize {
    let sites: Vec<InstId> = func
        .uses_of(phi)
        .into_iter()
        .filter(|(block, _)| in_region(*block))
        .map(|(_, inst)| inst)
        .collect();
    let mut count = 0;
    let mut swap = |v: &mut ValueId| {
        if *v == phi {
            *v = neutral;
            count += 1;
        }
    };
    for inst in sites {
        match &mut func.insts[inst].op {
            Op::Br { target, args } => {
                if in_region(*target) {
                    args.iter_mut().for_each(&mut swap);
                }
            }
            Op::BrIf {
                cond,
                then_target,
                then_args,
                else_target,
                else_args,
            } => {
                swap(cond);
                if in_region(*then_target) {
                    then_args.iter_mut().for_each(&mut swap);
                }
                if in_region(*else_target) {
                    else_args.iter_mut().for_each(&mut swap);
                }
            }
            op => op.visit_operands_mut(&mut swap),
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::analysis::reduction::edge_arg;
    use crate::analysis::{self, divergence, RedKind};
    use crate::context::Region;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::interp::{Evaluator, Scalar};
    use crate::ir::{BinOp, BlockId, CmpKind, Constant, Function, FunctionSig};

    /// Sum over `n` loaded elements with one branch per element.
    ///
    /// ```text
    /// entry(n, base): br h(0, 0)
    /// h(i, s):  br_if i < n, body, exit
    /// body:     x = load(base + i); br_if x < 5, a, b
    /// a:        br m(s + x)
    /// b:        br m(s + 2x)
    /// m(sm):    br h(i + 1, sm)
    /// exit:     ret s
    /// ```
    fn branchy_sum() -> (Function, BlockId, ValueId) {
        let sig = FunctionSig {
            params: vec![Type::Int(64), Type::Int(64)],
            return_ty: Type::Int(64),
        };
        let mut fb = FunctionBuilder::new("branchy_sum", sig);
        let n = fb.param(0);
        let base = fb.param(1);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64), Type::Int(64)]);
        let body = fb.create_block();
        let a = fb.create_block();
        let b = fb.create_block();
        let (m, mp) = fb.create_block_with_params(&[Type::Int(64)]);
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
        fb.br_if(small, a, &[], b, &[]);

        fb.switch_to_block(a);
        let s1 = fb.add(s, x);
        fb.br(m, &[s1]);

        fb.switch_to_block(b);
        let two = fb.const_int(2);
        let t = fb.mul(x, two);
        let s2 = fb.add(s, t);
        fb.br(m, &[s2]);

        fb.switch_to_block(m);
        let one = fb.const_int(1);
        let i1 = fb.add(i, one);
        fb.br(h, &[i1, mp[0]]);

        fb.switch_to_block(exit);
        fb.ret(Some(s));
        (fb.build(), h, s)
    }

    /// The same loop shape folding `ty` elements with `op`, seeded from a
    /// parameter. The large-element path folds `x * x`.
    ///
    /// ```text
    /// entry(n, base, seed): br h(0, seed)
    /// h(i, s):  br_if i < n, body, exit
    /// body:     x = load(base + i); br_if x < 5, a, b
    /// a:        br m(s op x)
    /// b:        br m(s op x*x)
    /// m(sm):    br h(i + 1, sm)
    /// exit:     ret s
    /// ```
    fn branchy_fold(op: BinOp, ty: Type) -> (Function, BlockId, ValueId) {
        let sig = FunctionSig {
            params: vec![Type::Int(64), Type::Int(64), ty],
            return_ty: ty,
        };
        let mut fb = FunctionBuilder::new("branchy_fold", sig);
        let n = fb.param(0);
        let base = fb.param(1);
        let seed = fb.param(2);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64), ty]);
        let body = fb.create_block();
        let a = fb.create_block();
        let b = fb.create_block();
        let (m, mp) = fb.create_block_with_params(&[ty]);
        let exit = fb.create_block();
        fb.br(h, &[zero, seed]);

        fb.switch_to_block(h);
        let (i, s) = (hp[0], hp[1]);
        let c = fb.cmp(CmpKind::Lt, i, n);
        fb.br_if(c, body, &[], exit, &[]);

        fb.switch_to_block(body);
        let addr = fb.add(base, i);
        let x = fb.load(addr, ty);
        let five = fb.const_int(5);
        let small = fb.cmp(CmpKind::Lt, x, five);
        fb.br_if(small, a, &[], b, &[]);

        fb.switch_to_block(a);
        let s1 = fb.binary(op, s, x);
        fb.br(m, &[s1]);

        fb.switch_to_block(b);
        let sq = fb.mul(x, x);
        let s2 = fb.binary(op, s, sq);
        fb.br(m, &[s2]);

        fb.switch_to_block(m);
        let one = fb.const_int(1);
        let i1 = fb.add(i, one);
        fb.br(h, &[i1, mp[0]]);

        fb.switch_to_block(exit);
        fb.ret(Some(s));
        (fb.build(), h, s)
    }

    fn loop_context(func: Function, header: BlockId) -> VectorizationContext {
        let shapes = divergence::analyze(&func, &vec![Shape::Uniform; func.sig.params.len()]);
        let mut ctx = VectorizationContext::new(func, shapes);
        let an = ctx.analyses().clone();
        let reductions = analysis::reduction::analyze(&ctx.func, &an.cfg, &an.loops);
        let id = an.loops.loop_with_header(header).expect("header heads a loop");
        ctx.with_region(Region::for_loop(&an.loops, id))
            .with_reductions(reductions)
    }

    fn memory(values: &[i64]) -> BTreeMap<i64, Scalar> {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| (100 + i as i64, Scalar::Int(v)))
            .collect()
    }

    fn run(func: &Function, n: i64, mem: &[i64]) -> Scalar {
        let exec = Evaluator::new(func, 1)
            .run(&[vec![Scalar::Int(n)], vec![Scalar::Int(100)]], memory(mem))
            .expect("evaluates");
        exec.ret.expect("returns a value")[0]
    }

    fn run_seeded(func: &Function, n: i64, seed: i64, mem: &[i64]) -> Scalar {
        let args = [vec![Scalar::Int(n)], vec![Scalar::Int(100)], vec![Scalar::Int(seed)]];
        let exec = Evaluator::new(func, 1).run(&args, memory(mem)).expect("evaluates");
        exec.ret.expect("returns a value")[0]
    }

    fn combines(func: &Function, kind: BinOp, phi: ValueId) -> usize {
        func.blocks
            .values()
            .flat_map(|b| b.insts.iter())
            .filter(|&&i| matches!(func.insts[i].op, Op::Binary(op, a, _) if op == kind && a == phi))
            .count()
    }

    #[test]
    fn restarts_uses_from_neutral_and_combines_once() {
        let (func, h, s) = branchy_sum();
        let mut ctx = loop_context(func, h);
        let red = ctx.reductions.get(s).cloned().expect("s is a reduction");
        assert_eq!(red.kind, RedKind::Add);

        assert_eq!(ReductionOptimization::new(&mut ctx).run(), 1);

        assert_eq!(combines(&ctx.func, BinOp::Add, s), 1);
        let uses: Vec<_> = ctx
            .func
            .uses_of(s)
            .into_iter()
            .filter(|(b, _)| ctx.in_region(*b))
            .collect();
        assert_eq!(uses.len(), 1, "only the combine reads the accumulator in the loop");
        let combine = ctx.func.insts[uses[0].1].result.expect("combine has a result");
        let latch = ctx.analyses().loops.iter().next().expect("one loop").1.latches[0];
        assert_eq!(edge_arg(&ctx.func, latch, h, 1), Some(combine));
    }

    #[test]
    fn preserves_results() {
        let data = [1, 7, 3, 9, 4, 12, 0];
        let (func, h, _) = branchy_sum();
        let before: Vec<Scalar> = (0..=data.len() as i64).map(|n| run(&func, n, &data)).collect();

        let mut ctx = loop_context(func, h);
        ReductionOptimization::new(&mut ctx).run();
        let after: Vec<Scalar> = (0..=data.len() as i64)
            .map(|n| run(&ctx.func, n, &data))
            .collect();
        assert_eq!(before, after);
        assert_eq!(after[3], Scalar::Int(1 + 14 + 3));
    }

    #[test]
    fn single_use_is_left_alone() {
        // s' = s + x with the sum never read after the loop.
        let sig = FunctionSig {
            params: vec![Type::Int(64)],
            return_ty: Type::Void,
        };
        let mut fb = FunctionBuilder::new("acc", sig);
        let n = fb.param(0);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64), Type::Int(64)]);
        let body = fb.create_block();
        let exit = fb.create_block();
        fb.br(h, &[zero, zero]);
        fb.switch_to_block(h);
        let c = fb.cmp(CmpKind::Lt, hp[0], n);
        fb.br_if(c, body, &[], exit, &[]);
        fb.switch_to_block(body);
        let s1 = fb.add(hp[1], hp[0]);
        let one = fb.const_int(1);
        let i1 = fb.add(hp[0], one);
        fb.br(h, &[i1, s1]);
        fb.switch_to_block(exit);
        fb.ret(None);
        let func = fb.build();

        let mut ctx = loop_context(func, h);
        assert!(ctx.reductions.get(hp[1]).is_some());
        let before = ctx.func.insts.len();
        assert_eq!(ReductionOptimization::new(&mut ctx).run(), 0);
        assert_eq!(ctx.func.insts.len(), before);
    }

    #[test]
    fn whole_function_mode_is_a_no_op() {
        let (func, _, _) = branchy_sum();
        let shapes = divergence::analyze(&func, &[Shape::Uniform, Shape::Uniform]);
        let mut ctx = VectorizationContext::new(func, shapes);
        let an = ctx.analyses().clone();
        ctx.reductions = analysis::reduction::analyze(&ctx.func, &an.cfg, &an.loops);
        assert!(!ctx.reductions.is_empty());
        assert_eq!(ReductionOptimization::new(&mut ctx).run(), 0);
    }

    #[test]
    fn every_integer_kind_keeps_its_results() {
        let data = [3, -2, 7, 1, 6, -4, 2];
        let cases = [
            (BinOp::Mul, RedKind::Mul, 1),
            (BinOp::Min, RedKind::Min, 50),
            (BinOp::Max, RedKind::Max, -50),
            (BinOp::And, RedKind::And, -1),
            (BinOp::Or, RedKind::Or, 0),
        ];
        for (op, kind, seed) in cases {
            let (func, h, s) = branchy_fold(op, Type::Int(64));
            let before: Vec<Scalar> = (0..=data.len() as i64)
                .map(|n| run_seeded(&func, n, seed, &data))
                .collect();

            let mut ctx = loop_context(func, h);
            let red = ctx.reductions.get(s).cloned().expect("s is a reduction");
            assert_eq!(red.kind, kind);
            assert_eq!(ReductionOptimization::new(&mut ctx).run(), 1, "{op:?}");
            assert_eq!(combines(&ctx.func, op, s), 1, "{op:?}");

            let after: Vec<Scalar> = (0..=data.len() as i64)
                .map(|n| run_seeded(&ctx.func, n, seed, &data))
                .collect();
            assert_eq!(before, after, "{op:?}");
        }
    }

    #[test]
    fn min_over_i32_restarts_from_the_i32_maximum() {
        let data = [9, 4, 12, -3, 8];
        let (func, h, s) = branchy_fold(BinOp::Min, Type::Int(32));
        let mut ctx = loop_context(func, h);
        assert_eq!(ReductionOptimization::new(&mut ctx).run(), 1);

        let entry = ctx.func.entry;
        let first = ctx.func.blocks[entry].insts[0];
        assert_eq!(ctx.func.insts[first].op, Op::Const(Constant::Int(i32::MAX as i64)));
        assert_eq!(ctx.func.value_type(ctx.func.insts[first].result.expect("constant")), Type::Int(32));
        assert_eq!(combines(&ctx.func, BinOp::Min, s), 1);

        assert_eq!(run_seeded(&ctx.func, 3, 100, &data), Scalar::Int(4));
        assert_eq!(run_seeded(&ctx.func, 5, 100, &data), Scalar::Int(-3));
        assert_eq!(run_seeded(&ctx.func, 0, 100, &data), Scalar::Int(100));
    }
}
