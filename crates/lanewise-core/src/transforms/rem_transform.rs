//! Remainder (peeling) transform.
//!
//! A counted loop is split into a main loop whose trip count is a multiple
//! of the vector width and a scalar copy that runs the remaining iterations.
//! The main loop keeps the original blocks; the copy is entered from the
//! main loop's exit and leaves to the original exit block.

use std::collections::{HashMap, HashSet};

use crate::analysis::reduction::edge_arg;
use crate::analysis::Shape;
use crate::context::VectorizationContext;
use crate::ir::{BinOp, BlockId, CmpKind, Constant, Function, Op, Type, ValueId};

use super::util::replace_uses_where;
use super::Feasibility;

/// A header-tested counted loop: `for (iv = start; iv <test> bound; iv += step)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemainderPlan {
    pub header: BlockId,
    pub preheader: BlockId,
    pub latch: BlockId,
    pub exit: BlockId,
    /// In-loop successor of the header.
    pub body: BlockId,
    pub iv: ValueId,
    pub start: ValueId,
    pub bound: ValueId,
    pub step: i64,
    /// Normalized so the loop continues while `iv <test> bound` holds.
    pub test: CmpKind,
}

pub struct RemainderTransform<'a> {
    ctx: &'a mut VectorizationContext,
}

impl<'a> RemainderTransform<'a> {
    pub fn new(ctx: &'a mut VectorizationContext) -> Self {
        Self { ctx }
    }

    /// The header's exit test compares a unit-stride-or-wider induction
    /// variable against a loop-invariant bound.
    pub fn can_handle_exit_condition(&mut self, header: BlockId) -> bool {
        self.check(header).is_ok()
    }

    pub fn can_transform_loop(&mut self, header: BlockId) -> bool {
        self.plan(header).is_committed()
    }

    pub fn plan(&mut self, header: BlockId) -> Feasibility<RemainderPlan> {
        match self.check(header) {
            Ok(plan) => Feasibility::Committed(plan),
            Err(reason) => Feasibility::Rejected(reason),
        }
    }

    fn check(&mut self, header: BlockId) -> Result<RemainderPlan, String> {
        let an = self.ctx.analyses().clone();
        let func = &self.ctx.func;
        let id = an
            .loops
            .loop_with_header(header)
            .ok_or_else(|| format!("{header} is not a loop header"))?;
        let l = an.loops.get(id);
        let preheader = an
            .loops
            .preheader(id, func, &an.cfg)
            .ok_or_else(|| format!("loop at {header} has no preheader"))?;
        let latch = l
            .latch()
            .ok_or_else(|| format!("loop at {header} has {} latches", l.latches.len()))?;
        if l
            .blocks
            .iter()
            .any(|&b| matches!(func.terminator_op(b), Some(Op::Return(_))))
        {
            return Err(format!("loop at {header} returns from its body"));
        }
        let exit = match an.loops.exit_edges(id, &an.cfg).as_slice() {
            [(exiting, exit)] if *exiting == header => *exit,
            _ => return Err(format!("loop at {header} does not exit only from its header")),
        };
        match func.terminator_op(latch) {
            Some(Op::Br { target, .. }) if *target == header => {}
            _ => return Err(format!("latch-tested loops are not supported (latch {latch})")),
        }

        let Some(Op::BrIf {
            cond,
            then_target,
            else_target,
            ..
        }) = func.terminator_op(header)
        else {
            return Err(format!("{header} does not end in a conditional exit"));
        };
        let stays_on_true = l.contains(*then_target);
        let body = if stays_on_true { *then_target } else { *else_target };
        let Some(Op::Cmp(kind, a, b)) = func.defining_inst(*cond).map(|i| &func.insts[i].op) else {
            return Err(format!("exit test of {header} is not a comparison"));
        };
        let params = func.param_values(header);
        let (iv, bound, kind) = if params.contains(a) {
            (*a, *b, *kind)
        } else if params.contains(b) {
            (*b, *a, kind.swap())
        } else {
            return Err(format!("exit test of {header} does not read an induction variable"));
        };
        let test = if stays_on_true { kind } else { kind.negate() };
        if !matches!(test, CmpKind::Lt | CmpKind::Le | CmpKind::Ne) {
            return Err(format!("unsupported exit test `{}`", test.mnemonic()));
        }
        if !matches!(func.value_type(iv), Type::Int(_)) {
            return Err(format!("induction variable {iv} is not an integer"));
        }
        let defs = func.def_blocks();
        if defs.get(&bound).map_or(true, |b| l.contains(*b)) {
            return Err(format!("loop bound {bound} is not invariant"));
        }

        let index = params.iter().position(|&p| p == iv).expect("iv is a header parameter");
        let next = edge_arg(func, latch, header, index)
            .ok_or_else(|| format!("latch {latch} passes no value for {iv}"))?;
        let step = match func.defining_inst(next).map(|i| &func.insts[i].op) {
            Some(Op::Binary(BinOp::Add, x, y)) if *x == iv || *y == iv => {
                let other = if *x == iv { *y } else { *x };
                match func.defining_inst(other).map(|i| &func.insts[i].op) {
                    Some(Op::Const(Constant::Int(s))) if *s > 0 => *s,
                    _ => return Err(format!("step of {iv} is not a positive constant")),
                }
            }
            _ => return Err(format!("{iv} is not advanced by a constant step")),
        };
        let start = edge_arg(func, preheader, header, index)
            .ok_or_else(|| format!("preheader passes no start value for {iv}"))?;

        Ok(RemainderPlan {
            header,
            preheader,
            latch,
            exit,
            body,
            iv,
            start,
            bound,
            step,
            test,
        })
    }

    /// Split the loop. Values the split introduces (trip counts, the main
    /// bound and the main exit test) are uniform across lanes and are added
    /// to `uniform_overrides`. Returns the main loop header.
    pub fn create_vectorizable_loop(
        &mut self,
        plan: RemainderPlan,
        uniform_overrides: &mut HashSet<ValueId>,
        vector_width: u32,
        trip_align: u32,
    ) -> BlockId {
        assert!(vector_width > 0, "vector width must be positive");
        let header = plan.header;
        if trip_align % vector_width == 0 {
            tracing::debug!(%header, trip_align, vector_width, "trip count is aligned, no remainder");
            return header;
        }

        let an = self.ctx.analyses().clone();
        let id = an
            .loops
            .loop_with_header(header)
            .unwrap_or_else(|| panic!("committed plan for {header}, which heads no loop"));
        let blocks: Vec<BlockId> = an.loops.get(id).blocks.iter().copied().collect();
        let ty = self.ctx.func.value_type(plan.iv);

        let mut split = Splitter {
            ctx: &mut *self.ctx,
            overrides: uniform_overrides,
            block: plan.preheader,
        };
        let zero = split.emit(Op::Const(Constant::Int(0)), ty);
        let one = split.emit(Op::Const(Constant::Int(1)), ty);
        let step = split.emit(Op::Const(Constant::Int(plan.step)), ty);
        let width = split.emit(Op::Const(Constant::Int(i64::from(vector_width))), ty);
        let diff = split.emit(Op::Binary(BinOp::Sub, plan.bound, plan.start), ty);
        let trip_count = match plan.test {
            CmpKind::Lt => {
                let bias = split.emit(Op::Binary(BinOp::Sub, step, one), ty);
                let num = split.emit(Op::Binary(BinOp::Add, diff, bias), ty);
                let q = split.emit(Op::Binary(BinOp::Div, num, step), ty);
                let any = split.emit(Op::Cmp(CmpKind::Gt, plan.bound, plan.start), Type::Bool);
                split.emit(
                    Op::Select {
                        cond: any,
                        on_true: q,
                        on_false: zero,
                    },
                    ty,
                )
            }
            CmpKind::Le => {
                let q = split.emit(Op::Binary(BinOp::Div, diff, step), ty);
                let q1 = split.emit(Op::Binary(BinOp::Add, q, one), ty);
                let any = split.emit(Op::Cmp(CmpKind::Ge, plan.bound, plan.start), Type::Bool);
                split.emit(
                    Op::Select {
                        cond: any,
                        on_true: q1,
                        on_false: zero,
                    },
                    ty,
                )
            }
            CmpKind::Ne => split.emit(Op::Binary(BinOp::Div, diff, step), ty),
            other => panic!("committed plan with exit test `{}`", other.mnemonic()),
        };
        let tail = split.emit(Op::Binary(BinOp::Rem, trip_count, width), ty);
        let main_trips = split.emit(Op::Binary(BinOp::Sub, trip_count, tail), ty);
        let span = split.emit(Op::Binary(BinOp::Mul, main_trips, step), ty);
        let main_bound = split.emit(Op::Binary(BinOp::Add, plan.start, span), ty);


        let (block_map, value_map) = clone_loop(&mut split.ctx.func, &blocks);
        for (&old, &new) in &value_map {
            let shape = split.ctx.shapes.get(old);
            split.ctx.shapes.set(new, shape);
        }
        let remainder = block_map[&header];

        split.block = header;
        let main_test = split.emit(Op::Cmp(CmpKind::Lt, plan.iv, main_bound), Type::Bool);

        let ctx = &mut *self.ctx;

        let Some(Op::BrIf {
            then_target,
            then_args,
            else_args,
            ..
        }) = ctx.func.terminator_op(header).cloned()
        else {
            panic!("committed plan for {header} without a conditional exit");
        };
        let body_args = if then_target == plan.body { then_args } else { else_args };
        let carried = ctx.func.param_values(header);
        ctx.func.set_terminator(
            header,
            Op::BrIf {
                cond: main_test,
                then_target: plan.body,
                then_args: body_args,
                else_target: remainder,
                else_args: carried,
            },
        );

        // Code after the loop now sees the remainder's final values.
        let copies: HashSet<BlockId> = block_map.values().copied().collect();
        let originals: HashSet<BlockId> = blocks.iter().copied().collect();
        let mut rewired = 0;
        for (&old, &new) in &value_map {
            rewired += replace_uses_where(&mut ctx.func, old, new, |b| {
                !originals.contains(&b) && !copies.contains(&b)
            });
        }

        ctx.invalidate();
        tracing::debug!(
            %header,
            %remainder,
            vector_width,
            rewired,
            "split off scalar remainder loop"
        );
        header
    }
}

/// Emits uniform bookkeeping values before a block's terminator.
struct Splitter<'c> {
    ctx: &'c mut VectorizationContext,
    overrides: &'c mut HashSet<ValueId>,
    block: BlockId,
}

impl Splitter<'_> {
    fn emit(&mut self, op: Op, ty: Type) -> ValueId {
        let v = self.ctx.func.insert_before_terminator(self.block, op, ty);
        self.ctx.shapes.set(v, Shape::Uniform);
        self.overrides.insert(v);
        v
    }
}

/// Copy `blocks` with fresh parameters and results. Branches between copied
/// blocks point at the copies; branches leaving the set are kept.
fn clone_loop(
    func: &mut Function,
    blocks: &[BlockId],
) -> (HashMap<BlockId, BlockId>, HashMap<ValueId, ValueId>) {
    let mut block_map = HashMap::new();
    let mut value_map = HashMap::new();
    for &block in blocks {
        let copy = func.create_block();
        block_map.insert(block, copy);
        for param in func.blocks[block].params.clone() {
            let value = func.add_block_param(copy, param.ty);
            value_map.insert(param.value, value);
        }
    }
    for &block in blocks {
        for inst in func.blocks[block].insts.clone() {
            let result = func.insts[inst].result;
            let op = func.insts[inst].op.clone();
            let copy = func.make_inst(op, result.map(|r| func.value_type(r)));
            if let (Some(old), Some(new)) = (result, func.insts[copy].result) {
                value_map.insert(old, new);
            }
            func.blocks[block_map[&block]].insts.push(copy);
        }
    }
    for &block in blocks {
        for inst in func.blocks[block_map[&block]].insts.clone() {
            let op = &mut func.insts[inst].op;
            op.visit_operands_mut(|v| {
                if let Some(&new) = value_map.get(&*v) {
                    *v = new;
                }
            });
            match op {
                Op::Br { target, .. } => {
                    if let Some(&new) = block_map.get(&*target) {
                        *target = new;
                    }
                }
                Op::BrIf {
                    then_target,
                    else_target,
                    ..
                } => {
                    for target in [then_target, else_target] {
                        if let Some(&new) = block_map.get(&*target) {
                            *target = new;
                        }
                    }
                }
                _ => {}
            }
        }
    }
    (block_map, value_map)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::analysis::ShapeMap;
    use crate::ir::builder::FunctionBuilder;
    use crate::ir::interp::{Evaluator, Execution, Scalar};
    use crate::ir::FunctionSig;

    struct Counted {
        test: CmpKind,
        exit_on_true: bool,
        swapped: bool,
        step: i64,
    }

    impl Counted {
        fn lt() -> Self {
            Self {
                test: CmpKind::Lt,
                exit_on_true: false,
                swapped: false,
                step: 1,
            }
        }
    }

    /// Sum of the induction variable.
    ///
    /// ```text
    /// entry(n): br h(0, 0)
    /// h(i, s):  br_if i <test> n, body, exit   (targets swapped when exiting on true)
    /// body:     br h(i + step, s + i)
    /// exit:     ret s
    /// ```
    fn counted(form: &Counted) -> (Function, BlockId, BlockId) {
        let sig = FunctionSig {
            params: vec![Type::Int(64)],
            return_ty: Type::Int(64),
        };
        let mut fb = FunctionBuilder::new("counted", sig);
        let n = fb.param(0);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64), Type::Int(64)]);
        let body = fb.create_block();
        let exit = fb.create_block();
        fb.br(h, &[zero, zero]);

        fb.switch_to_block(h);
        let (i, s) = (hp[0], hp[1]);
        let c = if form.swapped {
            fb.cmp(form.test.swap(), n, i)
        } else {
            fb.cmp(form.test, i, n)
        };
        if form.exit_on_true {
            fb.br_if(c, exit, &[], body, &[]);
        } else {
            fb.br_if(c, body, &[], exit, &[]);
        }

        fb.switch_to_block(body);
        let step = fb.const_int(form.step);
        let i1 = fb.add(i, step);
        let s1 = fb.add(s, i);
        fb.br(h, &[i1, s1]);

        fb.switch_to_block(exit);
        fb.ret(Some(s));
        (fb.build(), h, body)
    }

    fn run(func: &Function, n: i64) -> Execution {
        Evaluator::new(func, 1)
            .run(&[vec![Scalar::Int(n)]], BTreeMap::new())
            .unwrap()
    }

    fn split(func: Function, header: BlockId, width: u32, align: u32) -> (VectorizationContext, HashSet<ValueId>) {
        let mut ctx = VectorizationContext::new(func, ShapeMap::new());
        let mut overrides = HashSet::new();
        let mut t = RemainderTransform::new(&mut ctx);
        let plan = t.plan(header).into_result("remainder").unwrap();
        assert_eq!(t.create_vectorizable_loop(plan, &mut overrides, width, align), header);
        (ctx, overrides)
    }

    #[test]
    fn ten_iterations_split_into_eight_and_two() {
        let (func, h, body) = counted(&Counted::lt());
        let before = func.blocks.len();
        let (ctx, overrides) = split(func, h, 4, 1);

        // Copies are created in block order: header first, then body.
        let copies: Vec<BlockId> = ctx.func.blocks.keys().skip(before).collect();
        assert_eq!(copies.len(), 2);
        let exec = run(&ctx.func, 10);
        assert_eq!(exec.ret, Some(vec![Scalar::Int(45)]));
        assert_eq!(exec.visits_of(body), 8);
        assert_eq!(exec.visits_of(copies[1]), 2);

        let Some(Op::BrIf { cond, else_target, .. }) = ctx.func.terminator_op(h) else {
            panic!("main header keeps a conditional exit");
        };
        assert!(overrides.contains(cond), "main exit test is uniform");
        assert!(ctx.shapes.is_uniform(*cond));
        assert_eq!(*else_target, copies[0]);
    }

    #[test]
    fn every_exit_form_keeps_its_results() {
        let forms = [
            Counted::lt(),
            Counted { test: CmpKind::Le, ..Counted::lt() },
            Counted { test: CmpKind::Ne, ..Counted::lt() },
            Counted { test: CmpKind::Lt, swapped: true, ..Counted::lt() },
            Counted { test: CmpKind::Ge, exit_on_true: true, ..Counted::lt() },
            Counted { test: CmpKind::Gt, exit_on_true: true, ..Counted::lt() },
            Counted { test: CmpKind::Eq, exit_on_true: true, ..Counted::lt() },
            Counted { step: 3, ..Counted::lt() },
            Counted { test: CmpKind::Le, step: 2, ..Counted::lt() },
        ];
        for form in &forms {
            let (func, h, _) = counted(form);
            let original = func.clone();
            let (ctx, _) = split(func, h, 4, 1);
            for n in 0..=11 {
                if form.test == CmpKind::Ne && n % form.step != 0 {
                    continue;
                }
                assert_eq!(
                    run(&original, n).ret,
                    run(&ctx.func, n).ret,
                    "{:?} (exit on true: {}), n = {n}",
                    form.test,
                    form.exit_on_true
                );
            }
        }
    }

    #[test]
    fn aligned_trip_count_needs_no_remainder() {
        let (func, h, _) = counted(&Counted::lt());
        let text = func.to_string();
        let (ctx, overrides) = split(func, h, 4, 8);
        assert_eq!(ctx.func.to_string(), text);
        assert!(overrides.is_empty());
    }

    #[test]
    fn latch_tested_loop_is_rejected() {
        // entry(n): br h(0) ; h(i): br_if i + 1 < n, h(i + 1), exit ; exit: ret
        let sig = FunctionSig {
            params: vec![Type::Int(64)],
            return_ty: Type::Void,
        };
        let mut fb = FunctionBuilder::new("do_while", sig);
        let n = fb.param(0);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64)]);
        let exit = fb.create_block();
        fb.br(h, &[zero]);
        fb.switch_to_block(h);
        let one = fb.const_int(1);
        let i1 = fb.add(hp[0], one);
        let c = fb.cmp(CmpKind::Lt, i1, n);
        fb.br_if(c, h, &[i1], exit, &[]);
        fb.switch_to_block(exit);
        fb.ret(None);

        let mut ctx = VectorizationContext::new(fb.build(), ShapeMap::new());
        let Feasibility::Rejected(reason) = RemainderTransform::new(&mut ctx).plan(h) else {
            panic!("latch-tested loop must be rejected");
        };
        assert!(reason.contains("latch-tested"), "{reason}");
    }

    #[test]
    fn variable_step_is_rejected() {
        // h(i): br_if i < n, body, exit ; body: br h(i + n)
        let sig = FunctionSig {
            params: vec![Type::Int(64)],
            return_ty: Type::Void,
        };
        let mut fb = FunctionBuilder::new("stride", sig);
        let n = fb.param(0);
        let zero = fb.const_int(0);
        let (h, hp) = fb.create_block_with_params(&[Type::Int(64)]);
        let body = fb.create_block();
        let exit = fb.create_block();
        fb.br(h, &[zero]);
        fb.switch_to_block(h);
        let c = fb.cmp(CmpKind::Lt, hp[0], n);
        fb.br_if(c, body, &[], exit, &[]);
        fb.switch_to_block(body);
        let i1 = fb.add(hp[0], n);
        fb.br(h, &[i1]);
        fb.switch_to_block(exit);
        fb.ret(None);

        let mut ctx = VectorizationContext::new(fb.build(), ShapeMap::new());
        let mut t = RemainderTransform::new(&mut ctx);
        assert!(!t.can_handle_exit_condition(h));
        assert!(!t.can_transform_loop(h));
    }
}
